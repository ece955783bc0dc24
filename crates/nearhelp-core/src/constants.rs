//! Domain-wide tunables and limits.

/// Mean Earth radius in meters, used by the haversine distance.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Default matching radius for the nearby query.
pub const DEFAULT_RADIUS_METERS: f64 = 5_000.0;

/// Default request lifetime when the creator does not pick one.
pub const DEFAULT_DURATION_MINUTES: i64 = 30;

/// A requester may hold at most this many non-terminal (open or accepted)
/// requests at once.  Enforced at creation.
pub const MAX_ACTIVE_REQUESTS_PER_REQUESTER: usize = 3;

/// Upper bound on request description length (characters).
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Upper bound on a single chat message body (characters).
pub const MAX_MESSAGE_LEN: usize = 1_000;
