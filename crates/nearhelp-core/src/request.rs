//! The help-request state machine and its owned chat messages.
//!
//! All transition *validation* lives here as pure functions over the model,
//! so the state machine stays transport-agnostic and testable in isolation.
//! The store layer enforces the same guards a second time as atomic
//! conditional updates; the server never mutates a request except through
//! those two layers together.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_DESCRIPTION_LEN, MAX_MESSAGE_LEN};
use crate::error::LifecycleError;
use crate::types::{Coordinate, ParticipantId, RequestId, RequestStatus, Role, Visibility};

// ---------------------------------------------------------------------------
// Live location
// ---------------------------------------------------------------------------

/// A single reported position with the moment it was reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
}

/// The two independently-updated live-location slots, one per role.
/// The engine never expires these; a stale watcher simply stops sending.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveLocation {
    pub requester: Option<LocationFix>,
    pub helper: Option<LocationFix>,
}

impl LiveLocation {
    pub fn slot(&self, role: Role) -> Option<LocationFix> {
        match role {
            Role::Requester => self.requester,
            Role::Helper => self.helper,
        }
    }

    pub fn set_slot(&mut self, role: Role, fix: LocationFix) {
        match role {
            Role::Requester => self.requester = Some(fix),
            Role::Helper => self.helper = Some(fix),
        }
    }
}

// ---------------------------------------------------------------------------
// HelpRequest
// ---------------------------------------------------------------------------

/// A single help-seeking episode from creation to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelpRequest {
    pub id: RequestId,
    pub requester_id: ParticipantId,
    /// Set if and only if status is accepted or completed.
    pub helper_id: Option<ParticipantId>,
    pub category: String,
    pub description: String,
    pub origin: Coordinate,
    pub visibility: Visibility,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Fixed at creation; never mutated afterwards.
    pub expires_at: DateTime<Utc>,
    /// May differ from `helper_id` when the requester self-closes.
    pub completed_by: Option<ParticipantId>,
    #[serde(default)]
    pub live_location: LiveLocation,
}

impl HelpRequest {
    /// Validate inputs and build a fresh open request.
    ///
    /// The per-requester active-request cap is a store-level concern (it
    /// needs a count query) and is enforced by the coordinator before this
    /// constructor runs.
    pub fn new(
        requester_id: ParticipantId,
        category: &str,
        description: &str,
        origin: Coordinate,
        visibility: Visibility,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, LifecycleError> {
        let category = category.trim();
        let description = description.trim();

        if category.is_empty() {
            return Err(LifecycleError::Validation("category is required".into()));
        }
        if description.is_empty() {
            return Err(LifecycleError::Validation("description is required".into()));
        }
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(LifecycleError::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        if !origin.is_valid() {
            return Err(LifecycleError::Validation("invalid coordinate".into()));
        }
        if duration_minutes <= 0 {
            return Err(LifecycleError::Validation(
                "duration must be positive".into(),
            ));
        }

        Ok(Self {
            id: RequestId::new(),
            requester_id,
            helper_id: None,
            category: category.to_string(),
            description: description.to_string(),
            origin,
            visibility,
            status: RequestStatus::Open,
            created_at: now,
            accepted_at: None,
            completed_at: None,
            expires_at: now + Duration::minutes(duration_minutes),
            completed_by: None,
            live_location: LiveLocation::default(),
        })
    }

    /// The role `participant` plays on this request, if any.
    pub fn role_of(&self, participant: ParticipantId) -> Option<Role> {
        if participant == self.requester_id {
            Some(Role::Requester)
        } else if self.helper_id == Some(participant) {
            Some(Role::Helper)
        } else {
            None
        }
    }

    pub fn is_participant(&self, participant: ParticipantId) -> bool {
        self.role_of(participant).is_some()
    }

    /// Check the open -> accepted edge without applying it.
    pub fn validate_accept(
        &self,
        helper: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if helper == self.requester_id {
            return Err(LifecycleError::Forbidden(
                "cannot accept your own request".into(),
            ));
        }
        match self.status {
            RequestStatus::Open => {}
            RequestStatus::Expired => return Err(LifecycleError::Expired),
            _ => {
                return Err(LifecycleError::Conflict(format!(
                    "request is already {}",
                    self.status
                )))
            }
        }
        if now >= self.expires_at {
            return Err(LifecycleError::Expired);
        }
        Ok(())
    }

    /// Apply the open -> accepted edge.
    pub fn accept(
        &mut self,
        helper: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.validate_accept(helper, now)?;
        self.status = RequestStatus::Accepted;
        self.helper_id = Some(helper);
        self.accepted_at = Some(now);
        Ok(())
    }

    /// Check the -> completed edge without applying it.
    ///
    /// Permitted from accepted for either party, and from open for the
    /// requester (self-close).
    pub fn validate_complete(&self, actor: ParticipantId) -> Result<(), LifecycleError> {
        let role = self
            .role_of(actor)
            .ok_or_else(|| LifecycleError::Forbidden("not a participant".into()))?;

        match (self.status, role) {
            (RequestStatus::Accepted, _) => Ok(()),
            (RequestStatus::Open, Role::Requester) => Ok(()),
            (RequestStatus::Open, Role::Helper) => Err(LifecycleError::Forbidden(
                "only the requester may close an open request".into(),
            )),
            (status, _) => Err(LifecycleError::Conflict(format!(
                "request is already {status}"
            ))),
        }
    }

    /// Apply the -> completed edge.  `completed_by`/`completed_at` are set
    /// exactly once, here.
    pub fn complete(
        &mut self,
        actor: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.validate_complete(actor)?;
        self.status = RequestStatus::Completed;
        self.completed_at = Some(now);
        self.completed_by = Some(actor);
        Ok(())
    }

    /// Apply the open -> expired edge.  Idempotent: returns `Ok(false)`
    /// when the record is already terminal or not yet due, never an error.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RequestStatus::Open && now >= self.expires_at {
            self.status = RequestStatus::Expired;
            true
        } else {
            false
        }
    }

    /// Whether `sender` may append a chat message right now: both parties
    /// while accepted or completed, and the requester on their own open
    /// request.
    pub fn may_message(&self, sender: ParticipantId) -> Result<(), LifecycleError> {
        let role = self
            .role_of(sender)
            .ok_or_else(|| LifecycleError::Forbidden("not a participant".into()))?;

        match (self.status, role) {
            (RequestStatus::Accepted | RequestStatus::Completed, _) => Ok(()),
            (RequestStatus::Open, Role::Requester) => Ok(()),
            _ => Err(LifecycleError::Forbidden(
                "chat is not open for this request".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// One append-only chat message, exclusively owned by its request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub request_id: RequestId,
    pub sender_id: ParticipantId,
    /// Denormalized for display; the auth collaborator is the source of
    /// truth for names.
    pub sender_name: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        request_id: RequestId,
        sender_id: ParticipantId,
        sender_name: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, LifecycleError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(LifecycleError::Validation("message body is required".into()));
        }
        if body.chars().count() > MAX_MESSAGE_LEN {
            return Err(LifecycleError::Validation(format!(
                "message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            request_id,
            sender_id,
            sender_name: sender_name.to_string(),
            body: body.to_string(),
            timestamp: now,
        })
    }
}
