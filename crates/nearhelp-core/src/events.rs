//! Typed domain events.
//!
//! Every successful lifecycle transition emits exactly one of these.  The
//! server publishes them on an internal broadcast bus; NotificationFanout
//! and the room layer subscribe.  The state machine itself never talks to
//! the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{HelpRequest, LocationFix};
use crate::types::{ParticipantId, RequestId, Role};

/// One domain event with the participants involved.
///
/// Lifecycle events carry the post-transition request snapshot so that
/// subscribers never need a read-back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    RequestCreated {
        request: HelpRequest,
    },
    RequestAccepted {
        request: HelpRequest,
    },
    RequestCompleted {
        request: HelpRequest,
    },
    RequestExpired {
        request: HelpRequest,
    },
    /// A live-location fix moved.  `recipient` is the counterpart role's
    /// participant, absent when that side has not joined yet.
    LocationUpdated {
        request_id: RequestId,
        sender: ParticipantId,
        recipient: Option<ParticipantId>,
        role: Role,
        fix: LocationFix,
    },
}

impl DomainEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            DomainEvent::RequestCreated { request }
            | DomainEvent::RequestAccepted { request }
            | DomainEvent::RequestCompleted { request }
            | DomainEvent::RequestExpired { request } => request.id,
            DomainEvent::LocationUpdated { request_id, .. } => *request_id,
        }
    }

    /// The moment the transition committed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::RequestCreated { request } => request.created_at,
            DomainEvent::RequestAccepted { request } => {
                request.accepted_at.unwrap_or(request.created_at)
            }
            DomainEvent::RequestCompleted { request } => {
                request.completed_at.unwrap_or(request.created_at)
            }
            DomainEvent::RequestExpired { request } => request.expires_at,
            DomainEvent::LocationUpdated { fix, .. } => fix.timestamp,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::RequestCreated { .. } => "request-created",
            DomainEvent::RequestAccepted { .. } => "request-accepted",
            DomainEvent::RequestCompleted { .. } => "request-completed",
            DomainEvent::RequestExpired { .. } => "request-expired",
            DomainEvent::LocationUpdated { .. } => "location-updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, Visibility};

    #[test]
    fn event_exposes_request_id_and_kind() {
        let now = Utc::now();
        let request = HelpRequest::new(
            ParticipantId::new(),
            "Errands",
            "carry groceries",
            Coordinate::new(0.0, 0.0),
            Visibility::Public,
            30,
            now,
        )
        .unwrap();
        let id = request.id;

        let event = DomainEvent::RequestCreated { request };
        assert_eq!(event.request_id(), id);
        assert_eq!(event.kind(), "request-created");
        assert_eq!(event.timestamp(), now);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "requestCreated");
        assert_eq!(json["request"]["id"], id.to_string());
    }
}
