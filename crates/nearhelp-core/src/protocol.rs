//! Realtime channel protocol.
//!
//! JSON frames exchanged over the WebSocket channel.  Client frames are
//! commands scoped to a request room; server frames are asynchronous push
//! events.  Delivery is best-effort, at most once per connected recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{ChatMessage, HelpRequest, LocationFix};
use crate::types::{Coordinate, ParticipantId, RequestId, Role};

/// Frames a connected client may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Join the room scoped to one request.
    JoinRoom { request_id: RequestId },
    /// Leave that room.
    LeaveRoom { request_id: RequestId },
    /// Send a chat message to the other room members (also persisted).
    Chat { request_id: RequestId, body: String },
    /// Transient typing indicator, superseded by the latest value.
    Typing { request_id: RequestId, is_typing: bool },
    /// Push a live-location fix for the sender's role on the request.
    Location {
        request_id: RequestId,
        coordinate: Coordinate,
    },
    Ping,
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// A new request appeared nearby (fanout, visibility/radius filtered).
    RequestCreated { request: HelpRequest },
    /// Pushed to the requester when a helper accepts.
    RequestAccepted {
        request_id: RequestId,
        helper_id: ParticipantId,
        helper_name: String,
    },
    /// Pushed to the party that did not trigger the completion.
    RequestCompleted {
        request_id: RequestId,
        completed_by: ParticipantId,
    },
    /// Chat relayed to the other current room members.
    ChatReceived { message: ChatMessage },
    /// Typing state of a peer in the room.
    TypingChanged {
        request_id: RequestId,
        participant_id: ParticipantId,
        is_typing: bool,
    },
    /// The counterpart's live location moved.
    LocationChanged {
        request_id: RequestId,
        participant_id: ParticipantId,
        role: Role,
        fix: LocationFix,
    },
    /// A participant joined the room.
    MemberJoined {
        request_id: RequestId,
        participant_id: ParticipantId,
        display_name: String,
    },
    /// A participant left the room.
    MemberLeft {
        request_id: RequestId,
        participant_id: ParticipantId,
    },
    /// Addressed notification (e.g. "your request was accepted").
    Notification {
        kind: String,
        title: String,
        body: String,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    },
    /// Command rejected; the connection stays up.
    Error { reason: String },
    Pong,
}
