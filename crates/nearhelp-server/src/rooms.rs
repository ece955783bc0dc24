//! Request-scoped rooms for the realtime relay.
//!
//! A room groups the connections currently joined to one request's channel
//! and relays chat, typing and location frames to every member except the
//! sender.  Rooms are ephemeral: created on first join, destroyed when the
//! member set becomes empty.  Nothing here persists; a member who is not
//! currently joined misses the relay and reads history separately.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use nearhelp_core::protocol::ServerFrame;
use nearhelp_core::{ParticipantId, RequestId};

use crate::presence::{ConnectionId, PresenceRegistry};

struct Room {
    request_id: RequestId,
    /// participant -> the connection that joined.  The connection id only
    /// scopes disconnect cleanup; delivery always goes through presence.
    members: HashMap<ParticipantId, ConnectionId>,
}

impl Room {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            members: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Routes room-scoped frames between joined participants.
#[derive(Clone)]
pub struct RoomRouter {
    rooms: Arc<RwLock<HashMap<RequestId, Room>>>,
    presence: PresenceRegistry,
}

impl RoomRouter {
    pub fn new(presence: PresenceRegistry) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            presence,
        }
    }

    /// Add the participant's connection to the room (created on first
    /// join) and notify the other members.  Best-effort, non-blocking.
    pub async fn join(
        &self,
        request_id: RequestId,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        display_name: &str,
    ) {
        {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(request_id)
                .or_insert_with(|| Room::new(request_id));
            room.members.insert(participant_id, connection_id);

            info!(
                room = %request_id,
                participant = %participant_id,
                members = room.members.len(),
                "Participant joined room"
            );
        }

        self.relay(
            request_id,
            participant_id,
            ServerFrame::MemberJoined {
                request_id,
                participant_id,
                display_name: display_name.to_string(),
            },
        )
        .await;
    }

    /// Remove the membership; destroys the room once empty.
    pub async fn leave(&self, request_id: RequestId, participant_id: ParticipantId) {
        let removed = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&request_id) else {
                return;
            };
            let removed = room.members.remove(&participant_id).is_some();

            info!(
                room = %request_id,
                participant = %participant_id,
                members = room.members.len(),
                "Participant left room"
            );

            if room.is_empty() {
                rooms.remove(&request_id);
                debug!(room = %request_id, "Removed empty room");
            }
            removed
        };

        if removed {
            self.relay(
                request_id,
                participant_id,
                ServerFrame::MemberLeft {
                    request_id,
                    participant_id,
                },
            )
            .await;
        }
    }

    /// Deliver `frame` to every other current member of the room via their
    /// live connection.  Members without one are silently skipped.
    pub async fn relay(
        &self,
        request_id: RequestId,
        sender: ParticipantId,
        frame: ServerFrame,
    ) {
        self.relay_excluding(request_id, &[sender], frame).await;
    }

    /// Relay to every current member not named in `excluded`.  Used by the
    /// fanout layer to mirror a lifecycle event into the room without
    /// duplicating the direct push already sent to the affected parties.
    pub async fn relay_excluding(
        &self,
        request_id: RequestId,
        excluded: &[ParticipantId],
        frame: ServerFrame,
    ) {
        let members: Vec<ParticipantId> = {
            let rooms = self.rooms.read().await;
            match rooms.get(&request_id) {
                Some(room) => room
                    .members
                    .keys()
                    .filter(|id| !excluded.contains(id))
                    .copied()
                    .collect(),
                None => return,
            }
        };

        for member in members {
            if !self.presence.send(member, frame.clone()).await {
                debug!(
                    room = %request_id,
                    target = %member,
                    "Dropping relay for offline member"
                );
            }
        }
    }

    /// Same relay semantics as [`relay`]; the typing state is transient
    /// and only the latest value matters to peers.
    ///
    /// [`relay`]: RoomRouter::relay
    pub async fn relay_typing(
        &self,
        request_id: RequestId,
        sender: ParticipantId,
        is_typing: bool,
    ) {
        self.relay(
            request_id,
            sender,
            ServerFrame::TypingChanged {
                request_id,
                participant_id: sender,
                is_typing,
            },
        )
        .await;
    }

    /// Remove a dying connection from every room it was joined to.  Driven
    /// by the presence disconnect path; memberships held by a newer
    /// connection of the same participant are left alone.
    pub async fn drop_connection(
        &self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    ) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|request_id, room| {
            if room.members.get(&participant_id) == Some(&connection_id) {
                room.members.remove(&participant_id);
                debug!(
                    room = %request_id,
                    participant = %participant_id,
                    "Removed disconnected member"
                );
            }
            !room.is_empty()
        });
    }

    /// Current members of a room.
    pub async fn members(&self, request_id: RequestId) -> Vec<ParticipantId> {
        self.rooms
            .read()
            .await
            .get(&request_id)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
