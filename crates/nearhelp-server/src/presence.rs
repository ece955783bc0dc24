//! Presence registry: maps each authenticated participant to their
//! currently-active realtime connection.
//!
//! One active connection per participant.  A second connection from the
//! same participant overwrites the first (last-writer-wins): the old
//! entry's channel is dropped, which ends the old socket's writer task and
//! lets its cleanup path run.  Entries are process-lifetime only.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use nearhelp_core::protocol::ServerFrame;
use nearhelp_core::{Coordinate, ParticipantId};

/// Handle identifying one physical connection.  Disconnects are keyed on
/// this so a stale socket cannot evict its successor.
pub type ConnectionId = Uuid;

/// One live connection.
#[derive(Debug)]
struct PresenceEntry {
    connection_id: ConnectionId,
    display_name: String,
    /// Last coordinate the participant reported, used for creation-fanout
    /// radius eligibility.  `None` until they share one.
    last_location: Option<Coordinate>,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

/// Snapshot row handed to the fanout layer.
#[derive(Debug, Clone)]
pub struct OnlineParticipant {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub last_location: Option<Coordinate>,
}

/// Tracks all currently connected participants.
#[derive(Clone)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<ParticipantId, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or overwrite) the active connection for a participant.
    ///
    /// Returns the new connection's handle and the receiving half of its
    /// push channel; the caller drains that into the socket.
    pub async fn connect(
        &self,
        participant_id: ParticipantId,
        display_name: &str,
        location: Option<Coordinate>,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let entry = PresenceEntry {
            connection_id,
            display_name: display_name.to_string(),
            last_location: location,
            sender: tx,
        };

        let mut entries = self.entries.write().await;
        if entries.insert(participant_id, entry).is_some() {
            debug!(
                participant = %participant_id,
                "Second connection replaced an existing one"
            );
        }
        debug!(
            participant = %participant_id,
            connection = %connection_id,
            online = entries.len(),
            "Participant connected"
        );

        (connection_id, rx)
    }

    /// Remove the entry for this connection.  A no-op when the participant
    /// has already been overwritten by a newer connection.
    pub async fn disconnect(
        &self,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
    ) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&participant_id) {
            Some(entry) if entry.connection_id == connection_id => {
                entries.remove(&participant_id);
                debug!(
                    participant = %participant_id,
                    online = entries.len(),
                    "Participant disconnected"
                );
                true
            }
            _ => false,
        }
    }

    /// Best-effort push.  Returns whether delivery was attempted; there is
    /// no queueing for offline participants.
    pub async fn send(&self, participant_id: ParticipantId, frame: ServerFrame) -> bool {
        let entries = self.entries.read().await;
        match entries.get(&participant_id) {
            Some(entry) => entry.sender.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn is_online(&self, participant_id: ParticipantId) -> bool {
        self.entries.read().await.contains_key(&participant_id)
    }

    pub async fn display_name(&self, participant_id: ParticipantId) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&participant_id)
            .map(|e| e.display_name.clone())
    }

    /// Record the participant's most recent reported coordinate.
    pub async fn update_location(&self, participant_id: ParticipantId, location: Coordinate) {
        if let Some(entry) = self.entries.write().await.get_mut(&participant_id) {
            entry.last_location = Some(location);
        }
    }

    /// Snapshot of everyone online, for fanout iteration.
    pub async fn online_snapshot(&self) -> Vec<OnlineParticipant> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| OnlineParticipant {
                participant_id: *id,
                display_name: entry.display_name.clone(),
                last_location: entry.last_location,
            })
            .collect()
    }

    pub async fn online_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
