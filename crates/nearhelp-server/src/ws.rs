//! WebSocket endpoint.
//!
//! One socket per participant.  The socket is split: a writer task drains
//! the presence push channel into the sink, while the read loop parses
//! [`ClientFrame`] commands.  A newer connection for the same participant
//! silently supersedes this one; the stale socket's cleanup is keyed on
//! its connection id and cannot evict the replacement.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use nearhelp_core::protocol::{ClientFrame, ServerFrame};
use nearhelp_core::{Coordinate, ParticipantId, RequestId};

use crate::api::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let participant = query.participant_id;
    let location = match (query.lat, query.lng) {
        (Some(lat), Some(lng)) => {
            let coordinate = Coordinate::new(lat, lng);
            coordinate.is_valid().then_some(coordinate)
        }
        _ => None,
    };

    let (connection_id, mut pushes) = state
        .presence
        .connect(participant, &query.display_name, location)
        .await;
    info!(participant = %participant, connection = %connection_id, "Socket connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = pushes.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(participant = %participant, error = %e, "Socket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle_frame(&state, participant, connection_id, frame).await,
                Err(e) => {
                    send_error(&state, participant, format!("malformed frame: {e}")).await;
                }
            },
            Message::Close(_) => break,
            // Protocol-level pings are answered by the library.
            _ => {}
        }
    }

    // Cleanup is scoped to this connection: if the participant already
    // reconnected, both removals are no-ops.
    state.presence.disconnect(participant, connection_id).await;
    state.rooms.drop_connection(participant, connection_id).await;
    writer.abort();
    info!(participant = %participant, connection = %connection_id, "Socket closed");
}

async fn handle_frame(
    state: &AppState,
    participant: ParticipantId,
    connection_id: crate::presence::ConnectionId,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::JoinRoom { request_id } => {
            match authorize_member(state, request_id, participant).await {
                Ok(()) => {
                    let name = state
                        .presence
                        .display_name(participant)
                        .await
                        .unwrap_or_default();
                    state
                        .rooms
                        .join(request_id, participant, connection_id, &name)
                        .await;
                }
                Err(reason) => send_error(state, participant, reason).await,
            }
        }
        ClientFrame::LeaveRoom { request_id } => {
            state.rooms.leave(request_id, participant).await;
        }
        ClientFrame::Chat { request_id, body } => {
            let name = state
                .presence
                .display_name(participant)
                .await
                .unwrap_or_default();
            match state
                .coordinator
                .append_message(request_id, participant, &name, &body)
                .await
            {
                Ok(message) => {
                    state
                        .rooms
                        .relay(request_id, participant, ServerFrame::ChatReceived { message })
                        .await;
                }
                Err(e) => send_error(state, participant, reject_reason(e)).await,
            }
        }
        ClientFrame::Typing {
            request_id,
            is_typing,
        } => {
            // Only current room members may signal typing; membership is
            // what the join authorization already vetted.
            if state.rooms.members(request_id).await.contains(&participant) {
                state
                    .rooms
                    .relay_typing(request_id, participant, is_typing)
                    .await;
            } else {
                send_error(
                    state,
                    participant,
                    "not a member of this room".to_string(),
                )
                .await;
            }
        }
        ClientFrame::Location {
            request_id,
            coordinate,
        } => {
            state.presence.update_location(participant, coordinate).await;
            if let Err(e) = state
                .coordinator
                .update_live_location(request_id, participant, coordinate)
                .await
            {
                send_error(state, participant, reject_reason(e)).await;
            }
        }
        ClientFrame::Ping => {
            state.presence.send(participant, ServerFrame::Pong).await;
        }
    }
}

/// Room membership is restricted to the request's participants.
async fn authorize_member(
    state: &AppState,
    request_id: RequestId,
    participant: ParticipantId,
) -> Result<(), String> {
    let request = state
        .coordinator
        .request(request_id)
        .await
        .map_err(reject_reason)?;
    if request.is_participant(participant) {
        Ok(())
    } else {
        Err("not a participant of this request".to_string())
    }
}

async fn send_error(state: &AppState, participant: ParticipantId, reason: String) {
    debug!(participant = %participant, reason = %reason, "Rejected client frame");
    state
        .presence
        .send(participant, ServerFrame::Error { reason })
        .await;
}

fn reject_reason(e: ApiError) -> String {
    e.to_string()
}
