//! Notification fanout.
//!
//! A single background task subscribed to the domain-event bus.  It turns
//! each event into targeted [`ServerFrame`] pushes: creation announcements
//! go to online participants the visibility and radius rules permit,
//! lifecycle notifications go to the affected party, and location fixes go
//! to the counterpart plus the request room.  Delivery is best-effort; an
//! offline recipient simply misses the push and reads state over HTTP.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use nearhelp_core::events::DomainEvent;
use nearhelp_core::protocol::ServerFrame;
use nearhelp_core::{now_utc, HelpRequest, ParticipantId, Visibility};

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::presence::{OnlineParticipant, PresenceRegistry};
use crate::rooms::RoomRouter;

/// Spawn the fanout worker.  It runs until the event bus is dropped.
pub fn spawn_fanout(
    coordinator: Coordinator,
    presence: PresenceRegistry,
    rooms: RoomRouter,
    config: Arc<ServerConfig>,
) -> tokio::task::JoinHandle<()> {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    dispatch(&presence, &rooms, &config, event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Realtime-only consumer: dropped pushes are lost, the
                    // authoritative state is still in the store.
                    warn!(skipped, "Fanout lagged behind the event bus");
                }
                Err(RecvError::Closed) => {
                    info!("Event bus closed, fanout worker exiting");
                    break;
                }
            }
        }
    })
}

async fn dispatch(
    presence: &PresenceRegistry,
    rooms: &RoomRouter,
    config: &ServerConfig,
    event: DomainEvent,
) {
    match event {
        DomainEvent::RequestCreated { request } => {
            announce_created(presence, config, request).await;
        }
        DomainEvent::RequestAccepted { request } => {
            notify_accepted(presence, rooms, request).await;
        }
        DomainEvent::RequestCompleted { request } => {
            notify_completed(presence, rooms, request).await;
        }
        DomainEvent::RequestExpired { request } => {
            // No push for now: the creator learns on their next read.
            debug!(request = %request.id, "Request expired");
        }
        DomainEvent::LocationUpdated {
            request_id,
            sender,
            recipient,
            role,
            fix,
        } => {
            let frame = ServerFrame::LocationChanged {
                request_id,
                participant_id: sender,
                role,
                fix,
            };
            let mut already_pushed = vec![sender];
            if let Some(recipient) = recipient {
                presence.send(recipient, frame.clone()).await;
                already_pushed.push(recipient);
            }
            rooms
                .relay_excluding(request_id, &already_pushed, frame)
                .await;
        }
    }
}

/// Push a creation announcement to every eligible online participant.
async fn announce_created(
    presence: &PresenceRegistry,
    config: &ServerConfig,
    request: HelpRequest,
) {
    if request.visibility == Visibility::TrustedContactsOnly {
        // The trust graph lives elsewhere; these are never announced.
        return;
    }

    let candidates = presence.online_snapshot().await;
    let mut delivered = 0usize;
    for candidate in &candidates {
        if !eligible_for_announcement(&request, candidate, config.nearby_radius_meters) {
            continue;
        }
        let frame = ServerFrame::RequestCreated {
            request: request.clone(),
        };
        if presence.send(candidate.participant_id, frame).await {
            delivered += 1;
        }
    }
    debug!(
        request = %request.id,
        online = candidates.len(),
        delivered,
        "Announced new request"
    );
}

/// Whether one online participant should hear about a new request.
/// Public requests reach participants with no known location as well;
/// nearby-only requests require a known location inside the radius.
fn eligible_for_announcement(
    request: &HelpRequest,
    candidate: &OnlineParticipant,
    radius_meters: f64,
) -> bool {
    if candidate.participant_id == request.requester_id {
        return false;
    }
    match (request.visibility, candidate.last_location) {
        (Visibility::TrustedContactsOnly, _) => false,
        (Visibility::Public, None) => true,
        (_, Some(location)) => request.origin.distance_meters(&location) <= radius_meters,
        (Visibility::NearbyOnly, None) => false,
    }
}

async fn notify_accepted(presence: &PresenceRegistry, rooms: &RoomRouter, request: HelpRequest) {
    let Some(helper_id) = request.helper_id else {
        warn!(request = %request.id, "Accepted event without helper");
        return;
    };
    let helper_name = presence
        .display_name(helper_id)
        .await
        .unwrap_or_else(|| "A helper".to_string());

    let frame = ServerFrame::RequestAccepted {
        request_id: request.id,
        helper_id,
        helper_name: helper_name.clone(),
    };
    presence.send(request.requester_id, frame.clone()).await;
    presence
        .send(
            request.requester_id,
            ServerFrame::Notification {
                kind: "request-accepted".into(),
                title: "Your request was accepted".into(),
                body: format!("{helper_name} is coming to help"),
                request_id: request.id,
                timestamp: now_utc(),
            },
        )
        .await;
    // Anyone already sitting in the room sees the transition too; the
    // requester was pushed directly and must not hear it twice.
    rooms
        .relay_excluding(request.id, &[helper_id, request.requester_id], frame)
        .await;
}

async fn notify_completed(presence: &PresenceRegistry, rooms: &RoomRouter, request: HelpRequest) {
    let Some(completed_by) = request.completed_by else {
        warn!(request = %request.id, "Completed event without actor");
        return;
    };
    let frame = ServerFrame::RequestCompleted {
        request_id: request.id,
        completed_by,
    };

    // Notify the party that did not trigger the completion.
    let counterpart: Option<ParticipantId> = if completed_by == request.requester_id {
        request.helper_id
    } else {
        Some(request.requester_id)
    };
    let mut already_pushed = vec![completed_by];
    if let Some(counterpart) = counterpart {
        presence.send(counterpart, frame.clone()).await;
        presence
            .send(
                counterpart,
                ServerFrame::Notification {
                    kind: "request-completed".into(),
                    title: "Request completed".into(),
                    body: "The help request was marked as completed".into(),
                    request_id: request.id,
                    timestamp: now_utc(),
                },
            )
            .await;
        already_pushed.push(counterpart);
    }
    rooms
        .relay_excluding(request.id, &already_pushed, frame)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearhelp_core::{Coordinate, RequestStatus};
    use tokio::sync::mpsc;

    use crate::coordinator::CreateRequest;
    use nearhelp_store::Database;

    fn request_at(origin: Coordinate, visibility: Visibility) -> HelpRequest {
        HelpRequest::new(
            ParticipantId::new(),
            "Errands",
            "walk the dog",
            origin,
            visibility,
            30,
            now_utc(),
        )
        .unwrap()
    }

    fn candidate(location: Option<Coordinate>) -> OnlineParticipant {
        OnlineParticipant {
            participant_id: ParticipantId::new(),
            display_name: "C".into(),
            last_location: location,
        }
    }

    #[test]
    fn announcement_eligibility_rules() {
        let request = request_at(Coordinate::new(0.0, 0.0), Visibility::Public);

        // Public: unknown location and close-by are in, far away is out.
        assert!(eligible_for_announcement(&request, &candidate(None), 5_000.0));
        assert!(eligible_for_announcement(
            &request,
            &candidate(Some(Coordinate::new(0.01, 0.0))),
            5_000.0
        ));
        assert!(!eligible_for_announcement(
            &request,
            &candidate(Some(Coordinate::new(1.0, 0.0))),
            5_000.0
        ));

        // The requester never hears their own announcement.
        let own = OnlineParticipant {
            participant_id: request.requester_id,
            display_name: "me".into(),
            last_location: None,
        };
        assert!(!eligible_for_announcement(&request, &own, 5_000.0));

        // Nearby-only requires a known in-radius location.
        let nearby = request_at(Coordinate::new(0.0, 0.0), Visibility::NearbyOnly);
        assert!(!eligible_for_announcement(&nearby, &candidate(None), 5_000.0));
        assert!(eligible_for_announcement(
            &nearby,
            &candidate(Some(Coordinate::new(0.01, 0.0))),
            5_000.0
        ));

        let trusted = request_at(Coordinate::new(0.0, 0.0), Visibility::TrustedContactsOnly);
        assert!(!eligible_for_announcement(&trusted, &candidate(None), 5_000.0));
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn end_to_end_fanout_for_accept_and_complete() {
        let config = Arc::new(ServerConfig::default());
        let coordinator = Coordinator::new(Database::open_in_memory().unwrap(), config.clone())
            .await
            .unwrap();
        let presence = PresenceRegistry::new();
        let rooms = RoomRouter::new(presence.clone());
        let worker = spawn_fanout(
            coordinator.clone(),
            presence.clone(),
            rooms.clone(),
            config,
        );

        let requester = ParticipantId::new();
        let helper = ParticipantId::new();
        let nearby_user = ParticipantId::new();
        let far_user = ParticipantId::new();

        let (_, mut requester_rx) = presence
            .connect(requester, "A", Some(Coordinate::new(0.0, 0.0)))
            .await;
        let (_, mut helper_rx) = presence
            .connect(helper, "B", Some(Coordinate::new(0.001, 0.0)))
            .await;
        let (_, mut nearby_rx) = presence
            .connect(nearby_user, "C", Some(Coordinate::new(0.01, 0.0)))
            .await;
        let (_, mut far_rx) = presence
            .connect(far_user, "D", Some(Coordinate::new(10.0, 0.0)))
            .await;

        let request = coordinator
            .create(CreateRequest {
                requester_id: requester,
                category: "Errands".into(),
                description: "need a hand".into(),
                origin: Coordinate::new(0.0, 0.0),
                visibility: Visibility::Public,
                duration_minutes: Some(30),
            })
            .await
            .unwrap();
        coordinator.accept(request.id, helper).await.unwrap();
        let completed = coordinator.complete(request.id, requester).await.unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);

        // Give the worker a chance to drain the bus.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Nearby stranger saw only the creation announcement.
        let frames = drain(&mut nearby_rx).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerFrame::RequestCreated { .. }));

        // Out-of-radius stranger saw nothing.
        assert!(drain(&mut far_rx).await.is_empty());

        // The helper heard the announcement before accepting.
        let frames = drain(&mut helper_rx).await;
        assert!(matches!(frames[0], ServerFrame::RequestCreated { .. }));
        // Completion by the requester notifies the helper.
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::RequestCompleted { .. })));

        // The requester got the accept push with the helper's name.
        let frames = drain(&mut requester_rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::RequestAccepted { helper_name, .. } if helper_name == "B"
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Notification { kind, .. } if kind == "request-accepted"
        )));

        worker.abort();
    }

    #[tokio::test]
    async fn room_member_hears_each_lifecycle_push_once() {
        let config = Arc::new(ServerConfig::default());
        let coordinator = Coordinator::new(Database::open_in_memory().unwrap(), config.clone())
            .await
            .unwrap();
        let presence = PresenceRegistry::new();
        let rooms = RoomRouter::new(presence.clone());
        let worker = spawn_fanout(
            coordinator.clone(),
            presence.clone(),
            rooms.clone(),
            config,
        );

        let requester = ParticipantId::new();
        let helper = ParticipantId::new();
        let (requester_conn, mut requester_rx) = presence
            .connect(requester, "A", Some(Coordinate::new(0.0, 0.0)))
            .await;
        let (helper_conn, mut helper_rx) = presence
            .connect(helper, "B", Some(Coordinate::new(0.001, 0.0)))
            .await;

        let request = coordinator
            .create(CreateRequest {
                requester_id: requester,
                category: "Errands".into(),
                description: "need a hand".into(),
                origin: Coordinate::new(0.0, 0.0),
                visibility: Visibility::Public,
                duration_minutes: Some(30),
            })
            .await
            .unwrap();

        // Both parties sit in the request's room while the lifecycle moves.
        rooms.join(request.id, requester, requester_conn, "A").await;
        rooms.join(request.id, helper, helper_conn, "B").await;

        coordinator.accept(request.id, helper).await.unwrap();
        coordinator.complete(request.id, helper).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let frames = drain(&mut requester_rx).await;
        let accepted = frames
            .iter()
            .filter(|f| matches!(f, ServerFrame::RequestAccepted { .. }))
            .count();
        let completed = frames
            .iter()
            .filter(|f| matches!(f, ServerFrame::RequestCompleted { .. }))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(completed, 1);

        // The actor hears neither its own transition nor a mirror of it.
        let frames = drain(&mut helper_rx).await;
        assert!(!frames
            .iter()
            .any(|f| matches!(f, ServerFrame::RequestAccepted { .. })));
        assert!(!frames
            .iter()
            .any(|f| matches!(f, ServerFrame::RequestCompleted { .. })));

        worker.abort();
    }
}
