//! The request lifecycle coordinator.
//!
//! Owns the database handle, the geo index and the domain-event bus, and
//! exposes every lifecycle operation as an async method.  Transitions on a
//! shared record are linearized twice over: the database mutex serializes
//! writers in this process, and the store's conditional updates re-check
//! the status edge so a lost race classifies as `Conflict`/`Expired`
//! instead of corrupting state.  Every successful transition publishes one
//! [`DomainEvent`] on the bus; the coordinator itself never touches the
//! transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use nearhelp_core::constants::MAX_ACTIVE_REQUESTS_PER_REQUESTER;
use nearhelp_core::events::DomainEvent;
use nearhelp_core::geo::GeoIndex;
use nearhelp_core::{
    now_utc, ChatMessage, Coordinate, HelpRequest, LifecycleError, LocationFix, ParticipantId,
    RequestId, RequestStatus, Role, Visibility,
};
use nearhelp_store::{Database, StoreError};

use crate::config::ServerConfig;
use crate::error::ApiError;

/// Capacity of the broadcast event bus.  Subscribers that lag beyond this
/// lose events (they are realtime-only consumers, never the source of
/// truth).
const EVENT_BUS_CAPACITY: usize = 256;

/// Parameters of a create operation.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub requester_id: ParticipantId,
    pub category: String,
    pub description: String,
    pub origin: Coordinate,
    pub visibility: Visibility,
    pub duration_minutes: Option<i64>,
}

#[derive(Clone)]
pub struct Coordinator {
    db: Arc<Mutex<Database>>,
    geo: Arc<RwLock<GeoIndex>>,
    events: broadcast::Sender<DomainEvent>,
    config: Arc<ServerConfig>,
}

impl Coordinator {
    /// Wrap an open database.  Seeds the geo index from every request
    /// still inside the extended matching window.
    pub async fn new(db: Database, config: Arc<ServerConfig>) -> Result<Self, ApiError> {
        let coordinator = Self {
            db: Arc::new(Mutex::new(db)),
            geo: Arc::new(RwLock::new(GeoIndex::new())),
            events: broadcast::channel(EVENT_BUS_CAPACITY).0,
            config,
        };
        coordinator.refresh_geo().await?;
        Ok(coordinator)
    }

    /// Subscribe to the domain-event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: DomainEvent) {
        debug!(event = event.kind(), request = %event.request_id(), "domain event");
        // Zero receivers just means nothing realtime is listening yet.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------

    /// Create a new open request.
    pub async fn create(&self, params: CreateRequest) -> Result<HelpRequest, ApiError> {
        let now = now_utc();
        let duration = params
            .duration_minutes
            .unwrap_or(self.config.default_duration_minutes);

        let db = self.db.lock().await;

        let active = db.active_request_count(params.requester_id)?;
        if active >= MAX_ACTIVE_REQUESTS_PER_REQUESTER {
            return Err(LifecycleError::Validation(format!(
                "requester already has {MAX_ACTIVE_REQUESTS_PER_REQUESTER} active requests"
            ))
            .into());
        }

        let request = HelpRequest::new(
            params.requester_id,
            &params.category,
            &params.description,
            params.origin,
            params.visibility,
            duration,
            now,
        )
        .map_err(ApiError::Lifecycle)?;

        db.insert_request(&request)?;
        drop(db);

        self.geo.write().await.upsert(request.id, request.origin);

        info!(
            request = %request.id,
            requester = %request.requester_id,
            category = %request.category,
            "Request created"
        );
        self.publish(DomainEvent::RequestCreated {
            request: request.clone(),
        });
        Ok(request)
    }

    /// Accept an open request as `helper`.
    pub async fn accept(
        &self,
        id: RequestId,
        helper: ParticipantId,
    ) -> Result<HelpRequest, ApiError> {
        self.accept_at(id, helper, now_utc()).await
    }

    /// Accept with an explicit clock; the public entry point fixes `now`.
    pub async fn accept_at(
        &self,
        id: RequestId,
        helper: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<HelpRequest, ApiError> {
        let db = self.db.lock().await;

        // Friendly pre-check: gives the caller the precise reason.
        let snapshot = db.get_request(id).map_err(not_found)?;
        snapshot
            .validate_accept(helper, now)
            .map_err(ApiError::Lifecycle)?;

        // The conditional update is what actually decides the race.
        if !db.try_accept(id, helper, now)? {
            let reason = db.classify_lost_transition(id, now)?;
            return Err(reason.into());
        }

        let updated = db.get_request(id)?;
        drop(db);

        info!(request = %id, helper = %helper, "Request accepted");
        self.publish(DomainEvent::RequestAccepted {
            request: updated.clone(),
        });
        Ok(updated)
    }

    /// Complete a request as one of its participants.
    pub async fn complete(
        &self,
        id: RequestId,
        actor: ParticipantId,
    ) -> Result<HelpRequest, ApiError> {
        self.complete_at(id, actor, now_utc()).await
    }

    pub async fn complete_at(
        &self,
        id: RequestId,
        actor: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<HelpRequest, ApiError> {
        let db = self.db.lock().await;

        let snapshot = db.get_request(id).map_err(not_found)?;
        snapshot
            .validate_complete(actor)
            .map_err(ApiError::Lifecycle)?;
        let role = snapshot
            .role_of(actor)
            .ok_or_else(|| LifecycleError::Forbidden("not a participant".into()))
            .map_err(ApiError::Lifecycle)?;

        if !db.try_complete(id, actor, role, now)? {
            let reason = db.classify_lost_transition(id, now)?;
            return Err(reason.into());
        }

        let updated = db.get_request(id)?;
        drop(db);

        info!(request = %id, completed_by = %actor, "Request completed");
        self.publish(DomainEvent::RequestCompleted {
            request: updated.clone(),
        });
        Ok(updated)
    }

    /// Expire every open request past its deadline.  System-only, invoked
    /// by the sweeper.  Idempotent per record: records that already left
    /// `open` are skipped without error.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, ApiError> {
        let db = self.db.lock().await;
        let due = db.due_for_expiry(now)?;

        let mut expired = Vec::new();
        for id in due {
            // A concurrent accept may win between the scan and this CAS;
            // that is the no-op outcome, not an error.
            if db.try_expire(id, now)? {
                let request = db.get_request(id)?;
                expired.push(id);
                self.publish(DomainEvent::RequestExpired { request });
            }
        }
        drop(db);

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue requests");
        }
        Ok(expired)
    }

    /// Record a live-location fix for the sender's role on the request.
    pub async fn update_live_location(
        &self,
        id: RequestId,
        participant: ParticipantId,
        coordinate: Coordinate,
    ) -> Result<LocationFix, ApiError> {
        if !coordinate.is_valid() {
            return Err(LifecycleError::Validation("invalid coordinate".into()).into());
        }
        let now = now_utc();
        let db = self.db.lock().await;

        let request = db.get_request(id).map_err(not_found)?;
        let role = request
            .role_of(participant)
            .ok_or_else(|| ApiError::Lifecycle(LifecycleError::Forbidden(
                "not a participant".into(),
            )))?;

        let fix = LocationFix {
            coordinate,
            timestamp: now,
        };
        db.update_live_location(id, role, fix)?;
        drop(db);

        let recipient = match role.counterpart() {
            Role::Requester => Some(request.requester_id),
            Role::Helper => request.helper_id,
        };
        self.publish(DomainEvent::LocationUpdated {
            request_id: id,
            sender: participant,
            recipient,
            role,
            fix,
        });
        Ok(fix)
    }

    /// Append a chat message after checking the request permits it.
    pub async fn append_message(
        &self,
        id: RequestId,
        sender: ParticipantId,
        sender_name: &str,
        body: &str,
    ) -> Result<ChatMessage, ApiError> {
        let now = now_utc();
        let db = self.db.lock().await;

        let request = db.get_request(id).map_err(not_found)?;
        request.may_message(sender).map_err(ApiError::Lifecycle)?;

        let message =
            ChatMessage::new(id, sender, sender_name, body, now).map_err(ApiError::Lifecycle)?;
        db.insert_message(&message)?;

        debug!(request = %id, sender = %sender, "Message appended");
        Ok(message)
    }

    // -----------------------------------------------------------------
    // Read paths
    // -----------------------------------------------------------------

    pub async fn request(&self, id: RequestId) -> Result<HelpRequest, ApiError> {
        self.db.lock().await.get_request(id).map_err(not_found)
    }

    /// The nearby-matching read: open requests inside the radius and the
    /// matching window, excluding the caller's own, ordered by ascending
    /// distance from `center`.
    pub async fn nearby(
        &self,
        caller: ParticipantId,
        center: Coordinate,
    ) -> Result<Vec<HelpRequest>, ApiError> {
        if !center.is_valid() {
            return Err(LifecycleError::Validation("invalid coordinate".into()).into());
        }
        let cutoff = now_utc() - self.config.matching_window();

        self.scan_radius(center, |request| {
            request.status == RequestStatus::Open
                && request.requester_id != caller
                && request.created_at >= cutoff
                && visible_in_feed(request, caller)
        })
        .await
    }

    /// Extended read over the 24h window, any status, for display.
    pub async fn all_nearby(
        &self,
        caller: ParticipantId,
        center: Coordinate,
    ) -> Result<Vec<HelpRequest>, ApiError> {
        if !center.is_valid() {
            return Err(LifecycleError::Validation("invalid coordinate".into()).into());
        }
        let cutoff = now_utc() - self.config.extended_window();

        self.scan_radius(center, |request| {
            request.created_at >= cutoff
                && (request.is_participant(caller) || visible_in_feed(request, caller))
        })
        .await
    }

    async fn scan_radius<F>(
        &self,
        center: Coordinate,
        mut keep: F,
    ) -> Result<Vec<HelpRequest>, ApiError>
    where
        F: FnMut(&HelpRequest) -> bool,
    {
        let db = self.db.lock().await;
        let geo = self.geo.read().await;

        let hits = geo.within_radius(center, self.config.nearby_radius_meters, |_| true);
        let mut out = Vec::with_capacity(hits.len());
        for (id, _distance) in hits {
            match db.get_request(id) {
                Ok(request) => {
                    if keep(&request) {
                        out.push(request);
                    }
                }
                // The index can briefly lead the store (e.g. right after a
                // retention purge); skip rather than fail the whole read.
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    pub async fn requests_of(
        &self,
        requester: ParticipantId,
    ) -> Result<Vec<HelpRequest>, ApiError> {
        Ok(self.db.lock().await.requests_by_requester(requester)?)
    }

    pub async fn accepted_by(
        &self,
        helper: ParticipantId,
    ) -> Result<Vec<HelpRequest>, ApiError> {
        Ok(self.db.lock().await.accepted_by_helper(helper)?)
    }

    pub async fn messages(
        &self,
        id: RequestId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        Ok(self
            .db
            .lock()
            .await
            .messages_for_request(id, limit, offset)?)
    }

    // -----------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------

    /// Retention sweep: drop requests (and their messages) older than the
    /// configured horizon, then rebuild the geo index.
    pub async fn purge_aged(&self, now: DateTime<Utc>) -> Result<usize, ApiError> {
        let cutoff = now - chrono::Duration::days(self.config.retention_days);
        let removed = self.db.lock().await.purge_older_than(cutoff)?;
        if removed > 0 {
            info!(removed, "Retention sweep removed aged requests");
        }
        self.refresh_geo().await?;
        Ok(removed)
    }

    /// Rebuild the geo index from every request inside the extended
    /// window.  Queries filter on status, so terminal records may stay
    /// indexed until they age out.
    pub async fn refresh_geo(&self) -> Result<(), ApiError> {
        let cutoff = now_utc() - self.config.extended_window();
        let recent = self.db.lock().await.requests_created_since(cutoff)?;

        let mut index = GeoIndex::new();
        for request in &recent {
            index.upsert(request.id, request.origin);
        }
        debug!(entries = index.len(), "Geo index refreshed");
        *self.geo.write().await = index;
        Ok(())
    }
}

/// Whether a request may appear in `caller`'s feed.  Trusted-contacts
/// requests never do: the trust graph lives in an external service.
/// Nearby-only permits anyone who queried from inside the radius, which
/// the geo scan has already established.
fn visible_in_feed(request: &HelpRequest, caller: ParticipantId) -> bool {
    match request.visibility {
        Visibility::Public | Visibility::NearbyOnly => true,
        Visibility::TrustedContactsOnly => request.is_participant(caller),
    }
}

fn not_found(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound => ApiError::Lifecycle(LifecycleError::NotFound),
        other => ApiError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn coordinator() -> Coordinator {
        let db = Database::open_in_memory().unwrap();
        Coordinator::new(db, Arc::new(ServerConfig::default()))
            .await
            .unwrap()
    }

    fn create_params(requester: ParticipantId, origin: Coordinate) -> CreateRequest {
        CreateRequest {
            requester_id: requester,
            category: "Medical".into(),
            description: "Need a ride to the pharmacy".into(),
            origin,
            visibility: Visibility::Public,
            duration_minutes: Some(30),
        }
    }

    #[tokio::test]
    async fn create_accept_complete_scenario() {
        let coord = coordinator().await;
        let mut events = coord.subscribe();

        let a = ParticipantId::new();
        let b = ParticipantId::new();

        let request = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Open);
        assert_eq!(request.expires_at, request.created_at + Duration::minutes(30));

        let accepted = coord.accept(request.id, b).await.unwrap();
        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert_eq!(accepted.helper_id, Some(b));

        let completed = coord.complete(request.id, a).await.unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);
        assert_eq!(completed.completed_by, Some(a));

        // Any later accept by a third party conflicts.
        let err = coord.accept(request.id, ParticipantId::new()).await;
        assert!(matches!(
            err,
            Err(ApiError::Lifecycle(LifecycleError::Conflict(_)))
        ));

        // The bus saw exactly the three transitions, in order.
        assert!(matches!(
            events.recv().await,
            Ok(DomainEvent::RequestCreated { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Ok(DomainEvent::RequestAccepted { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Ok(DomainEvent::RequestCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn fourth_active_request_is_rejected() {
        let coord = coordinator().await;
        let a = ParticipantId::new();

        for _ in 0..3 {
            coord
                .create(create_params(a, Coordinate::new(0.0, 0.0)))
                .await
                .unwrap();
        }

        let err = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await;
        assert!(matches!(
            err,
            Err(ApiError::Lifecycle(LifecycleError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn completing_a_terminal_request_frees_a_slot() {
        let coord = coordinator().await;
        let a = ParticipantId::new();

        let first = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();
        for _ in 0..2 {
            coord
                .create(create_params(a, Coordinate::new(0.0, 0.0)))
                .await
                .unwrap();
        }
        coord.complete(first.id, a).await.unwrap();

        coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_expires_and_late_accept_fails() {
        let coord = coordinator().await;
        let a = ParticipantId::new();
        let request = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();

        let late = request.expires_at + Duration::seconds(1);
        let expired = coord.expire_due(late).await.unwrap();
        assert_eq!(expired, vec![request.id]);

        // Idempotent on re-run.
        assert!(coord.expire_due(late).await.unwrap().is_empty());

        let err = coord
            .accept_at(request.id, ParticipantId::new(), late)
            .await;
        assert!(matches!(
            err,
            Err(ApiError::Lifecycle(LifecycleError::Expired))
        ));
    }

    #[tokio::test]
    async fn accept_and_expire_race_has_exactly_one_winner() {
        let coord = coordinator().await;
        let a = ParticipantId::new();

        for _ in 0..20 {
            let request = coord
                .create(create_params(a, Coordinate::new(0.0, 0.0)))
                .await
                .unwrap();
            let just_before = request.expires_at - Duration::seconds(1);
            let just_after = request.expires_at + Duration::seconds(1);

            let helper = ParticipantId::new();
            let c1 = coord.clone();
            let c2 = coord.clone();
            let id = request.id;

            let accept = tokio::spawn(async move { c1.accept_at(id, helper, just_before).await });
            let expire = tokio::spawn(async move { c2.expire_due(just_after).await });

            let accept_won = accept.await.unwrap().is_ok();
            let expire_won = !expire.await.unwrap().unwrap().is_empty();

            // Exactly one transition commits.
            assert!(
                accept_won ^ expire_won,
                "accept_won={accept_won} expire_won={expire_won}"
            );

            let final_status = coord.request(request.id).await.unwrap().status;
            if accept_won {
                assert_eq!(final_status, RequestStatus::Accepted);
                // Free the slot for the next round.
                coord.complete(request.id, a).await.unwrap();
            } else {
                assert_eq!(final_status, RequestStatus::Expired);
            }
        }
    }

    #[tokio::test]
    async fn nearby_excludes_own_far_stale_and_trusted() {
        let coord = coordinator().await;
        let caller = ParticipantId::new();
        let other = ParticipantId::new();
        let center = Coordinate::new(0.0, 0.0);

        // ~1.1 km away: in range.
        let in_range = coord
            .create(create_params(other, Coordinate::new(0.01, 0.0)))
            .await
            .unwrap();
        // Caller's own request at the same spot.
        coord
            .create(create_params(caller, Coordinate::new(0.01, 0.0)))
            .await
            .unwrap();
        // ~111 km away: outside the 5 km radius.
        coord
            .create(create_params(other, Coordinate::new(1.0, 0.0)))
            .await
            .unwrap();
        // Trusted-contacts-only: never broadcast.
        let mut trusted = create_params(other, Coordinate::new(0.01, 0.0));
        trusted.visibility = Visibility::TrustedContactsOnly;
        coord.create(trusted).await.unwrap();

        let feed = coord.nearby(caller, center).await.unwrap();
        let ids: Vec<RequestId> = feed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![in_range.id]);
    }

    #[tokio::test]
    async fn nearby_orders_by_distance_and_drops_accepted() {
        let coord = coordinator().await;
        let caller = ParticipantId::new();
        let other = ParticipantId::new();
        let center = Coordinate::new(0.0, 0.0);

        let far = coord
            .create(create_params(other, Coordinate::new(0.02, 0.0)))
            .await
            .unwrap();
        let near = coord
            .create(create_params(other, Coordinate::new(0.005, 0.0)))
            .await
            .unwrap();
        let taken = coord
            .create(create_params(other, Coordinate::new(0.001, 0.0)))
            .await
            .unwrap();
        coord.accept(taken.id, caller).await.unwrap();

        let feed = coord.nearby(caller, center).await.unwrap();
        let ids: Vec<RequestId> = feed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);

        // The extended read still shows the accepted one.
        let all = coord.all_nearby(caller, center).await.unwrap();
        assert!(all.iter().any(|r| r.id == taken.id));
    }

    #[tokio::test]
    async fn live_location_routes_to_counterpart() {
        let coord = coordinator().await;
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let request = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();
        coord.accept(request.id, b).await.unwrap();

        let mut events = coord.subscribe();
        let fix = coord
            .update_live_location(request.id, b, Coordinate::new(0.001, 0.001))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            DomainEvent::LocationUpdated {
                sender,
                recipient,
                role,
                fix: event_fix,
                ..
            } => {
                assert_eq!(sender, b);
                assert_eq!(recipient, Some(a));
                assert_eq!(role, Role::Helper);
                assert_eq!(event_fix, fix);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let stored = coord.request(request.id).await.unwrap();
        assert_eq!(stored.live_location.helper, Some(fix));

        // Strangers may not push locations.
        let err = coord
            .update_live_location(request.id, ParticipantId::new(), Coordinate::new(0.0, 0.0))
            .await;
        assert!(matches!(
            err,
            Err(ApiError::Lifecycle(LifecycleError::Forbidden(_)))
        ));
    }

    #[tokio::test]
    async fn chat_append_respects_permissions() {
        let coord = coordinator().await;
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let request = coord
            .create(create_params(a, Coordinate::new(0.0, 0.0)))
            .await
            .unwrap();

        // Requester may chat on their own open request; others may not.
        coord
            .append_message(request.id, a, "A", "anyone around?")
            .await
            .unwrap();
        let err = coord.append_message(request.id, b, "B", "hi").await;
        assert!(matches!(
            err,
            Err(ApiError::Lifecycle(LifecycleError::Forbidden(_)))
        ));

        coord.accept(request.id, b).await.unwrap();
        coord
            .append_message(request.id, b, "B", "on my way")
            .await
            .unwrap();

        let history = coord.messages(request.id, 100, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "anyone around?");
        assert_eq!(history[1].body, "on my way");
    }
}
