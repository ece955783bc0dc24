//! Typed CRUD and lifecycle transition primitives for help requests.
//!
//! The `try_*` methods are atomic conditional updates: the `WHERE` clause
//! re-checks the current status (a compare-and-swap on the status column),
//! and the affected-row count reports whether this caller won the
//! transition.  This is the per-record mutual exclusion the accept/expire
//! race relies on; a loser observes `false` and classifies the outcome by
//! re-reading, never by retrying.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use nearhelp_core::{
    Coordinate, HelpRequest, LifecycleError, LiveLocation, LocationFix, ParticipantId,
    RequestId, RequestStatus, Role, Visibility,
};

use crate::database::{decode_ts, encode_ts, Database};
use crate::error::{Result, StoreError};

const REQUEST_COLUMNS: &str = "id, requester_id, helper_id, category, description, \
     origin_lat, origin_lng, visibility, status, \
     created_at, accepted_at, completed_at, expires_at, completed_by, \
     requester_loc_lat, requester_loc_lng, requester_loc_ts, \
     helper_loc_lat, helper_loc_lng, helper_loc_ts";

impl Database {
    pub fn insert_request(&self, request: &HelpRequest) -> Result<()> {
        self.conn().execute(
            "INSERT INTO requests (id, requester_id, helper_id, category, description, \
             origin_lat, origin_lng, visibility, status, \
             created_at, accepted_at, completed_at, expires_at, completed_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                request.id.0.to_string(),
                request.requester_id.0.to_string(),
                request.helper_id.map(|h| h.0.to_string()),
                request.category,
                request.description,
                request.origin.lat,
                request.origin.lng,
                request.visibility.as_str(),
                request.status.as_str(),
                encode_ts(request.created_at),
                request.accepted_at.map(encode_ts),
                request.completed_at.map(encode_ts),
                encode_ts(request.expires_at),
                request.completed_by.map(|p| p.0.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn get_request(&self, id: RequestId) -> Result<HelpRequest> {
        self.conn()
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                params![id.0.to_string()],
                row_to_request,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Number of non-terminal (open or accepted) requests held by a
    /// requester.  Backs the creation cap.
    pub fn active_request_count(&self, requester: ParticipantId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM requests \
             WHERE requester_id = ?1 AND status IN ('open', 'accepted')",
            params![requester.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All requests created by a requester, newest first.
    pub fn requests_by_requester(&self, requester: ParticipantId) -> Result<Vec<HelpRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE requester_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![requester.0.to_string()], row_to_request)?;
        collect_rows(rows)
    }

    /// Requests currently accepted by a helper, most recently accepted
    /// first.
    pub fn accepted_by_helper(&self, helper: ParticipantId) -> Result<Vec<HelpRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE helper_id = ?1 AND status = 'accepted' ORDER BY accepted_at DESC"
        ))?;
        let rows = stmt.query_map(params![helper.0.to_string()], row_to_request)?;
        collect_rows(rows)
    }

    /// Requests created within the matching window, any status.  Feeds the
    /// geo index rebuild at startup and the extended "all" read.
    pub fn requests_created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<HelpRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE created_at >= ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![encode_ts(cutoff)], row_to_request)?;
        collect_rows(rows)
    }

    /// Attempt the open -> accepted transition.  Returns whether this
    /// caller won the compare-and-swap; a `false` means the record is gone,
    /// no longer open, or past its expiry.
    pub fn try_accept(
        &self,
        id: RequestId,
        helper: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE requests \
             SET status = 'accepted', helper_id = ?1, accepted_at = ?2 \
             WHERE id = ?3 AND status = 'open' \
               AND expires_at > ?2 AND requester_id != ?1",
            params![helper.0.to_string(), encode_ts(now), id.0.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Attempt the -> completed transition for a validated actor.
    ///
    /// The permission decision (which actor may close from which status)
    /// is made by the core state machine before this runs; the `WHERE`
    /// clause re-checks the status edge so a concurrent transition loses
    /// cleanly.
    pub fn try_complete(
        &self,
        id: RequestId,
        actor: ParticipantId,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let actor_s = actor.0.to_string();
        let affected = match role {
            // Requester may complete from accepted, or self-close from open.
            Role::Requester => self.conn().execute(
                "UPDATE requests \
                 SET status = 'completed', completed_at = ?1, completed_by = ?2 \
                 WHERE id = ?3 AND status IN ('open', 'accepted') \
                   AND requester_id = ?2",
                params![encode_ts(now), actor_s, id.0.to_string()],
            )?,
            // Helper may only complete an accepted request they hold.
            Role::Helper => self.conn().execute(
                "UPDATE requests \
                 SET status = 'completed', completed_at = ?1, completed_by = ?2 \
                 WHERE id = ?3 AND status = 'accepted' AND helper_id = ?2",
                params![encode_ts(now), actor_s, id.0.to_string()],
            )?,
        };
        Ok(affected > 0)
    }

    /// Ids of all open requests whose expiry deadline has passed.
    pub fn due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM requests WHERE status = 'open' AND expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![encode_ts(now)], |row| {
            let id: String = row.get(0)?;
            Ok(id)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            ids.push(RequestId(Uuid::parse_str(&raw)?));
        }
        Ok(ids)
    }

    /// Attempt the open -> expired transition.  Idempotent: a record that
    /// is already terminal, accepted, or not yet due reports `false`,
    /// never an error.
    pub fn try_expire(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE requests SET status = 'expired' \
             WHERE id = ?1 AND status = 'open' AND expires_at <= ?2",
            params![id.0.to_string(), encode_ts(now)],
        )?;
        Ok(affected > 0)
    }

    /// Overwrite the live-location slot for one role.
    pub fn update_live_location(
        &self,
        id: RequestId,
        role: Role,
        fix: LocationFix,
    ) -> Result<()> {
        let sql = match role {
            Role::Requester => {
                "UPDATE requests SET requester_loc_lat = ?1, requester_loc_lng = ?2, \
                 requester_loc_ts = ?3 WHERE id = ?4"
            }
            Role::Helper => {
                "UPDATE requests SET helper_loc_lat = ?1, helper_loc_lng = ?2, \
                 helper_loc_ts = ?3 WHERE id = ?4"
            }
        };
        let affected = self.conn().execute(
            sql,
            params![
                fix.coordinate.lat,
                fix.coordinate.lng,
                encode_ts(fix.timestamp),
                id.0.to_string(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Retention sweep: delete requests created before `cutoff` together
    /// with their messages.  Returns the number of requests removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        // Messages first; the FK cascade only triggers on DELETE of the
        // parent row, which is exactly what follows, but being explicit
        // keeps the sweep correct even with foreign_keys off.
        self.conn().execute(
            "DELETE FROM messages WHERE request_id IN \
             (SELECT id FROM requests WHERE created_at < ?1)",
            params![encode_ts(cutoff)],
        )?;
        let affected = self.conn().execute(
            "DELETE FROM requests WHERE created_at < ?1",
            params![encode_ts(cutoff)],
        )?;
        Ok(affected)
    }

    /// Classify why a lifecycle CAS reported no winner, by re-reading the
    /// record.  Shared by accept/complete callers.
    pub fn classify_lost_transition(
        &self,
        id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<LifecycleError> {
        let current = match self.conn().query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
            params![id.0.to_string()],
            row_to_request,
        ) {
            Ok(req) => req,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(LifecycleError::NotFound),
            Err(other) => return Err(StoreError::Sqlite(other)),
        };

        Ok(match current.status {
            RequestStatus::Expired => LifecycleError::Expired,
            RequestStatus::Open if now >= current.expires_at => LifecycleError::Expired,
            status => LifecycleError::Conflict(format!("request is {status}")),
        })
    }
}

fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<HelpRequest>>,
) -> Result<Vec<HelpRequest>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    decode_ts(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn read_fix(
    row: &Row<'_>,
    lat_idx: usize,
    lng_idx: usize,
    ts_idx: usize,
) -> rusqlite::Result<Option<LocationFix>> {
    let lat: Option<f64> = row.get(lat_idx)?;
    let lng: Option<f64> = row.get(lng_idx)?;
    let ts: Option<String> = row.get(ts_idx)?;

    match (lat, lng, ts) {
        (Some(lat), Some(lng), Some(ts)) => Ok(Some(LocationFix {
            coordinate: Coordinate::new(lat, lng),
            timestamp: parse_ts(ts_idx, &ts)?,
        })),
        _ => Ok(None),
    }
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<HelpRequest> {
    let id: String = row.get(0)?;
    let requester: String = row.get(1)?;
    let helper: Option<String> = row.get(2)?;
    let visibility: String = row.get(7)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let accepted_at: Option<String> = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;
    let expires_at: String = row.get(12)?;
    let completed_by: Option<String> = row.get(13)?;

    let bad_value = |idx: usize, what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized {what}").into(),
        )
    };

    Ok(HelpRequest {
        id: RequestId(parse_uuid(0, &id)?),
        requester_id: ParticipantId(parse_uuid(1, &requester)?),
        helper_id: helper
            .map(|h| parse_uuid(2, &h).map(ParticipantId))
            .transpose()?,
        category: row.get(3)?,
        description: row.get(4)?,
        origin: Coordinate::new(row.get(5)?, row.get(6)?),
        visibility: Visibility::parse(&visibility).ok_or_else(|| bad_value(7, "visibility"))?,
        status: RequestStatus::parse(&status).ok_or_else(|| bad_value(8, "status"))?,
        created_at: parse_ts(9, &created_at)?,
        accepted_at: accepted_at.map(|ts| parse_ts(10, &ts)).transpose()?,
        completed_at: completed_at.map(|ts| parse_ts(11, &ts)).transpose()?,
        expires_at: parse_ts(12, &expires_at)?,
        completed_by: completed_by
            .map(|p| parse_uuid(13, &p).map(ParticipantId))
            .transpose()?,
        live_location: LiveLocation {
            requester: read_fix(row, 14, 15, 16)?,
            helper: read_fix(row, 17, 18, 19)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use nearhelp_core::now_utc;

    fn open_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn sample_request(now: DateTime<Utc>) -> HelpRequest {
        HelpRequest::new(
            ParticipantId::new(),
            "Medical",
            "Need someone to pick up a prescription",
            Coordinate::new(48.8566, 2.3522),
            Visibility::Public,
            30,
            now,
        )
        .unwrap()
    }

    #[test]
    fn insert_and_read_back() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);

        db.insert_request(&request).unwrap();
        let loaded = db.get_request(request.id).unwrap();
        assert_eq!(loaded, request);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let db = open_db();
        let err = db.get_request(RequestId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn active_count_ignores_terminal_requests() {
        let db = open_db();
        let now = now_utc();
        let requester = ParticipantId::new();

        for _ in 0..2 {
            let mut req = sample_request(now);
            req.requester_id = requester;
            db.insert_request(&req).unwrap();
        }
        let mut done = sample_request(now);
        done.requester_id = requester;
        let done_id = done.id;
        db.insert_request(&done).unwrap();
        assert!(db
            .try_complete(done_id, requester, Role::Requester, now)
            .unwrap());

        assert_eq!(db.active_request_count(requester).unwrap(), 2);
    }

    #[test]
    fn accept_cas_single_winner() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        let first = ParticipantId::new();
        let second = ParticipantId::new();

        assert!(db.try_accept(request.id, first, now).unwrap());
        assert!(!db.try_accept(request.id, second, now).unwrap());

        let loaded = db.get_request(request.id).unwrap();
        assert_eq!(loaded.status, RequestStatus::Accepted);
        assert_eq!(loaded.helper_id, Some(first));
        assert_eq!(loaded.accepted_at, Some(now));

        let reason = db.classify_lost_transition(request.id, now).unwrap();
        assert!(matches!(reason, LifecycleError::Conflict(_)));
    }

    #[test]
    fn accept_refuses_after_deadline() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        let late = now + Duration::minutes(31);
        assert!(!db.try_accept(request.id, ParticipantId::new(), late).unwrap());
        assert_eq!(
            db.classify_lost_transition(request.id, late).unwrap(),
            LifecycleError::Expired
        );
    }

    #[test]
    fn accept_refuses_self() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        assert!(!db.try_accept(request.id, request.requester_id, now).unwrap());
    }

    #[test]
    fn helper_cannot_complete_open_request() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        let helper = ParticipantId::new();
        assert!(!db.try_complete(request.id, helper, Role::Helper, now).unwrap());

        // After accepting, the helper may complete.
        assert!(db.try_accept(request.id, helper, now).unwrap());
        assert!(db.try_complete(request.id, helper, Role::Helper, now).unwrap());

        let loaded = db.get_request(request.id).unwrap();
        assert_eq!(loaded.status, RequestStatus::Completed);
        assert_eq!(loaded.completed_by, Some(helper));
    }

    #[test]
    fn expire_is_idempotent_and_conditional() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        // Not due yet.
        assert!(!db.try_expire(request.id, now).unwrap());

        let late = now + Duration::minutes(31);
        assert_eq!(db.due_for_expiry(late).unwrap(), vec![request.id]);
        assert!(db.try_expire(request.id, late).unwrap());
        // Second sweep: no-op, not an error.
        assert!(!db.try_expire(request.id, late).unwrap());
        assert!(db.due_for_expiry(late).unwrap().is_empty());

        assert_eq!(
            db.get_request(request.id).unwrap().status,
            RequestStatus::Expired
        );
    }

    #[test]
    fn expire_loses_to_accept() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        assert!(db.try_accept(request.id, ParticipantId::new(), now).unwrap());
        let late = now + Duration::minutes(31);
        assert!(!db.try_expire(request.id, late).unwrap());
        assert_eq!(
            db.get_request(request.id).unwrap().status,
            RequestStatus::Accepted
        );
    }

    #[test]
    fn live_location_round_trip() {
        let db = open_db();
        let now = now_utc();
        let request = sample_request(now);
        db.insert_request(&request).unwrap();

        let fix = LocationFix {
            coordinate: Coordinate::new(48.86, 2.35),
            timestamp: now,
        };
        db.update_live_location(request.id, Role::Helper, fix).unwrap();

        let loaded = db.get_request(request.id).unwrap();
        assert_eq!(loaded.live_location.helper, Some(fix));
        assert_eq!(loaded.live_location.requester, None);
    }

    #[test]
    fn retention_purge_removes_old_requests_and_messages() {
        let db = open_db();
        let now = now_utc();
        let old = sample_request(now - Duration::days(200));
        let fresh = sample_request(now);
        db.insert_request(&old).unwrap();
        db.insert_request(&fresh).unwrap();

        let msg = nearhelp_core::ChatMessage::new(
            old.id,
            old.requester_id,
            "A",
            "hello",
            now - Duration::days(200),
        )
        .unwrap();
        db.insert_message(&msg).unwrap();

        let removed = db.purge_older_than(now - Duration::days(180)).unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(db.get_request(old.id), Err(StoreError::NotFound)));
        assert!(db.get_request(fresh.id).is_ok());
        assert!(db.messages_for_request(old.id, 100, 0).unwrap().is_empty());
    }
}
