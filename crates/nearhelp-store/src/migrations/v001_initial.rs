//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `requests` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Help requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS requests (
    id           TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    requester_id TEXT NOT NULL,              -- UUID v4
    helper_id    TEXT,                       -- set iff accepted/completed
    category     TEXT NOT NULL,
    description  TEXT NOT NULL,
    origin_lat   REAL NOT NULL,
    origin_lng   REAL NOT NULL,
    visibility   TEXT NOT NULL,              -- public | nearby-only | trusted-contacts-only
    status       TEXT NOT NULL,              -- open | accepted | completed | expired
    created_at   TEXT NOT NULL,              -- RFC-3339, fixed width (sortable)
    accepted_at  TEXT,
    completed_at TEXT,
    expires_at   TEXT NOT NULL,              -- never mutated after creation
    completed_by TEXT,

    -- Live-location slots, one per role.  Never expired by the engine.
    requester_loc_lat REAL,
    requester_loc_lng REAL,
    requester_loc_ts  TEXT,
    helper_loc_lat    REAL,
    helper_loc_lng    REAL,
    helper_loc_ts     TEXT
);

CREATE INDEX IF NOT EXISTS idx_requests_requester ON requests(requester_id);
CREATE INDEX IF NOT EXISTS idx_requests_helper    ON requests(helper_id);
CREATE INDEX IF NOT EXISTS idx_requests_status_expiry
    ON requests(status, expires_at);

-- ----------------------------------------------------------------
-- Chat messages (append-only, owned by their request)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    request_id  TEXT NOT NULL,               -- FK -> requests(id)
    sender_id   TEXT NOT NULL,
    sender_name TEXT NOT NULL,               -- denormalized for display
    body        TEXT NOT NULL,
    timestamp   TEXT NOT NULL,               -- RFC-3339, fixed width

    FOREIGN KEY (request_id) REFERENCES requests(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_request_ts
    ON messages(request_id, timestamp);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
