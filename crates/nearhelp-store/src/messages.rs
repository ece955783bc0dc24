//! Chat message persistence: the append path plus the plain paginated
//! read used for history.  The realtime relay never reads from here.

use rusqlite::params;
use uuid::Uuid;

use nearhelp_core::{ChatMessage, ParticipantId, RequestId};

use crate::database::{decode_ts, encode_ts, Database};
use crate::error::{Result, StoreError};

impl Database {
    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, request_id, sender_id, sender_name, body, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.request_id.0.to_string(),
                message.sender_id.0.to_string(),
                message.sender_name,
                message.body,
                encode_ts(message.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Messages for one request in send order, oldest first.
    pub fn messages_for_request(
        &self,
        request_id: RequestId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, request_id, sender_id, sender_name, body, timestamp \
             FROM messages \
             WHERE request_id = ?1 \
             ORDER BY timestamp ASC \
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![request_id.0.to_string(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: Uuid) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                "SELECT id, request_id, sender_id, sender_name, body, timestamp \
                 FROM messages WHERE id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_str: String = row.get(0)?;
    let request_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let ts_str: String = row.get(5)?;

    let text_err = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    Ok(ChatMessage {
        id: Uuid::parse_str(&id_str).map_err(|e| text_err(0, Box::new(e)))?,
        request_id: RequestId(
            Uuid::parse_str(&request_str).map_err(|e| text_err(1, Box::new(e)))?,
        ),
        sender_id: ParticipantId(
            Uuid::parse_str(&sender_str).map_err(|e| text_err(2, Box::new(e)))?,
        ),
        sender_name: row.get(3)?,
        body: row.get(4)?,
        timestamp: decode_ts(&ts_str).map_err(|e| text_err(5, Box::new(e)))?,
    })
}
