use chrono::Utc;
use tracing::instrument;

use maestro_core::ids::SessionId;
use maestro_core::messages::{HistoryPage, MessageRecord, StoredMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Append-only message log per session. The `seq` column is the insertion
/// order and doubles as the pagination cursor.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message, returning its sequence number.
    #[instrument(skip(self, message), fields(session_id = %session_id, role = message.role()))]
    pub fn record(
        &self,
        session_id: &SessionId,
        message: &StoredMessage,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(message)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (session_id, role, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![session_id.as_str(), message.role(), payload, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Full history in insertion order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, payload, created_at FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }

    /// Newest-first page. `before` is an exclusive cursor from a previous
    /// page; `None` starts from the latest message.
    #[instrument(skip(self), fields(session_id = %session_id, limit))]
    pub fn history_page(
        &self,
        session_id: &SessionId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<HistoryPage, StoreError> {
        self.db.with_conn(|conn| {
            // Fetch one extra row to detect whether more pages exist.
            let fetch = i64::from(limit) + 1;
            let mut records = Vec::new();

            match before {
                Some(cursor) => {
                    let mut stmt = conn.prepare(
                        "SELECT seq, payload, created_at FROM messages
                         WHERE session_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![session_id.as_str(), cursor, fetch])?;
                    while let Some(row) = rows.next()? {
                        records.push(row_to_record(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT seq, payload, created_at FROM messages
                         WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![session_id.as_str(), fetch])?;
                    while let Some(row) = rows.next()? {
                        records.push(row_to_record(row)?);
                    }
                }
            }

            let has_more = records.len() > limit as usize;
            records.truncate(limit as usize);
            let next_cursor = if has_more {
                records.last().map(|r| r.seq)
            } else {
                None
            };

            Ok(HistoryPage { messages: records, has_more, next_cursor })
        })
    }

    /// Keep messages at ascending positions `0..=index`, delete the rest.
    #[instrument(skip(self), fields(session_id = %session_id, index))]
    pub fn truncate_after(&self, session_id: &SessionId, index: usize) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let seqs = session_seqs(conn, session_id)?;
            match seqs.get(index) {
                Some(boundary) => {
                    let deleted = conn.execute(
                        "DELETE FROM messages WHERE session_id = ?1 AND seq > ?2",
                        rusqlite::params![session_id.as_str(), boundary],
                    )?;
                    Ok(deleted)
                }
                // Index beyond the end: nothing to truncate.
                None => Ok(0),
            }
        })
    }

    /// Replace the payload at ascending position `index`.
    #[instrument(skip(self, message), fields(session_id = %session_id, index))]
    pub fn update_at(
        &self,
        session_id: &SessionId,
        index: usize,
        message: &StoredMessage,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(message)?;
        self.db.with_conn(|conn| {
            let seqs = session_seqs(conn, session_id)?;
            match seqs.get(index) {
                Some(seq) => {
                    let changed = conn.execute(
                        "UPDATE messages SET role = ?1, payload = ?2 WHERE seq = ?3",
                        rusqlite::params![message.role(), payload, seq],
                    )?;
                    Ok(changed > 0)
                }
                None => Ok(false),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

fn session_seqs(
    conn: &rusqlite::Connection,
    session_id: &SessionId,
) -> Result<Vec<i64>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT seq FROM messages WHERE session_id = ?1 ORDER BY seq ASC")?;
    let seqs = stmt
        .query_map([session_id.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(seqs)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let seq: i64 = row_helpers::get(row, 0, "messages", "seq")?;
    let raw: String = row_helpers::get(row, 1, "messages", "payload")?;
    let message: StoredMessage = row_helpers::parse_json(&raw, "messages", "payload")?;
    let created_at: String = row_helpers::get(row, 2, "messages", "created_at")?;
    Ok(MessageRecord { seq, message, created_at })
}
