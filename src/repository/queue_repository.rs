use super::database::now_millis;
use anyhow::Result;
use rusqlite::params;

/// Append-only outbox backing the durable queue.
pub struct QueueRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> QueueRepository<'a> {
    const INSERT_MESSAGE: &'static str =
        "INSERT INTO queue_messages (event_key, body, created_at) VALUES (?1, ?2, ?3)";

    const SELECT_AFTER: &'static str = "SELECT id, event_key, body FROM queue_messages
         WHERE id > ?1 ORDER BY id LIMIT ?2";

    const COUNT: &'static str = "SELECT COUNT(*) FROM queue_messages";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, event_key: &str, body: &str) -> Result<i64> {
        self.conn
            .execute(Self::INSERT_MESSAGE, params![event_key, body, now_millis()])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Messages with an id greater than `after_id`, in publish order.
    pub fn read_after(&self, after_id: i64, limit: usize) -> Result<Vec<(i64, String, String)>> {
        let mut stmt = self.conn.prepare(Self::SELECT_AFTER)?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.conn.query_row(Self::COUNT, [], |row| row.get(0))?)
    }
}
