use super::database::now_millis;
use crate::events::EventKey;
use anyhow::Result;
use rusqlite::{OptionalExtension, params};

/// Relay tasks the executor gave up on. The indexer only reads this table;
/// `insert` exists for the executor side and for tests.
pub struct SuspendedTransactionRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> SuspendedTransactionRepository<'a> {
    const INSERT_SUSPENDED: &'static str = "INSERT OR IGNORE INTO suspended_transactions
            (src_chain_id, transaction_hash, log_index, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)";

    const IS_SUSPENDED: &'static str = "SELECT 1 FROM suspended_transactions
         WHERE src_chain_id = ?1 AND transaction_hash = ?2 AND log_index = ?3";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, key: &EventKey, reason: &str) -> Result<()> {
        self.conn.execute(
            Self::INSERT_SUSPENDED,
            params![
                key.src_chain_id,
                format!("{:?}", key.transaction_hash),
                key.log_index,
                reason,
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn is_suspended(&self, key: &EventKey) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                Self::IS_SUSPENDED,
                params![
                    key.src_chain_id,
                    format!("{:?}", key.transaction_hash),
                    key.log_index
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
