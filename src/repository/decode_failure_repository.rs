use super::database::now_millis;
use crate::events::DecodeFailure;
use anyhow::Result;
use rusqlite::params;

pub struct DecodeFailureRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> DecodeFailureRepository<'a> {
    const INSERT_FAILURE: &'static str = "INSERT OR IGNORE INTO decode_failures (
            src_chain_id, contract_address, block_number, transaction_hash,
            log_index, reason, data, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

    const SELECT_RECENT: &'static str = "SELECT src_chain_id, contract_address, block_number,
            transaction_hash, log_index, reason, data, created_at
         FROM decode_failures ORDER BY id DESC LIMIT ?1";

    const COUNT: &'static str = "SELECT COUNT(*) FROM decode_failures";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert_batch(&self, failures: &[DecodeFailure]) -> Result<usize> {
        let mut stmt = self.conn.prepare(Self::INSERT_FAILURE)?;
        let now = now_millis();
        let mut count = 0;

        for failure in failures {
            count += stmt.execute(params![
                failure.src_chain_id,
                format!("{:?}", failure.contract_address),
                failure.block_number,
                failure.transaction_hash.map(|h| format!("{h:?}")),
                failure.log_index,
                failure.reason,
                failure.data.to_string(),
                now,
            ])?;
        }

        Ok(count)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<DecodeFailureRow>> {
        let mut stmt = self.conn.prepare(Self::SELECT_RECENT)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(DecodeFailureRow {
                    src_chain_id: row.get(0)?,
                    contract_address: row.get(1)?,
                    block_number: row.get(2)?,
                    transaction_hash: row.get(3)?,
                    log_index: row.get(4)?,
                    reason: row.get(5)?,
                    data: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.conn.query_row(Self::COUNT, [], |row| row.get(0))?)
    }
}

#[derive(Debug, Clone)]
pub struct DecodeFailureRow {
    pub src_chain_id: u64,
    pub contract_address: String,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
    pub reason: String,
    pub data: String,
    pub created_at: i64,
}
