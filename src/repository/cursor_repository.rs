use super::database::now_millis;
use crate::cursor::WatchTarget;
use anyhow::Result;
use rusqlite::{OptionalExtension, params};

pub struct CursorRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> CursorRepository<'a> {
    const ENSURE_TARGET: &'static str = "INSERT OR IGNORE INTO watch_targets
            (chain_id, contract_address, event_name, updated_at)
         VALUES (?1, ?2, ?3, ?4)";

    // Never moves the cursor backwards
    const ADVANCE_CURSOR: &'static str = "UPDATE watch_targets
         SET last_processed_block = MAX(COALESCE(last_processed_block, ?1), ?1),
             updated_at = ?5
         WHERE chain_id = ?2 AND contract_address = ?3 AND event_name = ?4";

    const SET_GENESIS_BLOCK: &'static str = "UPDATE watch_targets
         SET genesis_block = ?1, updated_at = ?5
         WHERE chain_id = ?2 AND contract_address = ?3 AND event_name = ?4";

    const GET_LAST_PROCESSED_BLOCK: &'static str = "SELECT last_processed_block FROM watch_targets
         WHERE chain_id = ?1 AND contract_address = ?2 AND event_name = ?3";

    const GET_GENESIS_BLOCK: &'static str = "SELECT genesis_block FROM watch_targets
         WHERE chain_id = ?1 AND contract_address = ?2 AND event_name = ?3";

    const LIST_TARGETS: &'static str = "SELECT chain_id, contract_address, event_name,
            genesis_block, last_processed_block, updated_at
         FROM watch_targets ORDER BY chain_id, contract_address, event_name";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    fn ensure(&self, target: &WatchTarget) -> Result<()> {
        self.conn.execute(
            Self::ENSURE_TARGET,
            params![
                target.src_chain_id,
                format!("{:?}", target.contract_address),
                target.event.name(),
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn get_last_processed_block(&self, target: &WatchTarget) -> Result<Option<u64>> {
        let block: Option<Option<u64>> = self
            .conn
            .query_row(
                Self::GET_LAST_PROCESSED_BLOCK,
                params![
                    target.src_chain_id,
                    format!("{:?}", target.contract_address),
                    target.event.name()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.flatten())
    }

    /// Moves the cursor to `block_number` unless it is already further.
    pub fn advance(&self, target: &WatchTarget, block_number: u64) -> Result<()> {
        self.ensure(target)?;
        self.conn.execute(
            Self::ADVANCE_CURSOR,
            params![
                block_number,
                target.src_chain_id,
                format!("{:?}", target.contract_address),
                target.event.name(),
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn get_genesis_block(&self, target: &WatchTarget) -> Result<Option<u64>> {
        let block: Option<Option<u64>> = self
            .conn
            .query_row(
                Self::GET_GENESIS_BLOCK,
                params![
                    target.src_chain_id,
                    format!("{:?}", target.contract_address),
                    target.event.name()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.flatten())
    }

    pub fn set_genesis_block(&self, target: &WatchTarget, block_number: u64) -> Result<()> {
        self.ensure(target)?;
        self.conn.execute(
            Self::SET_GENESIS_BLOCK,
            params![
                block_number,
                target.src_chain_id,
                format!("{:?}", target.contract_address),
                target.event.name(),
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<CursorRow>> {
        let mut stmt = self.conn.prepare(Self::LIST_TARGETS)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CursorRow {
                    chain_id: row.get(0)?,
                    contract_address: row.get(1)?,
                    event_name: row.get(2)?,
                    genesis_block: row.get(3)?,
                    last_processed_block: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct CursorRow {
    pub chain_id: u64,
    pub contract_address: String,
    pub event_name: String,
    pub genesis_block: Option<u64>,
    pub last_processed_block: Option<u64>,
    pub updated_at: i64,
}
