use super::database::now_millis;
use crate::events::{BridgeEventKind, Event, EventKey, EventStatus};
use alloy_primitives::{Address, B256};
use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, ToSql, params, params_from_iter};
use std::str::FromStr;

pub struct EventRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> EventRepository<'a> {
    // The unique identity key makes replays a no-op
    const INSERT_EVENT: &'static str = "INSERT OR IGNORE INTO events (
            src_chain_id, dest_chain_id, contract_address, event_name, msg_hash,
            block_number, transaction_hash, log_index, payload, status,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)";

    const EXISTS: &'static str = "SELECT 1 FROM events
         WHERE src_chain_id = ?1 AND transaction_hash = ?2 AND log_index = ?3";

    const UPDATE_STATUS: &'static str = "UPDATE events SET status = ?1, updated_at = ?2
         WHERE src_chain_id = ?3 AND transaction_hash = ?4 AND log_index = ?5";

    const SELECT_EVENT: &'static str = "SELECT src_chain_id, dest_chain_id, contract_address,
            event_name, msg_hash, block_number, transaction_hash, log_index, payload, status
         FROM events";

    const COUNT_BY_STATUS: &'static str =
        "SELECT status, COUNT(*) FROM events GROUP BY status ORDER BY status";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Returns `false` when an event with the same identity key is already stored.
    pub fn insert(&self, event: &Event) -> Result<bool> {
        let changed = self.conn.execute(
            Self::INSERT_EVENT,
            params![
                event.src_chain_id,
                event.dest_chain_id,
                format!("{:?}", event.contract_address),
                event.name.name(),
                format!("{:?}", event.msg_hash),
                event.block_number,
                format!("{:?}", event.transaction_hash),
                event.log_index,
                event.payload.to_string(),
                event.status.as_str(),
                now_millis(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Inserts `events` with one prepared statement and returns the keys that
    /// were new. Runs inside the caller's transaction.
    pub fn insert_batch(&self, events: &[Event]) -> Result<Vec<EventKey>> {
        let mut inserted = Vec::new();
        let mut stmt = self.conn.prepare(Self::INSERT_EVENT)?;
        let now = now_millis();

        for event in events {
            let changed = stmt.execute(params![
                event.src_chain_id,
                event.dest_chain_id,
                format!("{:?}", event.contract_address),
                event.name.name(),
                format!("{:?}", event.msg_hash),
                event.block_number,
                format!("{:?}", event.transaction_hash),
                event.log_index,
                event.payload.to_string(),
                event.status.as_str(),
                now,
            ])?;
            if changed > 0 {
                inserted.push(event.key());
            }
        }

        Ok(inserted)
    }

    pub fn exists(&self, key: &EventKey) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                Self::EXISTS,
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

    pub fn update_status(&self, key: &EventKey, status: EventStatus) -> Result<()> {
        self.conn.execute(
            Self::UPDATE_STATUS,
            params![
                status.as_str(),
                now_millis(),
                key.src_chain_id,
                format!("{:?}", key.transaction_hash),
                key.log_index
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &EventKey) -> Result<Option<Event>> {
        let sql = format!(
            "{} WHERE src_chain_id = ?1 AND transaction_hash = ?2 AND log_index = ?3",
            Self::SELECT_EVENT
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![
                    key.src_chain_id,
                    format!("{:?}", key.transaction_hash),
                    key.log_index
                ],
                read_event_row,
            )
            .optional()?;
        row.map(EventRow::into_event).transpose()
    }

    /// `new` events created before `created_before` (unix millis), oldest first.
    pub fn find_unpublished(&self, created_before: i64, limit: usize) -> Result<Vec<Event>> {
        let sql = format!(
            "{} WHERE status = ?1 AND created_at <= ?2 ORDER BY block_number, log_index LIMIT ?3",
            Self::SELECT_EVENT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![EventStatus::New.as_str(), created_before, limit as i64],
                read_event_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(name) = filter.event_name {
            conditions.push("event_name = ?");
            params.push(Box::new(name.name()));
        }

        if let Some((start, end)) = filter.block_range {
            conditions.push("block_number >= ?");
            params.push(Box::new(start));
            conditions.push("block_number <= ?");
            params.push(Box::new(end));
        }

        let mut sql = Self::SELECT_EVENT.to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY block_number DESC, log_index DESC LIMIT ? OFFSET ?");
        params.push(Box::new(filter.limit as i64));
        params.push(Box::new(filter.offset as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), read_event_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub fn count_by_status(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(Self::COUNT_BY_STATUS)?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub event_name: Option<BridgeEventKind>,
    pub block_range: Option<(u64, u64)>,
    pub limit: usize,
    pub offset: usize,
}

struct EventRow {
    src_chain_id: u64,
    dest_chain_id: Option<u64>,
    contract_address: String,
    event_name: String,
    msg_hash: String,
    block_number: u64,
    transaction_hash: String,
    log_index: u64,
    payload: String,
    status: String,
}

fn read_event_row(row: &Row) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        src_chain_id: row.get(0)?,
        dest_chain_id: row.get(1)?,
        contract_address: row.get(2)?,
        event_name: row.get(3)?,
        msg_hash: row.get(4)?,
        block_number: row.get(5)?,
        transaction_hash: row.get(6)?,
        log_index: row.get(7)?,
        payload: row.get(8)?,
        status: row.get(9)?,
    })
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            src_chain_id: self.src_chain_id,
            dest_chain_id: self.dest_chain_id,
            contract_address: Address::from_str(&self.contract_address)?,
            name: BridgeEventKind::from_str(&self.event_name).map_err(|e| anyhow!(e))?,
            msg_hash: B256::from_str(&self.msg_hash)?,
            block_number: self.block_number,
            transaction_hash: B256::from_str(&self.transaction_hash)?,
            log_index: self.log_index,
            payload: serde_json::from_str(&self.payload)?,
            status: EventStatus::from_str(&self.status).map_err(|e| anyhow!(e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BridgeEventKind, decode_event};
    use crate::mock::message_sent_log;
    use crate::repository::Database;

    fn event(block: u64, log_index: u64) -> Event {
        let log = message_sent_log(Address::repeat_byte(0x22), block, log_index, block);
        decode_event(BridgeEventKind::MessageSent, 1, &log).unwrap()
    }

    #[test]
    fn insert_is_idempotent_on_identity_key() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = EventRepository::new(conn);
            let e = event(10, 0);
            assert!(repo.insert(&e)?);
            assert!(!repo.insert(&e)?);
            assert!(repo.exists(&e.key())?);
            assert!(!repo.exists(&event(10, 1).key())?);

            let inserted = repo.insert_batch(&[e.clone(), event(10, 1)])?;
            assert_eq!(inserted, vec![event(10, 1).key()]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn stored_event_reads_back_intact() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = EventRepository::new(conn);
            let e = event(11, 2);
            repo.insert(&e)?;
            repo.update_status(&e.key(), EventStatus::Queued)?;

            let stored = repo.get(&e.key())?.expect("event stored");
            assert_eq!(stored.status, EventStatus::Queued);
            assert_eq!(stored.payload, e.payload);
            assert_eq!(stored.msg_hash, e.msg_hash);
            assert_eq!(stored.contract_address, e.contract_address);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unpublished_only_returns_new_events() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let repo = EventRepository::new(conn);
            let queued = event(1, 0);
            let fresh = event(2, 0);
            repo.insert(&queued)?;
            repo.insert(&fresh)?;
            repo.update_status(&queued.key(), EventStatus::Queued)?;

            let pending = repo.find_unpublished(now_millis(), 10)?;
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].key(), fresh.key());

            assert!(repo.find_unpublished(0, 10)?.is_empty());

            let counts = repo.count_by_status()?;
            assert_eq!(counts, vec![("new".to_string(), 1), ("queued".to_string(), 1)]);
            Ok(())
        })
        .unwrap();
    }
}
