use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared SQLite connection. Blocking work is pushed onto the blocking pool
/// with [`Database::run`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        create_tables(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&conn)
    }

    /// Like [`Database::with_conn`], off the async executor.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f)).await?
    }
}

fn create_tables(conn: &Connection) -> Result<()> {
    // One row per indexed stream; holds the progress cursor
    conn.execute(
        "CREATE TABLE IF NOT EXISTS watch_targets (
            chain_id INTEGER NOT NULL,
            contract_address TEXT NOT NULL,
            event_name TEXT NOT NULL,
            genesis_block INTEGER,
            last_processed_block INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (chain_id, contract_address, event_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            src_chain_id INTEGER NOT NULL,
            dest_chain_id INTEGER,
            contract_address TEXT NOT NULL,
            event_name TEXT NOT NULL,
            msg_hash TEXT NOT NULL,
            block_number INTEGER NOT NULL,
            transaction_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (src_chain_id, transaction_hash, log_index)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_status_created
         ON events(status, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_block_number
         ON events(block_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS decode_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            src_chain_id INTEGER NOT NULL,
            contract_address TEXT NOT NULL,
            block_number INTEGER,
            transaction_hash TEXT,
            log_index INTEGER,
            reason TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (src_chain_id, transaction_hash, log_index)
        )",
        [],
    )?;

    // Written by the relay executor, only read here
    conn.execute(
        "CREATE TABLE IF NOT EXISTS suspended_transactions (
            src_chain_id INTEGER NOT NULL,
            transaction_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            reason TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (src_chain_id, transaction_hash, log_index)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
