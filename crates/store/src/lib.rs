//! Durable key/value + relational store for tasks, task updates, events,
//! and read-receipts (spec §6.6). A thin wrapper around a single
//! `rusqlite::Connection` guarded by a mutex — grounded on
//! `agtrace-index::Database`'s open/init_schema/query style, generalized
//! from a read-mostly log index to a read-write transactional store with
//! a busy-wait retry policy (§7 `Busy`).

mod events;
mod history;
mod schema;
mod tasks;

pub use events::{EventFilter, ListOrder};
pub use tasks::TaskFilter;

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use sa_domain::error::{Error, Result};

pub struct Store {
    conn: Mutex<Connection>,
    busy_retries: u32,
    busy_backoff: Duration,
}

impl Store {
    pub fn open(path: &Path, busy_timeout_ms: u64, busy_retries: u32, busy_backoff_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, busy_timeout_ms, busy_retries, busy_backoff_ms)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, 5_000, 3, 25)
    }

    fn from_connection(
        conn: Connection,
        busy_timeout_ms: u64,
        busy_retries: u32,
        busy_backoff_ms: u64,
    ) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let store = Self {
            conn: Mutex::new(conn),
            busy_retries,
            busy_backoff: Duration::from_millis(busy_backoff_ms),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        schema::init_schema(&conn)
    }

    /// §7 `Busy`: retry a store write up to `busy_retries` times with a
    /// fixed backoff before surfacing the error to the caller.
    pub(crate) fn retry_busy<T>(&self, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        let mut attempt = 0;
        loop {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_busy() && attempt < self.busy_retries => {
                    attempt += 1;
                    std::thread::sleep(self.busy_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Converts a `rusqlite::Error` carrying `SQLITE_BUSY`/`SQLITE_LOCKED`
/// into the domain `Busy` variant so `retry_busy` and callers can match on
/// it uniformly; anything else passes through as `Error::Sqlite`.
pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref code, _) = e {
        if code.code == rusqlite::ErrorCode::DatabaseBusy
            || code.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return Error::Busy(e.to_string());
        }
    }
    Error::Sqlite(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_initializes_schema_idempotently() {
        let store = Store::open_in_memory().unwrap();
        // Re-running init_schema must not fail (CREATE TABLE IF NOT EXISTS).
        store.init_schema().unwrap();
    }
}
