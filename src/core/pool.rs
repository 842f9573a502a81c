//! SQLite connection pool with read/write separation and retry logic.
//!
//! - Maintains a **write mutex** per DB for serialized write access
//! - Creates fresh **read connections** per operation (no mutex, concurrent via WAL)
//! - Retries writes that hit `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff
//!
//! A pool belongs to one runtime [`Context`](crate::core::context::Context);
//! there is no process-wide instance, so tests can run isolated stores side by side.

use crate::core::db;
use crate::core::error::FactflowError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 50;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 2_000;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u32 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u32 = 5;

/// Per-database entry holding a write mutex for serialized write access.
struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

/// Connection pool providing read/write separation per SQLite database.
#[derive(Default)]
pub struct SqlitePool {
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl SqlitePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_entry(&self, db_path: &Path) -> Result<Arc<PoolEntry>, FactflowError> {
        let key = db_path.to_path_buf();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("sqlite pool entries"))?;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(PoolEntry {
                write_lock: Mutex::new(()),
                db_path: key,
            })
        });
        Ok(Arc::clone(entry))
    }

    /// Execute a closure with a write connection for the given DB path.
    ///
    /// Write access is serialized per DB. The closure may run more than once
    /// when SQLite reports the database busy, so it must not have side effects
    /// outside the connection.
    pub fn with_write<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, FactflowError>
    where
        F: FnMut(&mut Connection) -> Result<R, FactflowError>,
    {
        let entry = self.get_entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("sqlite pool write lock"))?;

        retry_on_busy(|| {
            let mut conn = db::db_connect_with_timeout(&entry.db_path, WRITE_BUSY_TIMEOUT_SECS)?;
            f(&mut conn)
        })
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, FactflowError>
    where
        F: FnOnce(&Connection) -> Result<R, FactflowError>,
    {
        let conn = db::db_connect_with_timeout(db_path, READ_BUSY_TIMEOUT_SECS)?;
        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff.
fn retry_on_busy<F, R>(mut f: F) -> Result<R, FactflowError>
where
    F: FnMut() -> Result<R, FactflowError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                tracing::debug!(attempt, delay_ms, "sqlite busy, retrying write");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an error is a SQLite busy/locked error that is retryable.
fn is_busy_error(err: &FactflowError) -> bool {
    match err {
        FactflowError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
