//! Connection setup shared by the fact log and the views: WAL journal,
//! foreign keys, busy timeout.

use crate::core::error;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn db_connect_with_timeout(
    db_path: &Path,
    busy_timeout_secs: u32,
) -> Result<Connection, error::FactflowError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(u64::from(busy_timeout_secs)))
        .map_err(error::FactflowError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::FactflowError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::FactflowError::RusqliteError)?;
    Ok(conn)
}

/// Run a list of DDL statements against a connection.
pub fn apply_schema(conn: &Connection, statements: &[&str]) -> Result<(), error::FactflowError> {
    for stmt in statements {
        conn.execute(stmt, [])
            .map_err(error::FactflowError::RusqliteError)?;
    }
    Ok(())
}
