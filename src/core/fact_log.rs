//! The fact log: append-only, integrity-checked, idempotent on fact id.
//!
//! Each accepted fact is written to four places inside one SQLite
//! transaction: the `facts` row itself, the per-kind index, the global time
//! index (which also assigns the insertion sequence) and, when the subject
//! names a project, the per-project index. Readers never observe a fact that
//! is only partly indexed.

use crate::core::db;
use crate::core::error::FactflowError;
use crate::core::fact::{Fact, JsonMap};
use crate::core::pool::SqlitePool;
use crate::core::schemas;
use crate::core::store::Store;
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::Arc;

/// Result of a single [`FactLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// First time this id was seen; stored and indexed.
    Stored,
    /// Same id already in the log; nothing written.
    AlreadyPresent,
    /// Signature did not match the fact's fields; nothing written.
    Rejected,
}

impl AppendOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, AppendOutcome::Rejected)
    }
}

/// A fact together with its position in the time index.
#[derive(Debug, Clone)]
pub struct LoggedFact {
    pub seq: i64,
    pub fact: Fact,
}

pub struct FactLog {
    pool: Arc<SqlitePool>,
    db_path: PathBuf,
}

struct FactRow {
    id: String,
    ts: i64,
    source: String,
    kind: String,
    subject: String,
    payload: String,
    caused_by: Option<String>,
    sig: String,
}

const FACT_COLUMNS: &str = "f.id, f.ts, f.source, f.kind, f.subject, f.payload, f.caused_by, f.sig";

impl FactLog {
    /// Open (and migrate) the fact log of `store`. Failure is fatal to the caller.
    pub fn open(pool: Arc<SqlitePool>, store: &Store) -> Result<Self, FactflowError> {
        store.ensure_root()?;
        let log = Self {
            pool,
            db_path: store.facts_db_path(),
        };
        log.pool
            .with_write(&log.db_path, |conn| {
                db::apply_schema(
                    conn,
                    &[
                        schemas::FACTS_DB_SCHEMA_FACTS,
                        schemas::FACTS_DB_SCHEMA_KIND_INDEX,
                        schemas::FACTS_DB_SCHEMA_TIME_INDEX,
                        schemas::FACTS_DB_SCHEMA_PROJECT_INDEX,
                        schemas::FACTS_DB_INDEX_TIME_ORDER,
                    ],
                )
            })
            .map_err(|e| {
                FactflowError::StoreInitializationError(format!(
                    "fact log at {}: {}",
                    log.db_path.display(),
                    e
                ))
            })?;
        Ok(log)
    }

    pub fn append(&self, fact: &Fact) -> Result<AppendOutcome, FactflowError> {
        if !fact.verify() {
            tracing::warn!(fact_id = fact.id(), kind = fact.kind(), "fact failed integrity check, refusing append");
            return Ok(AppendOutcome::Rejected);
        }
        let subject = serde_json::to_string(fact.subject())?;
        let payload = serde_json::to_string(fact.payload())?;

        let outcome = self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM facts WHERE id = ?1", [fact.id()], |r| r.get(0))
                .optional()?;
            if exists.is_some() {
                return Ok(AppendOutcome::AlreadyPresent);
            }

            tx.execute(
                "INSERT INTO facts(id, ts, source, kind, subject, payload, caused_by, sig)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    fact.id(),
                    fact.timestamp(),
                    fact.source(),
                    fact.kind(),
                    subject,
                    payload,
                    fact.caused_by(),
                    fact.signature(),
                ],
            )?;
            tx.execute(
                "INSERT INTO fact_time_index(fact_id, ts) VALUES(?1, ?2)",
                params![fact.id(), fact.timestamp()],
            )?;
            let seq = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO fact_kind_index(kind, fact_id, seq) VALUES(?1, ?2, ?3)",
                params![fact.kind(), fact.id(), seq],
            )?;
            if let Some(project_id) = fact.project_id() {
                tx.execute(
                    "INSERT INTO fact_project_index(project_id, fact_id, seq) VALUES(?1, ?2, ?3)",
                    params![project_id, fact.id(), seq],
                )?;
            }
            tx.commit()?;
            Ok(AppendOutcome::Stored)
        })?;

        match outcome {
            AppendOutcome::Stored => {
                tracing::debug!(fact_id = fact.id(), kind = fact.kind(), "fact appended")
            }
            AppendOutcome::AlreadyPresent => {
                tracing::debug!(fact_id = fact.id(), "fact already in log")
            }
            AppendOutcome::Rejected => {}
        }
        Ok(outcome)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Fact>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {FACT_COLUMNS} FROM facts f WHERE f.id = ?1"),
                    [id],
                    read_row,
                )
                .optional()?;
            row.map(row_to_fact).transpose()
        })
    }

    /// Facts of `kind`, oldest first.
    pub fn get_by_kind(&self, kind: &str, limit: usize) -> Result<Vec<Fact>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            query_facts(
                conn,
                &format!(
                    "SELECT {FACT_COLUMNS} FROM fact_kind_index k
                     JOIN facts f ON f.id = k.fact_id
                     WHERE k.kind = ?1 ORDER BY k.seq ASC LIMIT ?2"
                ),
                params![kind, sql_limit(limit)],
            )
        })
    }

    /// Facts whose subject names `project_id`, oldest first.
    pub fn get_by_project(&self, project_id: &str, limit: usize) -> Result<Vec<Fact>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            query_facts(
                conn,
                &format!(
                    "SELECT {FACT_COLUMNS} FROM fact_project_index p
                     JOIN facts f ON f.id = p.fact_id
                     WHERE p.project_id = ?1 ORDER BY p.seq ASC LIMIT ?2"
                ),
                params![project_id, sql_limit(limit)],
            )
        })
    }

    /// Most recent facts by timestamp, newest first; equal timestamps put the
    /// later insertion first.
    pub fn get_latest(&self, limit: usize) -> Result<Vec<Fact>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            query_facts(
                conn,
                &format!(
                    "SELECT {FACT_COLUMNS} FROM fact_time_index t
                     JOIN facts f ON f.id = t.fact_id
                     ORDER BY t.ts DESC, t.seq DESC LIMIT ?1"
                ),
                params![sql_limit(limit)],
            )
        })
    }

    /// Facts in insertion order with `seq > after_seq`.
    pub fn replay(&self, after_seq: i64, limit: usize) -> Result<Vec<LoggedFact>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT t.seq, {FACT_COLUMNS} FROM fact_time_index t
                 JOIN facts f ON f.id = t.fact_id
                 WHERE t.seq > ?1 ORDER BY t.seq ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![after_seq, sql_limit(limit)], |r| {
                    let seq: i64 = r.get(0)?;
                    Ok((seq, read_row_at(r, 1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(seq, row)| Ok(LoggedFact { seq, fact: row_to_fact(row)? }))
                .collect()
        })
    }

    /// Every fact in insertion order.
    pub fn all_in_order(&self) -> Result<Vec<Fact>, FactflowError> {
        Ok(self
            .replay(0, usize::MAX)?
            .into_iter()
            .map(|l| l.fact)
            .collect())
    }

    pub fn count(&self) -> Result<u64, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }

    /// Re-verify every stored signature; returns the ids that no longer match.
    pub fn verify_all(&self) -> Result<Vec<String>, FactflowError> {
        let facts = self.all_in_order()?;
        let mut bad: Vec<String> = facts
            .par_iter()
            .filter(|f| !f.verify())
            .map(|f| f.id().to_string())
            .collect();
        bad.sort();
        if !bad.is_empty() {
            tracing::warn!(count = bad.len(), "stored facts failed integrity check");
        }
        Ok(bad)
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn read_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FactRow> {
    read_row_at(r, 0)
}

fn read_row_at(r: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<FactRow> {
    Ok(FactRow {
        id: r.get(base)?,
        ts: r.get(base + 1)?,
        source: r.get(base + 2)?,
        kind: r.get(base + 3)?,
        subject: r.get(base + 4)?,
        payload: r.get(base + 5)?,
        caused_by: r.get(base + 6)?,
        sig: r.get(base + 7)?,
    })
}

fn row_to_fact(row: FactRow) -> Result<Fact, FactflowError> {
    let subject: JsonMap = serde_json::from_str(&row.subject)?;
    let payload: JsonMap = serde_json::from_str(&row.payload)?;
    Ok(Fact::from_stored(
        row.id,
        row.ts,
        row.source,
        row.kind,
        subject,
        payload,
        row.caused_by,
        row.sig,
    ))
}

fn query_facts(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Fact>, FactflowError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(row_to_fact).collect()
}
