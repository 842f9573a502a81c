//! Centralized database schema definitions.
//!
//! factflow keeps two SQLite databases ("bins") per store:
//! 1. facts.db: the append-only fact log and its three secondary indexes.
//! 2. views.db: current-state projections derived from the log.
//!
//! The fact log tables mirror a key/value + set + sorted-set layout: one row
//! per fact keyed by id, set-style index tables keyed by (kind, id) and
//! (project, id), and a time index ordered by (ts, seq).

pub const CONFIG_FILE_NAME: &str = "factflow.toml";

// --- 1. Fact log bin ---
pub const FACTS_DB_NAME: &str = "facts.db";

pub const FACTS_DB_SCHEMA_FACTS: &str = "
    CREATE TABLE IF NOT EXISTS facts (
        id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL,
        source TEXT NOT NULL,
        kind TEXT NOT NULL,
        subject TEXT NOT NULL,
        payload TEXT NOT NULL,
        caused_by TEXT,
        sig TEXT NOT NULL
    )
";

pub const FACTS_DB_SCHEMA_KIND_INDEX: &str = "
    CREATE TABLE IF NOT EXISTS fact_kind_index (
        kind TEXT NOT NULL,
        fact_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (kind, fact_id)
    )
";

pub const FACTS_DB_SCHEMA_TIME_INDEX: &str = "
    CREATE TABLE IF NOT EXISTS fact_time_index (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        fact_id TEXT NOT NULL UNIQUE,
        ts INTEGER NOT NULL
    )
";

pub const FACTS_DB_SCHEMA_PROJECT_INDEX: &str = "
    CREATE TABLE IF NOT EXISTS fact_project_index (
        project_id TEXT NOT NULL,
        fact_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (project_id, fact_id)
    )
";

pub const FACTS_DB_INDEX_TIME_ORDER: &str =
    "CREATE INDEX IF NOT EXISTS idx_fact_time_order ON fact_time_index(ts, seq)";

// --- 2. Views bin ---
pub const VIEWS_DB_NAME: &str = "views.db";

pub const VIEWS_DB_SCHEMA_PROJECTS: &str = "
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL,
        progress REAL NOT NULL DEFAULT 0,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        total_tasks INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const VIEWS_DB_SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL,
        assignee TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const VIEWS_DB_SCHEMA_DEPENDENCIES: &str = "
    CREATE TABLE IF NOT EXISTS dependencies (
        source_task_id TEXT NOT NULL,
        target_task_id TEXT NOT NULL,
        dependency_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (source_task_id, target_task_id)
    )
";

pub const VIEWS_DB_SCHEMA_INSIGHTS: &str = "
    CREATE TABLE IF NOT EXISTS insights (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        project_id TEXT NOT NULL,
        message TEXT NOT NULL,
        severity TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        source TEXT NOT NULL,
        additional_data TEXT
    )
";

pub const VIEWS_DB_INDEX_TASKS_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)";
pub const VIEWS_DB_INDEX_DEPENDENTS: &str =
    "CREATE INDEX IF NOT EXISTS idx_dependencies_target ON dependencies(target_task_id)";
pub const VIEWS_DB_INDEX_INSIGHTS_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_insights_project ON insights(project_id, timestamp)";
pub const VIEWS_DB_INDEX_INSIGHTS_TIME: &str =
    "CREATE INDEX IF NOT EXISTS idx_insights_time ON insights(timestamp, seq)";
