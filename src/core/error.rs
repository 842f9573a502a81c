use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactflowError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Failed to initialize store: {0}")]
    StoreInitializationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Integrity check failed for fact {0}")]
    IntegrityError(String),
    #[error("Lifecycle error: {0}")]
    LifecycleError(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}
