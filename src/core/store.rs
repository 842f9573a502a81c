//! Store abstraction for factflow's on-disk state.
//!
//! A store is one directory holding the fact log database, the projection
//! database and an optional `factflow.toml`. Everything under it except the
//! fact log is derived and can be rebuilt.

use crate::core::error::FactflowError;
use crate::core::schemas;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the store root when `--root` is not given.
pub const ROOT_ENV: &str = "FACTFLOW_ROOT";

/// Default store directory, relative to the working directory.
pub const DEFAULT_ROOT_DIR: &str = ".factflow";

/// Store handle representing a factflow state workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute or working-directory-relative path to the store root
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the store root: explicit path, then `FACTFLOW_ROOT`, then `./.factflow`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(p) = explicit {
            return Self::new(p);
        }
        match std::env::var(ROOT_ENV) {
            Ok(v) if !v.trim().is_empty() => Self::new(v),
            _ => Self::new(DEFAULT_ROOT_DIR),
        }
    }

    pub fn facts_db_path(&self) -> PathBuf {
        self.root.join(schemas::FACTS_DB_NAME)
    }

    pub fn views_db_path(&self) -> PathBuf {
        self.root.join(schemas::VIEWS_DB_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(schemas::CONFIG_FILE_NAME)
    }

    /// Create the root directory. Failure here is fatal for the runtime.
    pub fn ensure_root(&self) -> Result<(), FactflowError> {
        fs::create_dir_all(&self.root).map_err(|e| {
            FactflowError::StoreInitializationError(format!(
                "cannot create store root {}: {}",
                self.root.display(),
                e
            ))
        })
    }
}
