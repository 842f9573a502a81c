//! `factflow.toml` loading. A missing file means defaults, not an error.

use crate::core::error::FactflowError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use std::fs;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_QUERY_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AgentsConfig {
    /// Agent names to run; see [`crate::plugins::AGENT_NAMES`].
    #[serde(default = "default_enabled_agents")]
    pub enabled: Vec<String>,
    /// Warm agent caches from the fact log before subscribing.
    #[serde(default = "default_true")]
    pub hydrate: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_agents(),
            hydrate: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_enabled_agents() -> Vec<String> {
    crate::plugins::AGENT_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_query_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, FactflowError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `factflow.toml` from the store root.
    pub fn load(store: &Store) -> Result<Self, FactflowError> {
        let path = store.config_path();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path)?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    fn validate(&self) -> Result<(), FactflowError> {
        for name in &self.agents.enabled {
            if !crate::plugins::AGENT_NAMES.contains(&name.as_str()) {
                return Err(FactflowError::ValidationError(format!(
                    "unknown agent '{}' in [agents] enabled (known: {})",
                    name,
                    crate::plugins::AGENT_NAMES.join(", ")
                )));
            }
        }
        if self.query.default_limit == 0 {
            return Err(FactflowError::ValidationError(
                "[query] default_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
