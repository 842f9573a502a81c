//! Reactive agents. Each consumes a few fact kinds, keeps a private cache and
//! publishes derived facts back through the broker.

pub mod agent;
pub mod insight;
pub mod progress;
pub mod relation;

use crate::core::error::FactflowError;
use agent::AgentHandle;

/// Names accepted by [`build_agent`] and `[agents] enabled`, in start order.
pub const AGENT_NAMES: [&str; 3] = [
    progress::PROGRESS_AGENT,
    relation::RELATION_AGENT,
    insight::INSIGHT_AGENT,
];

pub fn build_agent(name: &str) -> Result<AgentHandle, FactflowError> {
    match name {
        progress::PROGRESS_AGENT => Ok(AgentHandle::new(progress::ProgressAgent::new())),
        relation::RELATION_AGENT => Ok(AgentHandle::new(relation::RelationAgent::new())),
        insight::INSIGHT_AGENT => Ok(AgentHandle::new(insight::InsightAgent::new())),
        other => Err(FactflowError::ValidationError(format!("unknown agent '{other}'"))),
    }
}
