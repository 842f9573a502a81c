//! Relation agent: infers task dependencies from `task-<id>` mentions in
//! descriptions, refusing any edge that would close a cycle.

use crate::core::broker::FactSink;
use crate::core::error::FactflowError;
use crate::core::fact::{self, Fact};
use crate::core::factory;
use crate::plugins::agent::{self, Agent, KindHandler};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{LazyLock, Mutex};

pub const RELATION_AGENT: &str = "relation";

static TASK_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"task-([a-z0-9]+)").expect("static regex"));

const HANDLERS: &[(&str, KindHandler<RelationAgent>)] = &[
    (fact::TASK_CREATED, RelationAgent::on_task_created as KindHandler<RelationAgent>),
    (fact::TASK_UPDATED, RelationAgent::on_task_updated as KindHandler<RelationAgent>),
];

type Adjacency = FxHashMap<String, FxHashSet<String>>;

/// Keeps `source -> {targets}` for every edge it has published.
#[derive(Default)]
pub struct RelationAgent {
    edges: Mutex<Adjacency>,
}

/// Task ids mentioned in `text`, lower-cased, first occurrence order, no repeats.
pub fn extract_task_mentions(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = FxHashSet::default();
    TASK_REFERENCE
        .captures_iter(&lowered)
        .filter_map(|c| c.get(1))
        .map(|m| format!("task-{}", m.as_str()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// True when `target` already reaches `source`, i.e. `source -> target` would
/// close a cycle. Each node is expanded at most once.
pub fn would_create_cycle(edges: &Adjacency, source: &str, target: &str) -> bool {
    let mut visited: FxHashSet<&str> = FxHashSet::default();
    let mut stack = vec![target];
    while let Some(current) = stack.pop() {
        if current == source {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(next) = edges.get(current) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

impl RelationAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_task_created(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let description = fact.payload_str("description").unwrap_or_default();
        self.analyze(fact, description, sink)
    }

    fn on_task_updated(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let description = fact
            .payload_object("updates")
            .and_then(|u| u.get("description"))
            .and_then(|d| d.as_str())
            .unwrap_or_default();
        self.analyze(fact, description, sink)
    }

    fn analyze(&self, fact: &Fact, description: &str, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let (Some(task_id), Some(project_id)) = (fact.subject_str("taskId"), fact.project_id()) else {
            return Err(FactflowError::ValidationError(format!(
                "{} {} is missing taskId or projectId",
                fact.kind(),
                fact.id()
            )));
        };
        if description.is_empty() {
            return Ok(());
        }

        for target in extract_task_mentions(description) {
            if target == task_id {
                continue;
            }
            let mut edges = self
                .edges
                .lock()
                .map_err(|_| FactflowError::LockPoisoned("relation agent state"))?;
            if edges.get(task_id).is_some_and(|t| t.contains(&target)) {
                continue;
            }
            if would_create_cycle(&edges, task_id, &target) {
                tracing::info!(source = task_id, target = %target, "dependency rejected, would create a cycle");
                continue;
            }
            let derived = factory::dependency_added(
                task_id,
                &target,
                factory::DEFAULT_DEPENDENCY_TYPE,
                Some(project_id),
                RELATION_AGENT,
                Some(fact.id()),
            );
            if !sink.publish(derived)? {
                tracing::warn!(source = task_id, target = %target, "dependency fact refused, edge not recorded");
                continue;
            }
            edges.entry(task_id.to_string()).or_default().insert(target.clone());
            tracing::debug!(source = task_id, target = %target, "dependency detected");
        }
        Ok(())
    }

    /// Targets recorded for `task_id`, sorted.
    pub fn dependencies_of(&self, task_id: &str) -> Vec<String> {
        let Ok(edges) = self.edges.lock() else {
            return Vec::new();
        };
        let mut out: Vec<String> = edges
            .get(task_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

impl Agent for RelationAgent {
    fn name(&self) -> &'static str {
        RELATION_AGENT
    }

    fn kinds(&self) -> Vec<&'static str> {
        agent::table_kinds(HANDLERS)
    }

    fn handle(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        agent::dispatch(HANDLERS, self, fact, sink)
    }

    fn reset(&self) {
        if let Ok(mut e) = self.edges.lock() {
            e.clear();
        }
    }
}
