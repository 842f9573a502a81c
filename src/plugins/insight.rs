//! Insight agent: raises progress milestones and long dependency chains,
//! each at most once per dedup key.

use crate::core::broker::FactSink;
use crate::core::error::FactflowError;
use crate::core::fact::{self, Fact};
use crate::core::factory;
use crate::plugins::agent::{self, Agent, KindHandler};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

pub const INSIGHT_AGENT: &str = "insight";
pub const UNKNOWN_PROJECT: &str = "project-unknown";
/// Chains longer than this many levels raise a warning.
pub const LONG_CHAIN_THRESHOLD: usize = 3;

const HANDLERS: &[(&str, KindHandler<InsightAgent>)] = &[
    (
        fact::PROJECT_PROGRESS_CALCULATED,
        InsightAgent::on_progress_calculated as KindHandler<InsightAgent>,
    ),
    (fact::DEPENDENCY_ADDED, InsightAgent::on_dependency_added as KindHandler<InsightAgent>),
];

#[derive(Default)]
struct InsightState {
    progress: FxHashMap<String, f64>,
    edges: FxHashMap<String, FxHashSet<String>>,
    raised: FxHashSet<String>,
}

#[derive(Default)]
pub struct InsightAgent {
    state: Mutex<InsightState>,
}

/// Milestone messages for `progress`; thresholds are independent, so more
/// than one can apply.
pub fn progress_messages(progress: f64) -> Vec<String> {
    let mut out = Vec::new();
    if (80.0..90.0).contains(&progress) {
        out.push(format!("Project is approaching completion ({progress:.1}%)"));
    }
    if (90.0..=100.0).contains(&progress) {
        out.push(format!("Project is nearly complete ({progress:.1}%)"));
    }
    if (0.0..=10.0).contains(&progress) {
        out.push(format!("Project has just started ({progress:.1}%)"));
    }
    out
}

/// Longest chain reachable from `task_id`; a task with no dependencies is 1.
/// Nodes already visited in this walk count as 0, so cycles terminate.
pub fn chain_length(edges: &FxHashMap<String, FxHashSet<String>>, task_id: &str) -> usize {
    fn children<'a>(edges: &'a FxHashMap<String, FxHashSet<String>>, node: &str) -> Vec<&'a str> {
        edges
            .get(node)
            .map(|next| next.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    // Frame: unvisited children left to expand, longest child chain so far.
    let mut visited: FxHashSet<&str> = FxHashSet::default();
    visited.insert(task_id);
    let mut stack: Vec<(Vec<&str>, usize)> = vec![(children(edges, task_id), 0)];
    let mut longest = 0;
    while let Some((pending, best)) = stack.last_mut() {
        if let Some(child) = pending.pop() {
            if visited.insert(child) {
                stack.push((children(edges, child), 0));
            }
            continue;
        }
        let length = 1 + *best;
        stack.pop();
        match stack.last_mut() {
            Some((_, parent_best)) => *parent_best = (*parent_best).max(length),
            None => longest = length,
        }
    }
    longest
}

impl InsightAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_progress_calculated(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let (Some(project_id), Some(progress)) = (fact.project_id(), fact.payload_f64("progress")) else {
            return Err(FactflowError::ValidationError(format!(
                "{} {} is missing projectId or progress",
                fact.kind(),
                fact.id()
            )));
        };
        let mut state = self.lock()?;
        state.progress.insert(project_id.to_string(), progress);
        for message in progress_messages(progress) {
            let key = format!("{project_id}:{message}");
            if state.raised.contains(&key) {
                continue;
            }
            let derived = factory::insight_raised(project_id, &message, "info", INSIGHT_AGENT, Some(fact.id()), None);
            sink.publish(derived)?;
            state.raised.insert(key);
            tracing::info!(project_id, message = %message, "insight raised");
        }
        Ok(())
    }

    fn on_dependency_added(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let (Some(source), Some(target)) = (fact.subject_str("sourceTaskId"), fact.subject_str("targetTaskId")) else {
            return Err(FactflowError::ValidationError(format!(
                "{} {} is missing sourceTaskId or targetTaskId",
                fact.kind(),
                fact.id()
            )));
        };
        let mut state = self.lock()?;
        state
            .edges
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string());

        let length = chain_length(&state.edges, source);
        if length <= LONG_CHAIN_THRESHOLD {
            return Ok(());
        }
        let key = format!("{source}:dependency_chain");
        if state.raised.contains(&key) {
            return Ok(());
        }
        let project_id = fact.project_id().unwrap_or(UNKNOWN_PROJECT);
        let message = format!("Task {source} has a long dependency chain ({length} levels)");
        let derived = factory::insight_raised(
            project_id,
            &message,
            "warning",
            INSIGHT_AGENT,
            Some(fact.id()),
            Some(crate::json_map! { "taskId" => source, "chainLength" => length }),
        );
        sink.publish(derived)?;
        state.raised.insert(key);
        tracing::info!(project_id, task_id = source, chain_length = length, "long dependency chain");
        Ok(())
    }

    /// Last progress value seen for `project_id`.
    pub fn progress_of(&self, project_id: &str) -> Option<f64> {
        self.state.lock().ok()?.progress.get(project_id).copied()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InsightState>, FactflowError> {
        self.state
            .lock()
            .map_err(|_| FactflowError::LockPoisoned("insight agent state"))
    }
}

impl Agent for InsightAgent {
    fn name(&self) -> &'static str {
        INSIGHT_AGENT
    }

    fn kinds(&self) -> Vec<&'static str> {
        agent::table_kinds(HANDLERS)
    }

    fn handle(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        agent::dispatch(HANDLERS, self, fact, sink)
    }

    fn reset(&self) {
        if let Ok(mut s) = self.state.lock() {
            *s = InsightState::default();
        }
    }
}
