//! Progress agent: derives project completion from task statuses.

use crate::core::broker::FactSink;
use crate::core::error::FactflowError;
use crate::core::fact::{self, Fact};
use crate::core::factory;
use crate::plugins::agent::{self, Agent, KindHandler};
use rustc_hash::FxHashMap;
use std::sync::Mutex;

pub const PROGRESS_AGENT: &str = "progress";
pub const COMPLETED_STATUS: &str = "completed";

const HANDLERS: &[(&str, KindHandler<ProgressAgent>)] = &[
    (fact::TASK_CREATED, ProgressAgent::on_task_created as KindHandler<ProgressAgent>),
    (fact::TASK_STATUS_CHANGED, ProgressAgent::on_task_status_changed as KindHandler<ProgressAgent>),
];

/// Tracks `projectId -> (taskId -> status)` and publishes a
/// ProjectProgressCalculated fact after every change.
#[derive(Default)]
pub struct ProgressAgent {
    projects: Mutex<FxHashMap<String, FxHashMap<String, String>>>,
}

#[derive(Clone, Copy)]
enum Update<'a> {
    Created(&'a str),
    Changed(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTally {
    pub completed: u64,
    pub total: u64,
}

impl ProgressTally {
    /// `None` when the project has no tasks.
    pub fn percent(self) -> Option<f64> {
        (self.total > 0).then(|| self.completed as f64 / self.total as f64 * 100.0)
    }
}

impl ProgressAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_task_created(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let (Some(project_id), Some(task_id)) = (fact.project_id(), fact.subject_str("taskId")) else {
            return Err(missing_fields(fact));
        };
        let status = fact.payload_str("status").unwrap_or("pending");
        self.record(project_id, task_id, Update::Created(status), fact, sink)
    }

    fn on_task_status_changed(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        let (Some(project_id), Some(task_id), Some(status)) = (
            fact.project_id(),
            fact.subject_str("taskId"),
            fact.payload_str("newStatus"),
        ) else {
            return Err(missing_fields(fact));
        };
        self.record(project_id, task_id, Update::Changed(status), fact, sink)
    }

    fn record(
        &self,
        project_id: &str,
        task_id: &str,
        update: Update<'_>,
        fact: &Fact,
        sink: &dyn FactSink,
    ) -> Result<(), FactflowError> {
        let tally = {
            let mut projects = self
                .projects
                .lock()
                .map_err(|_| FactflowError::LockPoisoned("progress agent state"))?;
            let tasks = projects.entry(project_id.to_string()).or_default();
            match update {
                // A redelivered creation must not roll back a later status change.
                Update::Created(status) => {
                    tasks.entry(task_id.to_string()).or_insert_with(|| status.to_string());
                }
                Update::Changed(status) => {
                    tasks.insert(task_id.to_string(), status.to_string());
                }
            }
            tally(tasks)
        };
        let Some(progress) = tally.percent() else {
            return Ok(());
        };
        let derived = factory::project_progress_calculated(
            project_id,
            progress,
            tally.completed,
            tally.total,
            PROGRESS_AGENT,
            Some(fact.id()),
        );
        sink.publish(derived)?;
        tracing::debug!(
            project_id,
            progress,
            completed = tally.completed,
            total = tally.total,
            "project progress calculated"
        );
        Ok(())
    }

    pub fn tally_for(&self, project_id: &str) -> Option<ProgressTally> {
        let projects = self.projects.lock().ok()?;
        projects.get(project_id).map(tally)
    }
}

fn tally(tasks: &FxHashMap<String, String>) -> ProgressTally {
    ProgressTally {
        completed: tasks.values().filter(|s| *s == COMPLETED_STATUS).count() as u64,
        total: tasks.len() as u64,
    }
}

fn missing_fields(fact: &Fact) -> FactflowError {
    FactflowError::ValidationError(format!(
        "{} {} is missing projectId, taskId or status",
        fact.kind(),
        fact.id()
    ))
}

impl Agent for ProgressAgent {
    fn name(&self) -> &'static str {
        PROGRESS_AGENT
    }

    fn kinds(&self) -> Vec<&'static str> {
        agent::table_kinds(HANDLERS)
    }

    fn handle(&self, fact: &Fact, sink: &dyn FactSink) -> Result<(), FactflowError> {
        agent::dispatch(HANDLERS, self, fact, sink)
    }

    fn reset(&self) {
        if let Ok(mut p) = self.projects.lock() {
            p.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::agent::RecordingSink;

    fn created(task: &str, status: &str) -> Fact {
        factory::task_created(task, "project-x", task, "", None, status, "test", None)
    }

    #[test]
    fn three_of_four_is_seventy_five() {
        let agent = ProgressAgent::new();
        let sink = RecordingSink::new();
        for (task, status) in [("task-1", "completed"), ("task-2", "completed"), ("task-3", "completed"), ("task-4", "pending")] {
            agent.handle(&created(task, status), &sink).unwrap();
        }
        let last = sink.facts().pop().unwrap();
        assert_eq!(last.kind(), fact::PROJECT_PROGRESS_CALCULATED);
        assert_eq!(last.payload_f64("progress"), Some(75.0));
        assert_eq!(last.payload()["completedTasks"], 3);
        assert_eq!(last.payload()["totalTasks"], 4);
        assert_eq!(agent.tally_for("project-x"), Some(ProgressTally { completed: 3, total: 4 }));
        assert_eq!(agent.tally_for("project-y"), None);
    }

    #[test]
    fn progress_carries_cause() {
        let agent = ProgressAgent::new();
        let sink = RecordingSink::new();
        let trigger = created("task-1", "pending");
        agent.handle(&trigger, &sink).unwrap();
        let out = sink.facts();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].caused_by(), Some(trigger.id()));
        assert_eq!(out[0].payload_f64("progress"), Some(0.0));
    }

    #[test]
    fn redelivered_creation_keeps_later_status() {
        let agent = ProgressAgent::new();
        let sink = RecordingSink::new();
        let first = created("task-1", "pending");
        agent.handle(&first, &sink).unwrap();
        agent.handle(&created("task-2", "pending"), &sink).unwrap();
        let done = factory::task_status_changed("task-1", "project-x", "pending", "completed", "test", None);
        agent.handle(&done, &sink).unwrap();
        assert_eq!(sink.facts().pop().unwrap().payload_f64("progress"), Some(50.0));

        agent.handle(&first, &sink).unwrap();
        let last = sink.facts().pop().unwrap();
        assert_eq!(last.payload_f64("progress"), Some(50.0));
        assert_eq!(last.caused_by(), Some(first.id()));
        assert_eq!(agent.tally_for("project-x"), Some(ProgressTally { completed: 1, total: 2 }));
    }

    #[test]
    fn empty_project_has_no_percentage() {
        assert_eq!(ProgressTally { completed: 0, total: 0 }.percent(), None);
    }

    #[test]
    fn missing_fields_are_reported_without_publishing() {
        let agent = ProgressAgent::new();
        let sink = RecordingSink::new();
        let bad = factory::task_status_changed("task-1", "project-x", "pending", "completed", "t", None);
        let stripped = Fact::new(
            bad.source(),
            bad.kind(),
            crate::json_map! { "taskId" => "task-1" },
            bad.payload().clone(),
            None,
        );
        assert!(agent.handle(&stripped, &sink).is_err());
        assert!(sink.facts().is_empty());
    }
}
