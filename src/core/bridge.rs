//! Turns structured analysis reports and legacy project databases into facts.
//!
//! Entity ids are derived from names, so re-ingesting the same report is
//! stable: existing projections are diffed and only changed fields produce
//! update facts.

use crate::core::broker::Broker;
use crate::core::error::FactflowError;
use crate::core::fact::JsonMap;
use crate::core::factory;
use crate::core::projector::{DEFAULT_TASK_STATUS, ViewProjector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIGRATION_SOURCE: &str = "project-manager-migration";

/// Output of the conversation analyzer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub projects: BTreeMap<String, ReportedProject>,
    #[serde(default)]
    pub participants: BTreeMap<String, ReportedParticipant>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportedProject {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, ReportedTask>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportedTask {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportedParticipant {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub assigned_tasks: Vec<String>,
}

/// Legacy project database: `{projects: {<id>: {name, description, tasks: {<id>: {...}}}}}`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LegacyDatabase {
    #[serde(default)]
    pub projects: BTreeMap<String, LegacyProject>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LegacyProject {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, LegacyTask>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LegacyTask {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub projects_created: usize,
    pub projects_updated: usize,
    pub tasks_created: usize,
    pub tasks_updated: usize,
    pub status_changes: usize,
    pub participants_seen: usize,
    pub facts_published: usize,
    pub facts_refused: usize,
}

impl IngestSummary {
    fn count(&mut self, accepted: bool) {
        if accepted {
            self.facts_published += 1;
        } else {
            self.facts_refused += 1;
        }
    }
}

/// Lower-case and collapse whitespace runs into single hyphens.
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

pub fn project_id_for(name: &str) -> String {
    format!("project-{}", slugify(name))
}

pub fn task_id_for(project_name: &str, task_name: &str) -> String {
    format!("task-{}-{}", slugify(project_name), slugify(task_name))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Publish creation or update facts for everything in `report`.
///
/// Projections are read to decide between creation and update, so pending
/// deliveries are flushed first. Must not be called from a subscriber.
pub fn ingest_analysis(
    broker: &Broker,
    projector: &ViewProjector,
    report: &AnalysisReport,
    channel: &str,
) -> Result<IngestSummary, FactflowError> {
    broker.flush()?;
    let source = format!("chat-{channel}");
    let mut summary = IngestSummary {
        participants_seen: report.participants.len(),
        ..IngestSummary::default()
    };

    for (project_name, reported) in &report.projects {
        let project_id = project_id_for(project_name);
        match projector.get_project(&project_id)? {
            None => {
                let fact = factory::project_created(
                    &project_id,
                    project_name,
                    reported.description.as_deref().unwrap_or_default(),
                    &source,
                    None,
                );
                let accepted = broker.publish(fact)?;
                summary.count(accepted);
                summary.projects_created += usize::from(accepted);
            }
            Some(existing) => {
                let mut updates = JsonMap::new();
                if let Some(d) = non_empty(&reported.description).filter(|d| *d != existing.description) {
                    updates.insert("description".into(), d.into());
                }
                if let Some(s) = non_empty(&reported.status).filter(|s| *s != existing.status) {
                    updates.insert("status".into(), s.into());
                }
                if !updates.is_empty() {
                    let accepted = broker.publish(factory::project_updated(&project_id, updates, &source, None))?;
                    summary.count(accepted);
                    summary.projects_updated += usize::from(accepted);
                }
            }
        }

        for (task_name, task) in &reported.tasks {
            let task_id = task_id_for(project_name, task_name);
            match projector.get_task(&task_id)? {
                None => {
                    let status = non_empty(&task.status).unwrap_or(DEFAULT_TASK_STATUS);
                    create_task(
                        broker,
                        &mut summary,
                        NewTask {
                            task_id: &task_id,
                            project_id: &project_id,
                            title: task_name,
                            description: task.description.as_deref().unwrap_or_default(),
                            assignee: non_empty(&task.assignee),
                            status,
                        },
                        &source,
                    )?;
                }
                Some(existing) => {
                    let mut updates = JsonMap::new();
                    if let Some(d) = non_empty(&task.description).filter(|d| *d != existing.description) {
                        updates.insert("description".into(), d.into());
                    }
                    if let Some(a) = non_empty(&task.assignee).filter(|a| Some(*a) != existing.assignee.as_deref()) {
                        updates.insert("assignee".into(), a.into());
                    }
                    if !updates.is_empty() {
                        let fact = factory::task_updated(&task_id, &project_id, updates, &source, None);
                        let accepted = broker.publish(fact)?;
                        summary.count(accepted);
                        summary.tasks_updated += usize::from(accepted);
                    }
                    if let Some(status) = non_empty(&task.status).filter(|s| *s != existing.status) {
                        let fact = factory::task_status_changed(
                            &task_id,
                            &project_id,
                            &existing.status,
                            status,
                            &source,
                            None,
                        );
                        let accepted = broker.publish(fact)?;
                        summary.count(accepted);
                        summary.status_changes += usize::from(accepted);
                    }
                }
            }
        }
    }

    tracing::info!(
        channel,
        projects_created = summary.projects_created,
        tasks_created = summary.tasks_created,
        facts = summary.facts_published,
        "analysis ingested"
    );
    Ok(summary)
}

/// Replay a legacy project database as creation facts. Ids are taken as-is.
pub fn import_legacy(broker: &Broker, db: &LegacyDatabase) -> Result<IngestSummary, FactflowError> {
    let mut summary = IngestSummary::default();
    for (project_id, project) in &db.projects {
        let fact = factory::project_created(
            project_id,
            project.name.as_deref().unwrap_or(project_id),
            project.description.as_deref().unwrap_or_default(),
            MIGRATION_SOURCE,
            None,
        );
        let accepted = broker.publish(fact)?;
        summary.count(accepted);
        summary.projects_created += usize::from(accepted);

        for (task_id, task) in &project.tasks {
            create_task(
                broker,
                &mut summary,
                NewTask {
                    task_id,
                    project_id,
                    title: task.title.as_deref().unwrap_or(task_id),
                    description: task.description.as_deref().unwrap_or_default(),
                    assignee: non_empty(&task.assignee),
                    status: non_empty(&task.status).unwrap_or(DEFAULT_TASK_STATUS),
                },
                MIGRATION_SOURCE,
            )?;
        }
    }
    tracing::info!(projects = summary.projects_created, tasks = summary.tasks_created, "legacy database imported");
    Ok(summary)
}

struct NewTask<'a> {
    task_id: &'a str,
    project_id: &'a str,
    title: &'a str,
    description: &'a str,
    assignee: Option<&'a str>,
    status: &'a str,
}

/// TaskCreated as pending, then a status change caused by it when the
/// reported status is anything else.
fn create_task(
    broker: &Broker,
    summary: &mut IngestSummary,
    task: NewTask<'_>,
    source: &str,
) -> Result<(), FactflowError> {
    let created = factory::task_created(
        task.task_id,
        task.project_id,
        task.title,
        task.description,
        task.assignee,
        DEFAULT_TASK_STATUS,
        source,
        None,
    );
    let created_id = created.id().to_string();
    let accepted = broker.publish(created)?;
    summary.count(accepted);
    summary.tasks_created += usize::from(accepted);
    if !accepted || task.status == DEFAULT_TASK_STATUS {
        return Ok(());
    }
    let status = factory::task_status_changed(
        task.task_id,
        task.project_id,
        DEFAULT_TASK_STATUS,
        task.status,
        source,
        Some(&created_id),
    );
    let accepted = broker.publish(status)?;
    summary.count(accepted);
    summary.status_changes += usize::from(accepted);
    Ok(())
}
