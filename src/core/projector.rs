//! Materialized views over the fact stream.
//!
//! The projector owns `views.db`: projects, tasks, dependency edges and
//! insights. Creation facts only ever insert, update facts only ever touch an
//! existing row, and nothing here is authoritative: [`ViewProjector::rebuild`]
//! reconstructs every table from the fact log.

use crate::core::broker::{Broker, Subscriber};
use crate::core::db;
use crate::core::error::FactflowError;
use crate::core::fact::{Fact, FactKind, JsonMap};
use crate::core::fact_log::FactLog;
use crate::core::factory::DEFAULT_DEPENDENCY_TYPE;
use crate::core::pool::SqlitePool;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

pub const DEFAULT_PROJECT_STATUS: &str = "active";
pub const DEFAULT_TASK_STATUS: &str = "pending";
pub const DEFAULT_INSIGHT_SEVERITY: &str = "info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub progress: f64,
    pub completed_tasks: i64,
    pub total_tasks: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assignee: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub source_task_id: String,
    pub target_task_id: String,
    #[serde(rename = "type")]
    pub dependency_type: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub id: String,
    pub project_id: String,
    pub message: String,
    pub severity: String,
    pub timestamp: i64,
    pub source: String,
    pub additional_data: Option<JsonMap>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub tasks: Vec<Task>,
    pub insights: Vec<Insight>,
}

/// Everything a dashboard needs in one read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub projects: Vec<ProjectView>,
    pub latest_insights: Vec<Insight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewChange {
    ProjectCreated,
    ProjectUpdated,
    ProjectProgressUpdated,
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    DependencyAdded,
    InsightRaised,
}

impl ViewChange {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewChange::ProjectCreated => "projectCreated",
            ViewChange::ProjectUpdated => "projectUpdated",
            ViewChange::ProjectProgressUpdated => "projectProgressUpdated",
            ViewChange::TaskCreated => "taskCreated",
            ViewChange::TaskUpdated => "taskUpdated",
            ViewChange::TaskStatusChanged => "taskStatusChanged",
            ViewChange::DependencyAdded => "dependencyAdded",
            ViewChange::InsightRaised => "insightRaised",
        }
    }
}

/// Called with the change type, the affected entity id and its new state.
pub type ViewListener =
    Arc<dyn Fn(ViewChange, &str, &JsonValue) -> Result<(), FactflowError> + Send + Sync>;

struct Applied {
    change: ViewChange,
    entity_id: String,
    data: JsonValue,
}

impl Applied {
    fn new(change: ViewChange, entity_id: &str, entity: &impl Serialize) -> Result<Self, FactflowError> {
        Ok(Self {
            change,
            entity_id: entity_id.to_string(),
            data: serde_json::to_value(entity)?,
        })
    }
}

pub struct ViewProjector {
    pool: Arc<SqlitePool>,
    db_path: PathBuf,
    listeners: RwLock<HashMap<ViewChange, Vec<ViewListener>>>,
}

impl ViewProjector {
    pub fn open(pool: Arc<SqlitePool>, store: &Store) -> Result<Self, FactflowError> {
        store.ensure_root()?;
        let projector = Self {
            pool,
            db_path: store.views_db_path(),
            listeners: RwLock::new(HashMap::new()),
        };
        projector
            .pool
            .with_write(&projector.db_path, |conn| {
                db::apply_schema(
                    conn,
                    &[
                        schemas::VIEWS_DB_SCHEMA_PROJECTS,
                        schemas::VIEWS_DB_SCHEMA_TASKS,
                        schemas::VIEWS_DB_SCHEMA_DEPENDENCIES,
                        schemas::VIEWS_DB_SCHEMA_INSIGHTS,
                        schemas::VIEWS_DB_INDEX_TASKS_PROJECT,
                        schemas::VIEWS_DB_INDEX_DEPENDENTS,
                        schemas::VIEWS_DB_INDEX_INSIGHTS_PROJECT,
                        schemas::VIEWS_DB_INDEX_INSIGHTS_TIME,
                    ],
                )
            })
            .map_err(|e| {
                FactflowError::StoreInitializationError(format!(
                    "views at {}: {}",
                    projector.db_path.display(),
                    e
                ))
            })?;
        Ok(projector)
    }

    /// Subscribe to every well-known kind on `broker`.
    pub fn attach(self: &Arc<Self>, broker: &Broker) -> Result<(), FactflowError> {
        let sub: Arc<dyn Subscriber> = Arc::clone(self) as Arc<dyn Subscriber>;
        for kind in FactKind::ALL {
            broker.subscribe(kind.as_str(), Arc::clone(&sub))?;
        }
        Ok(())
    }

    /// Detach from `broker`; views stay readable.
    pub fn close(self: &Arc<Self>, broker: &Broker) -> Result<(), FactflowError> {
        let sub: Arc<dyn Subscriber> = Arc::clone(self) as Arc<dyn Subscriber>;
        for kind in FactKind::ALL {
            broker.unsubscribe(kind.as_str(), Some(&sub))?;
        }
        Ok(())
    }

    pub fn register_listener(&self, change: ViewChange, listener: ViewListener) -> bool {
        let Ok(mut map) = self.listeners.write() else {
            return false;
        };
        let list = map.entry(change).or_default();
        if list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        list.push(listener);
        true
    }

    pub fn unregister_listener(&self, change: ViewChange, listener: &ViewListener) -> bool {
        let Ok(mut map) = self.listeners.write() else {
            return false;
        };
        let Some(list) = map.get_mut(&change) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !Arc::ptr_eq(l, listener));
        list.len() != before
    }

    /// Apply one fact and notify listeners of the resulting change, if any.
    pub fn apply(&self, fact: &Fact) -> Result<(), FactflowError> {
        if let Some(applied) = self.apply_quiet(fact)? {
            self.notify(&applied);
        }
        Ok(())
    }

    fn apply_quiet(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let Some(kind) = fact.well_known_kind() else {
            return Ok(None);
        };
        match kind {
            FactKind::ProjectCreated => self.on_project_created(fact),
            FactKind::ProjectUpdated => self.on_project_updated(fact),
            FactKind::ProjectProgressCalculated => self.on_project_progress(fact),
            FactKind::TaskCreated => self.on_task_created(fact),
            FactKind::TaskUpdated => self.on_task_updated(fact),
            FactKind::TaskStatusChanged => self.on_task_status_changed(fact),
            FactKind::DependencyAdded => self.on_dependency_added(fact),
            FactKind::InsightRaised => self.on_insight_raised(fact),
        }
    }

    fn notify(&self, applied: &Applied) {
        let listeners: Vec<ViewListener> = match self.listeners.read() {
            Ok(map) => map.get(&applied.change).cloned().unwrap_or_default(),
            Err(_) => return,
        };
        for listener in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener(applied.change, &applied.entity_id, &applied.data)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    change = applied.change.as_str(),
                    entity_id = %applied.entity_id,
                    error = %e,
                    "view listener failed"
                ),
                Err(_) => tracing::error!(
                    change = applied.change.as_str(),
                    entity_id = %applied.entity_id,
                    "view listener panicked"
                ),
            }
        }
    }

    fn on_project_created(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let Some(project_id) = required_subject(fact, "projectId") else {
            return Ok(None);
        };
        let project = Project {
            id: project_id.to_string(),
            name: fact.payload_str("name").unwrap_or_default().to_string(),
            description: fact.payload_str("description").unwrap_or_default().to_string(),
            status: DEFAULT_PROJECT_STATUS.to_string(),
            progress: 0.0,
            completed_tasks: 0,
            total_tasks: 0,
            created_at: fact.timestamp(),
            updated_at: fact.timestamp(),
        };
        let inserted = self.pool.with_write(&self.db_path, |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO projects(id, name, description, status, progress, completed_tasks, total_tasks, created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    project.id,
                    project.name,
                    project.description,
                    project.status,
                    project.progress,
                    project.completed_tasks,
                    project.total_tasks,
                    project.created_at,
                    project.updated_at,
                ],
            )?;
            Ok(n == 1)
        })?;
        if !inserted {
            tracing::debug!(project_id, fact_id = fact.id(), "project already projected, creation ignored");
            return Ok(None);
        }
        tracing::debug!(project_id, "project materialized");
        Ok(Some(Applied::new(ViewChange::ProjectCreated, project_id, &project)?))
    }

    fn on_project_updated(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let Some(project_id) = required_subject(fact, "projectId") else {
            return Ok(None);
        };
        let updates = fact.payload_object("updates").cloned().unwrap_or_default();
        let updated = self.modify_project(project_id, |p| {
            p.apply_updates(&updates);
            p.updated_at = fact.timestamp();
        })?;
        let Some(project) = updated else {
            dropped_missing_target(fact, project_id);
            return Ok(None);
        };
        Ok(Some(Applied::new(ViewChange::ProjectUpdated, project_id, &project)?))
    }

    fn on_project_progress(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let Some(project_id) = required_subject(fact, "projectId") else {
            return Ok(None);
        };
        let progress = fact.payload_f64("progress").unwrap_or(0.0);
        let completed = fact.payload().get("completedTasks").and_then(JsonValue::as_i64).unwrap_or(0);
        let total = fact.payload().get("totalTasks").and_then(JsonValue::as_i64).unwrap_or(0);
        let updated = self.modify_project(project_id, |p| {
            p.progress = progress;
            p.completed_tasks = completed;
            p.total_tasks = total;
            p.updated_at = fact.timestamp();
        })?;
        let Some(project) = updated else {
            dropped_missing_target(fact, project_id);
            return Ok(None);
        };
        tracing::debug!(project_id, progress, "project progress updated");
        Ok(Some(Applied::new(ViewChange::ProjectProgressUpdated, project_id, &project)?))
    }

    fn on_task_created(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let (Some(task_id), Some(project_id)) =
            (required_subject(fact, "taskId"), required_subject(fact, "projectId"))
        else {
            return Ok(None);
        };
        let task = Task {
            id: task_id.to_string(),
            project_id: project_id.to_string(),
            title: fact.payload_str("title").unwrap_or_default().to_string(),
            description: fact.payload_str("description").unwrap_or_default().to_string(),
            status: fact.payload_str("status").unwrap_or(DEFAULT_TASK_STATUS).to_string(),
            assignee: fact.payload_str("assignee").map(str::to_string),
            created_at: fact.timestamp(),
            updated_at: fact.timestamp(),
        };
        let inserted = self.pool.with_write(&self.db_path, |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO tasks(id, project_id, title, description, status, assignee, created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id,
                    task.project_id,
                    task.title,
                    task.description,
                    task.status,
                    task.assignee,
                    task.created_at,
                    task.updated_at,
                ],
            )?;
            Ok(n == 1)
        })?;
        if !inserted {
            tracing::debug!(task_id, fact_id = fact.id(), "task already projected, creation ignored");
            return Ok(None);
        }
        tracing::debug!(task_id, project_id, "task materialized");
        Ok(Some(Applied::new(ViewChange::TaskCreated, task_id, &task)?))
    }

    fn on_task_updated(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let (Some(task_id), Some(_)) =
            (required_subject(fact, "taskId"), required_subject(fact, "projectId"))
        else {
            return Ok(None);
        };
        let updates = fact.payload_object("updates").cloned().unwrap_or_default();
        let updated = self.modify_task(task_id, |t| {
            t.apply_updates(&updates);
            t.updated_at = fact.timestamp();
        })?;
        let Some(task) = updated else {
            dropped_missing_target(fact, task_id);
            return Ok(None);
        };
        Ok(Some(Applied::new(ViewChange::TaskUpdated, task_id, &task)?))
    }

    fn on_task_status_changed(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let (Some(task_id), Some(_)) =
            (required_subject(fact, "taskId"), required_subject(fact, "projectId"))
        else {
            return Ok(None);
        };
        let Some(new_status) = fact.payload_str("newStatus") else {
            tracing::warn!(fact_id = fact.id(), kind = fact.kind(), "missing newStatus, dropping");
            return Ok(None);
        };
        let updated = self.modify_task(task_id, |t| {
            t.status = new_status.to_string();
            t.updated_at = fact.timestamp();
        })?;
        let Some(task) = updated else {
            dropped_missing_target(fact, task_id);
            return Ok(None);
        };
        tracing::debug!(task_id, status = new_status, "task status changed");
        Ok(Some(Applied::new(ViewChange::TaskStatusChanged, task_id, &task)?))
    }

    fn on_dependency_added(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let (Some(source), Some(target)) = (
            required_subject(fact, "sourceTaskId"),
            required_subject(fact, "targetTaskId"),
        ) else {
            return Ok(None);
        };
        let dep = Dependency {
            source_task_id: source.to_string(),
            target_task_id: target.to_string(),
            dependency_type: fact
                .payload_str("dependencyType")
                .unwrap_or(DEFAULT_DEPENDENCY_TYPE)
                .to_string(),
            created_at: fact.timestamp(),
        };
        let inserted = self.pool.with_write(&self.db_path, |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO dependencies(source_task_id, target_task_id, dependency_type, created_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![dep.source_task_id, dep.target_task_id, dep.dependency_type, dep.created_at],
            )?;
            Ok(n == 1)
        })?;
        if !inserted {
            return Ok(None);
        }
        let key = format!("{source}:{target}");
        tracing::debug!(source, target, "dependency materialized");
        Ok(Some(Applied::new(ViewChange::DependencyAdded, &key, &dep)?))
    }

    fn on_insight_raised(&self, fact: &Fact) -> Result<Option<Applied>, FactflowError> {
        let Some(project_id) = required_subject(fact, "projectId") else {
            return Ok(None);
        };
        let mut extra = fact.payload().clone();
        for key in ["message", "severity", "timestamp"] {
            extra.remove(key);
        }
        let insight = Insight {
            id: fact.id().to_string(),
            project_id: project_id.to_string(),
            message: fact.payload_str("message").unwrap_or_default().to_string(),
            severity: fact
                .payload_str("severity")
                .unwrap_or(DEFAULT_INSIGHT_SEVERITY)
                .to_string(),
            timestamp: fact.timestamp(),
            source: fact.source().to_string(),
            additional_data: (!extra.is_empty()).then_some(extra),
        };
        let additional = insight
            .additional_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let inserted = self.pool.with_write(&self.db_path, |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO insights(id, project_id, message, severity, timestamp, source, additional_data)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    insight.id,
                    insight.project_id,
                    insight.message,
                    insight.severity,
                    insight.timestamp,
                    insight.source,
                    additional,
                ],
            )?;
            Ok(n == 1)
        })?;
        if !inserted {
            return Ok(None);
        }
        tracing::info!(project_id, message = %insight.message, severity = %insight.severity, "insight recorded");
        Ok(Some(Applied::new(ViewChange::InsightRaised, &insight.id, &insight)?))
    }

    fn modify_project(
        &self,
        project_id: &str,
        mut edit: impl FnMut(&mut Project),
    ) -> Result<Option<Project>, FactflowError> {
        self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.transaction()?;
            let Some(mut project) = load_project(&tx, project_id)? else {
                return Ok(None);
            };
            edit(&mut project);
            tx.execute(
                "UPDATE projects SET name = ?2, description = ?3, status = ?4, progress = ?5,
                 completed_tasks = ?6, total_tasks = ?7, updated_at = ?8 WHERE id = ?1",
                params![
                    project.id,
                    project.name,
                    project.description,
                    project.status,
                    project.progress,
                    project.completed_tasks,
                    project.total_tasks,
                    project.updated_at,
                ],
            )?;
            tx.commit()?;
            Ok(Some(project))
        })
    }

    fn modify_task(
        &self,
        task_id: &str,
        mut edit: impl FnMut(&mut Task),
    ) -> Result<Option<Task>, FactflowError> {
        self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.transaction()?;
            let Some(mut task) = load_task(&tx, task_id)? else {
                return Ok(None);
            };
            edit(&mut task);
            tx.execute(
                "UPDATE tasks SET project_id = ?2, title = ?3, description = ?4, status = ?5,
                 assignee = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    task.id,
                    task.project_id,
                    task.title,
                    task.description,
                    task.status,
                    task.assignee,
                    task.updated_at,
                ],
            )?;
            tx.commit()?;
            Ok(Some(task))
        })
    }

    /// Projects ordered by progress, highest first.
    pub fn get_projects(&self) -> Result<Vec<Project>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY progress DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], project_from_row)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| load_project(conn, project_id))
    }

    pub fn get_project_tasks(&self, project_id: &str) -> Result<Vec<Task>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([project_id], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| load_task(conn, task_id))
    }

    /// Edges where `task_id` is the dependent (source) side.
    pub fn get_task_dependencies(&self, task_id: &str) -> Result<Vec<Dependency>, FactflowError> {
        self.query_dependencies("source_task_id", task_id)
    }

    /// Edges where `task_id` is depended upon (target side).
    pub fn get_task_dependents(&self, task_id: &str) -> Result<Vec<Dependency>, FactflowError> {
        self.query_dependencies("target_task_id", task_id)
    }

    fn query_dependencies(&self, column: &str, task_id: &str) -> Result<Vec<Dependency>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT source_task_id, target_task_id, dependency_type, created_at
                 FROM dependencies WHERE {column} = ?1
                 ORDER BY created_at ASC, source_task_id ASC, target_task_id ASC"
            ))?;
            let rows = stmt
                .query_map([task_id], |r| {
                    Ok(Dependency {
                        source_task_id: r.get(0)?,
                        target_task_id: r.get(1)?,
                        dependency_type: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Newest first.
    pub fn get_project_insights(&self, project_id: &str, limit: usize) -> Result<Vec<Insight>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            query_insights(
                conn,
                &format!(
                    "SELECT {INSIGHT_COLUMNS} FROM insights WHERE project_id = ?1
                     ORDER BY timestamp DESC, seq DESC LIMIT ?2"
                ),
                params![project_id, sql_limit(limit)],
            )
        })
    }

    /// Newest first across all projects.
    pub fn get_latest_insights(&self, limit: usize) -> Result<Vec<Insight>, FactflowError> {
        self.pool.with_read(&self.db_path, |conn| {
            query_insights(
                conn,
                &format!("SELECT {INSIGHT_COLUMNS} FROM insights ORDER BY timestamp DESC, seq DESC LIMIT ?1"),
                params![sql_limit(limit)],
            )
        })
    }

    pub fn snapshot(&self, limit: usize) -> Result<ViewSnapshot, FactflowError> {
        let projects = self
            .get_projects()?
            .into_iter()
            .map(|project| {
                let tasks = self.get_project_tasks(&project.id)?;
                let insights = self.get_project_insights(&project.id, limit)?;
                Ok(ProjectView {
                    project,
                    tasks,
                    insights,
                })
            })
            .collect::<Result<Vec<_>, FactflowError>>()?;
        Ok(ViewSnapshot {
            projects,
            latest_insights: self.get_latest_insights(limit)?,
        })
    }

    /// Drop every view row and replay the whole log. Listeners are not notified.
    pub fn rebuild(&self, log: &FactLog) -> Result<usize, FactflowError> {
        self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.transaction()?;
            for table in ["projects", "tasks", "dependencies", "insights"] {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            tx.commit()?;
            Ok(())
        })?;
        let facts = log.all_in_order()?;
        for fact in &facts {
            self.apply_quiet(fact)?;
        }
        tracing::info!(facts = facts.len(), "views rebuilt from fact log");
        Ok(facts.len())
    }
}

impl Subscriber for ViewProjector {
    fn name(&self) -> &str {
        "view-projector"
    }

    fn on_fact(&self, fact: &Fact) -> Result<(), FactflowError> {
        self.apply(fact)
    }
}

impl Project {
    fn apply_updates(&mut self, updates: &JsonMap) {
        for (key, value) in updates {
            let applied = match key.as_str() {
                "name" => set_string(&mut self.name, value),
                "description" => set_string(&mut self.description, value),
                "status" => set_string(&mut self.status, value),
                "progress" => value.as_f64().map(|v| self.progress = v).is_some(),
                "completedTasks" => value.as_i64().map(|v| self.completed_tasks = v).is_some(),
                "totalTasks" => value.as_i64().map(|v| self.total_tasks = v).is_some(),
                _ => false,
            };
            if !applied {
                tracing::debug!(project_id = %self.id, field = %key, "ignoring project update field");
            }
        }
    }
}

impl Task {
    fn apply_updates(&mut self, updates: &JsonMap) {
        for (key, value) in updates {
            let applied = match key.as_str() {
                "title" => set_string(&mut self.title, value),
                "description" => set_string(&mut self.description, value),
                "status" => set_string(&mut self.status, value),
                "projectId" => set_string(&mut self.project_id, value),
                "assignee" => match value {
                    JsonValue::Null => {
                        self.assignee = None;
                        true
                    }
                    JsonValue::String(s) => {
                        self.assignee = Some(s.clone());
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
            if !applied {
                tracing::debug!(task_id = %self.id, field = %key, "ignoring task update field");
            }
        }
    }
}

fn set_string(slot: &mut String, value: &JsonValue) -> bool {
    match value.as_str() {
        Some(s) => {
            *slot = s.to_string();
            true
        }
        None => false,
    }
}

fn required_subject<'a>(fact: &'a Fact, key: &str) -> Option<&'a str> {
    let value = fact.subject_str(key);
    if value.is_none() {
        tracing::warn!(fact_id = fact.id(), kind = fact.kind(), field = key, "missing subject field, dropping");
    }
    value
}

fn dropped_missing_target(fact: &Fact, entity_id: &str) {
    tracing::warn!(
        fact_id = fact.id(),
        kind = fact.kind(),
        entity_id,
        "update for unknown entity dropped"
    );
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const PROJECT_COLUMNS: &str =
    "id, name, description, status, progress, completed_tasks, total_tasks, created_at, updated_at";
const TASK_COLUMNS: &str = "id, project_id, title, description, status, assignee, created_at, updated_at";
const INSIGHT_COLUMNS: &str = "id, project_id, message, severity, timestamp, source, additional_data";

fn project_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        status: r.get(3)?,
        progress: r.get(4)?,
        completed_tasks: r.get(5)?,
        total_tasks: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

fn task_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: r.get(0)?,
        project_id: r.get(1)?,
        title: r.get(2)?,
        description: r.get(3)?,
        status: r.get(4)?,
        assignee: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

fn load_project(conn: &Connection, project_id: &str) -> Result<Option<Project>, FactflowError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [project_id],
            project_from_row,
        )
        .optional()?)
}

fn load_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, FactflowError> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [task_id],
            task_from_row,
        )
        .optional()?)
}

fn query_insights(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Insight>, FactflowError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |r| {
            Ok((
                Insight {
                    id: r.get(0)?,
                    project_id: r.get(1)?,
                    message: r.get(2)?,
                    severity: r.get(3)?,
                    timestamp: r.get(4)?,
                    source: r.get(5)?,
                    additional_data: None,
                },
                r.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(mut insight, extra)| {
            insight.additional_data = extra.map(|s| serde_json::from_str(&s)).transpose()?;
            Ok(insight)
        })
        .collect()
}
