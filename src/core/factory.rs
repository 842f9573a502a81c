//! Named constructors for the well-known fact kinds.
//!
//! These fix the subject/payload shape each consumer relies on; producers
//! outside this crate should build facts through here rather than by hand.

use crate::core::fact::{self, Fact, JsonMap};
use serde_json::Value as JsonValue;

pub const DEFAULT_DEPENDENCY_TYPE: &str = "depends-on";

pub fn project_created(
    project_id: &str,
    name: &str,
    description: &str,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::PROJECT_CREATED,
        crate::json_map! { "projectId" => project_id },
        crate::json_map! { "name" => name, "description" => description },
        caused_by.map(str::to_string),
    )
}

pub fn project_updated(
    project_id: &str,
    updates: JsonMap,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::PROJECT_UPDATED,
        crate::json_map! { "projectId" => project_id },
        crate::json_map! { "updates" => (JsonValue::Object(updates)) },
        caused_by.map(str::to_string),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn task_created(
    task_id: &str,
    project_id: &str,
    title: &str,
    description: &str,
    assignee: Option<&str>,
    status: &str,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::TASK_CREATED,
        crate::json_map! { "taskId" => task_id, "projectId" => project_id },
        crate::json_map! {
            "title" => title,
            "description" => description,
            "assignee" => assignee,
            "status" => status,
        },
        caused_by.map(str::to_string),
    )
}

pub fn task_updated(
    task_id: &str,
    project_id: &str,
    updates: JsonMap,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::TASK_UPDATED,
        crate::json_map! { "taskId" => task_id, "projectId" => project_id },
        crate::json_map! { "updates" => (JsonValue::Object(updates)) },
        caused_by.map(str::to_string),
    )
}

pub fn task_status_changed(
    task_id: &str,
    project_id: &str,
    old_status: &str,
    new_status: &str,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::TASK_STATUS_CHANGED,
        crate::json_map! { "taskId" => task_id, "projectId" => project_id },
        crate::json_map! { "oldStatus" => old_status, "newStatus" => new_status },
        caused_by.map(str::to_string),
    )
}

/// `project_id` is stamped into the subject when the producer knows it, so the
/// fact lands in the per-project index.
pub fn dependency_added(
    source_task_id: &str,
    target_task_id: &str,
    dependency_type: &str,
    project_id: Option<&str>,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    let mut subject = crate::json_map! {
        "sourceTaskId" => source_task_id,
        "targetTaskId" => target_task_id,
    };
    if let Some(pid) = project_id {
        subject.insert("projectId".into(), pid.into());
    }
    Fact::new(
        source,
        fact::DEPENDENCY_ADDED,
        subject,
        crate::json_map! { "dependencyType" => dependency_type },
        caused_by.map(str::to_string),
    )
}

/// Extra keys in `additional_data` are merged into the payload next to
/// `message` and `severity`; they cannot overwrite either.
pub fn insight_raised(
    project_id: &str,
    message: &str,
    severity: &str,
    source: &str,
    caused_by: Option<&str>,
    additional_data: Option<JsonMap>,
) -> Fact {
    let mut payload = JsonMap::new();
    if let Some(extra) = additional_data {
        payload.extend(extra);
    }
    payload.insert("message".into(), message.into());
    payload.insert("severity".into(), severity.into());
    Fact::new(
        source,
        fact::INSIGHT_RAISED,
        crate::json_map! { "projectId" => project_id },
        payload,
        caused_by.map(str::to_string),
    )
}

pub fn project_progress_calculated(
    project_id: &str,
    progress: f64,
    completed_tasks: u64,
    total_tasks: u64,
    source: &str,
    caused_by: Option<&str>,
) -> Fact {
    Fact::new(
        source,
        fact::PROJECT_PROGRESS_CALCULATED,
        crate::json_map! { "projectId" => project_id },
        crate::json_map! {
            "progress" => progress,
            "completedTasks" => completed_tasks,
            "totalTasks" => total_tasks,
        },
        caused_by.map(str::to_string),
    )
}
