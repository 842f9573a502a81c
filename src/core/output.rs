//! Compact text rendering for the `--format text` CLI surface.

use crate::core::projector::{Insight, Project, Task, ViewSnapshot};
use colored::Colorize;

/// Collapse whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{preview}...")
    } else {
        preview
    }
}

pub fn project_line(project: &Project) -> String {
    format!(
        "{} {} [{}] {:.1}% ({}/{})",
        project.id.bold(),
        compact_line(&project.name, 40),
        project.status,
        project.progress,
        project.completed_tasks,
        project.total_tasks
    )
}

pub fn task_line(task: &Task) -> String {
    let status = match task.status.as_str() {
        "completed" => task.status.green(),
        "blocked" => task.status.red(),
        _ => task.status.normal(),
    };
    format!(
        "  {} {} [{}]{}",
        task.id,
        compact_line(&task.title, 60),
        status,
        task.assignee
            .as_deref()
            .map(|a| format!(" @{a}"))
            .unwrap_or_default()
    )
}

pub fn insight_line(insight: &Insight) -> String {
    let severity = match insight.severity.as_str() {
        "warning" => insight.severity.yellow().bold(),
        "error" | "critical" => insight.severity.red().bold(),
        _ => insight.severity.cyan(),
    };
    format!(
        "{} {} {}",
        severity,
        insight.project_id.dimmed(),
        compact_line(&insight.message, 100)
    )
}

pub fn snapshot_text(snapshot: &ViewSnapshot) -> String {
    let mut lines = Vec::new();
    for view in &snapshot.projects {
        lines.push(project_line(&view.project));
        lines.extend(view.tasks.iter().map(task_line));
    }
    if !snapshot.latest_insights.is_empty() {
        lines.push("latest insights:".bold().to_string());
        lines.extend(snapshot.latest_insights.iter().map(insight_line));
    }
    lines.join("\n")
}
