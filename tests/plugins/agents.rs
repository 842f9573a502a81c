use factflow::core::config::Config;
use factflow::core::context::Context;
use factflow::core::fact::{self, Fact};
use factflow::core::factory;
use factflow::core::projector::Insight;
use factflow::core::store::Store;
use factflow::json_map;
use factflow::plugins::agent::LifecycleState;
use factflow::plugins::insight::INSIGHT_AGENT;
use factflow::plugins::progress::PROGRESS_AGENT;
use factflow::plugins::relation::RELATION_AGENT;
use std::path::Path;
use tempfile::tempdir;

const PROJECT: &str = "project-x";

fn open(root: &Path) -> Context {
    let ctx = Context::open(Store::new(root), Config::default()).expect("open context");
    ctx.start_agents().expect("start agents");
    ctx
}

fn task(ctx: &Context, id: &str, description: &str) -> Fact {
    let f = factory::task_created(id, PROJECT, id, description, None, "pending", "test", None);
    ctx.publish(f.clone()).expect("publish task");
    f
}

fn complete(ctx: &Context, id: &str) -> Fact {
    let f = factory::task_status_changed(id, PROJECT, "pending", "completed", "test", None);
    ctx.publish(f.clone()).expect("publish status");
    f
}

fn insights(ctx: &Context) -> Vec<Insight> {
    ctx.projector()
        .get_project_insights(PROJECT, 100)
        .expect("insights")
}

#[test]
fn agents_follow_their_lifecycle() {
    let tmp = tempdir().expect("tempdir");
    let ctx = Context::open(Store::new(tmp.path()), Config::default()).expect("open context");
    let names: Vec<&str> = ctx.agents().iter().map(|a| a.name()).collect();
    assert_eq!(names, vec![PROGRESS_AGENT, RELATION_AGENT, INSIGHT_AGENT]);
    assert!(ctx.agents().iter().all(|a| a.state() == LifecycleState::Initialized));

    ctx.start_agents().expect("start");
    assert!(ctx.agents().iter().all(|a| a.state() == LifecycleState::Running));
    task(&ctx, "task-a", "");
    ctx.flush().expect("flush");
    let progress = ctx.agent(PROGRESS_AGENT).expect("progress agent");
    assert_eq!(progress.processed_count(), 1);
    let derived = ctx.fact_log().get_by_kind(fact::PROJECT_PROGRESS_CALCULATED, 10).expect("by kind");
    assert_eq!(derived.len(), 1);

    ctx.stop_agents().expect("stop");
    assert!(ctx.agents().iter().all(|a| a.state() == LifecycleState::Stopped));
    task(&ctx, "task-b", "");
    ctx.flush().expect("flush");
    assert_eq!(progress.processed_count(), 1);
    let derived = ctx.fact_log().get_by_kind(fact::PROJECT_PROGRESS_CALCULATED, 10).expect("by kind");
    assert_eq!(derived.len(), 1);

    ctx.start_agents().expect("restart");
    assert_eq!(progress.state(), LifecycleState::Running);
    ctx.shutdown().expect("shutdown");
}

#[test]
fn derived_facts_point_at_their_cause() {
    let tmp = tempdir().expect("tempdir");
    let ctx = open(tmp.path());
    let created = task(&ctx, "task-a", "waits on task-b");
    ctx.flush().expect("flush");

    let log = ctx.fact_log();
    let progress = log.get_by_kind(fact::PROJECT_PROGRESS_CALCULATED, 10).expect("progress");
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].caused_by(), Some(created.id()));
    assert_eq!(progress[0].source(), PROGRESS_AGENT);

    let edges = log.get_by_kind(fact::DEPENDENCY_ADDED, 10).expect("edges");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].caused_by(), Some(created.id()));
    assert_eq!(edges[0].project_id(), Some(PROJECT));

    let started = insights(&ctx);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].message, "Project has just started (0.0%)");
    assert_eq!(started[0].source, INSIGHT_AGENT);
    ctx.shutdown().expect("shutdown");
}

#[test]
fn relation_agent_infers_dependencies_and_refuses_cycles() {
    let tmp = tempdir().expect("tempdir");
    let ctx = open(tmp.path());
    task(&ctx, "task-a", "Blocked until TASK-B and task-c land; see task-a");
    task(&ctx, "task-b", "Needs task-a first");
    ctx.flush().expect("flush");

    let views = ctx.projector();
    let targets: Vec<String> = views
        .get_task_dependencies("task-a")
        .expect("deps")
        .into_iter()
        .map(|d| d.target_task_id)
        .collect();
    assert_eq!(targets, vec!["task-b", "task-c"]);
    assert!(views.get_task_dependencies("task-b").expect("deps").is_empty());
    assert_eq!(views.get_task_dependents("task-b").expect("dependents").len(), 1);

    let update = factory::task_updated(
        "task-a",
        PROJECT,
        json_map! { "description" => "still waiting on task-b, also task-d" },
        "test",
        None,
    );
    ctx.publish(update).expect("publish update");
    ctx.flush().expect("flush");
    let edges = ctx.fact_log().get_by_kind(fact::DEPENDENCY_ADDED, 10).expect("edges");
    assert_eq!(edges.len(), 3);
    ctx.shutdown().expect("shutdown");
}

#[test]
fn insight_agent_flags_long_chains_once() {
    let tmp = tempdir().expect("tempdir");
    let ctx = open(tmp.path());
    task(&ctx, "task-d", "after task-e");
    task(&ctx, "task-c", "after task-d");
    task(&ctx, "task-b", "after task-c");
    let head = task(&ctx, "task-a", "after task-b");
    ctx.flush().expect("flush");

    let warnings = |ctx: &Context| -> Vec<Insight> {
        insights(ctx)
            .into_iter()
            .filter(|i| i.severity == "warning")
            .collect()
    };
    let raised = warnings(&ctx);
    assert_eq!(raised.len(), 2);
    let chain_a = raised
        .iter()
        .find(|i| i.message == "Task task-a has a long dependency chain (5 levels)")
        .expect("chain insight for task-a");
    let extra = chain_a.additional_data.as_ref().expect("additional data");
    assert_eq!(extra.get("taskId").and_then(|v| v.as_str()), Some("task-a"));
    assert_eq!(extra.get("chainLength").and_then(|v| v.as_u64()), Some(5));

    ctx.publish(head).expect("re-publish");
    ctx.flush().expect("flush");
    assert_eq!(warnings(&ctx).len(), 2);
    ctx.shutdown().expect("shutdown");
}

#[test]
fn malformed_facts_do_not_stall_agents() {
    let tmp = tempdir().expect("tempdir");
    let ctx = open(tmp.path());
    let broken = Fact::new(
        "test",
        fact::TASK_CREATED,
        json_map! { "taskId" => "task-z" },
        json_map! { "title" => "no project" },
        None,
    );
    assert!(ctx.publish(broken).expect("publish"));
    task(&ctx, "task-a", "");
    ctx.flush().expect("flush");

    let derived = ctx.fact_log().get_by_kind(fact::PROJECT_PROGRESS_CALCULATED, 10).expect("by kind");
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].project_id(), Some(PROJECT));
    ctx.shutdown().expect("shutdown");
}

#[test]
fn hydration_restores_agent_state_without_publishing() {
    let tmp = tempdir().expect("tempdir");
    {
        let ctx = open(tmp.path());
        ctx.publish(factory::project_created(PROJECT, "X", "", "test", None))
            .expect("publish project");
        task(&ctx, "task-a", "");
        task(&ctx, "task-b", "");
        complete(&ctx, "task-a");
        ctx.flush().expect("flush");
        ctx.shutdown().expect("shutdown");
    }

    let ctx = open(tmp.path());
    let before = ctx.fact_log().count().expect("count");
    ctx.flush().expect("flush");
    assert_eq!(ctx.fact_log().count().expect("count"), before);

    complete(&ctx, "task-b");
    ctx.flush().expect("flush");
    let project = ctx.projector().get_project(PROJECT).expect("get").expect("project");
    assert_eq!(project.progress, 100.0);
    assert_eq!((project.completed_tasks, project.total_tasks), (2, 2));

    let started: Vec<Insight> = insights(&ctx)
        .into_iter()
        .filter(|i| i.message.starts_with("Project has just started"))
        .collect();
    assert_eq!(started.len(), 1);
    ctx.shutdown().expect("shutdown");
}

#[test]
fn only_enabled_agents_run() {
    let tmp = tempdir().expect("tempdir");
    let config = Config::parse("[agents]\nenabled = [\"progress\"]\n").expect("config");
    let ctx = Context::open(Store::new(tmp.path()), config).expect("open context");
    ctx.start_agents().expect("start");
    assert_eq!(ctx.agents().len(), 1);
    assert!(ctx.agent(RELATION_AGENT).is_none());

    task(&ctx, "task-a", "depends on task-b");
    ctx.flush().expect("flush");
    assert!(ctx.fact_log().get_by_kind(fact::DEPENDENCY_ADDED, 10).expect("edges").is_empty());
    assert_eq!(
        ctx.fact_log().get_by_kind(fact::PROJECT_PROGRESS_CALCULATED, 10).expect("progress").len(),
        1
    );
    assert!(insights(&ctx).is_empty());
    ctx.shutdown().expect("shutdown");
}
