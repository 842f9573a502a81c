use factflow::core::broker::{Broker, Subscriber, subscriber_fn};
use factflow::core::error::FactflowError;
use factflow::core::fact::{self, Fact, NewFact};
use factflow::core::fact_log::{AppendOutcome, FactLog};
use factflow::core::factory;
use factflow::core::pool::SqlitePool;
use factflow::core::projector::{ViewChange, ViewListener, ViewProjector};
use factflow::core::store::Store;
use factflow::json_map;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct Harness {
    log: Arc<FactLog>,
    broker: Arc<Broker>,
    projector: Arc<ViewProjector>,
}

fn open_log(root: &Path) -> Arc<FactLog> {
    let store = Store::new(root);
    let pool = Arc::new(SqlitePool::new());
    Arc::new(FactLog::open(pool, &store).expect("open fact log"))
}

fn open_harness(root: &Path) -> Harness {
    let store = Store::new(root);
    let pool = Arc::new(SqlitePool::new());
    let log = Arc::new(FactLog::open(Arc::clone(&pool), &store).expect("open fact log"));
    let projector = Arc::new(ViewProjector::open(pool, &store).expect("open views"));
    let broker = Arc::new(Broker::new(Arc::clone(&log)).expect("broker"));
    projector.attach(&broker).expect("attach projector");
    Harness {
        log,
        broker,
        projector,
    }
}

fn forged(fact: &Fact) -> Fact {
    let mut value = serde_json::to_value(fact).expect("serialize fact");
    value["payload"]["name"] = JsonValue::from("Mallory");
    serde_json::from_value(value).expect("deserialize forged fact")
}

fn recorder(name: &str) -> (Arc<dyn Subscriber>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = subscriber_fn(name, move |f: &Fact| {
        sink.lock().expect("recorder lock").push(f.id().to_string());
        Ok(())
    });
    (sub, seen)
}

#[test]
fn fact_log_append_is_idempotent_on_id() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let fact = factory::project_created("project-x", "X", "first", "test", None);

    assert_eq!(log.append(&fact).expect("append"), AppendOutcome::Stored);
    assert_eq!(log.append(&fact).expect("append again"), AppendOutcome::AlreadyPresent);
    assert_eq!(log.count().expect("count"), 1);
    assert_eq!(log.get_by_kind(fact::PROJECT_CREATED, 10).expect("by kind").len(), 1);
    assert_eq!(log.get_by_project("project-x", 10).expect("by project").len(), 1);

    let stored = log.get_by_id(fact.id()).expect("get").expect("stored fact");
    assert_eq!(stored, fact);
    assert!(stored.verify());
}

#[test]
fn fact_log_refuses_tampered_facts() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let original = factory::project_created("project-x", "X", "", "test", None);
    let tampered = forged(&original);
    assert!(!tampered.verify());

    assert_eq!(log.append(&tampered).expect("append"), AppendOutcome::Rejected);
    assert!(log.get_by_id(original.id()).expect("get").is_none());
    assert_eq!(log.count().expect("count"), 0);
    assert!(log.verify_all().expect("verify").is_empty());
}

#[test]
fn fact_log_orders_latest_by_time_then_insertion() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let at = |id: &str, ts: i64| {
        Fact::seal(NewFact {
            id: Some(id.to_string()),
            timestamp: Some(ts),
            source: "test".into(),
            kind: fact::INSIGHT_RAISED.into(),
            subject: json_map! { "projectId" => "project-x" },
            payload: json_map! { "message" => id },
            caused_by: None,
        })
    };
    for f in [at("a", 2_000), at("b", 1_000), at("c", 2_000)] {
        log.append(&f).expect("append");
    }

    let latest: Vec<String> = log
        .get_latest(10)
        .expect("latest")
        .iter()
        .map(|f| f.id().to_string())
        .collect();
    assert_eq!(latest, vec!["c", "a", "b"]);

    let by_kind: Vec<String> = log
        .get_by_kind(fact::INSIGHT_RAISED, 2)
        .expect("by kind")
        .iter()
        .map(|f| f.id().to_string())
        .collect();
    assert_eq!(by_kind, vec!["a", "b"]);
    assert_eq!(log.get_latest(1).expect("latest 1").len(), 1);
}

#[test]
fn facts_without_project_skip_the_project_index() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let edge = factory::dependency_added("task-a", "task-b", factory::DEFAULT_DEPENDENCY_TYPE, None, "test", None);
    log.append(&edge).expect("append");
    assert_eq!(log.get_by_kind(fact::DEPENDENCY_ADDED, 10).expect("by kind").len(), 1);
    assert!(log.get_by_project("project-unknown", 10).expect("by project").is_empty());
}

#[test]
fn broker_delivers_in_publish_order_after_storing() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let broker = Broker::new(Arc::clone(&log)).expect("broker");
    let (sub, seen) = recorder("order");
    assert!(broker.subscribe(fact::TASK_CREATED, Arc::clone(&sub)).expect("subscribe"));

    let mut ids = Vec::new();
    for n in 0..20 {
        let f = factory::task_created(&format!("task-{n}"), "project-x", "t", "", None, "pending", "test", None);
        ids.push(f.id().to_string());
        assert!(broker.publish(f).expect("publish"));
    }
    broker.flush().expect("flush");

    assert_eq!(*seen.lock().expect("seen"), ids);
    assert_eq!(log.count().expect("count"), 20);
    broker.close().expect("close");
}

#[test]
fn broker_ignores_duplicate_subscriptions_and_releases_empty_channels() {
    let tmp = tempdir().expect("tempdir");
    let broker = Broker::new(open_log(tmp.path())).expect("broker");
    let (sub, seen) = recorder("dup");

    assert!(broker.subscribe(fact::PROJECT_CREATED, Arc::clone(&sub)).expect("subscribe"));
    assert!(!broker.subscribe(fact::PROJECT_CREATED, Arc::clone(&sub)).expect("subscribe again"));
    assert_eq!(broker.subscriber_count(fact::PROJECT_CREATED), 1);

    broker
        .publish(factory::project_created("project-x", "X", "", "test", None))
        .expect("publish");
    broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 1);

    assert!(broker.unsubscribe(fact::PROJECT_CREATED, Some(&sub)).expect("unsubscribe"));
    assert!(!broker.unsubscribe(fact::PROJECT_CREATED, Some(&sub)).expect("unsubscribe again"));
    assert_eq!(broker.subscriber_count(fact::PROJECT_CREATED), 0);

    broker
        .publish(factory::project_created("project-y", "Y", "", "test", None))
        .expect("publish");
    broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 1);
}

#[test]
fn failing_subscribers_do_not_block_others() {
    let tmp = tempdir().expect("tempdir");
    let broker = Broker::new(open_log(tmp.path())).expect("broker");
    let erroring = subscriber_fn("erroring", |_f: &Fact| {
        Err(FactflowError::ValidationError("nope".into()))
    });
    let panicking = subscriber_fn("panicking", |_f: &Fact| panic!("subscriber blew up"));
    let (healthy, seen) = recorder("healthy");
    for sub in [erroring, panicking, healthy] {
        broker.subscribe(fact::PROJECT_CREATED, sub).expect("subscribe");
    }

    let accepted = broker
        .publish(factory::project_created("project-x", "X", "", "test", None))
        .expect("publish never surfaces subscriber failures");
    assert!(accepted);
    broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 1);

    broker
        .publish(factory::project_created("project-y", "Y", "", "test", None))
        .expect("publish after a panic");
    broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 2);
}

#[test]
fn broker_refuses_tampered_facts_without_fan_out() {
    let tmp = tempdir().expect("tempdir");
    let broker = Broker::new(open_log(tmp.path())).expect("broker");
    let (sub, seen) = recorder("tamper");
    broker.subscribe(fact::PROJECT_CREATED, sub).expect("subscribe");

    let tampered = forged(&factory::project_created("project-x", "X", "", "test", None));
    assert!(!broker.publish(tampered).expect("publish"));
    broker.flush().expect("flush");
    assert!(seen.lock().expect("seen").is_empty());
    assert_eq!(broker.fact_log().count().expect("count"), 0);
}

#[test]
fn publishing_after_close_is_a_lifecycle_error() {
    let tmp = tempdir().expect("tempdir");
    let broker = Broker::new(open_log(tmp.path())).expect("broker");
    broker.close().expect("close");
    broker.close().expect("close is idempotent");

    let fact = factory::project_created("project-x", "X", "", "test", None);
    let id = fact.id().to_string();
    let err = broker.publish(fact).expect_err("closed broker");
    assert!(matches!(err, FactflowError::LifecycleError(_)));
    assert!(broker.fact_log().get_by_id(&id).expect("get").is_some());
}

#[test]
fn subscribers_can_publish_and_flush_waits_for_the_cascade() {
    let tmp = tempdir().expect("tempdir");
    let broker = Arc::new(Broker::new(open_log(tmp.path())).expect("broker"));
    let weak = Arc::downgrade(&broker);
    let echo = subscriber_fn("echo", move |f: &Fact| {
        let Some(broker) = weak.upgrade() else {
            return Ok(());
        };
        let project_id = f.project_id().unwrap_or_default();
        broker.publish(factory::insight_raised(project_id, "created", "info", "echo", Some(f.id()), None))?;
        Ok(())
    });
    broker.subscribe(fact::PROJECT_CREATED, echo).expect("subscribe");
    let (sub, seen) = recorder("insights");
    broker.subscribe(fact::INSIGHT_RAISED, sub).expect("subscribe");

    for n in 0..5 {
        broker
            .publish(factory::project_created(&format!("project-{n}"), "P", "", "test", None))
            .expect("publish");
    }
    broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 5);
    assert_eq!(broker.fact_log().count().expect("count"), 10);
}

#[test]
fn projector_materializes_facts_published_through_the_broker() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());

    let created = factory::project_created("project-x", "X", "desc", "test", None);
    h.broker.publish(created).expect("publish");
    h.broker
        .publish(factory::task_created("task-a", "project-x", "A", "", Some("ana"), "pending", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::task_status_changed("task-a", "project-x", "pending", "in-progress", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::project_updated(
            "project-x",
            json_map! { "status" => "paused", "description" => "updated" },
            "test",
            None,
        ))
        .expect("publish");
    h.broker
        .publish(factory::project_progress_calculated("project-x", 50.0, 1, 2, "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");

    let project = h.projector.get_project("project-x").expect("get").expect("project");
    assert_eq!(project.name, "X");
    assert_eq!(project.status, "paused");
    assert_eq!(project.description, "updated");
    assert_eq!(project.progress, 50.0);
    assert_eq!((project.completed_tasks, project.total_tasks), (1, 2));

    let task = h.projector.get_task("task-a").expect("get").expect("task");
    assert_eq!(task.status, "in-progress");
    assert_eq!(task.assignee.as_deref(), Some("ana"));
    assert_eq!(h.projector.get_project_tasks("project-x").expect("tasks").len(), 1);
}

#[test]
fn projector_drops_updates_for_unknown_entities() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());
    h.broker
        .publish(factory::project_updated("project-ghost", json_map! { "status" => "done" }, "test", None))
        .expect("publish");
    h.broker
        .publish(factory::task_status_changed("task-ghost", "project-ghost", "pending", "completed", "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");

    assert!(h.projector.get_project("project-ghost").expect("get").is_none());
    assert!(h.projector.get_task("task-ghost").expect("get").is_none());
    assert_eq!(h.log.count().expect("count"), 2);
}

#[test]
fn projector_creation_is_insert_only() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());
    h.broker
        .publish(factory::project_created("project-x", "First", "", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::project_created("project-x", "Second", "", "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");
    let project = h.projector.get_project("project-x").expect("get").expect("project");
    assert_eq!(project.name, "First");
}

#[test]
fn projector_tracks_dependencies_and_insights() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());
    h.broker
        .publish(factory::dependency_added("task-a", "task-b", factory::DEFAULT_DEPENDENCY_TYPE, Some("p"), "test", None))
        .expect("publish");
    h.broker
        .publish(factory::insight_raised("p", "older", "info", "test", None, None))
        .expect("publish");
    h.broker
        .publish(factory::insight_raised(
            "p",
            "newer",
            "warning",
            "test",
            None,
            Some(json_map! { "taskId" => "task-a" }),
        ))
        .expect("publish");
    h.broker.flush().expect("flush");

    let deps = h.projector.get_task_dependencies("task-a").expect("deps");
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].target_task_id, "task-b");
    assert_eq!(deps[0].dependency_type, factory::DEFAULT_DEPENDENCY_TYPE);
    assert_eq!(h.projector.get_task_dependents("task-b").expect("dependents").len(), 1);
    assert!(h.projector.get_task_dependents("task-a").expect("dependents").is_empty());

    let insights = h.projector.get_project_insights("p", 10).expect("insights");
    let messages: Vec<&str> = insights.iter().map(|i| i.message.as_str()).collect();
    assert_eq!(messages.len(), 2);
    assert!(messages.contains(&"older") && messages.contains(&"newer"));
    let newer = insights.iter().find(|i| i.message == "newer").expect("newer insight");
    assert_eq!(newer.severity, "warning");
    let extra = newer.additional_data.as_ref().expect("additional data");
    assert_eq!(extra.get("taskId").and_then(|v| v.as_str()), Some("task-a"));
    assert_eq!(h.projector.get_latest_insights(1).expect("latest").len(), 1);
}

#[test]
fn view_listeners_see_changes_until_unregistered() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: ViewListener = Arc::new(move |change: ViewChange, id: &str, data: &JsonValue| {
        let status = data.get("status").and_then(|s| s.as_str()).unwrap_or_default().to_string();
        sink.lock().expect("listener lock").push((change, id.to_string(), status));
        Ok(())
    });
    assert!(h.projector.register_listener(ViewChange::TaskStatusChanged, Arc::clone(&listener)));
    assert!(!h.projector.register_listener(ViewChange::TaskStatusChanged, Arc::clone(&listener)));

    h.broker
        .publish(factory::task_created("task-a", "p", "A", "", None, "pending", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::task_status_changed("task-a", "p", "pending", "completed", "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");
    assert_eq!(
        *seen.lock().expect("seen"),
        vec![(ViewChange::TaskStatusChanged, "task-a".to_string(), "completed".to_string())]
    );

    assert!(h.projector.unregister_listener(ViewChange::TaskStatusChanged, &listener));
    h.broker
        .publish(factory::task_status_changed("task-a", "p", "completed", "pending", "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");
    assert_eq!(seen.lock().expect("seen").len(), 1);
}

#[test]
fn rebuild_reconstructs_views_from_the_log() {
    let tmp = tempdir().expect("tempdir");
    let h = open_harness(tmp.path());
    h.broker
        .publish(factory::project_created("project-x", "X", "", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::task_created("task-a", "project-x", "A", "", None, "pending", "test", None))
        .expect("publish");
    h.broker
        .publish(factory::task_status_changed("task-a", "project-x", "pending", "completed", "test", None))
        .expect("publish");
    h.broker.flush().expect("flush");
    let before = h.projector.snapshot(10).expect("snapshot");

    h.projector.close(&h.broker).expect("detach");
    h.broker.close().expect("close");

    let store = Store::new(tmp.path());
    let fresh = ViewProjector::open(Arc::new(SqlitePool::new()), &store).expect("reopen views");
    assert_eq!(fresh.rebuild(&h.log).expect("rebuild"), 3);
    let after = fresh.snapshot(10).expect("snapshot");

    assert_eq!(after.projects.len(), before.projects.len());
    assert_eq!(after.projects[0].project, before.projects[0].project);
    assert_eq!(after.projects[0].tasks, before.projects[0].tasks);
    assert_eq!(after.projects[0].tasks[0].status, "completed");
}

#[test]
fn fractional_progress_verifies_after_read_back() {
    let tmp = tempdir().expect("tempdir");
    let log = open_log(tmp.path());
    let mut ids = Vec::new();
    for total in 1..=20u64 {
        for completed in 0..=total {
            let progress = completed as f64 / total as f64 * 100.0;
            let fact = factory::project_progress_calculated("project-x", progress, completed, total, "test", None);
            assert_eq!(log.append(&fact).expect("append"), AppendOutcome::Stored);
            ids.push((fact.id().to_string(), progress));
        }
    }

    assert!(log.verify_all().expect("verify").is_empty());
    for (id, progress) in ids {
        let stored = log.get_by_id(&id).expect("get").expect("stored fact");
        assert!(stored.verify(), "{id} no longer verifies");
        assert_eq!(stored.payload_f64("progress"), Some(progress));
    }
}
