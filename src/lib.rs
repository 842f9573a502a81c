//! factflow: an event-sourced project tracker.
//!
//! Everything that happens to a project is recorded as an immutable, signed
//! [`Fact`](core::fact::Fact). Facts flow through one pipeline:
//!
//! ```text
//! producer -> Broker::publish -> FactLog::append (durable, idempotent)
//!                             -> delivery thread -> ViewProjector (views.db)
//!                                                -> agents -> Broker::publish ...
//! ```
//!
//! # Architecture
//!
//! - **Fact log** (`facts.db`): append-only, signature-checked, indexed by
//!   kind, by project and by time. The single source of truth.
//! - **Broker**: durability before fan-out. A fact reaches subscribers only
//!   after it is stored; subscriber failures never reach the publisher.
//! - **View projector** (`views.db`): current projects, tasks, dependency
//!   edges and insights. Disposable; `factflow rebuild` replays the log.
//! - **Agents**: `progress`, `relation` and `insight` derive new facts from
//!   observed ones. Their dedup rules are what keeps cascades finite.
//!
//! # Examples
//!
//! ```bash
//! factflow init
//! factflow publish --kind ProjectCreated --source cli \
//!     --subject '{"projectId":"project-x"}' --payload '{"name":"X","description":""}'
//! factflow ingest --file analysis.json --channel general
//! factflow view snapshot --format text
//! factflow facts verify
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: fact model, storage, broker, projector, bridge, runtime context
//! - [`plugins`]: the reactive agents

pub mod core;
pub mod plugins;

use crate::core::{
    bridge,
    config::Config,
    context::Context,
    error::FactflowError,
    fact::{Fact, JsonMap},
    logging, output, schemas,
    store::Store,
    time,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "factflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Event-sourced project tracker with reactive agents"
)]
struct Cli {
    /// Store root (defaults to $FACTFLOW_ROOT, then ./.factflow).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Output format for view commands.
    #[clap(long, global = true, value_enum, default_value = "json")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store and write a default factflow.toml
    Init,

    /// Seal and publish a single fact
    Publish {
        #[clap(long)]
        kind: String,
        #[clap(long)]
        source: String,
        /// Subject as a JSON object
        #[clap(long, default_value = "{}")]
        subject: String,
        /// Payload as a JSON object
        #[clap(long, default_value = "{}")]
        payload: String,
        #[clap(long)]
        caused_by: Option<String>,
    },

    /// Ingest a structured analysis report (JSON)
    Ingest {
        #[clap(long)]
        file: PathBuf,
        #[clap(long, default_value = "default")]
        channel: String,
    },

    /// Import a legacy project database (JSON)
    #[clap(name = "import-legacy")]
    ImportLegacy {
        #[clap(long)]
        file: PathBuf,
    },

    /// Read the fact log
    Facts(FactsCli),

    /// Read the materialized views
    View(ViewCli),

    /// Drop all views and replay the fact log
    Rebuild,
}

#[derive(clap::Args, Debug)]
struct FactsCli {
    #[clap(subcommand)]
    command: FactsCommand,
}

#[derive(Subcommand, Debug)]
enum FactsCommand {
    /// One fact by id
    Get { id: String },
    /// Most recent facts, newest first
    Latest {
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Facts of one kind, oldest first
    Kind {
        kind: String,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Facts scoped to one project, oldest first
    Project {
        project_id: String,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Re-check every stored signature
    Verify,
}

#[derive(clap::Args, Debug)]
struct ViewCli {
    #[clap(subcommand)]
    command: ViewCommand,
}

#[derive(Subcommand, Debug)]
enum ViewCommand {
    /// All projects, highest progress first
    Projects,
    Project { project_id: String },
    Tasks { project_id: String },
    Task { task_id: String },
    /// Tasks this task depends on
    Deps { task_id: String },
    /// Tasks depending on this task
    Dependents { task_id: String },
    Insights {
        project_id: String,
        #[clap(long)]
        limit: Option<usize>,
    },
    #[clap(name = "latest-insights")]
    LatestInsights {
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Every project with its tasks and insights
    Snapshot {
        #[clap(long)]
        limit: Option<usize>,
    },
}

pub fn run() -> Result<(), FactflowError> {
    let cli = Cli::parse();
    let store = Store::resolve(cli.root.as_deref());
    let config = Config::load(&store)?;
    logging::init_tracing(&config.log.filter);

    let ctx = Context::open(store, config)?;
    let outcome = execute(&ctx, cli.command, cli.format);
    let closed = ctx.shutdown();
    let value = outcome?;
    closed?;
    if let Some(value) = value {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

/// Runs one command; `Some(json)` is printed by the caller after shutdown.
fn execute(ctx: &Context, command: Command, format: OutputFormat) -> Result<Option<JsonValue>, FactflowError> {
    let limit_default = ctx.config().query.default_limit;
    let value = match command {
        Command::Init => init_store(ctx)?,
        Command::Publish {
            kind,
            source,
            subject,
            payload,
            caused_by,
        } => {
            let fact = Fact::new(
                source,
                kind,
                parse_object("subject", &subject)?,
                parse_object("payload", &payload)?,
                caused_by,
            );
            ctx.start_agents()?;
            let accepted = ctx.publish(fact.clone())?;
            ctx.flush()?;
            time::command_envelope(
                "publish",
                if accepted { "ok" } else { "refused" },
                serde_json::json!({ "fact": fact, "accepted": accepted, "factCount": ctx.fact_log().count()? }),
            )
        }
        Command::Ingest { file, channel } => {
            let report: bridge::AnalysisReport = read_json(&file)?;
            ctx.start_agents()?;
            let summary = bridge::ingest_analysis(ctx.broker(), ctx.projector(), &report, &channel)?;
            ctx.flush()?;
            time::command_envelope("ingest", "ok", serde_json::json!({ "summary": summary }))
        }
        Command::ImportLegacy { file } => {
            let db: bridge::LegacyDatabase = read_json(&file)?;
            ctx.start_agents()?;
            let summary = bridge::import_legacy(ctx.broker(), &db)?;
            ctx.flush()?;
            time::command_envelope("import-legacy", "ok", serde_json::json!({ "summary": summary }))
        }
        Command::Facts(facts) => run_facts(ctx, facts.command, limit_default)?,
        Command::View(view) => match run_view(ctx, view.command, limit_default, format)? {
            Some(v) => v,
            None => return Ok(None),
        },
        Command::Rebuild => {
            let replayed = ctx.projector().rebuild(ctx.fact_log())?;
            time::command_envelope("rebuild", "ok", serde_json::json!({ "replayed": replayed }))
        }
    };
    Ok(Some(value))
}

fn init_store(ctx: &Context) -> Result<JsonValue, FactflowError> {
    let config_path = ctx.store().config_path();
    let wrote_config = if config_path.exists() {
        false
    } else {
        let rendered = toml::to_string_pretty(&Config::default())
            .map_err(|e| FactflowError::ValidationError(e.to_string()))?;
        fs::write(&config_path, rendered)?;
        true
    };
    tracing::info!(root = %ctx.store().root.display(), "store initialized");
    Ok(time::command_envelope(
        "init",
        "ok",
        serde_json::json!({
            "root": ctx.store().root.display().to_string(),
            "facts_db": schemas::FACTS_DB_NAME,
            "views_db": schemas::VIEWS_DB_NAME,
            "wrote_config": wrote_config,
        }),
    ))
}

fn run_facts(ctx: &Context, command: FactsCommand, limit_default: usize) -> Result<JsonValue, FactflowError> {
    let log = ctx.fact_log();
    let value = match command {
        FactsCommand::Get { id } => {
            let fact = log
                .get_by_id(&id)?
                .ok_or_else(|| FactflowError::NotFound(format!("fact {id}")))?;
            let verified = fact.verify();
            time::command_envelope("facts.get", "ok", serde_json::json!({ "fact": fact, "verified": verified }))
        }
        FactsCommand::Latest { limit } => {
            let facts = log.get_latest(limit.unwrap_or(limit_default))?;
            time::command_envelope("facts.latest", "ok", serde_json::json!({ "facts": facts }))
        }
        FactsCommand::Kind { kind, limit } => {
            let facts = log.get_by_kind(&kind, limit.unwrap_or(usize::MAX))?;
            time::command_envelope("facts.kind", "ok", serde_json::json!({ "kind": kind, "facts": facts }))
        }
        FactsCommand::Project { project_id, limit } => {
            let facts = log.get_by_project(&project_id, limit.unwrap_or(usize::MAX))?;
            time::command_envelope(
                "facts.project",
                "ok",
                serde_json::json!({ "projectId": project_id, "facts": facts }),
            )
        }
        FactsCommand::Verify => {
            let checked = log.count()?;
            let tampered = log.verify_all()?;
            let status = if tampered.is_empty() { "ok" } else { "failed" };
            time::command_envelope(
                "facts.verify",
                status,
                serde_json::json!({ "checked": checked, "tampered": tampered }),
            )
        }
    };
    Ok(value)
}

fn run_view(
    ctx: &Context,
    command: ViewCommand,
    limit_default: usize,
    format: OutputFormat,
) -> Result<Option<JsonValue>, FactflowError> {
    let views = ctx.projector();
    let text = format == OutputFormat::Text;
    let value = match command {
        ViewCommand::Projects => {
            let projects = views.get_projects()?;
            if text {
                print_lines(projects.iter().map(output::project_line));
                return Ok(None);
            }
            serde_json::json!({ "projects": projects })
        }
        ViewCommand::Project { project_id } => {
            let project = views
                .get_project(&project_id)?
                .ok_or_else(|| FactflowError::NotFound(format!("project {project_id}")))?;
            if text {
                println!("{}", output::project_line(&project));
                return Ok(None);
            }
            serde_json::json!({ "project": project })
        }
        ViewCommand::Tasks { project_id } => {
            let tasks = views.get_project_tasks(&project_id)?;
            if text {
                print_lines(tasks.iter().map(output::task_line));
                return Ok(None);
            }
            serde_json::json!({ "projectId": project_id, "tasks": tasks })
        }
        ViewCommand::Task { task_id } => {
            let task = views
                .get_task(&task_id)?
                .ok_or_else(|| FactflowError::NotFound(format!("task {task_id}")))?;
            if text {
                println!("{}", output::task_line(&task));
                return Ok(None);
            }
            serde_json::json!({ "task": task })
        }
        ViewCommand::Deps { task_id } => {
            serde_json::json!({ "taskId": task_id, "dependencies": views.get_task_dependencies(&task_id)? })
        }
        ViewCommand::Dependents { task_id } => {
            serde_json::json!({ "taskId": task_id, "dependents": views.get_task_dependents(&task_id)? })
        }
        ViewCommand::Insights { project_id, limit } => {
            let insights = views.get_project_insights(&project_id, limit.unwrap_or(limit_default))?;
            if text {
                print_lines(insights.iter().map(output::insight_line));
                return Ok(None);
            }
            serde_json::json!({ "projectId": project_id, "insights": insights })
        }
        ViewCommand::LatestInsights { limit } => {
            let insights = views.get_latest_insights(limit.unwrap_or(limit_default))?;
            if text {
                print_lines(insights.iter().map(output::insight_line));
                return Ok(None);
            }
            serde_json::json!({ "insights": insights })
        }
        ViewCommand::Snapshot { limit } => {
            let snapshot = views.snapshot(limit.unwrap_or(limit_default))?;
            if text {
                println!("{}", output::snapshot_text(&snapshot));
                return Ok(None);
            }
            serde_json::to_value(&snapshot)?
        }
    };
    Ok(Some(time::command_envelope("view", "ok", value)))
}

fn print_lines(lines: impl Iterator<Item = String>) {
    for line in lines {
        println!("{line}");
    }
}

fn parse_object(what: &str, raw: &str) -> Result<JsonMap, FactflowError> {
    serde_json::from_str(raw)
        .map_err(|e| FactflowError::ValidationError(format!("--{what} must be a JSON object: {e}")))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, FactflowError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
