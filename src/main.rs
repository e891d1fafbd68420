//! # Jobflow — durable job scheduler and workflow engine
//!
//! Usage:
//!   jobflow run                                   # Run the scheduler until Ctrl-C
//!   jobflow job schedule echo --payload hi --delay-secs 60
//!   jobflow workflow build mb-42 --monitor-id 42 --product desk --product mobile
//!   jobflow workflow show mb-42                   # Inspect an instance
//!   jobflow workflow event mb-42 RETRY_REQUESTED  # Re-enter a failed build

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jobflow_build::BuildRequest;
use jobflow_core::JobflowConfig;
use jobflow_scheduler::{Job, JobScheduler, SqliteJobStore, Task};
use jobflow_workflow::{SqliteWorkflowStore, WorkflowEngine, WorkflowEvent, WorkflowInstance, WorkflowStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jobflow",
    version,
    about = "⏱️ Jobflow — durable job scheduler and step-based workflow engine"
)]
struct Cli {
    /// Config file (default: ~/.jobflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler (and registered workflows) until Ctrl-C
    Run,
    /// Manage scheduled jobs
    #[command(subcommand)]
    Job(JobCommand),
    /// Manage workflow instances
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

#[derive(Subcommand)]
enum JobCommand {
    /// Schedule a job for a registered task
    Schedule {
        task: String,
        #[arg(long, default_value = "")]
        payload: String,
        /// Absolute fire time (RFC 3339)
        #[arg(long, conflicts_with = "delay_secs")]
        at: Option<String>,
        /// Fire this many seconds from now
        #[arg(long)]
        delay_secs: Option<u64>,
        /// Repeat every N days
        #[arg(long, default_value_t = 0)]
        every_days: u32,
    },
    /// List all jobs
    List,
    /// Delete a job
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Start a registered workflow
    Start {
        name: String,
        reference: String,
        /// Initial context as JSON
        #[arg(long, default_value = "{}")]
        context: String,
        /// Read the initial context from a JSON file instead
        #[arg(long)]
        context_file: Option<String>,
        #[arg(long)]
        initiator: Option<String>,
    },
    /// Start the build pipeline for one or more products
    Build {
        reference: String,
        #[arg(long)]
        monitor_id: u64,
        #[arg(long = "product", required = true)]
        products: Vec<String>,
        #[arg(long)]
        patch: bool,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        initiator: Option<String>,
    },
    /// List instances
    List {
        /// Only instances in this status
        #[arg(long)]
        status: Option<String>,
        /// Only the N most recently started
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one instance as JSON
    Show { reference: String },
    /// Show an instance's event history
    Events { reference: String },
    /// Feed an event into a failed instance
    Event {
        reference: String,
        event: String,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Re-run the current step of a failed instance
    Retry {
        reference: String,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Stop a running instance
    Cancel {
        reference: String,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Delete a finished instance and its history
    Delete { reference: String },
    /// Instance counts and success rate
    Stats,
}

/// Logs its payload. Handy for checking a deployment end to end.
struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    async fn run(&mut self, job: &Job) -> jobflow_core::Result<()> {
        tracing::info!("🔔 echo job {}: {}", job.id, job.payload);
        Ok(())
    }
}

struct App {
    config: JobflowConfig,
    scheduler: Arc<JobScheduler>,
    engine: Arc<WorkflowEngine>,
}

impl App {
    fn open(config: JobflowConfig) -> Result<Self> {
        let db_path = config.database_file();
        let jobs = Arc::new(SqliteJobStore::open(&db_path)?);
        let scheduler = JobScheduler::new(config.scheduler.clone(), jobs);
        scheduler.registry().register("echo", || Box::new(EchoTask))?;

        let workflows = Arc::new(SqliteWorkflowStore::open(&db_path)?);
        let engine = WorkflowEngine::new(Arc::clone(&scheduler), workflows, config.workflow.clone())?;
        if config.build.enabled() {
            engine.register_workflow(jobflow_build::from_config(&config.build)?)?;
        } else {
            tracing::debug!("build.api_url not set, build pipeline disabled");
        }

        Ok(Self {
            config,
            scheduler,
            engine,
        })
    }
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "jobflow=debug,jobflow_scheduler=debug,jobflow_workflow=debug,jobflow_build=debug"
    } else {
        "jobflow=info,jobflow_scheduler=info,jobflow_workflow=info,jobflow_build=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = match &cli.config {
        Some(path) => JobflowConfig::load_from(Path::new(&expand_path(path)))?,
        None => JobflowConfig::load()?,
    };
    let app = App::open(config)?;

    match cli.command {
        Command::Run => run(&app).await,
        Command::Job(cmd) => job(&app, cmd),
        Command::Workflow(cmd) => workflow(&app, cmd).await,
    }
}

async fn run(app: &App) -> Result<()> {
    tracing::info!(
        "⏱️ Jobflow starting — db {}, {} worker(s), dispatcher {}",
        app.config.database_file().display(),
        app.config.scheduler.thread_count,
        if app.config.scheduler.dispatcher_enabled {
            format!("every {}s", app.config.scheduler.dispatcher_interval_secs)
        } else {
            "off".to_string()
        }
    );
    tracing::info!("🧭 Workflows: {:?}", app.engine.workflow_names());

    app.scheduler.start()?;
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("🛑 Shutting down");
    app.scheduler.stop().await;
    Ok(())
}

fn job(app: &App, cmd: JobCommand) -> Result<()> {
    match cmd {
        JobCommand::Schedule {
            task,
            payload,
            at,
            delay_secs,
            every_days,
        } => {
            let fire_at = match (at, delay_secs) {
                (Some(at), _) => DateTime::parse_from_rfc3339(&at)
                    .with_context(|| format!("invalid --at '{at}'"))?
                    .with_timezone(&Utc),
                (None, Some(secs)) => Utc::now() + chrono::Duration::seconds(secs as i64),
                (None, None) => Utc::now(),
            };
            if !app.scheduler.registry().contains(&task) {
                tracing::warn!("⚠️ Task '{}' is not registered in this binary", task);
            }
            let id = app
                .scheduler
                .schedule_job(&task, &payload, fire_at, every_days, every_days > 0)?;
            println!("{id}");
        }
        JobCommand::List => {
            for j in app.scheduler.list_jobs()? {
                println!(
                    "{:>6}  {:<20} {}  {}{}{}",
                    j.id,
                    j.task_name,
                    j.next_fire_at.to_rfc3339(),
                    if j.recurs() {
                        format!("every {}d ", j.interval_days)
                    } else {
                        String::new()
                    },
                    if j.abandoned { "abandoned " } else { "" },
                    j.last_error.as_deref().unwrap_or_default()
                );
            }
        }
        JobCommand::Delete { id } => {
            if !app.scheduler.delete_job(id)? {
                bail!("job {id} not found");
            }
        }
    }
    Ok(())
}

async fn workflow(app: &App, cmd: WorkflowCommand) -> Result<()> {
    let engine = &app.engine;
    match cmd {
        WorkflowCommand::Start {
            name,
            reference,
            context,
            context_file,
            initiator,
        } => {
            let raw = match context_file {
                Some(path) => std::fs::read_to_string(expand_path(&path))
                    .with_context(|| format!("reading {path}"))?,
                None => context,
            };
            let context: serde_json::Value = serde_json::from_str(&raw).context("parsing context JSON")?;
            let instance = engine.schedule_workflow(&name, &reference, context, initiator.as_deref())?;
            print_instance(&instance)?;
        }
        WorkflowCommand::Build {
            reference,
            monitor_id,
            products,
            patch,
            branch,
            initiator,
        } => {
            let request = BuildRequest {
                monitor_id,
                products,
                is_patch_build: patch,
                branch_name: branch,
            };
            let instance = jobflow_build::start_build(engine, &reference, request, initiator.as_deref())?;
            print_instance(&instance)?;
        }
        WorkflowCommand::List { status, limit } => {
            let instances = match (status, limit) {
                (Some(s), _) => engine.instances_by_status(WorkflowStatus::parse(&s)?)?,
                (None, Some(n)) => engine.recent_instances(n)?,
                (None, None) => engine.get_all_instances()?,
            };
            for i in instances {
                println!(
                    "{:<24} {:<16} {:<10} {:<22} {}",
                    i.reference_id,
                    i.workflow_name,
                    i.status,
                    i.current_step,
                    i.error_message.as_deref().unwrap_or_default()
                );
            }
        }
        WorkflowCommand::Show { reference } => match engine.get_instance(&reference)? {
            Some(instance) => print_instance(&instance)?,
            None => bail!("workflow instance '{reference}' not found"),
        },
        WorkflowCommand::Events { reference } => {
            for e in engine.events_for(&reference)? {
                println!(
                    "{}  {:<20} {}",
                    e.timestamp.to_rfc3339(),
                    e.event_type,
                    serde_json::Value::Object(e.payload)
                );
            }
        }
        WorkflowCommand::Event {
            reference,
            event,
            operator,
        } => {
            let instance = engine
                .process_event(&reference, WorkflowEvent::new(event), operator.as_deref())
                .await?;
            print_instance(&instance)?;
        }
        WorkflowCommand::Retry { reference, operator } => {
            let instance = engine.retry_workflow(&reference, operator.as_deref()).await?;
            print_instance(&instance)?;
        }
        WorkflowCommand::Cancel { reference, operator } => {
            let instance = engine.cancel_workflow(&reference, operator.as_deref())?;
            print_instance(&instance)?;
        }
        WorkflowCommand::Delete { reference } => engine.delete_workflow(&reference)?,
        WorkflowCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.statistics()?)?);
        }
    }
    Ok(())
}

fn print_instance(instance: &WorkflowInstance) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(instance)?);
    Ok(())
}
