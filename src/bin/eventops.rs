//! eventops CLI — operator interface to the job engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use eventops::config::Config;
use eventops::engine::{Dispatcher, DispatcherConfig, Engine, WorkerPool};
use eventops::handler::{Handler, HandlerError, JobContext};
use eventops::model::{JobId, NewJob};
use eventops::retry::RetryPolicy;
use eventops::store::Store;
use eventops::store::jobs::JobFilter;

#[derive(Parser)]
#[command(name = "eventops", about = "Durable at-least-once job engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher and worker pool
    Serve {
        /// Number of workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Submit a new job
    Submit {
        /// Registered handler name
        handler: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Priority (higher = leased sooner)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Attempt limit for this job
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show a job's status
    Status {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// List jobs
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by handler
        #[arg(long)]
        handler: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show queue depth, in-flight count, and worker count
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(Store::open(&config.db_path)?);
    let registry = Arc::new(builtin_handlers());
    let mut engine = Engine::new(store, registry);
    engine.default_max_attempts = config.default_max_attempts;
    let engine = Arc::new(engine);

    match cli.command {
        Command::Serve { workers } => cmd_serve(engine, config, workers).await,
        Command::Submit {
            handler,
            payload,
            priority,
            max_attempts,
        } => cmd_submit(&engine, handler, payload, priority, max_attempts),
        Command::Status { id } => {
            let id = resolve_id(&engine, &id)?;
            let status = engine.status(id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Cancel { id } => {
            let id = resolve_id(&engine, &id)?;
            let job = engine.cancel(id)?;
            println!("{}: {}", job.id, job.state);
            Ok(())
        }
        Command::List {
            state,
            handler,
            limit,
        } => cmd_list(&engine, state, handler, limit),
        Command::Health => {
            let health = engine.health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

async fn cmd_serve(
    engine: Arc<Engine>,
    config: Config,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        RetryPolicy::default(),
        DispatcherConfig {
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval,
            handler_timeout: config.handler_timeout,
            max_in_flight: config.max_in_flight,
            ..DispatcherConfig::default()
        },
    ));

    let pool = WorkerPool::spawn(workers.unwrap_or(config.workers), dispatcher);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    pool.shutdown_and_join().await;
    Ok(())
}

fn cmd_submit(
    engine: &Engine,
    handler: String,
    payload: Option<String>,
    priority: i32,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewJob::new(handler).payload(payload).priority(priority);
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    let job = engine.submit(new)?;
    println!("{} (state: {})", job.id, job.state);
    Ok(())
}

fn cmd_list(
    engine: &Engine,
    state: Option<String>,
    handler: Option<String>,
    limit: u32,
) -> anyhow::Result<()> {
    let filter = JobFilter {
        state: state.map(|s| s.parse()).transpose()?,
        handler,
        limit: Some(limit),
    };

    let jobs = engine.list(&filter)?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<10}  {:<4}  {:<8}  CREATED",
        "ID", "HANDLER", "STATE", "PRI", "ATTEMPTS"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        println!(
            "{:<36}  {:<12}  {:<10}  {:<4}  {:<8}  {}",
            job.id.to_string(),
            job.handler,
            job.state.to_string(),
            job.priority,
            format!("{}/{}", job.attempts, job.max_attempts),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// Support prefix matching — find the job whose ID starts with the given
/// string, or parse a full UUID directly.
fn resolve_id(engine: &Engine, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() == 36 {
        return Ok(id_str.parse()?);
    }

    let jobs = engine.list(&JobFilter {
        limit: Some(500),
        ..JobFilter::default()
    })?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id_str}' — be more specific"),
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Liveness probe. Ignores its payload and answers "pong".
struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!("pong"))
    }
}

/// Sleeps for `{"ms": n}`, checking for cancellation once a second.
struct Sleep;

#[async_trait]
impl Handler for Sleep {
    async fn execute(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let total = payload
            .get("ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HandlerError::Fatal("payload must have numeric 'ms'".to_string()))?;

        let mut remaining = total;
        while remaining > 0 {
            if ctx.cancel_requested() {
                return Err(HandlerError::Cancelled);
            }
            let step = remaining.min(1000);
            tokio::time::sleep(Duration::from_millis(step)).await;
            remaining -= step;
        }
        Ok(serde_json::json!({ "slept_ms": total }))
    }
}

/// Returns its payload unchanged.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn execute(
        &self,
        _ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(payload)
    }
}

fn builtin_handlers() -> eventops::handler::HandlerRegistry {
    let mut registry = eventops::handler::HandlerRegistry::new();
    registry.register("ping", Arc::new(Ping));
    registry.register("sleep", Arc::new(Sleep));
    registry.register("echo", Arc::new(Echo));
    registry
}
