use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use foreman_core::app::{App, AppBuilder, TaskStatusRow};
use foreman_core::domain::{JobId, NewTask};
use foreman_core::ports::IdGenerator;
use foreman_core::ForemanConfig;

mod demo;
mod serve;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Lease-based import-parse queue")]
struct Cli {
    /// TOML config; defaults apply when omitted
    #[arg(long, global = true, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Status counts, recent tasks and the blocked audit
    Inspect(InspectArgs),
    /// Enqueue one job with one task per payload
    Enqueue(EnqueueArgs),
    /// Claim tasks once and print the queue delta
    Dispatch(DispatchArgs),
    /// Release expired locks, then requeue orphaned tasks
    Reclaim,
    /// Reset attempts of queued tasks stuck at max_attempts
    ResetAttempts,
    /// List attempts of queued tasks
    CheckAttempts(CheckAttemptsArgs),
    /// Run a worker group with the demo handler plus the reclaimer loop
    Work(WorkArgs),
    /// Serve the ingest intake over HTTP
    Serve(ServeArgs),
}

#[derive(Args)]
struct InspectArgs {
    /// Number of recent tasks to show
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Only tasks updated within this many minutes
    #[arg(long)]
    since_minutes: Option<i64>,
    /// Summarize one job instead
    #[arg(long)]
    job: Option<String>,
}

#[derive(Args)]
struct EnqueueArgs {
    /// JSON file holding an array of payloads
    #[arg(long, conflicts_with = "payload")]
    file: Option<PathBuf>,
    /// Inline JSON payload (repeatable)
    #[arg(long)]
    payload: Vec<String>,
}

#[derive(Args)]
struct DispatchArgs {
    #[arg(long, default_value_t = 10)]
    max_tasks: usize,
}

#[derive(Args)]
struct CheckAttemptsArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Args)]
struct WorkArgs {
    /// Stop after this many seconds (runs until ctrl-c when omitted)
    #[arg(long)]
    duration_secs: Option<u64>,
    /// Simulated processing time per task
    #[arg(long, default_value_t = 200)]
    work_ms: u64,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8787")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ForemanConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ForemanConfig::default(),
    };
    let app = AppBuilder::new(config).build().context("building app")?;
    let out = Output { pretty: cli.pretty };

    match cli.command {
        Commands::Inspect(args) => inspect(&app, args, out).await,
        Commands::Enqueue(args) => enqueue(&app, args, out).await,
        Commands::Dispatch(args) => {
            let worker = app.ids.generate_worker_id();
            let delta = app
                .remediation
                .dispatch_with_delta(worker, args.max_tasks)
                .await
                .context("dispatch")?;
            info!(%worker, claimed = delta.claimed_ids.len(), "dispatch done");
            out.print(&delta)?;
            partial("dispatch", delta.count_error.as_deref())
        }
        Commands::Reclaim => {
            let released = app
                .remediation
                .release_expired_locks()
                .await
                .context("releasing expired locks")?;
            out.print(&released)?;
            let requeued = app
                .remediation
                .requeue_orphaned_dispatched()
                .await
                .context("requeueing orphans")?;
            out.print(&requeued)?;
            partial("releasing expired locks", released.count_error.as_deref())?;
            partial("requeueing orphans", requeued.count_error.as_deref())
        }
        Commands::ResetAttempts => {
            let report = app
                .remediation
                .reset_attempts_for_blocked()
                .await
                .context("resetting attempts")?;
            out.print(&report)?;
            partial("resetting attempts", report.count_error.as_deref())
        }
        Commands::CheckAttempts(args) => {
            let rows = app
                .status
                .queued_attempts(args.limit)
                .await
                .context("reading queued tasks")?;
            out.print(&rows)
        }
        Commands::Work(args) => work(app, args).await,
        Commands::Serve(args) => serve::run(Arc::new(app), &args.addr).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The change went through and its report is already printed; only the
/// follow-up count failed.
fn partial(action: &str, count_error: Option<&str>) -> Result<()> {
    match count_error {
        Some(err) => bail!("{action} applied, but counting tasks afterwards failed: {err}"),
        None => Ok(()),
    }
}

#[derive(Clone, Copy)]
struct Output {
    pretty: bool,
}

impl Output {
    fn print<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        println!("{text}");
        Ok(())
    }
}

#[derive(Serialize)]
struct InspectView {
    counts: foreman_core::domain::StatusCounts,
    blocked: foreman_core::app::BlockedAudit,
    recent: Vec<TaskStatusRow>,
}

async fn inspect(app: &App, args: InspectArgs, out: Output) -> Result<()> {
    if let Some(raw) = args.job {
        let job_id: JobId = raw.parse().with_context(|| format!("invalid job id {raw:?}"))?;
        let summary = app.status.summarize_job(job_id).await.context("summarizing job")?;
        return out.print(&summary);
    }

    let recent = match args.since_minutes {
        Some(m) if m <= 0 => bail!("--since-minutes must be positive"),
        Some(m) => app.status.recent_since(TimeDelta::minutes(m), args.limit).await,
        None => app.status.recent(args.limit).await,
    }
    .context("reading recent tasks")?;

    out.print(&InspectView {
        counts: app.status.counts().await.context("counting tasks")?,
        blocked: app.status.blocked_audit().await.context("auditing blocked tasks")?,
        recent,
    })
}

async fn enqueue(app: &App, args: EnqueueArgs, out: Output) -> Result<()> {
    let payloads: Vec<serde_json::Value> = match args.file {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => args
            .payload
            .iter()
            .map(|p| serde_json::from_str(p).with_context(|| format!("invalid payload {p:?}")))
            .collect::<Result<_>>()?,
    };
    if payloads.is_empty() {
        bail!("nothing to enqueue; pass --file or --payload");
    }

    if let [single] = payloads.as_slice() {
        let rec = app
            .enqueuer
            .enqueue(NewTask::new(single.clone()))
            .await
            .context("enqueue")?;
        return out.print(&rec);
    }
    let job = app.enqueuer.enqueue_job(payloads).await.context("enqueue job")?;
    out.print(&job)
}

async fn work(app: App, args: WorkArgs) -> Result<()> {
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let reclaimer = tokio::spawn(app.reclaimer_loop().run(stop_rx));
    let group = app.spawn_workers(Arc::new(demo::DemoHandler::new(Duration::from_millis(
        args.work_ms,
    ))));
    info!(workers = group.worker_ids().len(), "workers started");

    match args.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?,
    }

    info!("shutting down");
    group.shutdown_and_join().await;
    let _ = stop_tx.send(true);
    reclaimer.await.context("joining reclaimer")?;

    let counts = app.status.counts().await.context("counting tasks")?;
    info!(%counts, "final counts");
    Ok(())
}
