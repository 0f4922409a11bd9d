//! mocap-server – entry point.
//!
//! Startup order for `serve` (the default command):
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or pretty, optional daily log file).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Build the job service from the pipeline registry.
//! 5. Settle jobs orphaned by a previous instance.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.
//!
//! `migrate` and `jobs` stop after step 4 and never touch orphaned jobs.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mocap_core::store::sqlite::SqliteJobStore;
use mocap_core::{JobId, JobService};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;
use crate::state::AppState;

/// Video to motion-capture job server.
#[derive(Parser, Debug)]
#[command(name = "mocap-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Create or upgrade the database schema and exit.
    Migrate,
    /// Inspect or remove jobs without starting the server.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    /// List all jobs, newest first.
    List,
    /// Print one job record as JSON.
    Show { id: JobId },
    /// Delete a job record and its working area.
    Delete { id: JobId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Held until main returns so buffered file logs are flushed.
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "mocap-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteJobStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Job service ─────────────────────────────────────────────────────────
    let jobs = JobService::new(Arc::new(store), &cfg.runtime)?;
    info!(
        pipelines = jobs.pipelines().kinds().count(),
        media_root = %cfg.runtime.media_root.display(),
        "job service ready"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg, jobs).await,
        Command::Migrate => {
            info!("migrations applied");
            Ok(())
        }
        Command::Jobs { action } => run_jobs_command(&jobs, action).await,
    }
}

async fn serve(cfg: Config, jobs: JobService) -> anyhow::Result<()> {
    // ── 5. Orphan recovery ─────────────────────────────────────────────────────
    let report = jobs.recover_orphans().await?;
    if !report.is_empty() {
        info!(
            completed = report.completed.len(),
            reattached = report.reattached.len(),
            failed = report.failed.len(),
            "settled jobs from previous run"
        );
    }

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        jobs: Arc::new(jobs),
    });
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("mocap-server stopped");
    Ok(())
}

async fn run_jobs_command(jobs: &JobService, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::List => {
            for job in jobs.list().await? {
                println!(
                    "{}  {:<10} {:>3}%  {:<10} {}",
                    job.id, job.status, job.progress, job.pipeline_kind, job.name
                );
            }
        }
        JobsAction::Show { id } => {
            let job = jobs.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsAction::Delete { id } => {
            jobs.delete(id).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

/// Console logging plus an optional daily rolling JSON file under `log_dir`.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: MOCAP_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let console = if cfg.log_json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mocap-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
