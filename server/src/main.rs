//! evalstream - stream UCI engine analysis as newline-delimited JSON.
//!
//! With no subcommand (or `serve`) the binary runs the HTTP server. The
//! `eval` subcommand analyses a single position and prints its snapshots to
//! stdout, exiting non-zero when the evaluation ends in an error.

mod config;
mod http;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{
    AcquirePolicy, EnginePool, EvaluationRequest, Evaluator, EvaluatorDefaults, MatePerspective,
    ProcessLauncher, Snapshot,
};
use tokio::io::AsyncWriteExt;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "evalstream", about = "Stream UCI engine analysis as NDJSON")]
struct Cli {
    /// Engine executable. Overrides `EVALSTREAM_ENGINE_PATH`.
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Extra argument passed to the engine. Repeatable.
    #[arg(long = "engine-arg", global = true, allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Default search depth. Overrides `EVALSTREAM_DEFAULT_DEPTH`.
    #[arg(long, global = true)]
    default_depth: Option<u32>,

    /// Optional subcommand. Runs the server when omitted.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve evaluations over HTTP.
    Serve {
        /// Listen address. Overrides `EVALSTREAM_ADDR`.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Number of engines. Overrides `EVALSTREAM_POOL_SIZE`.
        #[arg(long)]
        pool_size: Option<usize>,

        /// `reject` or `wait`. Overrides `EVALSTREAM_ACQUIRE_POLICY`.
        #[arg(long)]
        policy: Option<AcquirePolicy>,
    },
    /// Evaluate one position and print its snapshots.
    Eval {
        #[arg(long)]
        fen: String,

        #[arg(long)]
        depth: Option<u32>,

        /// Time limit in milliseconds.
        #[arg(long)]
        time_limit: Option<u64>,

        /// Report mate distances from White's point of view.
        #[arg(long)]
        white_perspective: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = config::Settings::from_env();
    if let Some(engine) = cli.engine {
        settings.engine_path = engine;
    }
    if !cli.engine_args.is_empty() {
        settings.engine_args = cli.engine_args;
    }
    if let Some(depth) = cli.default_depth {
        settings.default_depth = depth;
    }

    let _guard = init_tracing(settings.log_dir.as_deref());

    match cli.command {
        Some(Commands::Eval {
            fen,
            depth,
            time_limit,
            white_perspective,
        }) => {
            let mut request = EvaluationRequest::new(fen);
            if let Some(depth) = depth {
                request = request.with_depth(depth);
            }
            if let Some(time_limit) = time_limit {
                request = request.with_time_limit_ms(time_limit);
            }
            if white_perspective {
                request = request.with_mate_perspective(MatePerspective::White);
            }
            run_eval(build_evaluator(&settings), request).await
        }
        Some(Commands::Serve {
            addr,
            pool_size,
            policy,
        }) => {
            if let Some(addr) = addr {
                settings.listen_addr = addr;
            }
            if let Some(size) = pool_size {
                settings.pool_size = size.max(1);
            }
            if let Some(policy) = policy {
                settings.acquire_policy = policy;
            }
            serve(&settings).await
        }
        None => serve(&settings).await,
    }
}

/// Log to stderr, or to a daily-rotated file when a log directory is set.
/// Stdout stays reserved for `eval` output.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "evalstream.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn build_evaluator(settings: &config::Settings) -> Evaluator {
    let launcher = ProcessLauncher::new(&settings.engine_path)
        .with_args(settings.engine_args.clone());
    let pool = EnginePool::new(
        Arc::new(launcher),
        settings.pool_size,
        settings.acquire_policy,
    );
    Evaluator::with_defaults(
        pool,
        EvaluatorDefaults {
            depth: settings.default_depth,
            time_limit: Duration::from_millis(settings.time_limit_ms),
        },
    )
}

async fn serve(settings: &config::Settings) -> anyhow::Result<()> {
    tracing::info!("Starting evalstream server");
    tracing::info!("Using engine: {}", settings.engine_path.display());
    tracing::info!(
        pool_size = settings.pool_size,
        policy = ?settings.acquire_policy,
        "Engine pool configured"
    );

    let evaluator = build_evaluator(settings);
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;
    tracing::info!("Server listening on {}", settings.listen_addr);

    axum::serve(listener, http::router(evaluator.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    evaluator.pool().close().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn run_eval(evaluator: Evaluator, request: EvaluationRequest) -> anyhow::Result<()> {
    let mut snapshots = evaluator.evaluate(request);
    let mut stdout = tokio::io::stdout();
    let mut failure = None;

    while let Some(snapshot) = snapshots.next_snapshot().await {
        stdout.write_all(snapshot.to_ndjson()?.as_bytes()).await?;
        stdout.flush().await?;
        if let Snapshot::Error(e) = snapshot {
            failure = Some(e);
        }
    }

    match failure {
        Some(e) => Err::<(), _>(e).context("Evaluation failed"),
        None => Ok(()),
    }
}
