use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use convergoor::agent::Agent;
use convergoor::config::{Config, DEFAULT_THRESHOLD_MS};

/// Passive route-convergence time monitor.
///
/// Listens to the kernel's route and traffic-control notifications. In idle
/// state any netem qdisc change or route add/delete opens a measurement
/// session; the session closes once the route table has stayed quiet for the
/// convergence threshold. One JSON record per event, per line.
#[derive(Parser)]
#[command(name = "convergoor", version, about)]
struct Cli {
    /// Quiet period in milliseconds after which the table counts as converged.
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD_MS)]
    threshold: i64,

    /// Router name stamped on every record (default: router_<user>_<unix_ts>).
    #[arg(short, long)]
    router_name: Option<String>,

    /// JSON log file path (falls back to the working directory when the
    /// default directory cannot be created).
    #[arg(short, long)]
    log_path: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return Ok(());
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::new(cli.threshold, cli.router_name, cli.log_path);
    cfg.validate().context("invalid arguments")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        threshold_ms = cfg.threshold_ms,
        router_name = %cfg.router_name,
        "starting convergoor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling: the handler task only signals, the main task
    // reacts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg);
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("convergoor stopped");

    Ok(())
}
