//! jfr-offload daemon
//!
//! Usage:
//!     GCS_BUCKET=profiles jfr-offload --root /data/jfr
//!     jfr-offload --bucket profiles --local-sink-dir ./remote --once

use anyhow::{Context, Result};
use clap::Parser;
use jfr_offload::{sink, OffloadArgs, Pipeline};
use jfr_offload_logging::{init_logging, LogConfig, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "jfr-offload",
    version,
    about = "Offload finished JFR recordings to object storage"
)]
struct Cli {
    #[command(flatten)]
    offload: OffloadArgs,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,

    /// Verbosity level (debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Console log format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Also write size-rotated log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "jfr-offload",
        level: cli.log_level.as_deref(),
        format: cli.log_format,
        log_dir: cli.log_dir.clone(),
    }) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = cli.offload.resolve().context("Invalid configuration")?;
    if cli.once {
        // A single pass never reads notifications.
        config.watch = false;
    }

    info!(
        bucket = config.bucket.as_deref().unwrap_or_default(),
        root = %config.root.display(),
        settle_interval_ms = config.settle_interval_ms,
        scan_interval_secs = config.scan_interval_secs,
        max_concurrent_uploads = config.max_concurrent_uploads,
        "Starting JFR offload"
    );

    let sink = sink::connect(&config)
        .await
        .context("Failed to create remote store client")?;
    let (mut pipeline, shutdown_tx) =
        Pipeline::new(&config, sink).context("Failed to start pipeline")?;

    if cli.once {
        let stats = pipeline.reconcile_once().await;
        info!(
            discovered = stats.discovered,
            delivered = stats.delivered,
            failed = stats.failed,
            "Single pass complete"
        );
        return Ok(());
    }

    install_signal_handlers(shutdown_tx)?;
    pipeline.run().await.context("Pipeline stopped with an error")?;
    Ok(())
}

fn install_signal_handlers(shutdown_tx: mpsc::Sender<()>) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "Received signal, initiating shutdown");
                let _ = shutdown_tx.blocking_send(());
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown");
            let _ = shutdown_tx.try_send(());
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    Ok(())
}
