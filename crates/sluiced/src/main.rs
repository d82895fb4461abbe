//! sluiced — the Sluice daemon.
//!
//! Assembles the pooling proxy from its crates:
//! - Configuration (sluice.toml)
//! - Pool registry + background sweep
//! - Client listener + admin console
//! - Optional HTTP metrics endpoint
//!
//! # Usage
//!
//! ```text
//! sluiced run --config /etc/sluice/sluice.toml
//! sluiced run --config sluice.toml --log-format json
//! sluiced check --config sluice.toml
//! ```

mod check;
mod daemon;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use sluice_core::Config;

#[derive(Parser)]
#[command(name = "sluiced", version, about = "Sluice connection pooling proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy.
    Run {
        /// Path to sluice.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Validate a configuration file and print a summary.
    Check {
        /// Path to sluice.toml.
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sluice=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            run(config).await
        }
        Command::Check { config } => {
            let summary = check::check(&config)?;
            print!("{summary}");
            Ok(())
        }
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    info!(
        path = %path.display(),
        databases = config.databases.len(),
        users = config.users.len(),
        "configuration loaded"
    );

    let daemon = daemon::Daemon::start(config, Some(path)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
