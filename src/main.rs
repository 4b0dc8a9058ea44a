//! trust-host
//!
//! Runs one service host from a TOML configuration file. The status service
//! is always available; other services are linked in by embedding the
//! library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use trust_host::config::{load_config, HostConfig};
use trust_host::host::{Collaborators, Host, ServiceFactories};
use trust_host::lifecycle::signals::wait_for_termination;
use trust_host::observability::{logging, metrics};
use trust_host::services::{status, StatusService};

#[derive(Parser)]
#[command(name = "trust-host")]
#[command(about = "Multiplexed REST and RPC service host", long_about = None)]
struct Cli {
    /// Path to the host configuration.
    #[arg(short, long, default_value = "host.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: configuration is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "trust-host starting");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Host failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(mut config: HostConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut collaborators = Collaborators::new();
    if config.observability.metrics_enabled {
        if config.observability.metrics_address.is_empty() {
            // Served by the status service under /metrics.
            collaborators = collaborators.provide(metrics::install_recorder()?);
        } else {
            metrics::init_metrics(config.observability.metrics_address.parse()?)?;
        }
    }

    if !config.services.iter().any(|s| s == status::SERVICE_NAME) {
        config.services.insert(0, status::SERVICE_NAME.to_string());
    }
    let factories = ServiceFactories::new().register(status::SERVICE_NAME, StatusService::factory);

    let name = config.name.clone();
    let host = Host::start(name, config, collaborators, &factories).await?;
    tracing::info!(addresses = ?host.local_addrs(), ready = host.is_ready(), "Host running");

    let (mut errors, mut errors_open) = match host.take_errors() {
        Some(rx) => (rx, true),
        None => (tokio::sync::mpsc::channel(1).1, false),
    };
    let signal = wait_for_termination();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            name = &mut signal => {
                tracing::info!(signal = name, "Termination requested");
                break;
            }
            err = errors.recv(), if errors_open => match err {
                Some(err) => tracing::warn!(error = %err, "Transport error"),
                None => errors_open = false,
            },
        }
    }

    host.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
