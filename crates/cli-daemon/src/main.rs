//! CLI entry point for the framejob server
//!
//! Parses command line arguments, loads the configuration and runs the daemon
//! until a client asks it to close or Ctrl-C is pressed.

use clap::Parser;
use framejob::control_client::{server_url, ControlClient};
use framejob::instance_lock::InstanceError;
use framejob::protocol::ClientRequest;
use framejob::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// framejob server - persistent encode and process job queue
#[derive(Parser, Debug)]
#[command(name = "framejob-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it is missing
    #[arg(short, long, default_value = "framejob.toml")]
    config: PathBuf,

    /// Control port, overriding the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for the job list, presets and lock file
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "framejob=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.state_dir {
        config.storage.state_dir = dir;
    }

    let host = config.server.host.clone();
    let port = config.server.port;
    let daemon = match Daemon::start(config).await {
        Ok(daemon) => daemon,
        Err(DaemonError::Instance(e @ InstanceError::AlreadyRunning { .. })) => {
            warn!(error = %e, "Server already running, asking it to show itself");
            notify_running_instance(&host, port).await;
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    if let Ok(addr) = daemon.local_addr() {
        info!(%addr, "framejob server ready");
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match daemon.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

async fn notify_running_instance(host: &str, port: u16) {
    let url = server_url(host, port);
    let result = async {
        let mut client = ControlClient::connect(&url).await?;
        client.request(&ClientRequest::ShowWindow).await?;
        client.close().await
    }
    .await;
    if let Err(e) = result {
        warn!(%url, error = %e, "Could not reach the running server");
    }
}
