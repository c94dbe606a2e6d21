//! CLI Entry Point for labd
//!
//! One binary plays both roles:
//! - `labd serve` runs the daemon in the foreground
//! - every other subcommand is a client of a running daemon
//!
//! # Usage
//!
//! ```bash
//! labd --config config/labd.yaml start
//! labd devices
//! labd run sequences/warmup.yaml
//! labd status
//! labd stop
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labd::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use labd::daemon::client::wait_until_ready;
use labd::daemon::lifecycle::ProcessProbe;
use labd::daemon::{
    Client, DaemonCore, DaemonServer, DetachedLauncher, PidMarker, Supervisor, SysinfoProbe,
};
use labd::tracing_init::{self, OutputFormat, TracingConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "labd")]
#[command(about = "Lab instrument control daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Serve,
    /// Start the daemon in the background unless one is already running
    Start,
    /// Ask the running daemon to exit
    Stop,
    /// Check that the daemon answers
    Hello,
    /// Probe every configured instrument
    Devices,
    /// Show the state of one instrument
    DeviceInfo {
        /// Instrument name from the configuration
        name: String,
    },
    /// Start a measurement sequence
    Run {
        /// Sequence YAML file
        sequence: PathBuf,
    },
    /// Show the progress of the current or last sequence
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Start => start(&cli.config, config).await,
        Commands::Stop => {
            connect(&config).await?.halt().await?;
            println!("halt sent to {}", config.daemon.address);
            Ok(())
        }
        Commands::Hello => {
            println!("{}", connect(&config).await?.hello().await?);
            Ok(())
        }
        Commands::Devices => print_json(&connect(&config).await?.list_devices().await?),
        Commands::DeviceInfo { name } => {
            print_json(&connect(&config).await?.device_info(&name).await?)
        }
        Commands::Run { sequence } => {
            let sequence = std::fs::canonicalize(&sequence)
                .with_context(|| format!("sequence file {}", sequence.display()))?;
            print_json(&connect(&config).await?.run_sequence(sequence).await?)
        }
        Commands::Status => print_json(&connect(&config).await?.experiment_status().await?),
    }
}

async fn connect(config: &DaemonConfig) -> Result<Client> {
    Client::connect(&config.daemon.address, config.daemon.client_timeout)
        .await
        .context("is the daemon running? try `labd start`")
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let tracing_config = TracingConfig::from_daemon_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;

    let marker = PidMarker::for_config(&config);
    marker.claim(std::process::id(), &SysinfoProbe)?;

    let address = config.daemon.address.clone();
    let core = match DaemonCore::builder(config)
        .with_pid_marker(marker.clone())
        .build()
    {
        Ok(core) => core,
        Err(err) => {
            marker.remove()?;
            return Err(err.into());
        }
    };
    let server = match DaemonServer::bind(&address).await {
        Ok(server) => server,
        Err(err) => {
            marker.remove()?;
            return Err(err).with_context(|| format!("binding {address}"));
        }
    };

    let interrupted = core.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            interrupted.request_shutdown();
        }
    });

    server.serve(core).await?;
    Ok(())
}

async fn start(config_path: &Path, config: DaemonConfig) -> Result<()> {
    tracing_init::init(TracingConfig::from_daemon_config(&config).map_err(anyhow::Error::msg)?)
        .map_err(anyhow::Error::msg)?;

    let config_path =
        std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let launcher = DetachedLauncher::for_config(&config_path, &config)?;
    let supervisor = Supervisor::new(&config, launcher, SysinfoProbe);
    let server = supervisor.start()?;

    if !server.existing {
        if let Err(err) = wait_until_ready(&server.address, config.daemon.client_timeout).await {
            if !SysinfoProbe.is_alive(server.pid) {
                supervisor.marker().remove()?;
            }
            return Err(err).with_context(|| format!("see {}", config.log_path().display()));
        }
    }
    print_json(&server)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
