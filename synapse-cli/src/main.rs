//! Synapse CLI - start an event-bus hub from the command line

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{debug, info};

use synapse_core::config::{ConnectMode, HubConfig};
use synapse_core::hub::Hub;
use synapse_core::transport::child::ChildChannel;

#[derive(Parser)]
#[command(name = "synapse")]
#[command(about = "Start a Synapse event-bus hub", long_about = None)]
#[command(version)]
struct Cli {
    /// Hub name, used in the handshake and as the event namespace
    #[arg(long = "bus-name")]
    name: Option<String>,

    /// Endpoint host
    #[arg(long = "bus-host")]
    host: Option<String>,

    /// Endpoint port
    #[arg(long = "bus-port")]
    port: Option<u16>,

    /// How to participate in the bus
    #[arg(long = "bus-mode", value_enum, default_value = "start")]
    mode: Mode,

    /// Prefer the same-process shortcut for local endpoints
    #[arg(long)]
    local: bool,

    /// Optional TOML configuration file (SYNAPSE_* env vars also apply)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra `--key value` options handed down by a spawning parent
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    passthrough: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Listen, falling back to connecting when the endpoint is taken
    Start,
    /// Listen only
    Listen,
    /// Connect only
    Connect,
    /// Connect to a supervising parent over stdio
    Child,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr, not stdout: in child mode stdout is the control channel
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = HubConfig::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        config.name = name;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.local = config.local || cli.local;
    if cli.mode == Mode::Child {
        config.mode = ConnectMode::Child;
    }
    if !cli.passthrough.is_empty() {
        debug!(options = ?cli.passthrough, "ignoring passthrough options");
    }

    let mut builder = Hub::builder().config(config);
    if cli.mode == Mode::Child {
        builder = builder.child_channel(ChildChannel::from_stdio());
    }
    let hub = builder.build();

    match cli.mode {
        Mode::Start => hub.start().await?,
        Mode::Listen => hub.listen().await?,
        Mode::Connect | Mode::Child => hub.connect().await?,
    }
    hub.wait_ready().await?;
    info!(name = %hub.name(), "hub running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    hub.stop().await?;
    Ok(())
}
