//! Relay Host daemon
//!
//! CLI for running the hub and poking at a running one.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use relay_host::config::{BackendKind, Config};
use relay_host::listener::Server;
use relay_host::store::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay Host - SMS relay hub for phones and consoles
#[derive(Parser)]
#[command(name = "relay-host")]
#[command(about = "Relay SMS and contacts between phones and desktop consoles")]
struct Cli {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub in the foreground
    Run(ConfigArgs),

    /// Ask a running hub for its status
    Status(ConfigArgs),

    /// Print the effective configuration as JSON
    Config(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address phones connect to
    #[arg(long)]
    device_addr: Option<SocketAddr>,

    /// Address consoles connect to
    #[arg(long)]
    console_addr: Option<SocketAddr>,

    /// Directory for persisted state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Number of messages returned by get_messages
    #[arg(long)]
    retention: Option<usize>,
}

impl ConfigArgs {
    /// Defaults, then the config file, then flags
    fn resolve(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(addr) = self.device_addr {
            config.device_addr = addr;
        }
        if let Some(addr) = self.console_addr {
            config.console_addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(retention) = self.retention {
            config.message_retention = retention;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cmd_run(args.resolve()?).await,
        Commands::Status(args) => cmd_status(args.resolve()?).await,
        Commands::Config(args) => cmd_config(args.resolve()?),
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    info!(
        backend = %config.backend,
        data_dir = %config.data_dir.display(),
        "Relay host starting"
    );

    let store = Arc::new(Store::open(&config));
    let summary = store.summary();
    info!(
        devices = summary.devices.len(),
        contacts = summary.contacts_count,
        messages = summary.messages_count,
        "Loaded state"
    );

    let server = Server::start(&config, store).await?;

    let stop = server.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stop.stop(),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    server.wait().await;
    Ok(())
}

async fn cmd_status(config: Config) -> anyhow::Result<()> {
    let addr = config.console_addr;
    let reply = tokio::time::timeout(STATUS_TIMEOUT, query_status(addr))
        .await
        .with_context(|| format!("no reply from {} within {:?}", addr, STATUS_TIMEOUT))??;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn query_status(addr: SocketAddr) -> anyhow::Result<serde_json::Value> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("relay host not reachable on {}", addr))?;
    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(br#"{"type":"get_status"}"#).await?;

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        bail!("connection closed before a reply");
    }
    Ok(serde_json::from_str(&line)?)
}

fn cmd_config(config: Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
