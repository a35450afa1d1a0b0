//! veilroute node
//!
//! Runs an onion relay, or builds a circuit through the configured relays
//! and checks that data makes it to the exit and back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use veilroute_core::{ExitPolicy, OnionRelay, OnionRouter};

mod config;

use config::NodeConfig;

/// veilroute - onion routing relay and client
#[derive(Parser)]
#[command(name = "veilroute")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "veilroute.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay until interrupted
    Relay {
        /// Listen address
        #[arg(long)]
        listen: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Drop data at the exit instead of echoing it
        #[arg(long)]
        discard: bool,
    },

    /// Build a circuit and send a message through it
    Probe {
        /// Number of relay hops
        #[arg(long)]
        hops: Option<usize>,

        /// Message to send
        #[arg(short, long, default_value = "hello")]
        message: String,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level_name = match &cli.log_level {
        Some(level) => level.clone(),
        None if cli.config.exists() => NodeConfig::load(&cli.config).await?.logging.level,
        None => "info".to_string(),
    };
    let log_level = match level_name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Relay {
            listen,
            port,
            discard,
        } => cmd_relay(&cli.config, listen, port, discard).await,
        Commands::Probe { hops, message } => cmd_probe(&cli.config, hops, message).await,
        Commands::Init { force } => cmd_init(&cli.config, force).await,
        Commands::Config => cmd_config(&cli.config).await,
    }
}

async fn cmd_relay(
    config_path: &Path,
    listen: Option<String>,
    port: Option<u16>,
    discard: bool,
) -> Result<()> {
    let mut config = NodeConfig::load_or_create(config_path).await?;
    if let Some(listen) = listen {
        config.relay.listen_address = listen;
    }
    if let Some(port) = port {
        config.relay.listen_port = port;
    }
    if discard {
        config.relay.exit_policy = ExitPolicy::Discard;
    }
    config.validate()?;

    let relay = OnionRelay::new(config.to_relay_config());
    let addr = relay.start().await.context("Failed to start relay")?;
    println!("Relay listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    relay.stop().await;
    Ok(())
}

async fn cmd_probe(config_path: &Path, hops: Option<usize>, message: String) -> Result<()> {
    let mut config = NodeConfig::load(config_path).await?;
    if let Some(hops) = hops {
        config.circuit.hop_count = hops;
    }
    config.validate()?;
    if config.relays.trusted.is_empty() {
        anyhow::bail!("No trusted relays in {:?}", config_path);
    }

    let router = OnionRouter::new(config.to_router_config())?;
    router.start().await.context("Failed to start router")?;

    let result = probe(&router, config.circuit.hop_count, message.as_bytes()).await;
    router.stop().await;

    let (path, reply, elapsed) = result?;
    println!("Circuit: {}", path.join(" -> "));
    println!("Reply:   {}", String::from_utf8_lossy(&reply));
    println!("Round trip: {}ms", elapsed.as_millis());
    Ok(())
}

async fn probe(
    router: &OnionRouter,
    hops: usize,
    message: &[u8],
) -> Result<(Vec<String>, Vec<u8>, Duration)> {
    let shared = router
        .create_circuit(hops)
        .await
        .context("Failed to build circuit")?;
    let mut circuit = shared.lock().await;
    let path = circuit.node_ids().to_vec();

    let started = std::time::Instant::now();
    circuit.send_data(message).await?;
    let reply = tokio::time::timeout(Duration::from_secs(10), circuit.receive_data())
        .await
        .context("No reply from exit (is it running with --discard?)")??;
    let elapsed = started.elapsed();

    let id = circuit.id();
    drop(circuit);
    router.manager().destroy_circuit(id).await?;

    Ok((path, reply.to_vec(), elapsed))
}

async fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    NodeConfig::default().save(config_path).await?;
    info!("Config saved to {:?}", config_path);

    println!("veilroute initialized. Add trusted relays to [relays] in {:?}", config_path);
    Ok(())
}

async fn cmd_config(config_path: &Path) -> Result<()> {
    let config = NodeConfig::load(config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
