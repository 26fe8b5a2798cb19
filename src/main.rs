//! Ethlink node entry point
//!
//! Serves `*.eth.<base>` over HTTPS with certificates from a local CA,
//! relays JSON-RPC on `ethereum.node.<base>` and exposes the cache admin
//! API on `node.<base>`.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration
//! ethlink-node
//!
//! # Run with custom config file
//! ethlink-node --config /etc/ethlink/config.toml run
//!
//! # Trust the local root certificate
//! ethlink-node install-ca
//! ```
//!
//! `ETHLINK_BASE_DOMAIN` and `ETHLINK_LISTEN` override the config file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ethlink_node::ca::{remove_leaf_files, CaPaths, CertificateAuthority};
use ethlink_node::config::Config;
use ethlink_node::node::{ca_options, EthlinkNode};
use ethlink_node::trust_store::SystemTrustStore;

/// Ethlink gateway node
#[derive(Parser, Debug)]
#[command(name = "ethlink-node")]
#[command(version)]
#[command(about = "Local HTTPS gateway for ENS names", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Run,

    /// Create the certificate authority if needed and add its root to the system trust store
    InstallCa,

    /// Show where the root certificate lives and whether it is trusted
    CaStatus,

    /// Delete lazily generated leaf certificates
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = load_config(args.config.as_ref())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::InstallCa => install_ca(&config),
        Command::CaStatus => ca_status(&config),
        Command::Cleanup => {
            let paths = CaPaths::new(&config.tls.cert_dir);
            remove_leaf_files(&paths.leaves_dir)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    info!("Starting ethlink node v{}", env!("CARGO_PKG_VERSION"));

    let node = EthlinkNode::build(config)?;
    if !node.authority().is_trusted() {
        warn!(
            "Root certificate is not trusted by the system. Run `ethlink-node install-ca` or:\n{}",
            node.authority().manual_install_instructions()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    node.run(shutdown_rx).await?;
    info!("Ethlink node stopped");
    Ok(())
}

fn open_authority(config: &Config) -> Result<CertificateAuthority> {
    Ok(CertificateAuthority::initialize(
        &ca_options(config),
        Box::new(SystemTrustStore),
    )?)
}

fn install_ca(config: &Config) -> Result<()> {
    let authority = open_authority(config)?;
    let outcome = authority.install_to_system_trust_store()?;
    if outcome.is_installed() {
        info!("Root certificate installed: {:?}", outcome);
    } else {
        warn!(
            "Automatic installation unavailable:\n{}",
            authority.manual_install_instructions()
        );
    }
    Ok(())
}

fn ca_status(config: &Config) -> Result<()> {
    let authority = open_authority(config)?;
    let paths = authority.paths();
    println!("Root certificate: {}", paths.root_cert.display());
    println!("Root key present: {}", paths.root_key.exists());
    println!("Trusted:          {}", authority.is_trusted());
    Ok(())
}
