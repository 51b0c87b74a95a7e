//! StageLink operator CLI.
//!
//! Pairing is an operator decision, so it lives in its own tool instead of
//! the node daemon: the CLI edits the same config file the node reads, and
//! the node's reconciliation loop picks the changes up on its next start.
//!
//! # Usage
//!
//! ```text
//! stagelink identity                 show (or create) this installation's identity
//! stagelink discover                 browse the network for other instances
//! stagelink pair --name <NAME>       pair with a discovered instance
//! stagelink pair-ip --host <HOST>    pair with an address directly
//! stagelink unpair <INSTANCE_ID>     drop a pinned master
//! stagelink masters                  list pinned masters
//! ```
//!
//! All commands honour `--config <PATH>` / `STAGELINK_CONFIG` so tests and
//! multi-instance machines can point at a non-default config file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stagelink_core::{fingerprint, DiscoveredPeer, PeerContactCache};
use stagelink_node::application::pair_peer::PairingService;
use stagelink_node::application::SystemClock;
use stagelink_node::infrastructure::discovery;
use stagelink_node::infrastructure::http::client::HttpPeerClient;
use stagelink_node::infrastructure::storage::config::{ensure_identity, SettingsStore};
use stagelink_node::infrastructure::storage::trust::ConfigTrustStore;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Operator tool for StageLink instances.
#[derive(Debug, Parser)]
#[command(
    name = "stagelink",
    about = "Discover, pair with, and manage StageLink master instances",
    version
)]
struct Cli {
    /// Path to the config file.  Defaults to the platform config directory.
    #[arg(long, global = true, env = "STAGELINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show this installation's identity, creating it on first run.
    Identity,

    /// Browse the network for other instances.
    Discover {
        /// How long to listen for announcements, in seconds.
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },

    /// Pair with a discovered instance by its announced name.
    Pair {
        /// The instance name exactly as `discover` lists it.
        #[arg(long)]
        name: String,

        /// How long to listen for announcements, in seconds.
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },

    /// Pair with an instance by address, for networks without multicast.
    PairIp {
        /// Host name or IP address of the master's pairing server.
        #[arg(long)]
        host: String,

        /// Port of the master's pairing server.
        #[arg(long, default_value_t = 24890)]
        port: u16,

        /// Session-bootstrap PIN the master requires.  Stored in the config
        /// so the node presents it on every socket-info request.
        #[arg(long)]
        pin: Option<String>,
    },

    /// Remove a pinned master.
    Unpair {
        /// Instance id as shown by `masters`.
        instance_id: Uuid,
    },

    /// List pinned masters.
    Masters,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the default output clean for table printing; RUST_LOG opts in.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(match &cli.config {
        Some(path) => SettingsStore::load(path.clone())?,
        None => SettingsStore::open_default()?,
    });

    match cli.command {
        Command::Identity => cmd_identity(&settings),
        Command::Discover { timeout_secs } => cmd_discover(timeout_secs).await,
        Command::Pair { name, timeout_secs } => cmd_pair(&settings, &name, timeout_secs).await,
        Command::PairIp { host, port, pin } => cmd_pair_ip(&settings, &host, port, pin).await,
        Command::Unpair { instance_id } => cmd_unpair(&settings, instance_id),
        Command::Masters => cmd_masters(&settings),
    }
}

fn make_pairing_service(settings: &Arc<SettingsStore>) -> anyhow::Result<PairingService> {
    Ok(PairingService::new(
        Arc::new(HttpPeerClient::new()?),
        Arc::new(ConfigTrustStore::new(Arc::clone(settings))),
        Arc::new(PeerContactCache::new()),
        Arc::new(SystemClock),
    ))
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_identity(settings: &Arc<SettingsStore>) -> anyhow::Result<()> {
    let identity = ensure_identity(settings)?;
    println!("instance id:      {}", identity.instance_id);
    println!("instance name:    {}", identity.instance_name);
    println!("hostname:         {}", identity.hostname);
    println!("key fingerprint:  {}", fingerprint(&identity.public_key_pem));
    println!("config file:      {}", settings.path().display());
    Ok(())
}

async fn cmd_discover(timeout_secs: u64) -> anyhow::Result<()> {
    eprintln!("listening for instances ({timeout_secs}s)...");
    let peers = discovery::scan(Duration::from_secs(timeout_secs)).await?;
    if peers.is_empty() {
        println!("no instances found");
        return Ok(());
    }
    print_peer_table(&peers);
    Ok(())
}

async fn cmd_pair(
    settings: &Arc<SettingsStore>,
    name: &str,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    eprintln!("looking for {name:?} ({timeout_secs}s)...");
    let peers = discovery::scan(Duration::from_secs(timeout_secs)).await?;
    let Some(peer) = peers.iter().find(|p| p.name == name) else {
        if peers.is_empty() {
            bail!("no instances found; is the master running and announcing?");
        }
        print_peer_table(&peers);
        bail!("no instance named {name:?} among the {} found above", peers.len());
    };

    let service = make_pairing_service(settings)?;
    let record = service.pair_with_peer(peer).await?;
    println!(
        "paired with {} ({}), key fingerprint {}",
        record.name,
        record.instance_id,
        fingerprint(&record.public_key_pem)
    );
    Ok(())
}

async fn cmd_pair_ip(
    settings: &Arc<SettingsStore>,
    host: &str,
    port: u16,
    pin: Option<String>,
) -> anyhow::Result<()> {
    // The PIN belongs to the node's session requests, not to this
    // handshake, so it is stored before pairing even starts.
    if let Some(pin) = &pin {
        settings.update(|config| config.discovery.pairing_pin = Some(pin.clone()))?;
        println!("stored the session pin in {}", settings.path().display());
    }

    let service = make_pairing_service(settings)?;
    let record = service.pair_with_peer_ip(host, port).await?;
    println!(
        "paired with {} ({}) at {host}:{port}, key fingerprint {}",
        record.name,
        record.instance_id,
        fingerprint(&record.public_key_pem)
    );
    Ok(())
}

fn cmd_unpair(settings: &Arc<SettingsStore>, instance_id: Uuid) -> anyhow::Result<()> {
    let service = make_pairing_service(settings)?;
    if service.unpair_peer(instance_id)? {
        println!("unpaired {instance_id}");
    } else {
        println!("no master with id {instance_id} is paired");
    }
    Ok(())
}

fn cmd_masters(settings: &Arc<SettingsStore>) -> anyhow::Result<()> {
    let masters = settings.snapshot().paired_masters;
    if masters.is_empty() {
        println!("no masters paired");
        return Ok(());
    }
    println!(
        "{:<24} {:<38} {:<22} {:<7} KEY",
        "NAME", "INSTANCE ID", "HOST", "PORT"
    );
    for master in &masters {
        println!(
            "{:<24} {:<38} {:<22} {:<7} {}",
            master.name,
            master.instance_id,
            master.host_hint.as_deref().unwrap_or("-"),
            master
                .pairing_port_hint
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            short_fingerprint(&master.public_key_pem),
        );
    }
    Ok(())
}

fn print_peer_table(peers: &[DiscoveredPeer]) {
    println!(
        "{:<24} {:<22} {:<7} {:<10} INSTANCE ID",
        "NAME", "HOST", "PORT", "VERSION"
    );
    for peer in peers {
        println!(
            "{:<24} {:<22} {:<7} {:<10} {}",
            peer.name,
            peer.preferred_host().unwrap_or_else(|| "-".to_string()),
            peer.pairing_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            peer.version.as_deref().unwrap_or("-"),
            peer.instance_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

/// First 16 hex digits, enough to eyeball a key in a table.
fn short_fingerprint(public_key_pem: &str) -> String {
    let full = fingerprint(public_key_pem);
    full.chars().take(16).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
