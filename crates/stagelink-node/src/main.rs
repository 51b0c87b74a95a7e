//! StageLink node entry point.
//!
//! Wires together the infrastructure services and starts the Tokio async
//! runtime.  Headless by design; the display layer logs what a windowing
//! embedder would render.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ SettingsStore / ensure_identity   -- config + durable RSA identity
//!  └─ start services
//!       ├─ CommandHub          (WebSocket listener for followers)
//!       ├─ pairing HTTP server (public-key / challenge / socket-info)
//!       ├─ DiscoveryService    (mDNS publish + browse thread)
//!       └─ ChannelSupervisor   (reconciliation loop, Tokio task)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stagelink_core::{PeerContactCache, TrustStore};

use stagelink_node::application::channel_sync::{ChannelSettings, ChannelSupervisor};
use stagelink_node::application::command_dispatch::{CommandDispatcher, DisplayPolicy};
use stagelink_node::application::{Clock, SystemClock};
use stagelink_node::infrastructure::channel::hub::CommandHub;
use stagelink_node::infrastructure::channel::transport::WsCommandTransport;
use stagelink_node::infrastructure::discovery::{DiscoveryConfig, DiscoveryService};
use stagelink_node::infrastructure::display::LogDisplay;
use stagelink_node::infrastructure::http::client::HttpPeerClient;
use stagelink_node::infrastructure::http::rate_limit::RateLimiter;
use stagelink_node::infrastructure::http::server::{self, ServerState};
use stagelink_node::infrastructure::storage::config::{ensure_identity, SettingsStore};
use stagelink_node::infrastructure::storage::trust::ConfigTrustStore;

/// StageLink node: peer discovery, pairing, and the authenticated
/// presentation command channel.
#[derive(Parser, Debug)]
#[command(name = "stagelink-node", version)]
struct Cli {
    /// Path to the config file.  Defaults to the platform config directory.
    #[arg(long, env = "STAGELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the pairing HTTP port for this run.
    #[arg(long, env = "STAGELINK_PAIRING_PORT")]
    pairing_port: Option<u16>,

    /// Override the command socket port for this run.
    #[arg(long, env = "STAGELINK_SOCKET_PORT")]
    socket_port: Option<u16>,

    /// Override the address both listeners bind to.
    #[arg(long, env = "STAGELINK_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Override the announced instance name for this run.
    #[arg(long, env = "STAGELINK_INSTANCE_NAME")]
    instance_name: Option<String>,

    /// Disable discovery announce/browse for this run.
    #[arg(long, env = "STAGELINK_OFFLINE")]
    offline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration loads before logging: the default log level lives in it.
    let settings = Arc::new(match &cli.config {
        Some(path) => SettingsStore::load(path.clone())?,
        None => SettingsStore::open_default()?,
    });
    settings.apply(|config| {
        if let Some(port) = cli.pairing_port {
            config.network.pairing_port = port;
        }
        if let Some(port) = cli.socket_port {
            config.network.socket_port = port;
        }
        if let Some(addr) = &cli.bind_address {
            config.network.bind_address = addr.clone();
        }
        if let Some(name) = &cli.instance_name {
            config.node.instance_name = name.clone();
        }
        if cli.offline {
            config.discovery.enabled = false;
        }
    });
    let config = settings.snapshot();

    // Initialise structured logging.  `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    info!("StageLink node starting (config {})", settings.path().display());

    let identity = ensure_identity(&settings)?;
    info!(
        "instance {} ({})",
        identity.instance_name, identity.instance_id
    );

    // Shutdown flag shared across all background services.
    let running = Arc::new(AtomicBool::new(true));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let trust: Arc<dyn TrustStore> = Arc::new(ConfigTrustStore::new(Arc::clone(&settings)));
    let contacts = Arc::new(PeerContactCache::new());

    // ── Command hub (WebSocket listener) ──────────────────────────────────────
    let hub = Arc::new(CommandHub::new(
        identity.clone(),
        config.network.socket_path.clone(),
        Arc::clone(&clock),
    ));
    let hub_listener =
        CommandHub::bind(&config.network.bind_address, config.network.socket_port).await?;
    tokio::spawn({
        let hub = Arc::clone(&hub);
        let running = Arc::clone(&running);
        async move { hub.run(hub_listener, running).await }
    });

    // ── Pairing HTTP server ────────────────────────────────────────────────────
    let server_state = Arc::new(ServerState {
        identity: identity.clone(),
        pairing_port: config.network.pairing_port,
        socket_port: config.network.socket_port,
        socket_path: config.network.socket_path.clone(),
        pin: config.discovery.pairing_pin.clone(),
        limiter: RateLimiter::new(30, Duration::from_secs(60)),
        hub: Arc::clone(&hub),
        clock: Arc::clone(&clock),
    });
    let http_listener =
        server::bind(&config.network.bind_address, config.network.pairing_port).await?;
    tokio::spawn({
        let running = Arc::clone(&running);
        async move {
            if let Err(e) = server::serve(http_listener, server_state, running).await {
                error!("pairing server stopped with an error: {e}");
            }
        }
    });

    // ── Channel supervisor ─────────────────────────────────────────────────────
    let peer_client = Arc::new(HttpPeerClient::new()?);
    let dispatcher = CommandDispatcher::new(
        Arc::new(LogDisplay),
        DisplayPolicy {
            keep_screens_open: config.display.keep_screens_open,
            use_additional_screens: config.display.use_additional_screens,
            idle_url: config.display.idle_url.clone(),
            fullscreen: config.display.fullscreen,
        },
    );
    let supervisor = Arc::new(ChannelSupervisor::new(
        identity.clone(),
        ChannelSettings {
            pairing_pin: config.discovery.pairing_pin.clone(),
            ..ChannelSettings::default()
        },
        Arc::clone(&trust),
        Arc::clone(&contacts),
        peer_client,
        Arc::new(WsCommandTransport::new()),
        dispatcher,
        Arc::clone(&clock),
    ));
    tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.run().await }
    });

    // ── Discovery ──────────────────────────────────────────────────────────────
    let (mut discovery, mut peers_rx) = DiscoveryService::new(&identity);
    if let Err(e) = discovery.refresh(&DiscoveryConfig {
        enabled: config.discovery.enabled,
        mode: config.node.mode.clone(),
        instance_name: identity.instance_name.clone(),
        pairing_port: config.network.pairing_port,
    }) {
        error!("failed to start discovery: {e}");
    }

    // ── Discovery event pump ───────────────────────────────────────────────────
    // Every fresh peer list feeds the supervisor's contact cache so the
    // next reconciliation tick dials current addresses.
    tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move {
            while let Some(peers) = peers_rx.recv().await {
                for peer in &peers {
                    supervisor.observe_peer(peer);
                }
            }
        }
    });

    // ── Ctrl-C / SIGTERM handler ───────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("StageLink node ready.  Press Ctrl-C to exit.");

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }

    supervisor.stop().await;
    discovery.stop(false);
    info!("StageLink node stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_leave_the_config_file_in_charge() {
        // Arrange: parse with no arguments (all overrides absent)
        let cli = Cli::parse_from(["stagelink-node"]);

        // Assert
        assert_eq!(cli.config, None);
        assert_eq!(cli.pairing_port, None);
        assert_eq!(cli.socket_port, None);
        assert!(!cli.offline);
    }

    #[test]
    fn test_cli_config_path_parses() {
        let cli = Cli::parse_from(["stagelink-node", "--config", "/tmp/stagelink.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/stagelink.toml")));
    }

    #[test]
    fn test_cli_pairing_port_override() {
        let cli = Cli::parse_from(["stagelink-node", "--pairing-port", "9999"]);
        assert_eq!(cli.pairing_port, Some(9999));
    }

    #[test]
    fn test_cli_socket_port_override() {
        let cli = Cli::parse_from(["stagelink-node", "--socket-port", "24901"]);
        assert_eq!(cli.socket_port, Some(24901));
    }

    #[test]
    fn test_cli_bind_address_and_instance_name_overrides() {
        let cli = Cli::parse_from([
            "stagelink-node",
            "--bind-address",
            "127.0.0.1",
            "--instance-name",
            "Stage Left",
        ]);

        assert_eq!(cli.bind_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.instance_name.as_deref(), Some("Stage Left"));
    }

    #[test]
    fn test_cli_offline_flag() {
        let cli = Cli::parse_from(["stagelink-node", "--offline"]);
        assert!(cli.offline);
    }

    #[test]
    fn test_cli_env_fallback_fills_unset_flags() {
        // No other test asserts on an unset instance_name, so the
        // temporary variable cannot leak into a parallel parse.
        std::env::set_var("STAGELINK_INSTANCE_NAME", "Env Stage");
        let cli = Cli::parse_from(["stagelink-node"]);
        std::env::remove_var("STAGELINK_INSTANCE_NAME");

        assert_eq!(cli.instance_name.as_deref(), Some("Env Stage"));
    }
}
