//! mDNS / DNS-SD peer discovery and presence announcement.
//!
//! Every instance in network mode registers itself under the
//! `_stagelink._tcp.local.` service type and simultaneously browses for
//! other registrations.  Discovery is presence only: it never carries
//! commands and it never creates trust.  Its output feeds two consumers:
//! the pairing UI (the list of candidates a user can pair with) and the
//! channel supervisor's contact cache (the current address of an already
//! paired master).
//!
//! # How DNS-SD discovery works (for beginners)
//!
//! Multicast DNS lets machines on one LAN answer DNS queries themselves,
//! without a DNS server.  DNS-SD layers service browsing on top of it:
//!
//! 1. This instance registers `"<name>._stagelink._tcp.local."` with the
//!    mDNS daemon, pointing at its hostname, pairing port, and a TXT
//!    record of identity attributes (`instanceId`, `mode`, `version`,
//!    `hostname`, `pairingPort`, `pubKeyFingerprint`).
//!
//! 2. Every instance also browses the same service type.  The daemon
//!    multicasts a query, collects PTR/SRV/TXT/A answers, and hands each
//!    fully resolved service to us as a [`ServiceEvent`].
//!
//! 3. Records expire or are withdrawn (`ServiceRemoved`), so the peer
//!    list self-heals when a machine leaves the network.
//!
//! The daemon's event channel is read on a dedicated blocking thread so
//! the Tokio runtime never waits on multicast I/O.  The thread exits when
//! browsing is stopped: `stop_browse` makes the daemon deliver a
//! `SearchStopped` event, which breaks the loop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagelink_core::{fingerprint, DiscoveredPeer};

use crate::application::LocalIdentity;

/// DNS-SD service type instances announce under and browse for.
pub const SERVICE_TYPE: &str = "_stagelink._tcp.local.";

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mDNS daemon refused an operation.
    #[error("mdns daemon error: {0}")]
    Daemon(String),
}

/// The slice of node configuration discovery reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// `"network"` or `"local"`.  Discovery only runs in network mode.
    pub mode: String,
    pub instance_name: String,
    pub pairing_port: u16,
}

impl DiscoveryConfig {
    fn wants_discovery(&self) -> bool {
        self.enabled && self.mode == "network"
    }
}

/// The service registration currently held with the daemon.
struct PublishedService {
    name: String,
    port: u16,
    fullname: String,
}

/// Owns the mDNS daemon, this instance's registration, and the browse
/// thread that maintains the peer list.
pub struct DiscoveryService {
    instance_id: Uuid,
    hostname: String,
    key_fingerprint: String,
    daemon: Option<ServiceDaemon>,
    running: Arc<AtomicBool>,
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
    events_tx: mpsc::Sender<Vec<DiscoveredPeer>>,
    published: Option<PublishedService>,
    browse_thread: Option<std::thread::JoinHandle<()>>,
}

impl DiscoveryService {
    /// Creates an idle service.  Nothing is announced until
    /// [`refresh`](Self::refresh) is called with a network-mode config.
    ///
    /// The returned receiver yields the full (sorted) peer list every time
    /// it changes; an empty list is emitted when discovery stops.
    pub fn new(identity: &LocalIdentity) -> (Self, mpsc::Receiver<Vec<DiscoveredPeer>>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        (
            Self {
                instance_id: identity.instance_id,
                hostname: identity.hostname.clone(),
                key_fingerprint: fingerprint(&identity.public_key_pem),
                daemon: None,
                running: Arc::new(AtomicBool::new(false)),
                peers: Arc::new(Mutex::new(HashMap::new())),
                events_tx,
                published: None,
                browse_thread: None,
            },
            events_rx,
        )
    }

    /// Brings announcement and browsing in line with `config`.  Safe to
    /// call repeatedly; it only talks to the daemon when something
    /// actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Daemon`] if the daemon cannot be created
    /// or refuses the registration or browse request.
    pub fn refresh(&mut self, config: &DiscoveryConfig) -> Result<(), DiscoveryError> {
        if !config.wants_discovery() {
            // Keep the daemon warm: flipping discovery back on later only
            // needs a re-register, not a new daemon.
            self.stop(true);
            return Ok(());
        }

        let daemon = match &self.daemon {
            Some(daemon) => daemon.clone(),
            None => {
                let daemon =
                    ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
                self.daemon = Some(daemon.clone());
                daemon
            }
        };
        self.running.store(true, Ordering::Relaxed);
        self.ensure_published(&daemon, config)?;
        self.ensure_browsing(&daemon)?;
        Ok(())
    }

    /// Withdraws the announcement, stops browsing, and clears the peer
    /// list.  With `keep_daemon` the daemon itself survives for a later
    /// [`refresh`](Self::refresh).
    pub fn stop(&mut self, keep_daemon: bool) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(daemon) = &self.daemon {
            if let Err(err) = daemon.stop_browse(SERVICE_TYPE) {
                debug!("stop_browse: {err}");
            }
            if let Some(published) = self.published.take() {
                if let Err(err) = daemon.unregister(&published.fullname) {
                    debug!("unregister {}: {err}", published.fullname);
                }
                info!("stopped announcing {}", published.name);
            }
        }
        if let Some(handle) = self.browse_thread.take() {
            // stop_browse delivers SearchStopped, which ends the thread.
            let _ = handle.join();
        }
        self.peers.lock().unwrap().clear();
        let _ = self.events_tx.try_send(Vec::new());
        if !keep_daemon {
            if let Some(daemon) = self.daemon.take() {
                let _ = daemon.shutdown();
            }
        }
    }

    /// Snapshot of the currently visible peers, sorted by name.
    pub fn visible_peers(&self) -> Vec<DiscoveredPeer> {
        let peers = self.peers.lock().unwrap();
        sorted_peers(&peers)
    }

    fn ensure_published(
        &mut self,
        daemon: &ServiceDaemon,
        config: &DiscoveryConfig,
    ) -> Result<(), DiscoveryError> {
        if let Some(published) = &self.published {
            if published.name == config.instance_name && published.port == config.pairing_port {
                return Ok(());
            }
            if let Err(err) = daemon.unregister(&published.fullname) {
                warn!("could not withdraw {}: {err}", published.fullname);
            }
            self.published = None;
        }

        let mut txt = HashMap::new();
        txt.insert("instanceId".to_string(), self.instance_id.to_string());
        txt.insert("mode".to_string(), config.mode.clone());
        txt.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        txt.insert("hostname".to_string(), self.hostname.clone());
        txt.insert("pairingPort".to_string(), config.pairing_port.to_string());
        txt.insert("pubKeyFingerprint".to_string(), self.key_fingerprint.clone());

        let host = format!("{}.local.", self.hostname);
        let service = match local_ip_address::local_ip() {
            Ok(ip) => ServiceInfo::new(
                SERVICE_TYPE,
                &config.instance_name,
                &host,
                ip,
                config.pairing_port,
                txt,
            )
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?,
            Err(err) => {
                debug!("no primary local ip ({err}), letting the daemon pick addresses");
                ServiceInfo::new(
                    SERVICE_TYPE,
                    &config.instance_name,
                    &host,
                    "",
                    config.pairing_port,
                    txt,
                )
                .map_err(|e| DiscoveryError::Daemon(e.to_string()))?
                .enable_addr_auto()
            }
        };
        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        info!(
            "announcing {} on {} (pairing port {})",
            config.instance_name, SERVICE_TYPE, config.pairing_port
        );
        self.published = Some(PublishedService {
            name: config.instance_name.clone(),
            port: config.pairing_port,
            fullname,
        });
        Ok(())
    }

    fn ensure_browsing(&mut self, daemon: &ServiceDaemon) -> Result<(), DiscoveryError> {
        if self
            .browse_thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
        {
            return Ok(());
        }
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let peers = Arc::clone(&self.peers);
        let events_tx = self.events_tx.clone();
        let running = Arc::clone(&self.running);
        let local_id = self.instance_id;
        let handle = std::thread::Builder::new()
            .name("stagelink-mdns-browse".to_string())
            .spawn(move || browse_loop(receiver, peers, events_tx, running, local_id))
            .expect("failed to spawn mdns browse thread");
        self.browse_thread = Some(handle);
        Ok(())
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop(false);
    }
}

/// One-shot browse for the CLI: collects whatever resolves within
/// `duration` and shuts the daemon down again.
///
/// # Errors
///
/// Returns [`DiscoveryError::Daemon`] if the daemon cannot be created or
/// the browse request is refused.
pub async fn scan(duration: Duration) -> Result<Vec<DiscoveredPeer>, DiscoveryError> {
    tokio::task::spawn_blocking(move || scan_blocking(duration))
        .await
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))?
}

fn scan_blocking(duration: Duration) -> Result<Vec<DiscoveredPeer>, DiscoveryError> {
    let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
    let deadline = Instant::now() + duration;
    let mut peers: HashMap<String, DiscoveredPeer> = HashMap::new();
    loop {
        let Some(remaining) = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
        else {
            break;
        };
        match receiver.recv_timeout(remaining) {
            // A scanning CLI has no instance id of its own to filter out.
            Ok(event) => {
                apply_service_event(&mut peers, Uuid::nil(), &event);
            }
            Err(_) => break,
        }
    }
    let _ = daemon.shutdown();
    Ok(sorted_peers(&peers))
}

fn browse_loop(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
    events_tx: mpsc::Sender<Vec<DiscoveredPeer>>,
    running: Arc<AtomicBool>,
    local_id: Uuid,
) {
    loop {
        let event = match receiver.recv() {
            Ok(event) => event,
            // The daemon dropped its side of the channel.
            Err(_) => break,
        };
        if matches!(event, ServiceEvent::SearchStopped(_)) || !running.load(Ordering::Relaxed) {
            break;
        }
        let changed = {
            let mut peers = peers.lock().unwrap();
            apply_service_event(&mut peers, local_id, &event)
        };
        if changed {
            let snapshot = {
                let peers = peers.lock().unwrap();
                sorted_peers(&peers)
            };
            debug!("peer list changed: {} visible", snapshot.len());
            if events_tx.blocking_send(snapshot).is_err() {
                break;
            }
        }
    }
    debug!("mdns browse thread exiting");
}

/// Folds one daemon event into the peer map.  Returns whether the map
/// changed.  Our own echoed announcement is ignored.
fn apply_service_event(
    peers: &mut HashMap<String, DiscoveredPeer>,
    local_id: Uuid,
    event: &ServiceEvent,
) -> bool {
    match event {
        ServiceEvent::ServiceResolved(service) => {
            let peer = peer_from_service(service);
            if peer.instance_id == Some(local_id) {
                return false;
            }
            info!(
                "discovered peer: {} ({})",
                peer.name,
                peer.host.as_deref().unwrap_or("unknown host")
            );
            peers.insert(peer.key.clone(), peer);
            true
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            let name = instance_name_of(fullname);
            let before = peers.len();
            peers.retain(|_, peer| peer.name != name);
            if peers.len() != before {
                info!("peer left: {name}");
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Builds a peer descriptor from a resolved DNS-SD service.  TXT
/// attributes are all optional; a peer announced by an older version is
/// still listed with whatever it did provide.
fn peer_from_service(service: &ServiceInfo) -> DiscoveredPeer {
    let txt = |key: &str| {
        service
            .get_property_val_str(key)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
    };

    let instance_id = txt("instanceId").and_then(|v| Uuid::parse_str(&v).ok());
    let name = instance_name_of(service.get_fullname()).to_string();
    let host = {
        let trimmed = service.get_hostname().trim_end_matches('.');
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    let mut addresses: Vec<IpAddr> = service.get_addresses().iter().copied().collect();
    addresses.sort();
    let pairing_port = txt("pairingPort")
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| service.get_port());
    let key = instance_id.map(|id| id.to_string()).unwrap_or_else(|| {
        format!(
            "{}:{}:{}",
            name,
            host.as_deref().unwrap_or(""),
            pairing_port
        )
    });

    DiscoveredPeer {
        key,
        instance_id,
        name,
        host,
        pairing_port: Some(pairing_port),
        addresses,
        mode: txt("mode"),
        version: txt("version"),
        hostname: txt("hostname"),
        pub_key_fingerprint: txt("pubKeyFingerprint"),
    }
}

/// `"hall-a._stagelink._tcp.local."` -> `"hall-a"`.
fn instance_name_of(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname)
}

fn sorted_peers(peers: &HashMap<String, DiscoveredPeer>) -> Vec<DiscoveredPeer> {
    let mut list: Vec<DiscoveredPeer> = peers.values().cloned().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

// ── Tests ─────────────────────────────────────────────────────────────────────
