//! The reconciliation loop that keeps one authenticated command channel
//! open per paired master.
//!
//! # How the loop works (for beginners)
//!
//! Masters move between networks, reboot, and get unpaired while the
//! follower keeps running, so the follower never assumes a connection it
//! opened is still the right one.  Instead a supervisor re-derives the
//! desired state from scratch every tick:
//!
//! 1. Read the full list of paired masters from the trust store.
//! 2. Resolve where each master currently lives: fresh discovery contact
//!    first, the address it was paired at as the fallback.
//! 3. Hash the connection parameters (host, port, pinned key, PIN) into an
//!    *endpoint key*.  A live channel whose key matches is left alone; a
//!    mismatch means the master moved and the channel must be replaced.
//! 4. For a missing or stale channel, fetch a signed session token over
//!    HTTP, verify the signature against the pinned key, and hand the
//!    token to the socket transport as its first frame.
//!
//! Masters are reconciled concurrently and independently: one master that
//! stopped answering never delays or poisons the others.  Repeated
//! failures against the same host collapse into a single warning until the
//! host recovers, so an unplugged master does not flood the log at one
//! warning per tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagelink_core::{
    endpoint_key, parse_peer_command, verify, AuthPayload, DiscoveredPeer, PairedMaster,
    PeerContact, PeerContactCache, ResolvedEndpoint, SessionInfo, TrustStore,
};

use crate::application::command_dispatch::CommandDispatcher;
use crate::application::{Clock, LocalIdentity};

/// Error type for command channel establishment.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The endpoint did not answer the socket-info request.
    #[error("cannot reach {host}:{port}: {detail}")]
    Network {
        host: String,
        port: u16,
        detail: String,
    },

    /// The endpoint answered with something other than the session contract.
    #[error("unexpected response from {host}: {detail}")]
    Protocol { host: String, detail: String },

    /// The session token's signature does not verify against the pinned key.
    #[error("socket-info signature verification failed for {host}")]
    SignatureVerificationFailed { host: String },

    /// The session token was already expired when it arrived.
    #[error("session token from {host} expired at {expires_at}")]
    SessionExpired { host: String, expires_at: u64 },

    /// The trust record is unusable: no pinned key, or no address to try.
    #[error("no usable endpoint for paired master {name}")]
    MissingTrustInfo { name: String },
}

impl ChannelError {
    /// Host the failure is attributed to, when one is known.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Network { host, .. }
            | Self::Protocol { host, .. }
            | Self::SignatureVerificationFailed { host }
            | Self::SessionExpired { host, .. } => Some(host),
            Self::MissingTrustInfo { .. } => None,
        }
    }

    /// Coarse failure class used to deduplicate repeated log notices.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Protocol { .. } => "protocol",
            Self::SignatureVerificationFailed { .. } => "signature",
            Self::SessionExpired { .. } => "expired",
            Self::MissingTrustInfo { .. } => "unresolved",
        }
    }
}

/// Where a master sits in its channel lifecycle.
///
/// `Removed` is terminal: it is only entered when the master disappears
/// from the trust store, and re-pairing starts the cycle over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterChannelState {
    /// Paired but no address is currently known for it.
    Unresolved,
    /// A session fetch or socket dial is in flight.
    Handshaking,
    /// The master acknowledged authentication; commands flow.
    Connected,
    /// The channel dropped or could not be established; retried next tick.
    Disconnected,
    /// The master was unpaired while the loop was running.
    Removed,
}

/// Events a live channel reports back to the supervisor.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The master acknowledged the authentication frame.
    Connected,
    /// The socket closed after a successful authentication.
    Disconnected { reason: String },
    /// The master rejected the authentication frame.
    ConnectError { detail: String },
    /// A command frame arrived.
    Command { command: serde_json::Value },
}

/// A live command channel as produced by a [`CommandTransport`].
pub struct ChannelConnection {
    /// Lifecycle and command events, in arrival order.
    pub events: mpsc::Receiver<ChannelEvent>,
    /// The transport's socket task.  Aborting it closes the channel.
    pub io_task: JoinHandle<()>,
}

/// HTTP surface that issues signed session tokens for the command socket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// `GET /peer/socket-info` on the master's pairing endpoint.
    async fn fetch_socket_info<'a>(
        &self,
        host: &str,
        port: u16,
        instance_id: Uuid,
        pin: Option<&'a str>,
    ) -> Result<SessionInfo, ChannelError>;
}

/// The socket transport the supervisor dials through.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Opens the socket at `socket_url` + `socket_path` and sends `auth`
    /// as the first frame.  Success means the socket is open, not that the
    /// master accepted the authentication; acceptance arrives as
    /// [`ChannelEvent::Connected`] on the returned connection.
    async fn connect(
        &self,
        socket_url: &str,
        socket_path: &str,
        auth: AuthPayload,
    ) -> Result<ChannelConnection, ChannelError>;
}

/// Tunables for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// How often the reconciliation pass runs.
    pub tick_interval: Duration,
    /// Optional PIN sent with socket-info requests.  Part of the endpoint
    /// key, so changing it forces a re-handshake.
    pub pairing_pin: Option<String>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            pairing_pin: None,
        }
    }
}

/// One row of the connection overview shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterStatus {
    pub instance_id: Uuid,
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connected: bool,
}

/// A channel the supervisor currently holds open.
struct ActiveChannel {
    /// Distinguishes this channel from any predecessor for the same
    /// master; events queued by a superseded channel carry a stale serial.
    serial: u64,
    endpoint_key: String,
    endpoint: ResolvedEndpoint,
    name: String,
    io_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

/// Everything the supervisor mutates, behind one lock.
#[derive(Default)]
struct SupervisorState {
    channels: HashMap<Uuid, ActiveChannel>,
    master_states: HashMap<Uuid, MasterChannelState>,
    /// Source of [`ActiveChannel::serial`] values.
    next_serial: u64,
    /// Masters already warned about as unresolved, so the warning fires
    /// once per outage instead of once per tick.
    unresolved_notices: HashSet<Uuid>,
    /// `(host, failure class)` pairs already warned about.
    failure_notices: HashSet<(String, &'static str)>,
}

impl SupervisorState {
    /// Aborts and forgets the live channel for `master_id`, if any.
    fn teardown_channel(&mut self, master_id: Uuid) {
        if let Some(channel) = self.channels.remove(&master_id) {
            channel.io_task.abort();
            channel.pump_task.abort();
        }
    }

    /// Forgets failure notices attributed to `host` so the next failure
    /// there logs at full volume again.
    fn clear_host_failures(&mut self, host: &str) {
        self.failure_notices.retain(|(h, _)| h != host);
    }
}

/// Owns the per-master channels and the tick loop that reconciles them.
pub struct ChannelSupervisor {
    identity: LocalIdentity,
    settings: ChannelSettings,
    trust: Arc<dyn TrustStore>,
    contacts: Arc<PeerContactCache>,
    sessions: Arc<dyn SessionApi>,
    transport: Arc<dyn CommandTransport>,
    dispatcher: CommandDispatcher,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    state: Mutex<SupervisorState>,
    events_tx: mpsc::Sender<(Uuid, u64, ChannelEvent)>,
    events_rx: Mutex<Option<mpsc::Receiver<(Uuid, u64, ChannelEvent)>>>,
}

impl ChannelSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: LocalIdentity,
        settings: ChannelSettings,
        trust: Arc<dyn TrustStore>,
        contacts: Arc<PeerContactCache>,
        sessions: Arc<dyn SessionApi>,
        transport: Arc<dyn CommandTransport>,
        dispatcher: CommandDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            identity,
            settings,
            trust,
            contacts,
            sessions,
            transport,
            dispatcher,
            clock,
            running: AtomicBool::new(true),
            state: Mutex::new(SupervisorState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Drives ticks and channel events until [`stop`](Self::stop) is called.
    /// The first reconciliation pass runs immediately.
    pub async fn run(&self) {
        let mut events = match self.events_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("channel supervisor is already running");
                return;
            }
        };

        info!(
            "channel supervisor started, reconciling every {:?}",
            self.settings.tick_interval
        );
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                maybe = events.recv() => match maybe {
                    Some((master_id, serial, event)) => {
                        self.handle_event(master_id, serial, event).await;
                    }
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }

        self.disconnect_all().await;
        info!("channel supervisor stopped");
    }

    /// Asks the loop to exit and closes every channel immediately.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.disconnect_all().await;
    }

    /// One reconciliation pass over the whole trust store.
    pub async fn tick(&self) {
        let masters = self.trust.all();

        // Channels for masters that were unpaired since the last pass are
        // closed first; their entries stay in the state map as `Removed`.
        {
            let keep: HashSet<Uuid> = masters.iter().map(|m| m.instance_id).collect();
            let mut state = self.state.lock().await;
            let gone: Vec<Uuid> = state
                .master_states
                .iter()
                .filter(|(id, s)| !keep.contains(id) && **s != MasterChannelState::Removed)
                .map(|(id, _)| *id)
                .collect();
            for master_id in gone {
                info!("master {master_id} was unpaired, closing its command channel");
                state.teardown_channel(master_id);
                state
                    .master_states
                    .insert(master_id, MasterChannelState::Removed);
                state.unresolved_notices.remove(&master_id);
            }
        }

        // Masters are reconciled together but fail alone.
        let outcomes = join_all(masters.iter().map(|master| async move {
            (master, self.reconcile_master(master).await)
        }))
        .await;

        for (master, outcome) in outcomes {
            if let Err(err) = outcome {
                self.note_failure(master, err).await;
            }
        }
    }

    /// Brings one master's channel in line with its trust record.
    async fn reconcile_master(&self, master: &PairedMaster) -> Result<(), ChannelError> {
        if master.public_key_pem.is_empty() {
            return Err(ChannelError::MissingTrustInfo {
                name: master.name.clone(),
            });
        }
        let endpoint = self
            .resolve_endpoint(master)
            .ok_or_else(|| ChannelError::MissingTrustInfo {
                name: master.name.clone(),
            })?;
        let key = endpoint_key(
            &endpoint.host,
            endpoint.port,
            &master.public_key_pem,
            self.settings.pairing_pin.as_deref(),
        );

        {
            let mut state = self.state.lock().await;
            state.unresolved_notices.remove(&master.instance_id);
            if let Some(channel) = state.channels.get(&master.instance_id) {
                if channel.endpoint_key == key {
                    return Ok(());
                }
                info!(
                    "endpoint for {} changed to {}:{}, replacing its channel",
                    master.name, endpoint.host, endpoint.port
                );
            }
            state
                .master_states
                .insert(master.instance_id, MasterChannelState::Handshaking);
        }

        let session = self
            .sessions
            .fetch_socket_info(
                &endpoint.host,
                endpoint.port,
                self.identity.instance_id,
                self.settings.pairing_pin.as_deref(),
            )
            .await?;
        if !verify(
            &master.public_key_pem,
            session.canonical_message().as_bytes(),
            &session.signature,
        ) {
            return Err(ChannelError::SignatureVerificationFailed {
                host: endpoint.host.clone(),
            });
        }
        if session.is_expired(self.clock.now_ms()) {
            return Err(ChannelError::SessionExpired {
                host: endpoint.host.clone(),
                expires_at: session.expires_at,
            });
        }

        let auth = AuthPayload {
            token: session.token.clone(),
            expires_at: session.expires_at,
            signature: session.signature.clone(),
            instance_id: self.identity.instance_id,
            instance_name: self.identity.instance_name.clone(),
            hostname: self.identity.hostname.clone(),
        };

        // The superseded channel closes before the replacement dials, so
        // there is never more than one live connection per master.
        self.state.lock().await.teardown_channel(master.instance_id);

        let connection = self
            .transport
            .connect(&session.socket_url, &session.socket_path, auth)
            .await?;

        let mut state = self.state.lock().await;
        state.next_serial += 1;
        let serial = state.next_serial;
        let pump_task = self.spawn_event_pump(master.instance_id, serial, connection.events);
        state.channels.insert(
            master.instance_id,
            ActiveChannel {
                serial,
                endpoint_key: key,
                endpoint,
                name: master.name.clone(),
                io_task: connection.io_task,
                pump_task,
            },
        );
        // Still `Handshaking`: the master confirms with an auth-ack, which
        // arrives as `ChannelEvent::Connected`.
        Ok(())
    }

    /// Applies one event reported by the channel with the given serial.
    ///
    /// A teardown aborts the channel's pump, but events it already queued
    /// still arrive afterwards; the serial check keeps those leftovers
    /// from touching the replacement channel.
    pub async fn handle_event(&self, master_id: Uuid, serial: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                let mut state = self.state.lock().await;
                let Some(channel) = state.channels.get(&master_id) else {
                    // Raced with a teardown; the ack is moot.
                    return;
                };
                if channel.serial != serial {
                    debug!("ignoring a stale auth-ack for {master_id}");
                    return;
                }
                let host = channel.endpoint.host.clone();
                let name = channel.name.clone();
                let previous = state
                    .master_states
                    .insert(master_id, MasterChannelState::Connected);
                state.clear_host_failures(&host);
                state.unresolved_notices.remove(&master_id);
                if previous != Some(MasterChannelState::Connected) {
                    info!("command channel to {name} ({master_id}) established");
                }
            }
            ChannelEvent::Disconnected { reason } => {
                let mut state = self.state.lock().await;
                if state
                    .channels
                    .get(&master_id)
                    .is_some_and(|c| c.serial == serial)
                {
                    state.teardown_channel(master_id);
                    state
                        .master_states
                        .insert(master_id, MasterChannelState::Disconnected);
                    info!("command channel to {master_id} closed: {reason}");
                } else {
                    debug!("ignoring a disconnect from a superseded channel for {master_id}");
                }
            }
            ChannelEvent::ConnectError { detail } => {
                let mut state = self.state.lock().await;
                let Some(channel) = state.channels.get(&master_id) else {
                    return;
                };
                if channel.serial != serial {
                    debug!("ignoring a connect error from a superseded channel for {master_id}");
                    return;
                }
                let host = channel.endpoint.host.clone();
                state.teardown_channel(master_id);
                state
                    .master_states
                    .insert(master_id, MasterChannelState::Disconnected);
                if state.failure_notices.insert((host, "connect")) {
                    warn!("master {master_id} rejected the command channel: {detail}");
                } else {
                    debug!("master {master_id} still rejecting the command channel: {detail}");
                }
            }
            ChannelEvent::Command { command } => {
                let endpoint = {
                    let state = self.state.lock().await;
                    match state.channels.get(&master_id) {
                        Some(channel) if channel.serial == serial => channel.endpoint.clone(),
                        _ => {
                            debug!("dropping a command from a superseded channel for {master_id}");
                            return;
                        }
                    }
                };
                let Some(master) = self.trust.get(master_id) else {
                    debug!("dropping command from unpaired master {master_id}");
                    return;
                };
                match parse_peer_command(&command) {
                    Ok(parsed) => {
                        self.dispatcher
                            .dispatch(parsed, &master, Some(&endpoint))
                            .await;
                    }
                    Err(err) => {
                        warn!("ignoring malformed command from {}: {err}", master.name);
                    }
                }
            }
        }
    }

    /// Feeds a discovery sighting into the contact cache, but only for
    /// masters that are already paired.  Unpaired peers stay strangers
    /// until the user pairs them.
    pub fn observe_peer(&self, peer: &DiscoveredPeer) {
        let Some(master_id) = peer.instance_id else {
            return;
        };
        if self.trust.get(master_id).is_none() {
            return;
        }
        let (Some(host), Some(port)) = (peer.preferred_host(), peer.pairing_port) else {
            return;
        };
        self.contacts.insert(
            master_id,
            PeerContact {
                host,
                port,
                addresses: peer.addresses.clone(),
                hostname: peer.hostname.clone(),
                last_seen: self.clock.now_ms(),
            },
        );
        debug!("refreshed contact for paired master {master_id}");
    }

    /// Connection overview: one row per paired master, whether or not a
    /// channel is currently open to it.
    pub async fn master_statuses(&self) -> Vec<MasterStatus> {
        let masters = self.trust.all();
        let state = self.state.lock().await;
        masters
            .into_iter()
            .map(|master| {
                let connected = state.master_states.get(&master.instance_id)
                    == Some(&MasterChannelState::Connected);
                let (host, port) = match state.channels.get(&master.instance_id) {
                    Some(channel) => (
                        Some(channel.endpoint.host.clone()),
                        Some(channel.endpoint.port),
                    ),
                    None => match self.contacts.get(master.instance_id) {
                        Some(contact) => (Some(contact.host), Some(contact.port)),
                        None => (master.host_hint.clone(), master.pairing_port_hint),
                    },
                };
                MasterStatus {
                    instance_id: master.instance_id,
                    name: master.name,
                    host,
                    port,
                    connected,
                }
            })
            .collect()
    }

    /// Records a failed reconciliation, deduplicating the log noise.
    async fn note_failure(&self, master: &PairedMaster, err: ChannelError) {
        let mut state = self.state.lock().await;
        state.teardown_channel(master.instance_id);
        match &err {
            ChannelError::MissingTrustInfo { .. } => {
                state
                    .master_states
                    .insert(master.instance_id, MasterChannelState::Unresolved);
                if state.unresolved_notices.insert(master.instance_id) {
                    warn!(
                        "paired master {} ({}) has no reachable endpoint: {err}",
                        master.name, master.instance_id
                    );
                }
            }
            other => {
                state
                    .master_states
                    .insert(master.instance_id, MasterChannelState::Disconnected);
                let host = other.host().unwrap_or("unknown").to_string();
                if state.failure_notices.insert((host, other.class())) {
                    warn!(
                        "command channel to {} ({}) failed: {err}",
                        master.name, master.instance_id
                    );
                } else {
                    debug!(
                        "command channel to {} ({}) still failing: {err}",
                        master.name, master.instance_id
                    );
                }
            }
        }
    }

    /// Closes every channel and resets all bookkeeping.
    async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<Uuid> = state.channels.keys().copied().collect();
        for master_id in ids {
            state.teardown_channel(master_id);
        }
        state.master_states.clear();
        state.unresolved_notices.clear();
        state.failure_notices.clear();
    }

    /// Forwards one channel's events into the supervisor's shared queue,
    /// tagged with the owning master and the channel's serial.
    fn spawn_event_pump(
        &self,
        master_id: Uuid,
        serial: u64,
        mut events: mpsc::Receiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((master_id, serial, event)).await.is_err() {
                    break;
                }
            }
        })
    }

    fn resolve_endpoint(&self, master: &PairedMaster) -> Option<ResolvedEndpoint> {
        if let Some(contact) = self.contacts.get(master.instance_id) {
            return Some(ResolvedEndpoint {
                host: contact.host,
                port: contact.port,
            });
        }
        match (master.host_hint.as_ref(), master.pairing_port_hint) {
            (Some(host), Some(port)) => Some(ResolvedEndpoint {
                host: host.clone(),
                port,
            }),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
