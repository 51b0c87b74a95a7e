//! Master-side command hub.
//!
//! When this instance acts as the master, followers connect here with the
//! session token they fetched from `/peer/socket-info`.  The first frame
//! on every socket must be the authentication payload; the hub verifies
//! the token's signature against its *own* signing key (it issued the
//! token, so it can check it statelessly) and the expiry against the
//! clock.  Anything that fails gets an `auth-error` frame and the socket
//! closes; an accepted follower gets `auth-ack` and stays registered
//! until its socket drops or a reconnect supersedes it.
//!
//! The accept loop polls its running flag every 200 ms, so shutdown never
//! waits on a quiet network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagelink_core::{canonical_session_message, verify, AuthPayload, HubFrame};

use crate::application::{Clock, LocalIdentity};

/// How long a fresh socket gets to present its auth frame.
const AUTH_DEADLINE: Duration = Duration::from_secs(5);
/// Keepalive ping cadence per follower.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Accept timeout; on expiry the running flag is re-checked.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

type FollowerSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// Error type for the command hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// The listen socket could not be bound.
    #[error("failed to bind command hub on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

struct FollowerConn {
    name: String,
    sink: FollowerSink,
    task: JoinHandle<()>,
}

/// Accepts followers and pushes command frames to all of them.
pub struct CommandHub {
    identity: LocalIdentity,
    socket_path: String,
    clock: Arc<dyn Clock>,
    connections: Mutex<HashMap<Uuid, FollowerConn>>,
}

impl CommandHub {
    pub fn new(identity: LocalIdentity, socket_path: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            socket_path,
            clock,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Binds the hub's listen socket.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bind`] when the address is unusable.
    pub async fn bind(bind_address: &str, port: u16) -> Result<TcpListener, HubError> {
        let addr = format!("{bind_address}:{port}");
        TcpListener::bind(&addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: addr.clone(),
                source,
            })
    }

    /// Accept loop.  Runs until `running` flips to false, then closes
    /// every follower socket.
    pub async fn run(self: Arc<Self>, listener: TcpListener, running: Arc<AtomicBool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("command hub listening on {addr} (path {})", self.socket_path);
        }
        while running.load(Ordering::Relaxed) {
            let (stream, peer_addr) =
                match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(err)) => {
                        warn!("hub accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    // Timed out: re-check the running flag.
                    Err(_) => continue,
                };
            let hub = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(reason) = hub.handle_connection(stream, peer_addr).await {
                    debug!("follower at {peer_addr} not admitted: {reason}");
                }
            });
        }
        self.disconnect_all().await;
        info!("command hub stopped");
    }

    /// Sends `frame` to every connected follower.  Returns how many
    /// sockets accepted it.
    pub async fn broadcast(&self, frame: &HubFrame) -> usize {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!("unserializable hub frame: {err}");
                return 0;
            }
        };
        // Clone the sinks out so a slow follower never blocks the map.
        let sinks: Vec<(Uuid, String, FollowerSink)> = {
            let connections = self.connections.lock().await;
            connections
                .iter()
                .map(|(id, conn)| (*id, conn.name.clone(), Arc::clone(&conn.sink)))
                .collect()
        };
        let mut delivered = 0;
        for (id, name, sink) in sinks {
            match sink.lock().await.send(Message::Text(text.clone())).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!("send to {name} ({id}) failed: {err}"),
            }
        }
        delivered
    }

    /// Ids and names of the currently admitted followers.
    pub async fn connected_followers(&self) -> Vec<(Uuid, String)> {
        self.connections
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (*id, conn.name.clone()))
            .collect()
    }

    /// Closes every follower socket and clears the registry.
    pub async fn disconnect_all(&self) {
        let mut connections = self.connections.lock().await;
        for (id, conn) in connections.drain() {
            conn.task.abort();
            let _ = conn.sink.lock().await.send(Message::Close(None)).await;
            debug!("closed follower {id}");
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), String> {
        let path = self.socket_path.clone();
        let callback = move |request: &Request, response: Response| {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| format!("handshake failed: {e}"))?;
        let (sink, mut stream) = ws.split();
        let sink: FollowerSink = Arc::new(Mutex::new(sink));

        let first = tokio::time::timeout(AUTH_DEADLINE, stream.next())
            .await
            .map_err(|_| "no auth frame within the deadline".to_string())?;
        let auth_text = match first {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(other)) => return Err(format!("expected a text auth frame, got {other}")),
            Some(Err(err)) => return Err(format!("socket error before auth: {err}")),
            None => return Err("socket closed before auth".to_string()),
        };
        let auth: AuthPayload = match serde_json::from_str(&auth_text) {
            Ok(auth) => auth,
            Err(err) => {
                let reason = format!("malformed auth payload: {err}");
                self.reject(&sink, &reason).await;
                return Err(reason);
            }
        };
        if let Err(reason) = validate_auth(
            &self.identity.public_key_pem,
            &self.socket_path,
            &auth,
            self.clock.now_ms(),
        ) {
            self.reject(&sink, reason).await;
            return Err(format!(
                "{} ({}) at {peer_addr}: {reason}",
                auth.instance_name, auth.instance_id
            ));
        }

        send_frame(&sink, &HubFrame::AuthAck)
            .await
            .map_err(|e| format!("auth ack failed: {e}"))?;
        info!(
            "follower connected: {} ({}) from {peer_addr}",
            auth.instance_name, auth.instance_id
        );

        // The registry lock is held across spawn + insert so the read
        // loop's self-unregistration cannot run before the entry exists.
        let follower_id = auth.instance_id;
        let mut connections = self.connections.lock().await;
        let task = tokio::spawn({
            let hub = Arc::clone(&self);
            let sink = Arc::clone(&sink);
            async move {
                hub.read_loop(follower_id, stream, sink).await;
            }
        });
        if let Some(old) = connections.insert(
            follower_id,
            FollowerConn {
                name: auth.instance_name.clone(),
                sink,
                task,
            },
        ) {
            // Same follower reconnected; the stale socket is superseded.
            old.task.abort();
        }
        Ok(())
    }

    /// Per-follower read and keepalive loop.  Exits when the socket dies,
    /// then unregisters itself unless a reconnect already replaced it.
    async fn read_loop(
        self: Arc<Self>,
        follower_id: Uuid,
        mut stream: SplitStream<WebSocketStream<TcpStream>>,
        sink: FollowerSink,
    ) {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ping.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Pong(_))) => {}
                    // The channel is one-way; follower frames carry nothing.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("follower {follower_id} socket error: {err}");
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let mut connections = self.connections.lock().await;
        let ours = connections
            .get(&follower_id)
            .is_some_and(|conn| Arc::ptr_eq(&conn.sink, &sink));
        if ours {
            connections.remove(&follower_id);
            info!("follower disconnected: {follower_id}");
        }
    }

    async fn reject(&self, sink: &FollowerSink, reason: &str) {
        warn!("rejecting follower: {reason}");
        let _ = send_frame(sink, &HubFrame::AuthError(reason.to_string())).await;
        let _ = sink.lock().await.send(Message::Close(None)).await;
    }
}

async fn send_frame(sink: &FollowerSink, frame: &HubFrame) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.lock()
        .await
        .send(Message::Text(text))
        .await
        .map_err(|e| e.to_string())
}

/// Checks a follower's auth payload: the token signature must be this
/// instance's own (it issued the token) and the expiry still in the
/// future.
fn validate_auth(
    public_key_pem: &str,
    socket_path: &str,
    auth: &AuthPayload,
    now_ms: u64,
) -> Result<(), &'static str> {
    let message = canonical_session_message(&auth.token, auth.expires_at, socket_path);
    if !verify(public_key_pem, message.as_bytes(), &auth.signature) {
        return Err("invalid session token signature");
    }
    if auth.expires_at <= now_ms {
        return Err("session token expired");
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    use stagelink_core::{generate_challenge, generate_keypair, sign, Keypair};

    fn keys() -> &'static Keypair {
        static KEYS: OnceLock<Keypair> = OnceLock::new();
        KEYS.get_or_init(|| generate_keypair().expect("keypair generation"))
    }

    const NOW_MS: u64 = 1_700_000_000_000;

    fn make_auth(socket_path: &str, expires_at: u64) -> AuthPayload {
        let token = generate_challenge();
        let message = canonical_session_message(&token, expires_at, socket_path);
        let signature = sign(&keys().private_key_pem, message.as_bytes()).expect("signing");
        AuthPayload {
            token,
            expires_at,
            signature,
            instance_id: Uuid::new_v4(),
            instance_name: "follower-1".to_string(),
            hostname: "stage-pc".to_string(),
        }
    }

    #[test]
    fn test_valid_auth_payload_is_accepted() {
        let auth = make_auth("/peer", NOW_MS + 60_000);

        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        assert_eq!(verdict, Ok(()));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let auth = make_auth("/peer", NOW_MS - 1);

        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        assert_eq!(verdict, Err("session token expired"));
    }

    #[test]
    fn test_token_expiring_exactly_now_is_rejected() {
        let auth = make_auth("/peer", NOW_MS);

        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        assert_eq!(verdict, Err("session token expired"));
    }

    #[test]
    fn test_tampered_token_fails_the_signature_check() {
        // Arrange: the signature covers the original token.
        let mut auth = make_auth("/peer", NOW_MS + 60_000);
        auth.token.push('x');

        // Act
        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        // Assert
        assert_eq!(verdict, Err("invalid session token signature"));
    }

    #[test]
    fn test_token_issued_for_another_path_is_rejected() {
        // A token for a different socket path signs a different canonical
        // message, so the signature cannot match.
        let auth = make_auth("/other", NOW_MS + 60_000);

        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        assert_eq!(verdict, Err("invalid session token signature"));
    }

    #[test]
    fn test_token_signed_by_a_stranger_is_rejected() {
        // Arrange: same canonical message, wrong key.
        let stranger = generate_keypair().expect("keypair generation");
        let token = generate_challenge();
        let expires_at = NOW_MS + 60_000;
        let message = canonical_session_message(&token, expires_at, "/peer");
        let auth = AuthPayload {
            token,
            expires_at,
            signature: sign(&stranger.private_key_pem, message.as_bytes()).expect("signing"),
            instance_id: Uuid::new_v4(),
            instance_name: "impostor".to_string(),
            hostname: "impostor-pc".to_string(),
        };

        // Act
        let verdict = validate_auth(&keys().public_key_pem, "/peer", &auth, NOW_MS);

        // Assert
        assert_eq!(verdict, Err("invalid session token signature"));
    }
}
