//! Integration tests for the pairing handshake over real HTTP.
//!
//! # Purpose
//!
//! These tests run the actual axum pairing server on an ephemeral loopback
//! port and drive it through `PairingService` and `HttpPeerClient`, the
//! exact stack the node binary wires together.  They verify:
//!
//! - The happy path: `pair_with_peer_ip` fetches the key, completes the
//!   challenge/response, and pins the master's key.
//! - Trust-on-first-use: once a key is pinned, a different key answering at
//!   the same address is rejected and the stored record stays untouched.
//! - Session issuance: socket-info answers carry a verifiable signature, a
//!   future expiry, and honour the configured PIN.
//! - Transport hygiene: malformed bodies get 400, floods get 429.
//!
//! # The handshake under test
//!
//! ```text
//! Follower                              Master (the server in these tests)
//! ────────                              ─────────────────────────────────
//! GET /peer/public-key
//!   ← {instanceId, publicKey, ...}
//! generate challenge (random, base64)
//! POST /peer/challenge {challenge}
//!   ← {signature}
//! verify(publicKey, challenge, signature)
//! pin key, persist PairedMaster
//! ```
//!
//! The signature proves the answering machine holds the private key for
//! the public key it presented; the pin makes every later session check
//! against that first-seen key.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use stagelink_core::protocol::pairing::PublicKeyResponse;
use stagelink_core::{
    canonical_session_message, fingerprint, generate_keypair, verify, MemoryTrustStore,
    PairedMaster, PeerContactCache, TrustStore,
};
use stagelink_node::application::channel_sync::{ChannelError, SessionApi};
use stagelink_node::application::pair_peer::{PairingError, PairingService};
use stagelink_node::application::{Clock, LocalIdentity, SystemClock};
use stagelink_node::infrastructure::channel::hub::CommandHub;
use stagelink_node::infrastructure::http::client::HttpPeerClient;
use stagelink_node::infrastructure::http::rate_limit::RateLimiter;
use stagelink_node::infrastructure::http::server::{self, ServerState, SESSION_TOKEN_TTL_MS};

// ── Test fixtures ─────────────────────────────────────────────────────────────

fn make_identity(name: &str) -> LocalIdentity {
    let keys = generate_keypair().expect("keypair generation");
    LocalIdentity {
        instance_id: Uuid::new_v4(),
        instance_name: name.to_string(),
        hostname: format!("{name}-host"),
        public_key_pem: keys.public_key_pem,
        private_key_pem: keys.private_key_pem,
    }
}

/// Starts a real pairing server on `127.0.0.1:0` and returns the identity
/// it answers with plus the bound address.  The command hub exists so
/// `/peer/command` has something to broadcast to, but it is not listening;
/// these tests exercise pairing, not the socket.
async fn spawn_master(pin: Option<&str>) -> (LocalIdentity, SocketAddr) {
    let identity = make_identity("master");
    let clock = Arc::new(SystemClock);
    let hub = Arc::new(CommandHub::new(
        identity.clone(),
        "/peer".to_string(),
        clock.clone(),
    ));
    let listener = server::bind("127.0.0.1", 0).await.expect("bind server");
    let addr = listener.local_addr().expect("local addr");
    let state = Arc::new(ServerState {
        identity: identity.clone(),
        pairing_port: addr.port(),
        socket_port: addr.port(),
        socket_path: "/peer".to_string(),
        pin: pin.map(str::to_string),
        limiter: RateLimiter::new(30, Duration::from_secs(60)),
        hub,
        clock,
    });
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(async move {
        server::serve(listener, state, running).await.ok();
    });
    (identity, addr)
}

/// Builds the follower-side pairing stack over an in-memory trust store.
fn make_follower() -> (PairingService, Arc<MemoryTrustStore>, Arc<PeerContactCache>) {
    let api = Arc::new(HttpPeerClient::new().expect("http client"));
    let trust = Arc::new(MemoryTrustStore::new());
    let contacts = Arc::new(PeerContactCache::new());
    let service = PairingService::new(api, trust.clone(), contacts.clone(), Arc::new(SystemClock));
    (service, trust, contacts)
}

// ── Handshake tests ───────────────────────────────────────────────────────────

/// Tests the complete happy-path handshake against a live server: the
/// returned record pins the server's real key and remembers how the
/// master was reached.
#[tokio::test]
async fn test_pair_with_peer_ip_pins_the_master_key() {
    let (master, addr) = spawn_master(None).await;
    let (service, trust, contacts) = make_follower();

    let record = service
        .pair_with_peer_ip("127.0.0.1", addr.port())
        .await
        .expect("pairing must succeed");

    assert_eq!(record.instance_id, master.instance_id);
    assert_eq!(record.name, "master");
    assert_eq!(
        record.public_key_pem, master.public_key_pem,
        "the pinned key must be the key the server answered with"
    );
    assert_eq!(record.host_hint.as_deref(), Some("127.0.0.1"));
    assert_eq!(record.pairing_port_hint, Some(addr.port()));

    // The record is persisted and the contact cache knows the endpoint.
    let stored = trust.get(master.instance_id).expect("record stored");
    assert_eq!(stored.public_key_pem, master.public_key_pem);
    let contact = contacts.get(master.instance_id).expect("contact cached");
    assert_eq!(contact.port, addr.port());
}

/// Tests trust-on-first-use: with a different key already pinned for the
/// master's instance id, the live server's challenge signature no longer
/// verifies and the stored record must stay exactly as it was.
#[tokio::test]
async fn test_pairing_rejects_a_key_change_at_the_same_address() {
    let (master, addr) = spawn_master(None).await;
    let (service, trust, _contacts) = make_follower();

    // Pin a key that is NOT the one the server holds.
    let pinned_keys = generate_keypair().expect("keypair generation");
    let pinned = PairedMaster {
        instance_id: master.instance_id,
        name: "pinned-master".to_string(),
        public_key_pem: pinned_keys.public_key_pem.clone(),
        paired_at: 1,
        host_hint: None,
        pairing_port_hint: None,
        nat_compatibility: false,
    };
    trust.upsert(pinned.clone()).expect("pre-pin");

    let result = service.pair_with_peer_ip("127.0.0.1", addr.port()).await;

    assert!(
        matches!(result, Err(PairingError::SignatureVerificationFailed { .. })),
        "a key change must fail verification, got: {:?}",
        result
    );
    // Nothing about the pinned record may change on a failed handshake.
    let stored = trust.get(master.instance_id).expect("record still present");
    assert_eq!(stored, pinned);
}

/// Tests that the public-key endpoint reports the identity fields pairing
/// relies on, including a fingerprint that matches the PEM.
#[tokio::test]
async fn test_public_key_endpoint_reports_identity() {
    let (master, addr) = spawn_master(None).await;

    let url = format!("http://127.0.0.1:{}/peer/public-key", addr.port());
    let body: PublicKeyResponse = reqwest::get(&url)
        .await
        .expect("request")
        .json()
        .await
        .expect("decode");

    assert_eq!(body.instance_id, Some(master.instance_id));
    assert_eq!(body.instance_name.as_deref(), Some("master"));
    assert_eq!(body.hostname.as_deref(), Some("master-host"));
    assert_eq!(body.public_key, master.public_key_pem);
    assert_eq!(
        body.public_key_fingerprint,
        Some(fingerprint(&master.public_key_pem))
    );
    assert_eq!(body.pairing_port, Some(addr.port()));
}

// ── Session issuance tests ────────────────────────────────────────────────────

/// Tests that a socket-info answer is signed by the master's key over the
/// canonical `token:expiresAt:socketPath` message and expires in the
/// future but within the advertised lifetime.
#[tokio::test]
async fn test_socket_info_signature_verifies_and_expiry_is_bounded() {
    let (master, addr) = spawn_master(None).await;
    let client = HttpPeerClient::new().expect("http client");

    let session = client
        .fetch_socket_info("127.0.0.1", addr.port(), Uuid::new_v4(), None)
        .await
        .expect("socket-info must succeed without a configured pin");

    let message = canonical_session_message(&session.token, session.expires_at, &session.socket_path);
    assert!(
        verify(&master.public_key_pem, message.as_bytes(), &session.signature),
        "session signature must verify against the master's key"
    );
    assert_eq!(session.socket_path, "/peer");
    assert!(
        session.socket_url.starts_with("ws://127.0.0.1"),
        "socket url must be derived from the address the caller used, got: {}",
        session.socket_url
    );

    let now = SystemClock.now_ms();
    assert!(session.expires_at > now, "token must not be born expired");
    // Allow a little slack for the time between issuance and this check.
    assert!(session.expires_at <= now + SESSION_TOKEN_TTL_MS + 10_000);
}

/// Tests PIN enforcement on socket-info: missing and wrong PINs are turned
/// away with 401, the correct PIN is accepted.
#[tokio::test]
async fn test_socket_info_requires_the_configured_pin() {
    let (_master, addr) = spawn_master(Some("314159")).await;
    let client = HttpPeerClient::new().expect("http client");
    let follower_id = Uuid::new_v4();

    let missing = client
        .fetch_socket_info("127.0.0.1", addr.port(), follower_id, None)
        .await;
    assert!(
        matches!(&missing, Err(ChannelError::Protocol { detail, .. }) if detail.contains("401")),
        "missing pin must be rejected with 401, got: {:?}",
        missing
    );

    let wrong = client
        .fetch_socket_info("127.0.0.1", addr.port(), follower_id, Some("000000"))
        .await;
    assert!(
        matches!(&wrong, Err(ChannelError::Protocol { detail, .. }) if detail.contains("401")),
        "wrong pin must be rejected with 401, got: {:?}",
        wrong
    );

    client
        .fetch_socket_info("127.0.0.1", addr.port(), follower_id, Some("314159"))
        .await
        .expect("correct pin must be accepted");
}

// ── Transport hygiene tests ───────────────────────────────────────────────────

/// Tests that a challenge request with a body that is not JSON is answered
/// with 400, not a signature over garbage.
#[tokio::test]
async fn test_malformed_challenge_body_is_a_bad_request() {
    let (_master, addr) = spawn_master(None).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/peer/challenge", addr.port()))
        .header("content-type", "application/json")
        .body("{ this is not json")
        .send()
        .await
        .expect("request");

    assert_eq!(response.status().as_u16(), 400);
}

/// Tests the per-IP rate limit: the 31st request inside the window is
/// refused with 429 while the first 30 all pass.
#[tokio::test]
async fn test_burst_of_requests_hits_the_rate_limit() {
    let (_master, addr) = spawn_master(None).await;
    let url = format!("http://127.0.0.1:{}/peer/public-key", addr.port());
    let client = reqwest::Client::new();

    for i in 0..30 {
        let response = client.get(&url).send().await.expect("request");
        assert_eq!(
            response.status().as_u16(),
            200,
            "request {i} is inside the limit and must pass"
        );
    }

    let response = client.get(&url).send().await.expect("request");
    assert_eq!(
        response.status().as_u16(),
        429,
        "the 31st request inside the window must be rate limited"
    );
}
