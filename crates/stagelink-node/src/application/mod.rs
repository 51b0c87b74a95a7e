//! Application layer use cases for the node.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure trust rules, in `stagelink-core`) and the infrastructure
//! (sockets, HTTP, the file system).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "pair with
//!   that master" or "keep a live command channel to every paired master").
//! - **Depend on abstractions** (traits) rather than concrete
//!   implementations, so the infrastructure can be swapped without changing
//!   this code.
//! - **Contain no OS calls, no network I/O, no file system access.**
//!
//! # Sub-modules
//!
//! - **`pair_peer`** – The follower-side pairing handshake: fetch the
//!   master's public key, cross-check the hostname, issue a challenge, and
//!   pin the key on success (trust-on-first-use).
//!
//! - **`channel_sync`** – The reconciliation loop.  Every tick it resolves
//!   an endpoint for each paired master, exchanges a signed session token,
//!   and keeps exactly one authenticated command channel per master alive.
//!   This is the most critical use case in the node.
//!
//! - **`command_dispatch`** – Turns an incoming peer command into display
//!   service calls, honouring the keep-screens-open policy.
//!
//! - **`resolve_url`** – The NAT-aware URL resolver that decides whether a
//!   presentation URL a master sent is reachable as-is or must be rewritten
//!   toward the endpoint the follower actually used.

pub mod channel_sync;
pub mod command_dispatch;
pub mod pair_peer;
pub mod resolve_url;

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// This node's own identity, loaded from (or bootstrapped into) the
/// persisted configuration.
///
/// Carried by everything that signs, verifies, or advertises: the pairing
/// server signs challenges with `private_key_pem`, the command hub verifies
/// session tokens against `public_key_pem`, and discovery advertises
/// `instance_id`, `instance_name`, and `hostname` in its TXT record.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub instance_id: Uuid,
    pub instance_name: String,
    /// OS hostname, advertised over discovery and cross-checked by pairing
    /// clients against the HTTP response.
    pub hostname: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

/// Time source injected into the services so tests control the clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation of [`Clock`] used outside tests.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}
