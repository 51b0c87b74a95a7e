//! # stagelink-core
//!
//! Shared library for StageLink containing the cryptographic identity
//! primitives, the pinned-trust domain model, and the JSON wire types used
//! between peers.
//!
//! This crate is used by the node and the companion CLI.
//! It has zero dependencies on sockets, HTTP, or the async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! StageLink links presentation instances on a local network: one instance
//! (the "master") drives what is shown, and other instances ("followers")
//! pair with it and mirror its commands: open this presentation URL, go
//! back to the idle screen.  Before a follower obeys anyone it performs a
//! one-time pairing handshake and pins the master's public key, so a later
//! impostor on the same network cannot substitute its own key.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`identity`** – RSA keypair generation, SHA-256 fingerprints,
//!   challenge generation, and sign/verify.  Everything trust is built on.
//!
//! - **`domain`** – Pure records with no I/O: the pinned trust record for a
//!   paired master, the in-memory view of a discovered peer, the contact
//!   cache, and the endpoint key that detects when a master moved.
//!
//! - **`protocol`** – The JSON bodies that travel over HTTP and the command
//!   channel: pairing responses, signed session info, peer commands, and
//!   the channel's framing.

pub mod domain;
pub mod identity;
pub mod protocol;

pub use domain::peer::{endpoint_key, DiscoveredPeer, PeerContact, PeerContactCache, ResolvedEndpoint};
pub use domain::trust::{MemoryTrustStore, PairedMaster, TrustStore, TrustStoreError};
pub use identity::keys::{
    fingerprint, generate_challenge, generate_keypair, sign, verify, KeyError, Keypair,
};
pub use protocol::command::{parse_peer_command, CommandParseError, HubFrame, PeerCommand};
pub use protocol::session::{canonical_session_message, AuthPayload, SessionInfo};
