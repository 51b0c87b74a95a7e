//! Infrastructure layer for the node.
//!
//! Contains network- and OS-facing adapters: the mDNS announcer/browser,
//! the pairing HTTP server and client, the WebSocket command transports,
//! and the TOML-backed settings store.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `stagelink_core`, but MUST NOT be imported by the `application` or
//! domain layers.
//!
//! # Sub-modules
//!
//! - **`discovery`** – announces this instance over DNS-SD and keeps a live
//!   list of other instances on the network.
//!
//! - **`http`** – the axum pairing server (public key, challenge and
//!   socket-info endpoints) and the reqwest client the follower side uses
//!   to talk to a master's pairing server.
//!
//! - **`channel`** – WebSocket command plumbing: the follower-side
//!   transport that dials masters, and the hub that accepts authenticated
//!   followers when this instance acts as the master.
//!
//! - **`storage`** – the TOML settings file (identity, network, display
//!   and paired-master records) and the [`TrustStore`] implementation
//!   backed by it.
//!
//! - **`display`** – the logging display adapter commands are dispatched
//!   to when no real presentation window is wired up.
//!
//! [`TrustStore`]: stagelink_core::TrustStore

pub mod channel;
pub mod discovery;
pub mod display;
pub mod http;
pub mod storage;
