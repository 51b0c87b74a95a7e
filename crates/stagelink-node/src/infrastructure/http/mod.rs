//! Pairing HTTP surface.
//!
//! One axum server answers other instances (`server`), one reqwest client
//! calls theirs (`client`), and a sliding-window limiter (`rate_limit`)
//! keeps the unauthenticated endpoints from being hammered.

pub mod client;
pub mod rate_limit;
pub mod server;
