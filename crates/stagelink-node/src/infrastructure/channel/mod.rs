//! WebSocket command channel plumbing.
//!
//! `transport` is the follower side: it dials a master's socket and turns
//! the hub's frames into channel events.  `hub` is the master side: it
//! accepts sockets, validates the first-frame authentication, and pushes
//! command frames to every admitted follower.

pub mod hub;
pub mod transport;
