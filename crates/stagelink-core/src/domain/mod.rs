//! Domain module containing trust records, peer descriptors, and endpoint keys.

pub mod peer;
pub mod trust;

pub use peer::{endpoint_key, DiscoveredPeer, PeerContact, PeerContactCache, ResolvedEndpoint};
pub use trust::{MemoryTrustStore, PairedMaster, TrustStore, TrustStoreError};
