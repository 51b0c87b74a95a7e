//! Discovered-peer descriptors, the in-memory contact cache, and the
//! endpoint key that detects when a paired master's address changed.
//!
//! Nothing in this file is persisted.  [`DiscoveredPeer`] entries live only
//! as long as the discovery registry sees the service; [`PeerContactCache`]
//! entries are rebuilt from pairing contacts and lost on restart.  Durable
//! state belongs in [`crate::domain::trust`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A peer currently visible via mDNS/DNS-SD browse.
///
/// Field values come straight from the service's SRV record and TXT
/// metadata; any of them may be missing when a peer advertises an older or
/// partial record, so pairing validates what it needs and fails with a
/// descriptive error rather than assuming completeness.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    /// Map key in the registry: the advertised instance id, or
    /// `name:host:port` when the peer did not advertise one.
    pub key: String,
    /// Identity the peer claims in its TXT record.
    pub instance_id: Option<Uuid>,
    /// Service instance name (the human-visible label).
    pub name: String,
    /// SRV target hostname with any trailing dot trimmed.
    pub host: Option<String>,
    /// Pairing HTTP port from the TXT record (or the SRV port).
    pub pairing_port: Option<u16>,
    /// Resolved addresses for the SRV target.
    pub addresses: Vec<IpAddr>,
    /// `network` or `offline`, as advertised.
    pub mode: Option<String>,
    /// Application version the peer advertises.
    pub version: Option<String>,
    /// OS hostname the peer advertises; the pairing client cross-checks it
    /// against the HTTP response to catch discovery-layer spoofing.
    pub hostname: Option<String>,
    /// Advertised key fingerprint.  A convenience hint only; the pinned
    /// key from the handshake is the trust anchor.
    pub pub_key_fingerprint: Option<String>,
}

impl DiscoveredPeer {
    /// Picks the host to contact for pairing: the first IPv4 address if one
    /// was resolved, otherwise the advertised hostname.
    ///
    /// IPv4 first because dual-stack peers commonly advertise link-local
    /// IPv6 addresses that are not reachable without a scope id.
    pub fn preferred_host(&self) -> Option<String> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4())
            .map(|a| a.to_string())
            .or_else(|| self.host.clone())
    }
}

/// Best-known contact details for a paired master.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerContact {
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub hostname: Option<String>,
    /// Milliseconds since the Unix epoch of the last successful contact.
    pub last_seen: u64,
}

/// In-memory cache mapping a paired master's instance id to its last-known
/// contact details.
///
/// Seeded by the pairing client on every successful handshake and consumed
/// by the command channel client when it resolves endpoints each tick.  The
/// cache is preferred over the persisted hints because it reflects the most
/// recent successful contact.
#[derive(Debug, Default)]
pub struct PeerContactCache {
    entries: Mutex<HashMap<Uuid, PeerContact>>,
}

impl PeerContactCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `contact` for `instance_id`, replacing any previous entry.
    pub fn insert(&self, instance_id: Uuid, contact: PeerContact) {
        self.entries.lock().unwrap().insert(instance_id, contact);
    }

    /// Returns a clone of the entry for `instance_id`, if present.
    pub fn get(&self, instance_id: Uuid) -> Option<PeerContact> {
        self.entries.lock().unwrap().get(&instance_id).cloned()
    }

    /// Removes the entry for `instance_id`.  Returns `true` if one existed.
    pub fn remove(&self, instance_id: Uuid) -> bool {
        self.entries.lock().unwrap().remove(&instance_id).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of cached contacts.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A concrete host/port a master was resolved to for this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
}

/// Derives the endpoint key for a master's current connection parameters.
///
/// The key changes whenever the host, port, pinned key, or pairing PIN
/// changes, which is exactly when the channel client must drop the old
/// connection and handshake again.  Components are newline-separated before
/// hashing so an IPv6 host containing `:` cannot collide with a different
/// host/port split.
pub fn endpoint_key(host: &str, port: u16, public_key_pem: &str, pin: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b"\n");
    hasher.update(port.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(public_key_pem.as_bytes());
    hasher.update(b"\n");
    hasher.update(pin.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn make_peer() -> DiscoveredPeer {
        DiscoveredPeer {
            key: "9a1b".to_string(),
            instance_id: Some(Uuid::new_v4()),
            name: "chapel-stage".to_string(),
            host: Some("chapel.local".to_string()),
            pairing_port: Some(24890),
            addresses: vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30)),
            ],
            mode: Some("network".to_string()),
            version: Some("1.4.2".to_string()),
            hostname: Some("chapel".to_string()),
            pub_key_fingerprint: Some("ab".repeat(32)),
        }
    }

    // ── preferred_host ────────────────────────────────────────────────────────

    #[test]
    fn test_preferred_host_picks_ipv4_over_ipv6_and_hostname() {
        let peer = make_peer();
        assert_eq!(peer.preferred_host(), Some("192.168.1.30".to_string()));
    }

    #[test]
    fn test_preferred_host_falls_back_to_advertised_hostname() {
        let mut peer = make_peer();
        peer.addresses = vec![IpAddr::V6(Ipv6Addr::LOCALHOST)];
        assert_eq!(peer.preferred_host(), Some("chapel.local".to_string()));
    }

    #[test]
    fn test_preferred_host_none_when_nothing_advertised() {
        let mut peer = make_peer();
        peer.addresses.clear();
        peer.host = None;
        assert_eq!(peer.preferred_host(), None);
    }

    // ── PeerContactCache ──────────────────────────────────────────────────────

    fn make_contact(host: &str) -> PeerContact {
        PeerContact {
            host: host.to_string(),
            port: 24890,
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30))],
            hostname: Some("chapel".to_string()),
            last_seen: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_cache_insert_then_get() {
        // Arrange
        let cache = PeerContactCache::new();
        let id = Uuid::new_v4();

        // Act
        cache.insert(id, make_contact("192.168.1.30"));

        // Assert
        assert_eq!(cache.get(id), Some(make_contact("192.168.1.30")));
    }

    #[test]
    fn test_cache_insert_replaces_previous_contact() {
        let cache = PeerContactCache::new();
        let id = Uuid::new_v4();
        cache.insert(id, make_contact("192.168.1.30"));
        cache.insert(id, make_contact("10.0.0.5"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(id).map(|c| c.host), Some("10.0.0.5".to_string()));
    }

    #[test]
    fn test_cache_remove_is_idempotent() {
        let cache = PeerContactCache::new();
        let id = Uuid::new_v4();
        cache.insert(id, make_contact("192.168.1.30"));

        assert!(cache.remove(id));
        assert!(!cache.remove(id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_clear_removes_everything() {
        let cache = PeerContactCache::new();
        cache.insert(Uuid::new_v4(), make_contact("192.168.1.30"));
        cache.insert(Uuid::new_v4(), make_contact("192.168.1.31"));

        cache.clear();

        assert!(cache.is_empty());
    }

    // ── endpoint_key ──────────────────────────────────────────────────────────

    #[test]
    fn test_endpoint_key_is_deterministic() {
        let a = endpoint_key("192.168.1.30", 24890, "PEM", Some("1234"));
        let b = endpoint_key("192.168.1.30", 24890, "PEM", Some("1234"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_key_changes_with_each_component() {
        let base = endpoint_key("192.168.1.30", 24890, "PEM", Some("1234"));

        assert_ne!(base, endpoint_key("192.168.1.31", 24890, "PEM", Some("1234")));
        assert_ne!(base, endpoint_key("192.168.1.30", 24891, "PEM", Some("1234")));
        assert_ne!(base, endpoint_key("192.168.1.30", 24890, "OTHER", Some("1234")));
        assert_ne!(base, endpoint_key("192.168.1.30", 24890, "PEM", Some("9999")));
        assert_ne!(base, endpoint_key("192.168.1.30", 24890, "PEM", None));
    }

    #[test]
    fn test_endpoint_key_host_port_split_is_unambiguous() {
        // "a:1" + port 21 must not hash like "a" + port 121 or similar.
        let a = endpoint_key("fe80::1", 2489, "PEM", None);
        let b = endpoint_key("fe80::12", 489, "PEM", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_endpoint_key_is_sha256_hex() {
        let key = endpoint_key("h", 1, "k", None);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
