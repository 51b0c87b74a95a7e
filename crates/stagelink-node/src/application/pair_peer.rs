//! Follower-side pairing: the one-time handshake that pins a master's key.
//!
//! # How trust is established (for beginners)
//!
//! There is no certificate authority on a stage network.  Instead the
//! follower trusts the first key a master presents (trust-on-first-use) and
//! holds it against that master's instance id forever after:
//!
//! 1. Fetch the master's claimed public key over plain HTTP.
//! 2. Send a fresh random challenge.
//! 3. The master signs the challenge with its private key.
//! 4. Verify the signature, against the key *already on file* when this
//!    instance id was paired before, otherwise against the claimed key.
//!
//! Step 4 is the entire defence: a machine that answers on the same
//! address later but cannot sign with the pinned key fails verification,
//! and nothing about the stored record changes.
//!
//! Pairing is a single user-initiated action.  Every failure is returned
//! synchronously with a descriptive message and nothing is retried.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use stagelink_core::protocol::pairing::PublicKeyResponse;
use stagelink_core::{
    fingerprint, generate_challenge, verify, DiscoveredPeer, PairedMaster, PeerContact,
    PeerContactCache, TrustStore, TrustStoreError,
};

use crate::application::Clock;

/// Error type for the pairing handshake.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The candidate host did not answer.
    #[error("cannot reach {host}:{port}: {detail}")]
    Network {
        host: String,
        port: u16,
        detail: String,
    },

    /// The peer answered with something other than the pairing contract.
    #[error("{0}")]
    Protocol(String),

    /// The discovery layer advertised a different machine than the one
    /// answering on the candidate address.
    #[error("hostname mismatch: discovery advertised {expected:?} but the peer reports {reported:?}")]
    HostnameMismatch { expected: String, reported: String },

    /// The challenge came back with a signature the trusted key rejects.
    #[error("challenge signature verification failed for {host}:{port}")]
    SignatureVerificationFailed { host: String, port: u16 },

    /// The trust record could not be persisted.
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
}

/// HTTP surface of a remote master's pairing server, as seen by this
/// follower.  The node's infrastructure provides a `reqwest` implementation;
/// tests substitute a recording double.
#[async_trait]
pub trait PairingApi: Send + Sync {
    /// `GET /peer/public-key` on the candidate endpoint.
    async fn fetch_public_key(
        &self,
        host: &str,
        port: u16,
    ) -> Result<PublicKeyResponse, PairingError>;

    /// `POST /peer/challenge` on the candidate endpoint.  Returns the
    /// base64 signature the peer produced over the exact challenge bytes.
    async fn request_challenge_signature(
        &self,
        host: &str,
        port: u16,
        challenge: &str,
    ) -> Result<String, PairingError>;
}

/// The follower-side pairing use case.
pub struct PairingService {
    api: Arc<dyn PairingApi>,
    trust: Arc<dyn TrustStore>,
    contacts: Arc<PeerContactCache>,
    clock: Arc<dyn Clock>,
}

impl PairingService {
    pub fn new(
        api: Arc<dyn PairingApi>,
        trust: Arc<dyn TrustStore>,
        contacts: Arc<PeerContactCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            trust,
            contacts,
            clock,
        }
    }

    /// Pairs with a peer found via discovery.
    ///
    /// # Errors
    ///
    /// Returns a descriptive [`PairingError`] on the first failing step; no
    /// partial trust is ever stored.
    pub async fn pair_with_peer(
        &self,
        peer: &DiscoveredPeer,
    ) -> Result<PairedMaster, PairingError> {
        let host = peer.preferred_host().ok_or_else(|| {
            PairingError::Protocol(format!("peer {:?} advertises no reachable host", peer.name))
        })?;
        let port = peer.pairing_port.ok_or_else(|| {
            PairingError::Protocol(format!("peer {:?} advertises no pairing port", peer.name))
        })?;

        self.handshake(&host, port, Some(peer)).await
    }

    /// Pairs with a manually entered endpoint instead of a discovery
    /// descriptor.  The session-bootstrap PIN the user typed alongside the
    /// address is configuration, not part of this handshake; the caller
    /// persists it.
    pub async fn pair_with_peer_ip(
        &self,
        host: &str,
        port: u16,
    ) -> Result<PairedMaster, PairingError> {
        self.handshake(host, port, None).await
    }

    /// Removes the trust record and the cached contact for `master_id`.
    /// Returns whether anything was actually removed; unpairing an unknown
    /// id is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::TrustStore`] if the record exists but cannot
    /// be deleted from the backing store.
    pub fn unpair_peer(&self, master_id: Uuid) -> Result<bool, PairingError> {
        let removed_record = self.trust.remove(master_id)?;
        let removed_contact = self.contacts.remove(master_id);
        if removed_record {
            info!("unpaired master {master_id}");
        }
        Ok(removed_record || removed_contact)
    }

    /// Steps 2–7 of the handshake, shared by both pairing entry points.
    async fn handshake(
        &self,
        host: &str,
        port: u16,
        peer: Option<&DiscoveredPeer>,
    ) -> Result<PairedMaster, PairingError> {
        let response = self.api.fetch_public_key(host, port).await?;

        // A spoofed discovery record can point the follower at the wrong
        // machine; the machine's own answer is the authority.
        if let (Some(expected), Some(reported)) = (
            peer.and_then(|p| p.hostname.as_deref()),
            response.hostname.as_deref(),
        ) {
            if expected != reported {
                return Err(PairingError::HostnameMismatch {
                    expected: expected.to_string(),
                    reported: reported.to_string(),
                });
            }
        }

        let master_id = response
            .instance_id
            .or_else(|| peer.and_then(|p| p.instance_id))
            .ok_or_else(|| {
                PairingError::Protocol(format!("peer at {host}:{port} did not report an instance id"))
            })?;

        // Trust-on-first-use: an existing record pins the verification key.
        let existing = self.trust.get(master_id);
        let verification_key = existing
            .as_ref()
            .map(|record| record.public_key_pem.clone())
            .unwrap_or_else(|| response.public_key.clone());

        if let Some(advertised) = peer.and_then(|p| p.pub_key_fingerprint.as_deref()) {
            // The advertised fingerprint is a convenience hint, never the
            // trust anchor.
            if advertised != fingerprint(&response.public_key) {
                debug!("peer at {host}:{port} advertises a stale key fingerprint");
            }
        }

        let challenge = generate_challenge();
        let signature = self
            .api
            .request_challenge_signature(host, port, &challenge)
            .await?;
        if !verify(&verification_key, challenge.as_bytes(), &signature) {
            return Err(PairingError::SignatureVerificationFailed {
                host: host.to_string(),
                port,
            });
        }

        let now = self.clock.now_ms();
        let record = match existing {
            // Re-pairing only refreshes how to reach the master.
            Some(mut record) => {
                record.host_hint = Some(host.to_string());
                record.pairing_port_hint = Some(port);
                record
            }
            None => PairedMaster {
                instance_id: master_id,
                name: response
                    .instance_name
                    .clone()
                    .or_else(|| peer.map(|p| p.name.clone()))
                    .unwrap_or_else(|| host.to_string()),
                public_key_pem: verification_key,
                paired_at: now,
                host_hint: Some(host.to_string()),
                pairing_port_hint: Some(port),
                nat_compatibility: false,
            },
        };
        self.trust.upsert(record.clone())?;

        self.contacts.insert(
            master_id,
            PeerContact {
                host: host.to_string(),
                port,
                addresses: peer.map(|p| p.addresses.clone()).unwrap_or_default(),
                hostname: response
                    .hostname
                    .clone()
                    .or_else(|| peer.and_then(|p| p.hostname.clone())),
                last_seen: now,
            },
        );

        info!(
            "paired with {} ({master_id}) at {host}:{port}, key fingerprint {}",
            record.name,
            fingerprint(&record.public_key_pem)
        );
        Ok(record)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
