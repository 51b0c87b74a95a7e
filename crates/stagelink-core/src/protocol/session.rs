//! Signed session info and the authentication payload for the command
//! channel.
//!
//! A master hands out a short-lived session token over
//! `GET /peer/socket-info`, signed with its private key so the follower can
//! check, against the *pinned* key rather than whatever the network returned,
//! that the token really came from the paired master.  The follower then
//! presents the token, untouched, as the first frame on the WebSocket
//! connection.
//!
//! The signature covers the canonical string `token:expiresAt:socketPath`.
//! Both sides must build that string byte-for-byte identically, which is
//! why [`canonical_session_message`] is the single shared constructor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response body of `GET /peer/socket-info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Base URL to dial, e.g. `ws://192.168.1.10:24891`.
    pub socket_url: String,
    /// Path appended to `socket_url`, e.g. `/peer`.
    pub socket_path: String,
    /// Base64 of 32 random bytes; opaque to the follower.
    pub token: String,
    /// Expiry in milliseconds since the Unix epoch.
    pub expires_at: u64,
    /// Base64 RSA-SHA256 signature over the canonical message.
    pub signature: String,
}

impl SessionInfo {
    /// The string the issuer signed for this session.
    pub fn canonical_message(&self) -> String {
        canonical_session_message(&self.token, self.expires_at, &self.socket_path)
    }

    /// Whether the token is no longer valid at `now_ms`.
    ///
    /// The boundary instant counts as expired: a token must be strictly
    /// fresher than the clock to be used.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Builds the canonical signing message `token:expiresAt:socketPath`.
pub fn canonical_session_message(token: &str, expires_at: u64, socket_path: &str) -> String {
    format!("{token}:{expires_at}:{socket_path}")
}

/// First frame a follower sends on a new command channel connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Token from [`SessionInfo`], passed back unmodified.
    pub token: String,
    /// Expiry from [`SessionInfo`], passed back unmodified.
    pub expires_at: u64,
    /// Signature from [`SessionInfo`], passed back unmodified.
    pub signature: String,
    /// The follower's own identity, so the hub can register the connection.
    pub instance_id: Uuid,
    pub instance_name: String,
    pub hostname: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
