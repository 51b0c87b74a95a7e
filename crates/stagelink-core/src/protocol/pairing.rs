//! JSON bodies for the pairing HTTP endpoints.
//!
//! Field names on the wire are camelCase; the structs map them to
//! snake_case via `#[serde(rename_all = "camelCase")]`.  Everything in the
//! public-key response except the key itself is optional on the read side:
//! the pairing client validates what it needs and produces a descriptive
//! error instead of a deserialization failure when an older peer omits a
//! field.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response body of `GET /peer/public-key`.
///
/// Intentionally public identity information, no authentication.  Nothing
/// here is trusted until the challenge handshake proves the peer holds the
/// matching private key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    /// Identity the responder claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    /// Display name of the responder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// OS hostname of the responder; cross-checked against the discovery
    /// descriptor to catch a spoofed SRV record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// SPKI PEM public key.  The value the whole handshake exists to pin.
    pub public_key: String,
    /// SHA-256 hex fingerprint of `public_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_fingerprint: Option<String>,
    /// Responder's application version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Port the responder serves these pairing endpoints on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_port: Option<u16>,
}

/// Request body of `POST /peer/challenge`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeRequest {
    /// Base64 of 32 fresh random bytes.  The server signs these exact bytes.
    pub challenge: String,
}

/// Response body of `POST /peer/challenge`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeResponse {
    /// Base64 RSA-SHA256 signature over the challenge string.
    pub signature: String,
}

/// Error body used by every pairing/session endpoint (`{"error": "..."}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
