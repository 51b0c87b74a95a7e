//! HTTP client side of the pairing protocol.
//!
//! One `reqwest` client implements both follower-facing traits: the
//! pairing handshake ([`PairingApi`]) and the per-tick session fetch
//! ([`SessionApi`]).  Peers speak plain HTTP on the LAN; confidentiality
//! of commands was never a goal, authenticity is, and that comes from the
//! signatures, not the transport.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use stagelink_core::protocol::pairing::{
    ChallengeRequest, ChallengeResponse, ErrorBody, PublicKeyResponse,
};
use stagelink_core::SessionInfo;

use crate::application::channel_sync::{ChannelError, SessionApi};
use crate::application::pair_peer::{PairingApi, PairingError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for client construction.
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Talks to other instances' pairing servers.
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    /// # Errors
    ///
    /// Returns [`HttpClientError::Build`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, HttpClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    fn base_url(host: &str, port: u16) -> String {
        format!("http://{}:{port}", bracket_ipv6(host))
    }
}

#[async_trait]
impl PairingApi for HttpPeerClient {
    async fn fetch_public_key(
        &self,
        host: &str,
        port: u16,
    ) -> Result<PublicKeyResponse, PairingError> {
        let url = format!("{}/peer/public-key", Self::base_url(host, port));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PairingError::Network {
                host: host.to_string(),
                port,
                detail: e.to_string(),
            })?;
        read_json(response).await.map_err(|detail| {
            PairingError::Protocol(format!("public-key request to {host}:{port} failed: {detail}"))
        })
    }

    async fn request_challenge_signature(
        &self,
        host: &str,
        port: u16,
        challenge: &str,
    ) -> Result<String, PairingError> {
        let url = format!("{}/peer/challenge", Self::base_url(host, port));
        let response = self
            .http
            .post(&url)
            .json(&ChallengeRequest {
                challenge: challenge.to_string(),
            })
            .send()
            .await
            .map_err(|e| PairingError::Network {
                host: host.to_string(),
                port,
                detail: e.to_string(),
            })?;
        let body: ChallengeResponse = read_json(response).await.map_err(|detail| {
            PairingError::Protocol(format!("challenge request to {host}:{port} failed: {detail}"))
        })?;
        Ok(body.signature)
    }
}

#[async_trait]
impl SessionApi for HttpPeerClient {
    async fn fetch_socket_info<'a>(
        &self,
        host: &str,
        port: u16,
        instance_id: Uuid,
        pin: Option<&'a str>,
    ) -> Result<SessionInfo, ChannelError> {
        let url = format!("{}/peer/socket-info", Self::base_url(host, port));
        let mut request = self
            .http
            .get(&url)
            .query(&[("instanceId", instance_id.to_string())]);
        if let Some(pin) = pin {
            request = request.query(&[("pin", pin)]);
        }
        let response = request.send().await.map_err(|e| ChannelError::Network {
            host: host.to_string(),
            port,
            detail: e.to_string(),
        })?;
        read_json(response)
            .await
            .map_err(|detail| ChannelError::Protocol {
                host: host.to_string(),
                detail,
            })
    }
}

/// Decodes a 2xx JSON body.  A non-2xx answer becomes the server's own
/// `error` message when it sent one, the bare status line otherwise.
async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, String> {
    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        return Err(format!("status {}: {detail}", status.as_u16()));
    }
    response.json::<T>().await.map_err(|e| e.to_string())
}

/// Literal IPv6 addresses need brackets in a URL authority.
fn bracket_ipv6(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{host}]"))
    } else {
        Cow::Borrowed(host)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
