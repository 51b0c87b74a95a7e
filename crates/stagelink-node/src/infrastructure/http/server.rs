//! The pairing HTTP server every network-mode instance runs.
//!
//! Four endpoints, all JSON:
//!
//! - `GET  /peer/public-key`  – this instance's identity and public key.
//! - `POST /peer/challenge`   – signs the caller's challenge string.
//! - `GET  /peer/socket-info` – issues a signed, short-lived session token
//!   for the command socket.  Requires the PIN when one is configured.
//! - `POST /peer/command`     – pushes a command frame to every follower
//!   connected to the local hub.
//!
//! The socket URL in a socket-info answer is derived from the `Host`
//! header the request arrived with: whatever address the caller used to
//! reach the pairing server is, from the caller's side of any NAT, also
//! the right address for the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Host, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagelink_core::protocol::pairing::{
    ChallengeRequest, ChallengeResponse, ErrorBody, PublicKeyResponse,
};
use stagelink_core::{
    canonical_session_message, fingerprint, generate_challenge, sign, HubFrame, SessionInfo,
};

use crate::application::{Clock, LocalIdentity};
use crate::infrastructure::channel::hub::CommandHub;
use crate::infrastructure::http::rate_limit::RateLimiter;

/// How long an issued session token stays redeemable.
pub const SESSION_TOKEN_TTL_MS: u64 = 5 * 60 * 1000;

/// Error type for the pairing server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen socket could not be bound.
    #[error("failed to bind pairing server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server loop ended with an I/O error.
    #[error("pairing server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Everything the handlers need, shared behind one `Arc`.
pub struct ServerState {
    pub identity: LocalIdentity,
    pub pairing_port: u16,
    pub socket_port: u16,
    pub socket_path: String,
    /// When set, socket-info requests must present this PIN.
    pub pin: Option<String>,
    pub limiter: RateLimiter,
    pub hub: Arc<CommandHub>,
    pub clock: Arc<dyn Clock>,
}

impl ServerState {
    fn deny_rate_limited(&self, addr: SocketAddr) -> Option<Response> {
        if self.limiter.check(addr.ip(), Instant::now()) {
            None
        } else {
            warn!("rate limited pairing request from {}", addr.ip());
            Some(error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "too many requests",
            ))
        }
    }
}

/// Binds the pairing listener.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the address is unusable.
pub async fn bind(bind_address: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("{bind_address}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })
}

/// Serves the pairing API on `listener` until `running` flips to false.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] if the accept loop dies.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!("pairing server listening on {addr}");
    }
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .map_err(ServerError::Serve)
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/peer/public-key", get(public_key))
        .route("/peer/challenge", post(challenge))
        .route("/peer/socket-info", get(socket_info))
        .route("/peer/command", post(command))
        .with_state(state)
}

async fn public_key(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if let Some(denied) = state.deny_rate_limited(addr) {
        return denied;
    }
    let body = PublicKeyResponse {
        instance_id: Some(state.identity.instance_id),
        instance_name: Some(state.identity.instance_name.clone()),
        hostname: Some(state.identity.hostname.clone()),
        public_key: state.identity.public_key_pem.clone(),
        public_key_fingerprint: Some(fingerprint(&state.identity.public_key_pem)),
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        pairing_port: Some(state.pairing_port),
    };
    Json(body).into_response()
}

async fn challenge(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<ChallengeRequest>, JsonRejection>,
) -> Response {
    if let Some(denied) = state.deny_rate_limited(addr) {
        return denied;
    }
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid challenge request: {rejection}"),
            );
        }
    };
    debug!("signing pairing challenge for {}", addr.ip());
    // The exact challenge bytes are signed, never a re-serialization.
    match sign(&state.identity.private_key_pem, request.challenge.as_bytes()) {
        Ok(signature) => Json(ChallengeResponse { signature }).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocketInfoQuery {
    instance_id: Option<Uuid>,
    pin: Option<String>,
}

async fn socket_info(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Host(host): Host,
    Query(query): Query<SocketInfoQuery>,
) -> Response {
    if let Some(denied) = state.deny_rate_limited(addr) {
        return denied;
    }
    if let Some(expected) = &state.pin {
        if query.pin.as_deref() != Some(expected.as_str()) {
            warn!("socket-info request from {} with a wrong pin", addr.ip());
            return error_response(StatusCode::UNAUTHORIZED, "invalid or missing pin");
        }
    }
    if let Some(follower) = query.instance_id {
        debug!("issuing session token for follower {follower}");
    }

    let token = generate_challenge();
    let expires_at = state.clock.now_ms() + SESSION_TOKEN_TTL_MS;
    let message = canonical_session_message(&token, expires_at, &state.socket_path);
    let signature = match sign(&state.identity.private_key_pem, message.as_bytes()) {
        Ok(signature) => signature,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    let body = SessionInfo {
        socket_url: format!("ws://{}:{}", host_without_port(&host), state.socket_port),
        socket_path: state.socket_path.clone(),
        token,
        expires_at,
        signature,
    };
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: serde_json::Value,
}

async fn command(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<CommandBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid command body: {rejection}"),
            );
        }
    };
    let delivered = state.hub.broadcast(&HubFrame::PeerCommand(body.command)).await;
    Json(serde_json::json!({ "delivered": delivered })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Strips the port from a `Host` header value.  Bracketed IPv6 literals
/// keep their brackets; they are part of the URL authority syntax.
fn host_without_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_without_port_strips_plain_ports() {
        assert_eq!(host_without_port("192.168.1.10:24890"), "192.168.1.10");
        assert_eq!(host_without_port("stage-pc.local:8080"), "stage-pc.local");
    }

    #[test]
    fn test_host_without_port_keeps_portless_hosts() {
        assert_eq!(host_without_port("192.168.1.10"), "192.168.1.10");
        assert_eq!(host_without_port("stage-pc.local"), "stage-pc.local");
    }

    #[test]
    fn test_host_without_port_keeps_ipv6_brackets() {
        assert_eq!(host_without_port("[::1]:24890"), "[::1]");
        assert_eq!(host_without_port("[fe80::1]"), "[fe80::1]");
    }
}
