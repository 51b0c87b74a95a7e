//! Follower-side WebSocket transport.
//!
//! `connect` dials `socket_url` + `socket_path`, sends the authentication
//! payload as the very first text frame, and hands the socket to a pump
//! task.  The pump translates hub frames into [`ChannelEvent`]s; the
//! supervisor never sees WebSocket types.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use stagelink_core::{AuthPayload, HubFrame};

use crate::application::channel_sync::{
    ChannelConnection, ChannelError, ChannelEvent, CommandTransport,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials masters with `tokio-tungstenite`.
pub struct WsCommandTransport {
    connect_timeout: Duration,
}

impl WsCommandTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Default for WsCommandTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandTransport for WsCommandTransport {
    async fn connect(
        &self,
        socket_url: &str,
        socket_path: &str,
        auth: AuthPayload,
    ) -> Result<ChannelConnection, ChannelError> {
        let target = format!("{}{}", socket_url.trim_end_matches('/'), socket_path);
        let parsed = Url::parse(&target).map_err(|e| ChannelError::Protocol {
            host: socket_url.to_string(),
            detail: format!("invalid socket url {target}: {e}"),
        })?;
        let host = parsed.host_str().unwrap_or("unknown").to_string();
        let port = parsed.port_or_known_default().unwrap_or(0);

        let (stream, _response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(&target),
        )
        .await
        .map_err(|_| ChannelError::Network {
            host: host.clone(),
            port,
            detail: "connect timeout".to_string(),
        })?
        .map_err(|e| ChannelError::Network {
            host: host.clone(),
            port,
            detail: e.to_string(),
        })?;

        let auth_frame = serde_json::to_string(&auth).map_err(|e| ChannelError::Protocol {
            host: host.clone(),
            detail: e.to_string(),
        })?;
        let (mut sink, stream) = stream.split();
        sink.send(Message::Text(auth_frame))
            .await
            .map_err(|e| ChannelError::Network {
                host,
                port,
                detail: e.to_string(),
            })?;

        let (events_tx, events) = mpsc::channel(32);
        let io_task = tokio::spawn(pump(sink, stream, events_tx));
        Ok(ChannelConnection { events, io_task })
    }
}

/// Reads hub frames until the socket dies, forwarding them as events.
/// Holds the sink only to answer pings; a split stream does not reply to
/// them automatically.
async fn pump(
    mut sink: SplitSink<ClientStream, Message>,
    mut stream: SplitStream<ClientStream>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await;
                break;
            }
            None => {
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        reason: "socket closed".to_string(),
                    })
                    .await;
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<HubFrame>(&text) {
                Ok(HubFrame::AuthAck) => {
                    if events.send(ChannelEvent::Connected).await.is_err() {
                        break;
                    }
                }
                Ok(HubFrame::AuthError(reason)) => {
                    let _ = events.send(ChannelEvent::ConnectError { detail: reason }).await;
                    break;
                }
                Ok(HubFrame::PeerCommand(command)) => {
                    if events.send(ChannelEvent::Command { command }).await.is_err() {
                        break;
                    }
                }
                Err(err) => debug!("ignoring unparseable channel frame: {err}"),
            },
            Message::Ping(payload) => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    let _ = events
                        .send(ChannelEvent::Disconnected {
                            reason: "ping reply failed".to_string(),
                        })
                        .await;
                    break;
                }
            }
            Message::Close(_) => {
                let _ = events
                    .send(ChannelEvent::Disconnected {
                        reason: "closed by master".to_string(),
                    })
                    .await;
                break;
            }
            _ => {}
        }
    }
}
