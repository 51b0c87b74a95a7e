//! Peer commands and the command channel's frame types.
//!
//! Commands arrive as loose JSON (`{"type": "...", "payload": {...}}`)
//! because masters of different versions send different shapes.  Parsing is
//! deliberately tolerant: an unrecognized `type` is a valid
//! [`PeerCommand::Unknown`] so newer masters can talk to older followers,
//! while a recognized command with missing required data is an error the
//! dispatcher reports without dropping the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error type for peer command parsing.
#[derive(Debug, Error, PartialEq)]
pub enum CommandParseError {
    /// The command JSON has no string `type` field.
    #[error("command has no type field")]
    MissingType,

    /// An `open-presentation` command arrived without `payload.url`.
    #[error("open-presentation command is missing payload.url")]
    MissingUrl,
}

/// A command a master pushes to this follower.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Show the presentation served at `url`.
    OpenPresentation { url: String },
    /// Return to the idle screen (or close the window, per local config).
    ClosePresentation,
    /// A command type this version does not know.  Logged and ignored.
    Unknown { kind: String },
}

/// Parses a raw command value into a [`PeerCommand`].
///
/// # Errors
///
/// Returns [`CommandParseError::MissingType`] when the value carries no
/// string `type`, and [`CommandParseError::MissingUrl`] when an
/// `open-presentation` command has no usable `payload.url`.
pub fn parse_peer_command(value: &Value) -> Result<PeerCommand, CommandParseError> {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(CommandParseError::MissingType)?;

    match kind {
        "open-presentation" => {
            let url = value
                .get("payload")
                .and_then(|p| p.get("url"))
                .and_then(|u| u.as_str())
                .ok_or(CommandParseError::MissingUrl)?;
            Ok(PeerCommand::OpenPresentation {
                url: url.to_string(),
            })
        }
        "close-presentation" => Ok(PeerCommand::ClosePresentation),
        other => Ok(PeerCommand::Unknown {
            kind: other.to_string(),
        }),
    }
}

/// Frames the command hub sends to an authenticated follower.
///
/// Adjacently tagged JSON: `{"event": "auth-ack"}`,
/// `{"event": "auth-error", "data": "reason"}`,
/// `{"event": "peer-command", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum HubFrame {
    /// The authentication payload was accepted; commands will follow.
    AuthAck,
    /// The authentication payload was rejected; the hub closes after this.
    AuthError(String),
    /// A command relayed from the master, forwarded as raw JSON.
    PeerCommand(Value),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
