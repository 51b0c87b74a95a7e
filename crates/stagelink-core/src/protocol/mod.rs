//! Protocol module containing the JSON wire types exchanged between peers.

pub mod command;
pub mod pairing;
pub mod session;

pub use command::{parse_peer_command, CommandParseError, HubFrame, PeerCommand};
pub use pairing::{ChallengeRequest, ChallengeResponse, ErrorBody, PublicKeyResponse};
pub use session::{canonical_session_message, AuthPayload, SessionInfo};
