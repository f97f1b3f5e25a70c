//! Binary frame protocol spoken over the room channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ kind     │ client_id │ room_id  │ seq      │ payload  │
//! │ 1 byte   │ string    │ string   │ varint   │ bytes    │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Operation payloads are opaque to the adapter. Only `Join` carries a
//! structured payload (JSON-encoded [`PeerPresence`]) because user metadata
//! is an arbitrary JSON value that bincode cannot describe.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::SessionIdentity;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Local document operation (undoable edit)
    Update = 1,
    /// Ephemeral state such as cursors; never enters undo history
    Awareness = 2,
    /// Peer announced itself in the room
    Join = 3,
    /// Peer left the room
    Leave = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Presence announced on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub user_id: String,
    pub client_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl From<&SessionIdentity> for PeerPresence {
    fn from(identity: &SessionIdentity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            client_id: identity.client_id.clone(),
            metadata: identity.metadata.clone(),
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub client_id: String,
    pub room_id: String,
    /// Per-client sequence number, monotonically increasing per session
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(kind: FrameKind, identity: &SessionIdentity, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            client_id: identity.client_id.clone(),
            room_id: identity.room_id.clone(),
            seq,
            payload,
        }
    }

    pub fn update(identity: &SessionIdentity, seq: u64, op: Vec<u8>) -> Self {
        Self::new(FrameKind::Update, identity, seq, op)
    }

    pub fn awareness(identity: &SessionIdentity, seq: u64, state: Vec<u8>) -> Self {
        Self::new(FrameKind::Awareness, identity, seq, state)
    }

    pub fn join(identity: &SessionIdentity) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(&PeerPresence::from(identity))
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(FrameKind::Join, identity, 0, payload))
    }

    pub fn leave(identity: &SessionIdentity) -> Self {
        Self::new(FrameKind::Leave, identity, 0, Vec::new())
    }

    pub fn ping(identity: &SessionIdentity) -> Self {
        Self::new(FrameKind::Ping, identity, 0, Vec::new())
    }

    pub fn pong(identity: &SessionIdentity) -> Self {
        Self::new(FrameKind::Pong, identity, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format. Trailing bytes are malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after frame",
                bytes.len() - read
            )));
        }
        Ok(frame)
    }

    /// Parse the presence carried by a `Join` frame.
    pub fn presence(&self) -> Result<PeerPresence, ProtocolError> {
        if self.kind != FrameKind::Join {
            return Err(ProtocolError::UnexpectedKind(self.kind));
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// The channel delivered something the adapter cannot use.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unexpected frame kind {0:?}")]
    UnexpectedKind(FrameKind),
    #[error("text frames are not part of the protocol")]
    UnexpectedText,
}
