//! Error taxonomy for the collaboration adapter.
//!
//! Transport-level failures ([`ConnectError`]) are absorbed by the session
//! task and retried; the editor only ever sees them flattened into the reason
//! string of [`crate::ConnectionStatus::Failed`]. Misuse of the adapter
//! ([`CallerError`]) is returned synchronously from the offending call.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::protocol::ProtocolError;

/// A single connection attempt failed. Every variant is recoverable and
/// feeds the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// The adapter was used in a way its lifecycle does not permit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerError {
    #[error("a session is already open on this adapter")]
    AlreadyOpen,
    #[error("adapter is in the failed state; call reset() before reopening")]
    ResetRequired,
}

/// Umbrella error returned by the public adapter API.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Caller(#[from] CallerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("session has ended")]
    SessionEnded,
}

impl CollabError {
    /// The caller-misuse kind, if this error is one.
    pub fn caller_error(&self) -> Option<CallerError> {
        match self {
            Self::Caller(e) => Some(*e),
            _ => None,
        }
    }
}
