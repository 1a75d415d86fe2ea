use streamshare_proto::ProtocolError;
use thiserror::Error;

use crate::negotiation::Phase;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{operation} not allowed for peer {peer} in phase {phase}")]
    StateConflict {
        peer: String,
        phase: Phase,
        operation: &'static str,
    },
    #[error("negotiation capability failed: {0}")]
    Transport(String),
    #[error("negotiation engine is closed")]
    Closed,
}

impl NegotiationError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        NegotiationError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("signaling server unavailable at {url}: {reason}")]
    ConnectionUnavailable { url: String, reason: String },
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
