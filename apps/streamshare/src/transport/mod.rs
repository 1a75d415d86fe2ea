//! The connection-negotiation capability the engines drive.
//!
//! A `PeerTransport` is one peer connection: it builds and applies session
//! descriptions, accepts remote candidates and local tracks. Whatever it
//! discovers on its own (local candidates, remote tracks, connectivity
//! changes) is posted through its `TransportSink` into the client's event
//! loop rather than acted on in place.

pub mod mock;
pub mod webrtc;

use std::fmt;

use async_trait::async_trait;
use streamshare_proto::IceCandidate;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::NegotiationError;
use crate::media::{LocalTrack, RemoteTrack};

/// Monotonic per-client counter distinguishing successive transports opened
/// for the same peer.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub peer: String,
    pub generation: Generation,
    pub kind: TransportEventKind,
}

/// Posts a transport's callbacks into the owning event loop, stamped with
/// the peer and generation they belong to.
#[derive(Debug, Clone)]
pub struct TransportSink {
    peer: String,
    generation: Generation,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(
        peer: impl Into<String>,
        generation: Generation,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            peer: peer.into(),
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(TransportEventKind::RemoteTrack(track));
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.emit(TransportEventKind::StateChanged(state));
    }

    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!(peer = %self.peer, "event loop gone; transport event dropped");
        }
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Restarts connectivity in place. The next offer created on this
    /// transport carries fresh ICE credentials.
    async fn restart_connectivity(&self) -> Result<(), NegotiationError>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn open(
        &self,
        peer: &str,
        generation: Generation,
        sink: TransportSink,
    ) -> Result<Box<dyn PeerTransport>, NegotiationError>;
}
