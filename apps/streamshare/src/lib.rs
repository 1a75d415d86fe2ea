//! StreamShare client core.
//!
//! A participant subscribes to the signaling server, starts or joins a
//! session, and negotiates a direct connection with every other member
//! (full mesh). Connection mechanics are delegated to a
//! [`transport::PeerTransportFactory`]; the `webrtc` crate backs the
//! default one.

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod orchestrator;
pub mod signaling;
pub mod transport;

pub use client::{ConnectionMode, StreamShareClient};
pub use config::{ClientOptions, SignalEndpoint};
pub use error::{ClientError, NegotiationError};
pub use media::{LocalTrack, MediaEvent, MediaStream, RemoteStream, RemoteTrack, StreamKind, TrackKind};
pub use negotiation::{NegotiationEngine, Phase, Role};
pub use orchestrator::{PeerSummary, SessionOrchestrator};
