//! In-memory negotiation capability for tests.
//!
//! Descriptions are plain text listing the attached tracks, so applying a
//! remote description can surface the peer's tracks the way a real
//! connection would. Every call is recorded and can be inspected through a
//! `MockHandle`, which also injects callbacks (candidates, state changes).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamshare_proto::IceCandidate;

use super::{
    ConnectionState, Generation, PeerTransport, PeerTransportFactory, SdpKind,
    SessionDescription, TransportSink,
};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocalDescription(SdpKind),
    SetRemoteDescription(SdpKind),
    AddIceCandidate(String),
    AddTrack(String),
    RestartConnectivity,
    Close,
}

struct Shared {
    peer: String,
    generation: Generation,
    calls: Mutex<Vec<TransportCall>>,
    state: Mutex<ConnectionState>,
    local_tracks: Mutex<Vec<LocalTrack>>,
    remote_tracks: Mutex<HashSet<String>>,
    restart_armed: AtomicBool,
    fail_remote_description: AtomicBool,
    stall_answers: AtomicBool,
    descriptions: AtomicU32,
    sink: TransportSink,
}

pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Test-side view of a `MockTransport`.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new(sink: TransportSink) -> (Self, MockHandle) {
        let shared = Arc::new(Shared {
            peer: sink.peer().to_string(),
            generation: sink.generation(),
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::New),
            local_tracks: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(HashSet::new()),
            restart_armed: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
            stall_answers: AtomicBool::new(false),
            descriptions: AtomicU32::new(0),
            sink,
        });
        (
            MockTransport {
                shared: shared.clone(),
            },
            MockHandle { shared },
        )
    }

    fn record(&self, call: TransportCall) {
        self.shared.calls.lock().push(call);
    }

    fn describe(&self, kind: SdpKind, ice_restart: bool) -> SessionDescription {
        let serial = self.shared.descriptions.fetch_add(1, Ordering::SeqCst);
        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        let mut sdp = format!(
            "v=0\r\ns=streamshare-mock {label} {serial}\r\na=generation:{}\r\n",
            self.shared.generation
        );
        if ice_restart {
            sdp.push_str("a=ice-restart\r\n");
        }
        for track in self.shared.local_tracks.lock().iter() {
            sdp.push_str(&format!(
                "a=track:{}:{}:{}\r\n",
                track.stream_id, track.id, track.kind
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn surface_remote_tracks(&self, sdp: &str) {
        for line in sdp.lines() {
            let Some(rest) = line.strip_prefix("a=track:") else {
                continue;
            };
            let mut parts = rest.splitn(3, ':');
            let (Some(stream_id), Some(id), Some(kind)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let kind = match kind {
                "audio" => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            if self.shared.remote_tracks.lock().insert(id.to_string()) {
                self.shared.sink.remote_track(RemoteTrack {
                    id: id.to_string(),
                    stream_id: stream_id.to_string(),
                    kind,
                });
            }
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let ice_restart = self.shared.restart_armed.swap(false, Ordering::SeqCst);
        self.record(TransportCall::CreateOffer { ice_restart });
        Ok(self.describe(SdpKind::Offer, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(TransportCall::CreateAnswer);
        if self.shared.stall_answers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.describe(SdpKind::Answer, false))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(TransportCall::SetLocalDescription(description.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(TransportCall::SetRemoteDescription(description.kind));
        if self.shared.fail_remote_description.load(Ordering::SeqCst) {
            return Err(NegotiationError::Transport(
                "scripted remote description failure".into(),
            ));
        }
        self.surface_remote_tracks(&description.sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(TransportCall::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(TransportCall::AddTrack(track.id.clone()));
        self.shared.local_tracks.lock().push(track.clone());
        Ok(())
    }

    async fn restart_connectivity(&self) -> Result<(), NegotiationError> {
        self.record(TransportCall::RestartConnectivity);
        self.shared.restart_armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    async fn close(&self) {
        self.record(TransportCall::Close);
        *self.shared.state.lock() = ConnectionState::Closed;
    }
}

impl MockHandle {
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn generation(&self) -> Generation {
        self.shared.generation
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.shared.calls.lock().clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.shared.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.calls.lock().contains(&TransportCall::Close)
    }

    /// Makes every later `set_remote_description` fail.
    pub fn fail_remote_description(&self) {
        self.shared
            .fail_remote_description
            .store(true, Ordering::SeqCst);
    }

    /// Makes every later `create_answer` hang after recording the call.
    pub fn stall_answers(&self) {
        self.shared.stall_answers.store(true, Ordering::SeqCst);
    }

    pub fn emit_local_candidate(&self, candidate: impl Into<String>) {
        self.shared
            .sink
            .local_candidate(IceCandidate::new(candidate));
    }

    /// Moves the connection to `state` and reports it.
    pub fn emit_state(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
        self.shared.sink.state_changed(state);
    }
}

/// Opens `MockTransport`s and keeps a handle to each one it opened.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    opened: Arc<Mutex<Vec<MockHandle>>>,
    stall_answers: Arc<AtomicBool>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports opened from now on never finish `create_answer`.
    pub fn stall_answers(&self) {
        self.stall_answers.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<MockHandle> {
        self.opened.lock().clone()
    }

    /// Most recently opened transport for `peer`.
    pub fn latest(&self, peer: &str) -> Option<MockHandle> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|handle| handle.peer() == peer)
            .cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn open(
        &self,
        _peer: &str,
        _generation: Generation,
        sink: TransportSink,
    ) -> Result<Box<dyn PeerTransport>, NegotiationError> {
        let (transport, handle) = MockTransport::new(sink);
        if self.stall_answers.load(Ordering::SeqCst) {
            handle.stall_answers();
        }
        self.opened.lock().push(handle);
        Ok(Box::new(transport))
    }
}
