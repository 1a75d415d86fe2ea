//! Full-mesh topology: one negotiation engine per session peer.
//!
//! A peer listed in our own roster snapshot was there first, so we initiate
//! toward it. A peer announced by `peer-joined` arrived after us and will
//! initiate, so we only prepare a responder. Engines are keyed by peer
//! identity and replaced, never reused, when a peer reappears.

use std::collections::HashMap;
use std::sync::Arc;

use streamshare_proto::{ClientMessage, ServerMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::media::{LocalTrack, MediaEvent, MediaStream, RemoteStream};
use crate::negotiation::{NegotiationEngine, Phase, Role};
use crate::signaling::Outbox;
use crate::transport::{
    Generation, PeerTransportFactory, TransportEvent, TransportEventKind, TransportSink,
};

/// Snapshot of one engine, for callers outside the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer: String,
    pub role: Role,
    pub phase: Phase,
    pub pending_candidates: usize,
}

pub struct SessionOrchestrator {
    local_id: String,
    factory: Arc<dyn PeerTransportFactory>,
    outbox: Outbox,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    media: broadcast::Sender<MediaEvent>,
    engines: HashMap<String, NegotiationEngine>,
    local_tracks: Vec<LocalTrack>,
    remote_streams: HashMap<String, RemoteStream>,
    session: Option<String>,
    next_generation: Generation,
}

impl SessionOrchestrator {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn PeerTransportFactory>,
        outbox: Outbox,
        transport_events: mpsc::UnboundedSender<TransportEvent>,
        media: broadcast::Sender<MediaEvent>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            factory,
            outbox,
            transport_events,
            media,
            engines: HashMap::new(),
            local_tracks: Vec::new(),
            remote_streams: HashMap::new(),
            session: None,
            next_generation: 1,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn engine(&self, peer: &str) -> Option<&NegotiationEngine> {
        self.engines.get(peer)
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self
            .engines
            .values()
            .map(|engine| PeerSummary {
                peer: engine.peer().to_string(),
                role: engine.role(),
                phase: engine.phase(),
                pending_candidates: engine.pending_candidates(),
            })
            .collect();
        summaries.sort_by(|a, b| a.peer.cmp(&b.peer));
        summaries
    }

    pub fn start_session(&mut self, session_id: String) {
        self.request_session(session_id.clone(), ClientMessage::StartSession { session_id });
    }

    pub fn join_session(&mut self, session_id: String) {
        self.request_session(session_id.clone(), ClientMessage::JoinSession { session_id });
    }

    fn request_session(&mut self, session_id: String, request: ClientMessage) {
        if !self.outbox.send(request) {
            debug!(
                target: "streamshare::signaling",
                session = %session_id,
                "peer-only mode; session request not sent"
            );
        }
        self.session = Some(session_id);
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Subscribed { user_id } => {
                debug!(target: "streamshare::signaling", user = %user_id, "subscription acknowledged");
            }
            ServerMessage::Peers { peers } => {
                info!(
                    target: "streamshare::signaling",
                    roster = peers.len(),
                    "received session roster"
                );
                for peer in peers {
                    if peer == self.local_id {
                        continue;
                    }
                    if let Err(err) = self.initiate(&peer).await {
                        warn!(target: "streamshare::negotiation", peer = %peer, error = %err, "failed to start negotiation");
                    }
                }
            }
            ServerMessage::PeerJoined { user_id } => {
                if user_id == self.local_id {
                    return;
                }
                info!(target: "streamshare::signaling", peer = %user_id, "peer joined");
                if let Err(err) = self.replace_engine(&user_id, Role::Responder).await {
                    warn!(target: "streamshare::negotiation", peer = %user_id, error = %err, "failed to prepare responder");
                }
            }
            ServerMessage::PeerLeft { user_id } => {
                info!(target: "streamshare::signaling", peer = %user_id, "peer left");
                self.remove_peer(&user_id).await;
            }
            ServerMessage::Offer { from, sdp } => {
                if from == self.local_id {
                    return;
                }
                if let Err(err) = self.handle_offer(&from, sdp).await {
                    self.log_negotiation_error(&from, "offer", &err);
                }
            }
            ServerMessage::Answer { from, sdp } => {
                let Some(engine) = self.engines.get_mut(&from) else {
                    debug!(target: "streamshare::negotiation", peer = %from, "answer for unknown peer dropped");
                    return;
                };
                if let Err(err) = engine
                    .handle_answer(sdp, &self.local_tracks, &self.outbox)
                    .await
                {
                    self.log_negotiation_error(&from, "answer", &err);
                }
            }
            ServerMessage::Ice { from, candidate } => {
                let Some(engine) = self.engines.get_mut(&from) else {
                    debug!(target: "streamshare::negotiation", peer = %from, "candidate for unknown peer dropped");
                    return;
                };
                if let Err(err) = engine.handle_remote_candidate(candidate).await {
                    self.log_negotiation_error(&from, "ice", &err);
                }
            }
        }
    }

    async fn initiate(&mut self, peer: &str) -> Result<(), NegotiationError> {
        self.replace_engine(peer, Role::Initiator).await?;
        let Some(engine) = self.engines.get_mut(peer) else {
            return Ok(());
        };
        engine.offer(&self.local_tracks, &self.outbox).await
    }

    async fn handle_offer(&mut self, peer: &str, sdp: String) -> Result<(), NegotiationError> {
        let usable = self
            .engines
            .get(peer)
            .is_some_and(|engine| !engine.is_closed());
        if !usable {
            self.replace_engine(peer, Role::Responder).await?;
        }
        let Some(engine) = self.engines.get_mut(peer) else {
            return Ok(());
        };
        engine.handle_offer(sdp, &self.local_tracks, &self.outbox).await
    }

    async fn replace_engine(&mut self, peer: &str, role: Role) -> Result<(), NegotiationError> {
        if self.engines.contains_key(peer) {
            self.remove_peer(peer).await;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let sink = TransportSink::new(peer, generation, self.transport_events.clone());
        let transport = self.factory.open(peer, generation, sink).await?;
        self.engines.insert(
            peer.to_string(),
            NegotiationEngine::new(peer, role, generation, transport),
        );
        debug!(
            target: "streamshare::negotiation",
            peer = %peer,
            role = ?role,
            generation,
            "engine created"
        );
        Ok(())
    }

    async fn remove_peer(&mut self, peer: &str) {
        if let Some(mut engine) = self.engines.remove(peer) {
            engine.close().await;
        }
        if self.remote_streams.remove(peer).is_some() {
            let _ = self.media.send(MediaEvent::RemoteStreamEnded {
                peer: peer.to_string(),
            });
        }
    }

    /// Applies a callback from a transport, unless it came from one that
    /// has since been replaced or closed.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(engine) = self.engines.get_mut(&event.peer) else {
            return;
        };
        if engine.generation() != event.generation || engine.is_closed() {
            debug!(
                target: "streamshare::negotiation",
                peer = %event.peer,
                generation = event.generation,
                "stale transport event discarded"
            );
            return;
        }

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                engine.forward_local_candidate(candidate, &self.outbox);
            }
            TransportEventKind::StateChanged(state) => {
                if let Err(err) = engine
                    .handle_connection_state(state, &self.local_tracks, &self.outbox)
                    .await
                {
                    self.log_negotiation_error(&event.peer, "restart", &err);
                }
            }
            TransportEventKind::RemoteTrack(track) => {
                if !engine.add_remote_track(track.clone()) {
                    if let Some(stream) = self.remote_streams.get_mut(&event.peer) {
                        if !stream.tracks.contains(&track) {
                            stream.tracks.push(track.clone());
                            let _ = self.media.send(MediaEvent::RemoteTrackAdded {
                                peer: event.peer.clone(),
                                track,
                            });
                        }
                    }
                    return;
                }
                let stream = RemoteStream {
                    peer: event.peer.clone(),
                    tracks: vec![track],
                };
                self.remote_streams
                    .insert(event.peer.clone(), stream.clone());
                info!(target: "streamshare::negotiation", peer = %event.peer, "remote stream available");
                let _ = self.media.send(MediaEvent::RemoteStream {
                    peer: event.peer,
                    stream,
                });
            }
        }
    }

    /// Adds `stream`'s tracks to the local set and brings every engine up to
    /// date. Negotiated connections renegotiate now. Untouched ones attach
    /// and carry the tracks in their first exchange. Connections
    /// mid-negotiation renegotiate once the exchange in flight settles.
    pub async fn publish(&mut self, stream: MediaStream) {
        for track in stream.tracks {
            if !self.local_tracks.iter().any(|t| t.id == track.id) {
                self.local_tracks.push(track);
            }
        }

        let peers: Vec<String> = self.engines.keys().cloned().collect();
        for peer in peers {
            let Some(engine) = self.engines.get_mut(&peer) else {
                continue;
            };
            let result = match engine.phase() {
                Phase::Stable => engine.offer(&self.local_tracks, &self.outbox).await,
                Phase::Idle => engine.attach_tracks(&self.local_tracks).await,
                _ => {
                    engine.request_renegotiation();
                    Ok(())
                }
            };
            if let Err(err) = result {
                self.log_negotiation_error(&peer, "publish", &err);
            }
        }
    }

    /// The signaling channel is gone: nothing can be negotiated anymore.
    pub async fn channel_closed(&mut self) {
        warn!(target: "streamshare::signaling", engines = self.engines.len(), "signaling channel closed");
        self.outbox.detach();
        self.session = None;
        self.close_engines().await;
    }

    /// Leaves the joined session, if any, and tears down every engine.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.outbox.send(ClientMessage::LeaveSession);
            info!(target: "streamshare::signaling", session = %session, "left session");
        }
        self.close_engines().await;
    }

    async fn close_engines(&mut self) {
        let peers: Vec<String> = self.engines.keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer).await;
        }
    }

    fn log_negotiation_error(&self, peer: &str, operation: &str, err: &NegotiationError) {
        match err {
            NegotiationError::StateConflict { .. } => {
                warn!(target: "streamshare::negotiation", peer = %peer, operation, error = %err, "message dropped")
            }
            _ => {
                warn!(target: "streamshare::negotiation", peer = %peer, operation, error = %err, "negotiation step failed")
            }
        }
    }
}
