//! Per-peer negotiation state machine.
//!
//! Initiator path: `idle -> have-local-offer -> stable`.
//! Responder path: `idle -> have-remote-offer -> stable`.
//! `closed` is terminal and reachable from anywhere.
//!
//! Every operation takes `&mut self`, so an engine never has two
//! negotiation steps outstanding at once. Offers that arrive while a
//! negotiation is already in flight are rejected rather than rolled back.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use streamshare_proto::{ClientMessage, IceCandidate};
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::Outbox;
use crate::transport::{ConnectionState, Generation, PeerTransport, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::HaveLocalOffer => "have-local-offer",
            Phase::HaveRemoteOffer => "have-remote-offer",
            Phase::Stable => "stable",
            Phase::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We joined after this peer and send the first offer.
    Initiator,
    /// This peer joined after us; we wait for its offer.
    Responder,
}

pub struct NegotiationEngine {
    peer: String,
    role: Role,
    phase: Phase,
    generation: Generation,
    transport: Option<Box<dyn PeerTransport>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    attached_tracks: HashSet<String>,
    remote_tracks: Vec<RemoteTrack>,
    restart_attempted: bool,
    renegotiate_pending: bool,
}

impl NegotiationEngine {
    pub fn new(
        peer: impl Into<String>,
        role: Role,
        generation: Generation,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer: peer.into(),
            role,
            phase: Phase::Idle,
            generation,
            transport: Some(transport),
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            attached_tracks: HashSet::new(),
            remote_tracks: Vec::new(),
            restart_attempted: false,
            renegotiate_pending: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map_or(ConnectionState::Closed, |transport| transport.connection_state())
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiate_pending
    }

    /// Queues an offer for when the in-flight negotiation reaches `stable`.
    pub fn request_renegotiation(&mut self) {
        if self.is_closed() {
            return;
        }
        self.renegotiate_pending = true;
        debug!(
            target: "streamshare::negotiation",
            peer = %self.peer,
            phase = %self.phase,
            "renegotiation deferred"
        );
    }

    async fn offer_if_pending(
        &mut self,
        tracks: &[LocalTrack],
        outbox: &Outbox,
    ) -> Result<(), NegotiationError> {
        if !std::mem::take(&mut self.renegotiate_pending) {
            return Ok(());
        }
        self.offer(tracks, outbox).await
    }

    fn transport(&self) -> Result<&dyn PeerTransport, NegotiationError> {
        self.transport.as_deref().ok_or(NegotiationError::Closed)
    }

    fn conflict(&self, operation: &'static str) -> NegotiationError {
        NegotiationError::StateConflict {
            peer: self.peer.clone(),
            phase: self.phase,
            operation,
        }
    }

    /// Attaches every track in `tracks` not already on this connection.
    pub async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), NegotiationError> {
        for track in tracks {
            if self.attached_tracks.contains(&track.id) {
                continue;
            }
            self.transport()?.add_track(track).await?;
            self.attached_tracks.insert(track.id.clone());
            debug!(
                target: "streamshare::negotiation",
                peer = %self.peer,
                track = %track.id,
                "attached local track"
            );
        }
        Ok(())
    }

    /// Sends an offer built from the attached tracks. Valid from `idle`
    /// (first negotiation) and `stable` (renegotiation).
    pub async fn offer(
        &mut self,
        tracks: &[LocalTrack],
        outbox: &Outbox,
    ) -> Result<(), NegotiationError> {
        if !matches!(self.phase, Phase::Idle | Phase::Stable) {
            return Err(self.conflict("offer"));
        }
        self.attach_tracks(tracks).await?;

        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        let sdp = offer.sdp.clone();
        transport.set_local_description(offer).await?;

        self.phase = Phase::HaveLocalOffer;
        outbox.send(ClientMessage::Offer {
            to: self.peer.clone(),
            sdp,
        });
        info!(
            target: "streamshare::negotiation",
            peer = %self.peer,
            phase = %self.phase,
            "sent offer"
        );
        Ok(())
    }

    /// Applies a remote offer and answers it. Only accepted from `idle` or
    /// `stable`; anything else is a collision and is rejected untouched.
    pub async fn handle_offer(
        &mut self,
        sdp: String,
        tracks: &[LocalTrack],
        outbox: &Outbox,
    ) -> Result<(), NegotiationError> {
        if !matches!(self.phase, Phase::Idle | Phase::Stable) {
            return Err(self.conflict("apply offer"));
        }

        self.transport()?
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.phase = Phase::HaveRemoteOffer;
        self.remote_description_applied().await;
        self.attach_tracks(tracks).await?;

        let transport = self.transport()?;
        let answer = transport.create_answer().await?;
        let sdp = answer.sdp.clone();
        transport.set_local_description(answer).await?;

        outbox.send(ClientMessage::Answer {
            to: self.peer.clone(),
            sdp,
        });
        self.phase = Phase::Stable;
        info!(
            target: "streamshare::negotiation",
            peer = %self.peer,
            phase = %self.phase,
            "answered offer"
        );
        self.offer_if_pending(tracks, outbox).await
    }

    /// Applies the peer's answer. A renegotiation requested meanwhile goes
    /// out as soon as the engine is `stable` again.
    pub async fn handle_answer(
        &mut self,
        sdp: String,
        tracks: &[LocalTrack],
        outbox: &Outbox,
    ) -> Result<(), NegotiationError> {
        if self.phase != Phase::HaveLocalOffer {
            return Err(self.conflict("apply answer"));
        }
        self.transport()?
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.phase = Phase::Stable;
        self.remote_description_applied().await;
        info!(
            target: "streamshare::negotiation",
            peer = %self.peer,
            phase = %self.phase,
            "negotiation complete"
        );
        self.offer_if_pending(tracks, outbox).await
    }

    /// Applies a remote candidate now, or holds it until a remote
    /// description exists.
    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                target: "streamshare::negotiation",
                peer = %self.peer,
                buffered = self.pending_candidates.len(),
                "buffered remote candidate"
            );
            return Ok(());
        }
        self.transport()?.add_ice_candidate(candidate).await
    }

    /// Forwards a locally discovered candidate to the peer, whatever the
    /// phase.
    pub fn forward_local_candidate(&self, candidate: IceCandidate, outbox: &Outbox) {
        if self.is_closed() {
            return;
        }
        outbox.send(ClientMessage::Ice {
            to: self.peer.clone(),
            candidate,
        });
    }

    async fn remote_description_applied(&mut self) {
        if self.remote_description_set {
            return;
        }
        self.remote_description_set = true;
        let Some(transport) = self.transport.as_deref() else {
            self.pending_candidates.clear();
            return;
        };
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(
                    target: "streamshare::negotiation",
                    peer = %self.peer,
                    error = %err,
                    "buffered candidate rejected"
                );
            }
        }
    }

    /// Reacts to a connectivity change reported by the transport. The first
    /// failure triggers one in-place restart and the initiator re-offers,
    /// immediately when `stable` or else once the current exchange settles.
    /// Later failures are only logged.
    pub async fn handle_connection_state(
        &mut self,
        state: ConnectionState,
        tracks: &[LocalTrack],
        outbox: &Outbox,
    ) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        match state {
            ConnectionState::Failed if !self.restart_attempted => {
                self.restart_attempted = true;
                warn!(
                    target: "streamshare::negotiation",
                    peer = %self.peer,
                    phase = %self.phase,
                    "connectivity failed; restarting"
                );
                self.transport()?.restart_connectivity().await?;
                if self.role == Role::Initiator {
                    if self.phase == Phase::Stable {
                        self.offer(tracks, outbox).await?;
                    } else {
                        self.renegotiate_pending = true;
                    }
                }
            }
            ConnectionState::Failed => {
                warn!(
                    target: "streamshare::negotiation",
                    peer = %self.peer,
                    "connectivity failed after restart; giving up"
                );
            }
            other => {
                debug!(
                    target: "streamshare::negotiation",
                    peer = %self.peer,
                    state = %other,
                    "connection state changed"
                );
            }
        }
        Ok(())
    }

    /// Records a track received from the peer. Returns true for the first
    /// one, which is when the peer's stream appears.
    pub fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        if self.is_closed() || self.remote_tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.remote_tracks.push(track);
        self.remote_tracks.len() == 1
    }

    /// Releases the transport and all per-peer state. Idempotent.
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.pending_candidates.clear();
        self.remote_tracks.clear();
        self.attached_tracks.clear();
        self.renegotiate_pending = false;
        if self.phase != Phase::Closed {
            self.phase = Phase::Closed;
            debug!(target: "streamshare::negotiation", peer = %self.peer, "engine closed");
        }
    }
}
