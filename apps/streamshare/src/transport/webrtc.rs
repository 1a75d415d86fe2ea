use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use streamshare_proto::IceCandidate;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionState, Generation, PeerTransport, PeerTransportFactory, SdpKind,
    SessionDescription, TransportSink,
};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// ICE configuration shared by every peer connection a client opens.
#[derive(Clone, Debug)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
        }
    }
}

impl RtcConfig {
    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }

    pub fn with_turn(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
            ..Default::default()
        });
        self
    }
}

type SharedTracks = Arc<DashMap<String, Arc<TrackLocalStaticSample>>>;

/// Opens `webrtc` peer connections. A local track is backed by one
/// `TrackLocalStaticSample` shared across every connection it is attached to,
/// so a capture pipeline writes each sample once.
pub struct WebRtcTransportFactory {
    api: API,
    config: RtcConfig,
    tracks: SharedTracks,
}

impl WebRtcTransportFactory {
    pub fn new(config: RtcConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(NegotiationError::transport)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(NegotiationError::transport)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config,
            tracks: Arc::new(DashMap::new()),
        })
    }

    /// Sample writer behind a published local track, once it has been
    /// attached to at least one connection.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.get(id).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn open(
        &self,
        peer: &str,
        generation: Generation,
        sink: TransportSink,
    ) -> Result<Box<dyn PeerTransport>, NegotiationError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(NegotiationError::transport)?,
        );

        let candidate_sink = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => warn!(
                        target: "streamshare::negotiation",
                        peer = %sink.peer(),
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let track_sink = sink.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    sink.remote_track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                })
            },
        ));

        let state_sink = sink.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                Box::pin(async move {
                    if let Some(state) = map_state(state) {
                        sink.state_changed(state);
                    }
                })
            },
        ));

        debug!(
            target: "streamshare::negotiation",
            peer = %peer,
            generation,
            "opened peer connection"
        );

        Ok(Box::new(WebRtcTransport {
            peer_connection,
            tracks: self.tracks.clone(),
            ice_restart: AtomicBool::new(false),
        }))
    }
}

struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    tracks: SharedTracks,
    ice_restart: AtomicBool,
}

impl WebRtcTransport {
    /// An offer with nothing attached would negotiate no media at all, so
    /// ask to receive audio and video instead.
    async fn ensure_receivers(&self) -> Result<(), NegotiationError> {
        if !self.peer_connection.get_transceivers().await.is_empty() {
            return Ok(());
        }
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(NegotiationError::transport)?;
        }
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(NegotiationError::transport)
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_receivers().await?;
        let options = self
            .ice_restart
            .swap(false, Ordering::SeqCst)
            .then_some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(NegotiationError::transport)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(NegotiationError::transport)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(NegotiationError::transport)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(NegotiationError::transport)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(NegotiationError::transport)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sample_track = self
            .tracks
            .entry(track.id.clone())
            .or_insert_with(|| {
                Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind),
                    track.id.clone(),
                    track.stream_id.clone(),
                ))
            })
            .value()
            .clone();
        let sender = self
            .peer_connection
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(NegotiationError::transport)?;

        // RTCP has to be drained for the interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn restart_connectivity(&self) -> Result<(), NegotiationError> {
        self.ice_restart.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.peer_connection.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "streamshare::negotiation", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn turn_servers_are_appended() {
        let config = RtcConfig::localhost().with_turn("turn:relay.example:3478", "u", "p");
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "u");
    }

    #[test]
    fn codecs_follow_track_kind() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Video).mime_type, MIME_TYPE_VP8);
    }
}
