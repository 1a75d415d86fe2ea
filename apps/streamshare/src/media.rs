//! Local and remote media descriptions as the session layer sees them.
//!
//! Capture and rendering live outside this crate; a track here is an
//! identity plus a kind, enough to attach it to a connection and to tell
//! subscribers what arrived from whom.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Camera,
    Screen,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// A published bundle of local tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub kind: StreamKind,
    pub tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            id: id.into(),
            kind,
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, id: impl Into<String>, kind: TrackKind) -> Self {
        self.tracks.push(LocalTrack {
            id: id.into(),
            stream_id: self.id.clone(),
            kind,
        });
        self
    }

    /// Camera video plus microphone audio.
    pub fn camera(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), StreamKind::Camera)
            .with_track(format!("{id}-video"), TrackKind::Video)
            .with_track(format!("{id}-audio"), TrackKind::Audio)
    }

    pub fn screen(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), StreamKind::Screen).with_track(format!("{id}-video"), TrackKind::Video)
    }

    pub fn audio(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), StreamKind::Audio).with_track(format!("{id}-audio"), TrackKind::Audio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Everything received from one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer: String,
    pub tracks: Vec<RemoteTrack>,
}

/// Notifications delivered to `StreamShareClient::media_events` subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// First media received from `peer`.
    RemoteStream { peer: String, stream: RemoteStream },
    RemoteTrackAdded { peer: String, track: RemoteTrack },
    /// The peer left or its connection was torn down.
    RemoteStreamEnded { peer: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_stream_carries_video_and_audio() {
        let stream = MediaStream::camera("cam");
        assert_eq!(stream.kind, StreamKind::Camera);
        let kinds: Vec<TrackKind> = stream.tracks.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TrackKind::Video, TrackKind::Audio]);
        assert!(stream.tracks.iter().all(|t| t.stream_id == "cam"));
    }
}
