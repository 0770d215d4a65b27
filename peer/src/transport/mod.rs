// SPDX-License-Identifier: MPL-2.0

//! Abstraction over the native WebRTC peer connection.
//!
//! A [`TransportFactory`] builds one [`PeerTransport`] per
//! [`crate::PeerConnectionManager::initialize`] call. The transport reports
//! asynchronous happenings (connection state, gathered candidates, remote
//! tracks) through the [`EventSender`] it was created with.
//!
//! [`self::webrtc::WebRtcFactory`] is backed by webrtc-rs, [`loopback`]
//! links two transports in-process.

use async_trait::async_trait;
use audiolink_signalling_protocol as p;
use futures::channel::mpsc;
use std::sync::Arc;

use crate::config::IceServer;

pub mod loopback;
pub mod webrtc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Connection state as reported by the native peer connection
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

impl MediaTrack {
    pub fn audio(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MediaKind::Audio,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A set of tracks owned by the caller, e.g. a microphone capture
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks
            .iter()
            .filter(|track| track.kind == MediaKind::Audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq)]
/// Subset of the W3C statistics dictionaries the manager consumes.
///
/// Times are in seconds, as the native stack reports them.
pub enum StatsReport {
    InboundRtp {
        kind: MediaKind,
        packets_lost: i64,
        jitter: f64,
        audio_level: Option<f64>,
    },
    MediaSource {
        kind: MediaKind,
        audio_level: Option<f64>,
    },
    CandidatePair {
        state: CandidatePairState,
        nominated: bool,
        current_round_trip_time: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A local candidate was gathered and should be trickled to the remote peer
    IceCandidate(p::IceCandidate),
    /// The remote peer added a track
    Track(MediaTrack),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("invalid description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("peer connection is closed")]
    Closed,
    #[error("native peer connection error: {0}")]
    Native(String),
}

/// The native peer connection primitive
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<p::SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<p::SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError>;

    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: p::IceCandidate) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<Vec<StatsReport>, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
