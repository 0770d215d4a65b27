// SPDX-License-Identifier: MPL-2.0

//! [`PeerTransport`] on top of the webrtc-rs peer connection.
//!
//! Local audio is sent as Opus through one [`TrackLocalStaticSample`] per
//! added track. The samples themselves are written by the embedding
//! application, see [`WebRtcFactory::local_track`].

use async_trait::async_trait;
use audiolink_signalling_protocol as p;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::ice::candidate::CandidatePairState as NativePairState;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use ::webrtc::stats::StatsReportType;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_local::TrackLocal;

use super::{
    CandidatePairState, EventSender, MediaKind, MediaTrack, PeerTransport, RtcConfiguration,
    StatsReport, TransportError, TransportEvent, TransportFactory, TransportState,
};
use crate::config::AudioConstraints;

/// RTP clock rate and channel count of Opus in SDP, whatever is captured
const OPUS_CLOCK_RATE: u32 = 48000;
const OPUS_CHANNELS: u16 = 2;
const OPUS_PAYLOAD_TYPE: u8 = 111;

const STREAM_ID: &str = "audiolink";

fn native_error(err: ::webrtc::Error) -> TransportError {
    TransportError::Native(err.to_string())
}

/// Opus codec capability for the given capture constraints.
///
/// The RTP clock and channel count are fixed for Opus, the constraints go
/// into the format parameters.
pub fn opus_capability(constraints: &AudioConstraints) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: OPUS_CLOCK_RATE,
        channels: OPUS_CHANNELS,
        sdp_fmtp_line: format!(
            "minptime=10;useinbandfec=1;stereo={};sprop-stereo={};maxplaybackrate={};maxaveragebitrate={}",
            u8::from(constraints.channel_count > 1),
            u8::from(constraints.channel_count > 1),
            constraints.sample_rate,
            constraints.bitrate,
        ),
        rtcp_feedback: vec![],
    }
}

fn ice_servers(config: &RtcConfiguration) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

pub(crate) fn native_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(config),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

pub(crate) fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn candidate_pair_state(state: NativePairState) -> CandidatePairState {
    match state {
        NativePairState::Waiting => CandidatePairState::Waiting,
        NativePairState::InProgress => CandidatePairState::InProgress,
        NativePairState::Failed => CandidatePairState::Failed,
        NativePairState::Succeeded => CandidatePairState::Succeeded,
        _ => CandidatePairState::Frozen,
    }
}

fn media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

/// Translates native reports.
///
/// webrtc-rs reports neither receive jitter nor receive loss, so the audio
/// inbound report carries the loss the remote peer observed in its receiver
/// reports, and no jitter.
pub(crate) fn stats_reports<'a>(
    reports: impl IntoIterator<Item = &'a StatsReportType>,
) -> Vec<StatsReport> {
    let mut converted = vec![];
    let mut audio_inbound = false;
    let mut audio_remote_loss = None;

    for report in reports {
        match report {
            StatsReportType::InboundRTP(inbound) => match media_kind(&inbound.kind) {
                Some(MediaKind::Audio) => audio_inbound = true,
                Some(kind) => converted.push(StatsReport::InboundRtp {
                    kind,
                    packets_lost: 0,
                    jitter: 0.,
                    audio_level: None,
                }),
                None => (),
            },
            StatsReportType::RemoteInboundRTP(remote)
                if media_kind(&remote.kind) == Some(MediaKind::Audio) =>
            {
                *audio_remote_loss.get_or_insert(0) += remote.packets_lost;
            }
            StatsReportType::CandidatePair(pair) => converted.push(StatsReport::CandidatePair {
                state: candidate_pair_state(pair.state),
                nominated: pair.nominated,
                current_round_trip_time: (pair.current_round_trip_time > 0.)
                    .then_some(pair.current_round_trip_time),
            }),
            _ => (),
        }
    }

    if audio_inbound || audio_remote_loss.is_some() {
        converted.push(StatsReport::InboundRtp {
            kind: MediaKind::Audio,
            packets_lost: audio_remote_loss.unwrap_or(0),
            jitter: 0.,
            audio_level: None,
        });
    }

    converted
}

fn session_description(
    description: &p::SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description.sdp.clone();
    match description.sdp_type {
        p::SdpType::Offer => RTCSessionDescription::offer(sdp),
        p::SdpType::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|err| TransportError::InvalidDescription(err.to_string()))
}

fn from_native_description(
    description: RTCSessionDescription,
) -> Result<p::SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(p::SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => {
            Ok(p::SessionDescription::answer(description.sdp))
        }
        other => Err(TransportError::InvalidDescription(format!(
            "unsupported description type {other}"
        ))),
    }
}

type LocalTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

/// Builds webrtc-rs peer connections sending Opus shaped by
/// [`AudioConstraints`]
#[derive(Clone)]
pub struct WebRtcFactory {
    api: Arc<API>,
    constraints: AudioConstraints,
    local_tracks: LocalTracks,
}

impl WebRtcFactory {
    pub fn new(constraints: AudioConstraints) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(&constraints),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(native_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(native_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            constraints,
            local_tracks: Arc::default(),
        })
    }

    pub fn constraints(&self) -> &AudioConstraints {
        &self.constraints
    }

    /// The sample sink backing the local track with id `track_id`, for the
    /// application to write encoded Opus frames to
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().unwrap().get(track_id).cloned()
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(native_configuration(config))
                .await
                .map_err(native_error)?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Native peer connection state changed");
            let event = TransportEvent::StateChanged(transport_state(state));
            let _ = state_events.unbounded_send(event);
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.unbounded_send(TransportEvent::IceCandidate(
                            p::IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index.map(u32::from),
                            },
                        ));
                    }
                    Err(err) => warn!("Failed to serialize local candidate: {}", err),
                }
            }
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let _ = track_events.unbounded_send(TransportEvent::Track(MediaTrack {
                id: track.id(),
                kind,
                label: track.stream_id(),
            }));
            Box::pin(async {})
        }));

        info!(
            ice_servers = config.ice_servers.len(),
            pool_size = config.ice_candidate_pool_size,
            "Created native peer connection"
        );

        Ok(Arc::new(WebRtcTransport {
            pc,
            capability: opus_capability(&self.constraints),
            local_tracks: self.local_tracks.clone(),
            has_remote_description: AtomicBool::new(false),
        }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    capability: RTCRtpCodecCapability,
    local_tracks: LocalTracks,
    has_remote_description: AtomicBool,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            self.capability.clone(),
            track.id.clone(),
            STREAM_ID.to_owned(),
        ));

        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(native_error)?;

        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            trace!("RTCP reader ended");
        });

        self.local_tracks
            .lock()
            .unwrap()
            .insert(track.id.clone(), local);

        Ok(())
    }

    async fn create_offer(&self) -> Result<p::SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(native_error)?;

        from_native_description(offer)
    }

    async fn create_answer(&self) -> Result<p::SessionDescription, TransportError> {
        if !self.has_remote_description() {
            return Err(TransportError::NoRemoteDescription);
        }

        let answer = self.pc.create_answer(None).await.map_err(native_error)?;

        from_native_description(answer)
    }

    async fn set_local_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(session_description(&description)?)
            .await
            .map_err(|err| TransportError::InvalidDescription(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(session_description(&description)?)
            .await
            .map_err(|err| TransportError::InvalidDescription(err.to_string()))?;
        self.has_remote_description.store(true, Ordering::SeqCst);

        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.has_remote_description.load(Ordering::SeqCst)
    }

    async fn add_ice_candidate(&self, candidate: p::IceCandidate) -> Result<(), TransportError> {
        if !self.has_remote_description() {
            return Err(TransportError::NoRemoteDescription);
        }

        let sdp_mline_index = candidate
            .sdp_m_line_index
            .map(u16::try_from)
            .transpose()
            .map_err(|_| TransportError::InvalidCandidate(candidate.candidate.clone()))?;

        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| {
                debug!("Rejected candidate {}: {}", candidate.candidate, err);
                TransportError::InvalidCandidate(candidate.candidate)
            })
    }

    async fn stats(&self) -> Result<Vec<StatsReport>, TransportError> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(TransportError::Closed);
        }

        let report = self.pc.get_stats().await;

        Ok(stats_reports(report.reports.values()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!("Failed to close native peer connection: {}", err);
        }
        self.local_tracks.lock().unwrap().clear();
    }
}
