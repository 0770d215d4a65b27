// SPDX-License-Identifier: MPL-2.0

//! In-process transport pairs.
//!
//! The two ends of a [`LoopbackNetwork`] pair report `connected` as soon as
//! both of them hold a local and a remote description. Each end can be
//! inspected and poked through its [`LoopbackFactory`], which makes the pair
//! usable as a stand-in for a real network in tests and offline demos.

use async_trait::async_trait;
use audiolink_signalling_protocol as p;
use std::fmt::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::{
    CandidatePairState, EventSender, MediaKind, MediaTrack, PeerTransport, RtcConfiguration,
    StatsReport, TransportError, TransportEvent, TransportFactory, TransportState,
};

#[derive(Default)]
struct Endpoint {
    events: Option<EventSender>,
    local: Option<p::SessionDescription>,
    remote: Option<p::SessionDescription>,
    tracks: Vec<MediaTrack>,
    remote_candidates: Vec<p::IceCandidate>,
    state: TransportState,
    stats: Option<Vec<StatsReport>>,
    stats_requests: usize,
    gathered: u32,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.as_ref() {
            trace!("emitting {:?}", event);
            let _ = events.unbounded_send(event);
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            self.state = state;
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state == TransportState::Closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn default_stats(&self) -> Vec<StatsReport> {
        let connected = self.state == TransportState::Connected;

        vec![
            StatsReport::MediaSource {
                kind: MediaKind::Audio,
                audio_level: Some(0.5),
            },
            StatsReport::InboundRtp {
                kind: MediaKind::Audio,
                packets_lost: 0,
                jitter: 0.002,
                audio_level: Some(0.5),
            },
            StatsReport::CandidatePair {
                state: if connected {
                    CandidatePairState::Succeeded
                } else {
                    CandidatePairState::InProgress
                },
                nominated: connected,
                current_round_trip_time: Some(0.001),
            },
        ]
    }
}

#[derive(Default)]
struct Link {
    endpoints: [Endpoint; 2],
}

impl Link {
    fn maybe_connect(&mut self) {
        let ready = self.endpoints.iter().all(|endpoint| {
            endpoint.events.is_some()
                && endpoint.local.is_some()
                && endpoint.remote.is_some()
                && endpoint.state == TransportState::New
        });

        if !ready {
            return;
        }

        debug!("both ends negotiated, connecting");

        for endpoint in self.endpoints.iter_mut() {
            endpoint.set_state(TransportState::Connecting);
        }
        for endpoint in self.endpoints.iter_mut() {
            endpoint.set_state(TransportState::Connected);
        }
    }
}

fn session_description_text(side: usize, tracks: &[MediaTrack]) -> String {
    let mut sdp = format!("v=0\r\no=- {side} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    for (index, track) in tracks.iter().enumerate() {
        let _ = write!(
            sdp,
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:{index}\r\na=msid:- {}\r\na=rtpmap:111 opus/48000/2\r\n",
            track.id
        );
    }

    sdp
}

/// Creates linked pairs of in-process transports
pub struct LoopbackNetwork;

impl LoopbackNetwork {
    pub fn pair() -> (LoopbackFactory, LoopbackFactory) {
        let link = Arc::new(Mutex::new(Link::default()));

        (
            LoopbackFactory {
                link: link.clone(),
                side: 0,
            },
            LoopbackFactory { link, side: 1 },
        )
    }
}

/// One end of a loopback pair
#[derive(Clone)]
pub struct LoopbackFactory {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl LoopbackFactory {
    /// Overrides the reports returned by the statistics API
    pub fn set_stats(&self, stats: Vec<StatsReport>) {
        self.link.lock().unwrap().endpoints[self.side].stats = Some(stats);
    }

    /// Number of times the statistics API was queried
    pub fn stats_requests(&self) -> usize {
        self.link.lock().unwrap().endpoints[self.side].stats_requests
    }

    /// Pretends the native stack changed state, e.g. after losing the network
    pub fn simulate_state(&self, state: TransportState) {
        self.link.lock().unwrap().endpoints[self.side].set_state(state);
    }

    pub fn state(&self) -> TransportState {
        self.link.lock().unwrap().endpoints[self.side].state
    }

    /// Remote candidates applied so far, in order
    pub fn remote_candidates(&self) -> Vec<p::IceCandidate> {
        self.link.lock().unwrap().endpoints[self.side]
            .remote_candidates
            .clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.link.lock().unwrap().endpoints[self.side].tracks.clone()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: EventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        debug!(
            side = self.side,
            ice_servers = config.ice_servers.len(),
            "creating loopback transport"
        );

        // Test hooks installed before the transport exists stay in effect
        let mut link = self.link.lock().unwrap();
        let endpoint = &mut link.endpoints[self.side];
        *endpoint = Endpoint {
            events: Some(events),
            stats: endpoint.stats.take(),
            stats_requests: endpoint.stats_requests,
            ..Default::default()
        };
        drop(link);

        Ok(Arc::new(LoopbackTransport {
            link: self.link.clone(),
            side: self.side,
        }))
    }
}

struct LoopbackTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl LoopbackTransport {
    fn other(&self) -> usize {
        1 - self.side
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        let endpoint = &mut link.endpoints[self.side];
        endpoint.ensure_open()?;
        endpoint.tracks.push(track.clone());

        Ok(())
    }

    async fn create_offer(&self) -> Result<p::SessionDescription, TransportError> {
        let link = self.link.lock().unwrap();
        let endpoint = &link.endpoints[self.side];
        endpoint.ensure_open()?;

        Ok(p::SessionDescription::offer(session_description_text(
            self.side,
            &endpoint.tracks,
        )))
    }

    async fn create_answer(&self) -> Result<p::SessionDescription, TransportError> {
        let link = self.link.lock().unwrap();
        let endpoint = &link.endpoints[self.side];
        endpoint.ensure_open()?;

        match endpoint.remote.as_ref() {
            None => Err(TransportError::NoRemoteDescription),
            Some(remote) if remote.sdp_type != p::SdpType::Offer => Err(
                TransportError::InvalidDescription("remote description is not an offer".into()),
            ),
            Some(_) => Ok(p::SessionDescription::answer(session_description_text(
                self.side,
                &endpoint.tracks,
            ))),
        }
    }

    async fn set_local_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        let endpoint = &mut link.endpoints[self.side];
        endpoint.ensure_open()?;

        if description.sdp_type == p::SdpType::Answer && endpoint.remote.is_none() {
            return Err(TransportError::InvalidDescription(
                "can't set a local answer without a remote offer".into(),
            ));
        }

        endpoint.local = Some(description);

        // Gathering starts once the local description is in place
        endpoint.gathered += 1;
        let candidate = p::IceCandidate {
            candidate: format!(
                "candidate:{}{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.side,
                endpoint.gathered,
                50000 + self.side * 100 + endpoint.gathered as usize
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        endpoint.emit(TransportEvent::IceCandidate(candidate));

        link.maybe_connect();

        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        link.endpoints[self.side].ensure_open()?;

        if description.sdp.trim().is_empty() {
            return Err(TransportError::InvalidDescription("empty SDP".into()));
        }

        let remote_tracks = link.endpoints[self.other()].tracks.clone();
        let endpoint = &mut link.endpoints[self.side];
        endpoint.remote = Some(description);
        for track in remote_tracks {
            endpoint.emit(TransportEvent::Track(track));
        }

        link.maybe_connect();

        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.link.lock().unwrap().endpoints[self.side]
            .remote
            .is_some()
    }

    async fn add_ice_candidate(&self, candidate: p::IceCandidate) -> Result<(), TransportError> {
        let mut link = self.link.lock().unwrap();
        let endpoint = &mut link.endpoints[self.side];
        endpoint.ensure_open()?;

        if endpoint.remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }

        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }

        endpoint.remote_candidates.push(candidate);

        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatsReport>, TransportError> {
        let mut link = self.link.lock().unwrap();
        let endpoint = &mut link.endpoints[self.side];
        endpoint.ensure_open()?;
        endpoint.stats_requests += 1;

        Ok(endpoint
            .stats
            .clone()
            .unwrap_or_else(|| endpoint.default_stats()))
    }

    async fn close(&self) {
        let mut link = self.link.lock().unwrap();
        link.endpoints[self.side].set_state(TransportState::Closed);

        let other = &mut link.endpoints[self.other()];
        if matches!(
            other.state,
            TransportState::Connecting | TransportState::Connected
        ) {
            other.set_state(TransportState::Disconnected);
        }
    }
}
