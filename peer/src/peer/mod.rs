// SPDX-License-Identifier: MPL-2.0

//! Drives one peer connection through offer/answer/ICE and watches its
//! quality while connected.

use audiolink_signalling_protocol as p;
use futures::channel::mpsc;
use futures::prelude::*;
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::PeerSettings;
use crate::transport::{
    MediaKind, MediaStream, MediaTrack, PeerTransport, TransportError, TransportEvent,
    TransportFactory, TransportState,
};

mod candidates;
mod stats;

pub use candidates::IceCandidateBuffer;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("peer connection not initialized")]
    NotInitialized,
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for NegotiationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoRemoteDescription => NegotiationError::NoRemoteDescription,
            err => NegotiationError::Transport(err),
        }
    }
}

type StateCallback = Arc<dyn Fn(&p::ConnectionState) + Send + Sync>;
type IceCandidateCallback = Arc<dyn Fn(p::IceCandidate) + Send + Sync>;
type TrackCallback = Arc<dyn Fn(MediaTrack) + Send + Sync>;
type MetricsCallback = Arc<dyn Fn(&p::AudioMetrics) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_state_change: Option<StateCallback>,
    on_ice_candidate: Option<IceCandidateCallback>,
    on_track: Option<TrackCallback>,
    on_metrics: Option<MetricsCallback>,
}

#[derive(Default)]
struct State {
    transport: Option<Arc<dyn PeerTransport>>,
    event_task_handle: Option<task::JoinHandle<()>>,
    stats_task_handle: Option<task::JoinHandle<()>>,
    connection: p::ConnectionState,
}

struct Inner {
    settings: PeerSettings,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
}

/// Owns the native peer connection of one session
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<Inner>,
}

fn connection_status(state: TransportState) -> Option<p::ConnectionStatus> {
    match state {
        TransportState::New => None,
        TransportState::Connecting => Some(p::ConnectionStatus::Connecting),
        TransportState::Connected => Some(p::ConnectionStatus::Connected),
        TransportState::Disconnected => Some(p::ConnectionStatus::Disconnected),
        TransportState::Failed => Some(p::ConnectionStatus::Failed),
        TransportState::Closed => Some(p::ConnectionStatus::Closed),
    }
}

impl PeerConnectionManager {
    pub fn new(settings: PeerSettings, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                factory,
                state: Mutex::new(State::default()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Creates the native peer connection.
    ///
    /// Must be called from within a tokio runtime. Does nothing while a
    /// connection is live.
    #[instrument(level = "debug", skip(self))]
    pub async fn initialize(&self) -> Result<(), NegotiationError> {
        if self.inner.state.lock().unwrap().transport.is_some() {
            debug!("Already initialized");
            return Ok(());
        }

        let (events_tx, mut events_rx) = mpsc::unbounded::<TransportEvent>();
        let transport = self
            .inner
            .factory
            .create(&self.inner.settings.rtc_configuration(), events_tx)
            .await?;

        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            // Lost a race against a concurrent initialize
            if state.transport.is_some() {
                None
            } else {
                let this = Arc::downgrade(&self.inner);
                state.event_task_handle = Some(task::spawn(async move {
                    while let Some(event) = events_rx.next().await {
                        match this.upgrade() {
                            Some(inner) => inner.handle_event(event),
                            None => break,
                        }
                    }
                    trace!("Transport event stream ended");
                }));
                state.transport = Some(transport.clone());

                info!(
                    ice_servers = self.inner.settings.ice_servers.len(),
                    "Peer connection initialized"
                );

                state.connection = p::ConnectionState {
                    status: p::ConnectionStatus::Connecting,
                    latency: None,
                    quality: None,
                };
                Some(state.connection.clone())
            }
        };

        match snapshot {
            Some(snapshot) => self.inner.notify_state(&snapshot),
            None => {
                debug!("Already initialized");
                transport.close().await;
            }
        }

        Ok(())
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        self.inner
            .state
            .lock()
            .unwrap()
            .transport
            .clone()
            .ok_or(NegotiationError::NotInitialized)
    }

    /// Attaches every audio track of `stream` to the connection
    pub async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        let transport = self.transport()?;

        for track in stream.audio_tracks() {
            debug!(track_id = %track.id, label = %track.label, "Adding local track");
            transport.add_track(track).await?;
        }

        Ok(())
    }

    /// Creates an offer and applies it as the local description
    #[instrument(level = "debug", skip(self))]
    pub async fn create_offer(&self) -> Result<p::SessionDescription, NegotiationError> {
        let transport = self.transport()?;

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        Ok(offer)
    }

    /// Creates an answer to the applied remote offer and applies it as the
    /// local description
    #[instrument(level = "debug", skip(self))]
    pub async fn create_answer(&self) -> Result<p::SessionDescription, NegotiationError> {
        let transport = self.transport()?;

        if !transport.has_remote_description() {
            return Err(NegotiationError::NoRemoteDescription);
        }

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        Ok(answer)
    }

    #[instrument(level = "debug", skip(self, description), fields(sdp_type = ?description.sdp_type))]
    pub async fn set_remote_description(
        &self,
        description: p::SessionDescription,
    ) -> Result<(), NegotiationError> {
        let transport = self.transport()?;

        transport.set_remote_description(description).await?;

        Ok(())
    }

    pub fn has_remote_description(&self) -> bool {
        self.transport()
            .map(|transport| transport.has_remote_description())
            .unwrap_or(false)
    }

    /// Applies a remote candidate.
    ///
    /// Candidates arriving before the remote description are rejected, see
    /// [`IceCandidateBuffer`] for holding them back.
    pub async fn add_ice_candidate(
        &self,
        candidate: p::IceCandidate,
    ) -> Result<(), NegotiationError> {
        let transport = self.transport()?;

        if !transport.has_remote_description() {
            return Err(NegotiationError::NoRemoteDescription);
        }

        trace!(candidate = %candidate.candidate, "Adding remote candidate");
        transport.add_ice_candidate(candidate).await?;

        Ok(())
    }

    /// Takes one statistics sample
    pub async fn get_stats(&self) -> Result<p::AudioMetrics, NegotiationError> {
        let transport = self.transport()?;

        Ok(stats::audio_metrics(&transport.stats().await?))
    }

    /// Tears the connection down, subsequent calls do nothing
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        let (transport, snapshot) = {
            let mut state = self.inner.state.lock().unwrap();

            for handle in [
                state.event_task_handle.take(),
                state.stats_task_handle.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }

            let transport = state.transport.take();
            let snapshot = if state.connection.status != p::ConnectionStatus::Closed {
                state.connection = p::ConnectionState {
                    status: p::ConnectionStatus::Closed,
                    latency: None,
                    quality: None,
                };
                Some(state.connection.clone())
            } else {
                None
            };

            (transport, snapshot)
        };

        if let Some(transport) = transport {
            info!("Closing peer connection");
            transport.close().await;
        }

        if let Some(snapshot) = snapshot {
            self.inner.notify_state(&snapshot);
        }
    }

    pub fn state(&self) -> p::ConnectionState {
        self.inner.state.lock().unwrap().connection.clone()
    }

    /// Called with the full state on every change of status, latency or
    /// quality
    pub fn on_state_change<F: Fn(&p::ConnectionState) + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_state_change = Some(Arc::new(f));
    }

    /// Called for each gathered local candidate, to be trickled to the peer
    pub fn on_ice_candidate<F: Fn(p::IceCandidate) + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_ice_candidate = Some(Arc::new(f));
    }

    /// Called for each remote audio track
    pub fn on_track<F: Fn(MediaTrack) + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_track = Some(Arc::new(f));
    }

    pub fn on_metrics<F: Fn(&p::AudioMetrics) + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_metrics = Some(Arc::new(f));
    }
}

impl Inner {
    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(transport_state) => {
                debug!(state = ?transport_state, "Transport state changed");
                if let Some(status) = connection_status(transport_state) {
                    self.set_status(status);
                }
            }
            TransportEvent::IceCandidate(candidate) => {
                let callback = self.callbacks.lock().unwrap().on_ice_candidate.clone();
                match callback {
                    Some(callback) => callback(candidate),
                    None => debug!("No candidate handler, dropping local candidate"),
                }
            }
            TransportEvent::Track(track) if track.kind == MediaKind::Audio => {
                info!(track_id = %track.id, "Remote audio track");
                let callback = self.callbacks.lock().unwrap().on_track.clone();
                if let Some(callback) = callback {
                    callback(track);
                }
            }
            TransportEvent::Track(track) => {
                debug!(track_id = %track.id, kind = ?track.kind, "Ignoring remote track");
            }
        }
    }

    fn set_status(self: &Arc<Self>, status: p::ConnectionStatus) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.connection.status == status {
                return;
            }

            info!(from = ?state.connection.status, to = ?status, "Connection status changed");
            state.connection.status = status;

            if status == p::ConnectionStatus::Connected {
                if state.stats_task_handle.is_none() {
                    state.stats_task_handle = Some(self.spawn_stats_polling());
                }
            } else {
                if let Some(handle) = state.stats_task_handle.take() {
                    handle.abort();
                }
                state.connection.latency = None;
                state.connection.quality = None;
            }

            state.connection.clone()
        };

        self.notify_state(&snapshot);
    }

    fn spawn_stats_polling(self: &Arc<Self>) -> task::JoinHandle<()> {
        let this = Arc::downgrade(self);
        let period = self.settings.stats_interval;

        task::spawn(async move {
            // The first tick completes right away
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(inner) = this.upgrade() else {
                    break;
                };
                let transport = inner.state.lock().unwrap().transport.clone();
                let Some(transport) = transport else {
                    break;
                };

                match transport.stats().await {
                    Ok(reports) => inner.handle_metrics(stats::audio_metrics(&reports)),
                    Err(err) => warn!("Failed to collect stats: {}", err),
                }
            }
        })
    }

    fn handle_metrics(&self, metrics: p::AudioMetrics) {
        let quality = metrics.quality();

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.connection.status != p::ConnectionStatus::Connected {
                return;
            }

            let latency = Some(metrics.round_trip_time);
            let changed =
                state.connection.latency != latency || state.connection.quality != Some(quality);
            state.connection.latency = latency;
            state.connection.quality = Some(quality);

            changed.then(|| state.connection.clone())
        };

        trace!(?metrics, ?quality, "Stats sample");

        let callback = self.callbacks.lock().unwrap().on_metrics.clone();
        if let Some(callback) = callback {
            callback(&metrics);
        }

        if let Some(snapshot) = snapshot {
            self.notify_state(&snapshot);
        }
    }

    fn notify_state(&self, state: &p::ConnectionState) {
        let callback = self.callbacks.lock().unwrap().on_state_change.clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            for handle in [
                state.event_task_handle.take(),
                state.stats_task_handle.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackFactory, LoopbackNetwork};
    use crate::transport::{CandidatePairState, StatsReport};
    use std::time::Duration;

    fn managers() -> (
        (PeerConnectionManager, LoopbackFactory),
        (PeerConnectionManager, LoopbackFactory),
    ) {
        let (a, b) = LoopbackNetwork::pair();

        (
            (
                PeerConnectionManager::new(PeerSettings::default(), Arc::new(a.clone())),
                a,
            ),
            (
                PeerConnectionManager::new(PeerSettings::default(), Arc::new(b.clone())),
                b,
            ),
        )
    }

    fn watch_state(manager: &PeerConnectionManager) -> mpsc::UnboundedReceiver<p::ConnectionState> {
        let (tx, rx) = mpsc::unbounded();
        manager.on_state_change(move |state| {
            let _ = tx.unbounded_send(state.clone());
        });
        rx
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<p::ConnectionState>,
        status: p::ConnectionStatus,
    ) -> p::ConnectionState {
        loop {
            let state = rx.next().await.expect("state stream ended");
            if state.status == status {
                return state;
            }
        }
    }

    async fn negotiate(offerer: &PeerConnectionManager, answerer: &PeerConnectionManager) {
        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, p::SdpType::Offer);
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, p::SdpType::Answer);
        offerer.set_remote_description(answer).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn requires_initialization() {
        let ((manager, _), _) = managers();

        let stream = MediaStream::new(vec![MediaTrack::audio("microphone")]);
        assert_eq!(
            manager.add_local_stream(&stream).await,
            Err(NegotiationError::NotInitialized)
        );
        assert_eq!(
            manager.create_offer().await,
            Err(NegotiationError::NotInitialized)
        );
        assert_eq!(manager.state().status, p::ConnectionStatus::Disconnected);
    }

    #[test_log::test(tokio::test)]
    async fn initialize_is_idempotent() {
        let ((manager, _), _) = managers();
        let mut states = watch_state(&manager);

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();

        assert_eq!(
            states.next().await.unwrap().status,
            p::ConnectionStatus::Connecting
        );
        assert!(states.next().now_or_never().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn answer_and_candidates_need_remote_description() {
        let ((manager, _), _) = managers();
        manager.initialize().await.unwrap();

        assert_eq!(
            manager.create_answer().await,
            Err(NegotiationError::NoRemoteDescription)
        );

        let candidate = p::IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        assert_eq!(
            manager.add_ice_candidate(candidate).await,
            Err(NegotiationError::NoRemoteDescription)
        );
        assert!(!manager.has_remote_description());
    }

    #[test_log::test(tokio::test)]
    async fn offer_answer_connects() {
        let ((offerer, offerer_net), (answerer, answerer_net)) = managers();
        let mut offerer_states = watch_state(&offerer);
        let mut answerer_states = watch_state(&answerer);

        let (candidates_tx, mut candidates_rx) = mpsc::unbounded();
        offerer.on_ice_candidate(move |candidate| {
            let _ = candidates_tx.unbounded_send(candidate);
        });
        let (tracks_tx, mut tracks_rx) = mpsc::unbounded();
        answerer.on_track(move |track| {
            let _ = tracks_tx.unbounded_send(track);
        });

        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();

        let microphone = MediaTrack::audio("microphone");
        offerer
            .add_local_stream(&MediaStream::new(vec![microphone.clone()]))
            .await
            .unwrap();
        assert_eq!(offerer_net.local_tracks(), vec![microphone.clone()]);

        negotiate(&offerer, &answerer).await;

        let state = wait_for(&mut offerer_states, p::ConnectionStatus::Connected).await;
        assert_eq!(state.status, p::ConnectionStatus::Connected);
        wait_for(&mut answerer_states, p::ConnectionStatus::Connected).await;

        assert_eq!(tracks_rx.next().await.unwrap(), microphone);

        // Trickle the offerer's candidate to the answerer
        let candidate = candidates_rx.next().await.unwrap();
        answerer.add_ice_candidate(candidate.clone()).await.unwrap();
        assert_eq!(answerer_net.remote_candidates(), vec![candidate]);
    }

    #[test_log::test(tokio::test)]
    async fn invalid_candidate_is_reported() {
        let ((offerer, _), (answerer, _)) = managers();
        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();
        negotiate(&offerer, &answerer).await;

        let res = answerer
            .add_ice_candidate(p::IceCandidate {
                candidate: "garbage".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
            .await;
        assert!(matches!(
            res,
            Err(NegotiationError::Transport(TransportError::InvalidCandidate(_)))
        ));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn polls_stats_while_connected() {
        let ((offerer, offerer_net), (answerer, _)) = managers();
        let mut states = watch_state(&offerer);
        let (metrics_tx, mut metrics_rx) = mpsc::unbounded();
        offerer.on_metrics(move |metrics| {
            let _ = metrics_tx.unbounded_send((tokio::time::Instant::now(), metrics.clone()));
        });

        offerer_net.set_stats(vec![
            StatsReport::InboundRtp {
                kind: MediaKind::Audio,
                packets_lost: 3,
                jitter: 0.01,
                audio_level: Some(0.3),
            },
            StatsReport::CandidatePair {
                state: CandidatePairState::Succeeded,
                nominated: true,
                current_round_trip_time: Some(0.12),
            },
        ]);

        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();
        negotiate(&offerer, &answerer).await;

        wait_for(&mut states, p::ConnectionStatus::Connected).await;

        let (first_at, first) = metrics_rx.next().await.unwrap();
        assert!((first.round_trip_time - 120.).abs() < 1e-9);
        assert_eq!(first.packets_lost, 3);

        let state = offerer.state();
        assert_eq!(state.quality, Some(p::ConnectionQuality::Fair));
        assert!((state.latency.unwrap() - 120.).abs() < 1e-9);

        let (second_at, _) = metrics_rx.next().await.unwrap();
        assert!(second_at - first_at >= Duration::from_secs(1));

        offerer_net.simulate_state(TransportState::Disconnected);
        let state = wait_for(&mut states, p::ConnectionStatus::Disconnected).await;
        assert_eq!(state.latency, None);
        assert_eq!(state.quality, None);

        let requests = offerer_net.stats_requests();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(offerer_net.stats_requests(), requests);
    }

    #[test_log::test(tokio::test)]
    async fn close_is_idempotent() {
        let ((offerer, _), (answerer, answerer_net)) = managers();
        let mut offerer_states = watch_state(&offerer);
        let mut answerer_states = watch_state(&answerer);

        offerer.initialize().await.unwrap();
        answerer.initialize().await.unwrap();
        negotiate(&offerer, &answerer).await;
        wait_for(&mut offerer_states, p::ConnectionStatus::Connected).await;

        offerer.close().await;
        offerer.close().await;

        wait_for(&mut offerer_states, p::ConnectionStatus::Closed).await;
        assert!(offerer_states.next().now_or_never().is_none());
        assert_eq!(offerer.state().status, p::ConnectionStatus::Closed);

        wait_for(&mut answerer_states, p::ConnectionStatus::Disconnected).await;
        assert_eq!(answerer_net.state(), TransportState::Disconnected);

        assert_eq!(
            offerer.get_stats().await,
            Err(NegotiationError::NotInitialized)
        );
    }
}
