// SPDX-License-Identifier: MPL-2.0

//! Persistent connection to the signalling relay.
//!
//! The client registers its [`p::DeviceInfo`] every time the channel opens,
//! hands every forwarded envelope to the `on_message` callback, and retries at
//! a fixed interval after an unexpected close until the configured number of
//! attempts is exhausted.

use async_tungstenite::tungstenite::Message as WsMessage;
use audiolink_signalling_protocol as p;
use futures::channel::mpsc;
use futures::prelude::*;
use std::sync::{Arc, Mutex, Weak};
use tokio::task;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ClientSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("not connected to the signalling server")]
    NotConnected,
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("websocket error: {0}")]
    Transport(#[from] async_tungstenite::tungstenite::Error),
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("device id can't change while registered ({current} -> {requested})")]
    DeviceIdChanged { current: String, requested: String },
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

type MessageCallback = Arc<dyn Fn(p::SignallingMessage) + Send + Sync>;
type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_message: Option<MessageCallback>,
    on_connected: Option<EventCallback>,
    on_disconnected: Option<EventCallback>,
}

#[derive(Default)]
struct State {
    status: ClientStatus,
    /// Sender for the websocket messages
    websocket_sender: Option<mpsc::Sender<p::IncomingMessage>>,
    send_task_handle: Option<task::JoinHandle<Result<(), ClientError>>>,
    receive_task_handle: Option<task::JoinHandle<()>>,
    reconnect_task_handle: Option<task::JoinHandle<()>>,
    reconnect_attempts: u32,
    /// Bumped for every opened channel and on explicit disconnection, lets
    /// tasks of a previous channel notice they are stale
    generation: u64,
}

struct Inner {
    settings: ClientSettings,
    device: Mutex<p::DeviceInfo>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
}

/// Handle to the signalling channel, cheap to clone
#[derive(Clone)]
pub struct SignallingClient {
    inner: Arc<Inner>,
}

impl SignallingClient {
    pub fn new(settings: ClientSettings, device: p::DeviceInfo) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                device: Mutex::new(device),
                state: Mutex::new(State::default()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Opens the channel and registers with the relay.
    ///
    /// Cancels any pending automatic retry and resets the retry counter.
    /// Returns immediately when already connected.
    #[instrument(level = "debug", skip(self), fields(address = %self.inner.settings.address))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(handle) = state.reconnect_task_handle.take() {
                handle.abort();
            }
            state.reconnect_attempts = 0;

            if state.status == ClientStatus::Connected {
                return Ok(());
            }
        }

        Inner::open(&self.inner).await
    }

    /// Closes the channel for good, no automatic retry follows
    #[instrument(level = "debug", skip(self))]
    pub async fn disconnect(&self) {
        let (sender, send_task_handle, receive_task_handle, reconnect_task_handle, was_connected) = {
            let mut state = self.inner.state.lock().unwrap();
            state.generation += 1;
            let was_connected = state.status == ClientStatus::Connected;
            state.status = ClientStatus::Disconnected;

            (
                state.websocket_sender.take(),
                state.send_task_handle.take(),
                state.receive_task_handle.take(),
                state.reconnect_task_handle.take(),
                was_connected,
            )
        };

        if let Some(handle) = reconnect_task_handle {
            handle.abort();
        }

        // Closing the queue makes the send task emit a close frame and exit
        drop(sender);

        if let Some(handle) = send_task_handle {
            match handle.await {
                Ok(Err(err)) => debug!("Send task ended with error: {}", err),
                Err(err) => trace!("Error while joining send task: {}", err),
                Ok(Ok(())) => (),
            }
        }

        if let Some(handle) = receive_task_handle {
            handle.abort();
        }

        if was_connected {
            info!("Disconnected from the signalling server");
            self.inner.notify_disconnected();
        }
    }

    /// Queues an envelope for the relay
    pub async fn send_message(&self, msg: p::SignallingMessage) -> Result<(), ClientError> {
        let sender = {
            let state = self.inner.state.lock().unwrap();
            if state.status != ClientStatus::Connected {
                None
            } else {
                state.websocket_sender.clone()
            }
        };

        let Some(mut sender) = sender else {
            debug!(kind = ?msg.kind, "Not connected, can't send message");
            return Err(ClientError::NotConnected);
        };

        sender
            .send(p::IncomingMessage::Message(msg))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn send_offer(
        &self,
        offer: &p::SessionDescription,
        to: &str,
    ) -> Result<(), ClientError> {
        let msg = self.envelope(p::MessageType::Offer, offer, Some(to))?;
        self.send_message(msg).await
    }

    pub async fn send_answer(
        &self,
        answer: &p::SessionDescription,
        to: &str,
    ) -> Result<(), ClientError> {
        let msg = self.envelope(p::MessageType::Answer, answer, Some(to))?;
        self.send_message(msg).await
    }

    pub async fn send_ice_candidate(
        &self,
        candidate: &p::IceCandidate,
        to: &str,
    ) -> Result<(), ClientError> {
        let msg = self.envelope(p::MessageType::IceCandidate, candidate, Some(to))?;
        self.send_message(msg).await
    }

    /// Broadcasts a `join` to every other registered device
    pub async fn join_room(&self, room_id: &str) -> Result<(), ClientError> {
        let msg = self.envelope(
            p::MessageType::Join,
            &p::RoomPayload {
                room_id: room_id.to_string(),
            },
            None,
        )?;
        self.send_message(msg).await
    }

    /// Broadcasts a `leave` to every other registered device
    pub async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
        let msg = self.envelope(
            p::MessageType::Leave,
            &p::RoomPayload {
                room_id: room_id.to_string(),
            },
            None,
        )?;
        self.send_message(msg).await
    }

    fn envelope<T: serde::Serialize>(
        &self,
        kind: p::MessageType,
        payload: &T,
        to: Option<&str>,
    ) -> Result<p::SignallingMessage, ClientError> {
        let msg = p::SignallingMessage::with_payload(kind, payload)?.from_device(self.device_id());

        Ok(match to {
            Some(to) => msg.to_device(to),
            None => msg,
        })
    }

    /// Replaces the descriptor, re-registering when connected.
    ///
    /// The identifier must stay the same.
    pub async fn update_device_info(&self, info: p::DeviceInfo) -> Result<(), ClientError> {
        {
            let mut device = self.inner.device.lock().unwrap();
            if device.id != info.id {
                return Err(ClientError::DeviceIdChanged {
                    current: device.id.clone(),
                    requested: info.id,
                });
            }
            *device = info.clone();
        }

        let sender = {
            let state = self.inner.state.lock().unwrap();
            if state.status == ClientStatus::Connected {
                state.websocket_sender.clone()
            } else {
                None
            }
        };

        if let Some(mut sender) = sender {
            debug!(device_id = %info.id, "Re-registering updated device info");
            sender
                .send(p::IncomingMessage::Register(info))
                .await
                .map_err(|_| ClientError::NotConnected)?;
        }

        Ok(())
    }

    /// Sets the handler for forwarded envelopes, replacing any previous one
    pub fn on_message<F: Fn(p::SignallingMessage) + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_message = Some(Arc::new(f));
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_connected = Some(Arc::new(f));
    }

    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        self.inner.callbacks.lock().unwrap().on_disconnected = Some(Arc::new(f));
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    pub fn device_info(&self) -> p::DeviceInfo {
        self.inner.device.lock().unwrap().clone()
    }

    pub fn device_id(&self) -> String {
        self.inner.device.lock().unwrap().id.clone()
    }

    /// Automatic retries made since the channel was last open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().unwrap().reconnect_attempts
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }
}

impl Inner {
    async fn open(self: &Arc<Self>) -> Result<(), ClientError> {
        // A disconnect() while the handshake is in flight bumps the generation
        let started = {
            let mut state = self.state.lock().unwrap();
            state.status = ClientStatus::Connecting;
            state.generation
        };

        let address = self.settings.address.clone();
        debug!(address = %address, "Connecting");

        let mut ws = match tokio::time::timeout(
            self.settings.connect_timeout,
            async_tungstenite::tokio::connect_async(address.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => {
                self.connection_failed(started);
                return Err(err.into());
            }
            Err(_) => {
                self.connection_failed(started);
                return Err(ClientError::Timeout(address));
            }
        };

        if self.state.lock().unwrap().generation != started {
            info!(address = %address, "Disconnected during the handshake, closing");
            let _ = ws.close(None).await;
            return Err(ClientError::Cancelled);
        }

        info!(address = %address, "Connected to the signalling server");

        let (mut ws_sink, mut ws_stream) = ws.split();

        // 1000 is completely arbitrary, we simply don't want infinite piling
        // up of messages as with unbounded
        let (mut websocket_sender, mut websocket_receiver) =
            mpsc::channel::<p::IncomingMessage>(1000);
        let send_task_handle = task::spawn(async move {
            let mut res = Ok(());
            while let Some(msg) = websocket_receiver.next().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("Failed to serialize {:?}: {}", msg, err);
                        continue;
                    }
                };

                trace!("Sending websocket message {}", text);
                if let Err(err) = ws_sink.send(WsMessage::text(text)).await {
                    warn!("Quitting send loop: {}", err);
                    res = Err(err.into());
                    break;
                }
            }

            debug!("Done sending");

            let _ = ws_sink.close(None).await;

            res
        });

        let device = self.device.lock().unwrap().clone();
        info!(device_id = %device.id, "Registering");
        if websocket_sender
            .send(p::IncomingMessage::Register(device))
            .await
            .is_err()
        {
            self.connection_failed(started);
            return Err(ClientError::NotConnected);
        }

        // Held until the tasks are stored so that a channel closing right
        // away is seen as the current one
        let stale = 'registered: {
            let mut state = self.state.lock().unwrap();
            if state.generation != started {
                drop(state);
                break 'registered Some((websocket_sender, send_task_handle));
            }
            state.generation += 1;
            let generation = state.generation;

            let this = Arc::downgrade(self);
            let receive_task_handle = task::spawn(async move {
                while let Some(msg) = ws_stream.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            trace!("Received message {}", text);

                            match serde_json::from_str::<p::OutgoingMessage>(&text) {
                                Ok(p::OutgoingMessage::Message(msg)) => match this.upgrade() {
                                    Some(inner) => inner.dispatch(msg),
                                    None => break,
                                },
                                Err(err) => {
                                    warn!("Unknown message from server: {} ({})", text, err);
                                }
                            }
                        }
                        Ok(WsMessage::Close(reason)) => {
                            info!("websocket connection closed: {:?}", reason);
                            break;
                        }
                        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                        Ok(_) => warn!("Unsupported message type"),
                        Err(err) => {
                            warn!("Error receiving: {}", err);
                            break;
                        }
                    }
                }

                debug!("Stopped websocket receiving");

                if let Some(inner) = this.upgrade() {
                    Inner::handle_disconnect(&inner, generation);
                }
            });

            if let Some(handle) = state.receive_task_handle.replace(receive_task_handle) {
                handle.abort();
            }
            state.send_task_handle = Some(send_task_handle);
            state.websocket_sender = Some(websocket_sender);
            state.status = ClientStatus::Connected;
            state.reconnect_attempts = 0;
            drop(state);
            None
        };
        if let Some((websocket_sender, send_task_handle)) = stale {
            info!("Disconnected while registering, closing");
            // The send task closes the socket once its queue is gone
            drop(websocket_sender);
            let _ = send_task_handle.await;
            return Err(ClientError::Cancelled);
        }

        let callback = self.callbacks.lock().unwrap().on_connected.clone();
        if let Some(callback) = callback {
            callback();
        }

        Ok(())
    }

    fn connection_failed(&self, started: u64) {
        let mut state = self.state.lock().unwrap();
        if state.generation == started && state.status == ClientStatus::Connecting {
            state.status = ClientStatus::Disconnected;
        }
    }

    fn dispatch(&self, msg: p::SignallingMessage) {
        let callback = self.callbacks.lock().unwrap().on_message.clone();

        match callback {
            Some(callback) => callback(msg),
            None => debug!(kind = ?msg.kind, "No message handler, dropping"),
        }
    }

    fn notify_disconnected(&self) {
        let callback = self.callbacks.lock().unwrap().on_disconnected.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                trace!(generation, "Ignoring close of a stale channel");
                return;
            }

            state.websocket_sender = None;
            state.status = ClientStatus::Disconnected;

            let weak = Arc::downgrade(self);
            if let Some(handle) = state
                .reconnect_task_handle
                .replace(task::spawn(Self::reconnect(weak)))
            {
                handle.abort();
            }
        }

        warn!("Lost connection to the signalling server");
        self.notify_disconnected();
    }

    async fn reconnect(this: Weak<Self>) {
        loop {
            let Some(inner) = this.upgrade() else {
                return;
            };

            let (attempt, interval) = {
                let mut state = inner.state.lock().unwrap();
                if state.status == ClientStatus::Connected {
                    return;
                }

                if state.reconnect_attempts >= inner.settings.max_reconnect_attempts {
                    error!(
                        attempts = state.reconnect_attempts,
                        "Giving up reconnecting to the signalling server"
                    );
                    return;
                }

                state.reconnect_attempts += 1;
                (state.reconnect_attempts, inner.settings.reconnect_interval)
            };
            drop(inner);

            info!(attempt, "Reconnecting in {:?}", interval);
            tokio::time::sleep(interval).await;

            let Some(inner) = this.upgrade() else {
                return;
            };

            if inner.state.lock().unwrap().status == ClientStatus::Connected {
                return;
            }

            match Inner::open(&inner).await {
                Ok(()) => return,
                Err(err) => warn!(attempt, "Reconnection failed: {}", err),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            for handle in [
                state.receive_task_handle.take(),
                state.reconnect_task_handle.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }

            // The send task exits once its queue is gone
            state.websocket_sender = None;
        }
    }
}
