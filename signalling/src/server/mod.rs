// SPDX-License-Identifier: MPL-2.0

//! WebSocket plumbing of the relay.
//!
//! Every accepted socket gets a reader task feeding text frames into the
//! routing handler and a writer task draining the socket's outbox. The
//! router never waits on an outbox: a device that stops reading loses its
//! own frames once its outbox is full, everybody else keeps being served.

use anyhow::Error;
use async_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use futures::channel::mpsc;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task;
use tracing::{debug, error, info, instrument, trace, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Frames waiting for one socket
const OUTBOX_CAPACITY: usize = 1000;
/// Frames from all sockets waiting for the handler
const INBOX_CAPACITY: usize = 1000;

type Inbox = mpsc::Sender<(String, Option<Utf8Bytes>)>;

struct Connection {
    reader: task::JoinHandle<()>,
    writer: task::JoinHandle<Result<(), Error>>,
    outbox: mpsc::Sender<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Queued,
    Full,
    Closing,
    Unknown,
}

struct State {
    inbox: Option<Inbox>,
    connections: HashMap<String, Connection>,
}

impl State {
    /// Queues `frame` for `connection_id` without waiting
    fn deliver(&mut self, connection_id: &str, frame: String) -> Delivery {
        let Some(connection) = self.connections.get_mut(connection_id) else {
            return Delivery::Unknown;
        };

        match connection.outbox.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(err) if err.is_full() => Delivery::Full,
            Err(_) => Delivery::Closing,
        }
    }
}

/// Accepts WebSocket connections and plugs them into a routing handler
#[derive(Clone)]
pub struct Server {
    state: Arc<Mutex<State>>,
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("error during handshake {0}")]
    Handshake(#[from] async_tungstenite::tungstenite::Error),
}

impl Server {
    /// Spawn the routing task.
    ///
    /// `factory` receives the stream of parsed frames tagged with their
    /// connection id, `None` meaning the connection is gone, and returns the
    /// stream of frames to deliver.
    #[instrument(level = "debug", skip(factory))]
    pub fn spawn<
        I: for<'a> Deserialize<'a>,
        O: Serialize + std::fmt::Debug + Send + Sync + 'static,
        Factory: FnOnce(Pin<Box<dyn Stream<Item = (String, Option<I>)> + Send>>) -> St,
        St: Stream<Item = (String, O)> + Send + Unpin + 'static,
    >(
        factory: Factory,
    ) -> Self {
        let (inbox, frames) = mpsc::channel::<(String, Option<Utf8Bytes>)>(INBOX_CAPACITY);
        let handler = factory(Box::pin(frames.filter_map(|(connection_id, frame)| async move {
            let Some(frame) = frame else {
                return Some((connection_id, None));
            };

            match serde_json::from_str::<I>(&frame) {
                Ok(msg) => Some((connection_id, Some(msg))),
                Err(err) => {
                    warn!(
                        connection_id = %connection_id,
                        "Failed to parse incoming message: {} ({})", err, frame
                    );
                    None
                }
            }
        })));

        let state = Arc::new(Mutex::new(State {
            inbox: Some(inbox),
            connections: HashMap::new(),
        }));

        task::spawn(Self::route(state.clone(), handler));

        Self { state }
    }

    async fn route<O: Serialize + std::fmt::Debug, St: Stream<Item = (String, O)> + Unpin>(
        state: Arc<Mutex<State>>,
        mut handler: St,
    ) {
        while let Some((connection_id, msg)) = handler.next().await {
            let frame = match serde_json::to_string(&msg) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("Failed to serialize outgoing message: {}", err);
                    continue;
                }
            };

            trace!(connection_id = %connection_id, "Routing {}", frame);
            let delivery = state.lock().unwrap().deliver(&connection_id, frame);
            let reason = match delivery {
                Delivery::Queued => continue,
                Delivery::Full => {
                    warn!(
                        connection_id = %connection_id,
                        "Outbox full, dropping {:?}", msg
                    );
                    continue;
                }
                Delivery::Closing => "connection closing",
                Delivery::Unknown => "connection gone",
            };
            debug!(connection_id = %connection_id, "Dropping {:?}, {}", msg, reason);
        }

        debug!("Handler stream ended, routing stopped");
    }

    #[instrument(level = "debug", skip(state))]
    fn remove_connection(state: Arc<Mutex<State>>, connection_id: &str) {
        let Some(mut connection) = state.lock().unwrap().connections.remove(connection_id) else {
            return;
        };

        let connection_id = connection_id.to_string();
        task::spawn(async move {
            connection.outbox.close_channel();
            if let Err(err) = connection.writer.await {
                trace!(connection_id = %connection_id, "Error while joining writer: {}", err);
            }

            if let Err(err) = connection.reader.await {
                trace!(connection_id = %connection_id, "Error while joining reader: {}", err);
            }
        });
    }

    /// Number of currently open connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Drains `outbox` into the socket, pinging it when idle
    fn spawn_writer<W>(
        connection_id: String,
        mut sink: W,
        mut outbox: mpsc::Receiver<String>,
    ) -> task::JoinHandle<Result<(), Error>>
    where
        W: Sink<WsMessage, Error = async_tungstenite::tungstenite::Error> + Send + Unpin + 'static,
    {
        task::spawn(async move {
            let res = loop {
                let msg = match tokio::time::timeout(PING_INTERVAL, outbox.next()).await {
                    Ok(Some(frame)) => {
                        trace!(connection_id = %connection_id, "Sending {}", frame);
                        WsMessage::text(frame)
                    }
                    Ok(None) => break Ok(()),
                    Err(_) => {
                        trace!(connection_id = %connection_id, "Idle, sending ping");
                        WsMessage::Ping(Default::default())
                    }
                };

                if let Err(err) = sink.send(msg).await {
                    error!(connection_id = %connection_id, "Quitting send loop: {}", err);
                    break Err(err);
                }
            };

            debug!(connection_id = %connection_id, "Done sending");
            let _ = sink.close().await;

            res.map_err(Into::into)
        })
    }

    /// Feeds text frames from the socket to the handler, then reports the
    /// connection as gone
    fn spawn_reader<R>(
        state: Arc<Mutex<State>>,
        connection_id: String,
        mut source: R,
        mut inbox: Option<Inbox>,
    ) -> task::JoinHandle<()>
    where
        R: Stream<Item = Result<WsMessage, async_tungstenite::tungstenite::Error>>
            + Send
            + Unpin
            + 'static,
    {
        task::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(WsMessage::Text(frame)) => {
                        trace!(connection_id = %connection_id, "Received {}", frame);
                        let Some(inbox) = inbox.as_mut() else {
                            continue;
                        };
                        if let Err(err) = inbox.send((connection_id.clone(), Some(frame))).await {
                            warn!(connection_id = %connection_id, "Handler gone: {}", err);
                        }
                    }
                    Ok(WsMessage::Close(reason)) => {
                        info!(connection_id = %connection_id, "Connection closed: {:?}", reason);
                        break;
                    }
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                    Ok(_) => warn!(connection_id = %connection_id, "Unsupported message type"),
                    Err(err) => {
                        warn!(connection_id = %connection_id, "Receive error: {}", err);
                        break;
                    }
                }
            }

            if let Some(inbox) = inbox.as_mut() {
                let _ = inbox.send((connection_id.clone(), None)).await;
            }

            Self::remove_connection(state, &connection_id);
        })
    }

    /// Completes the WebSocket handshake on `stream` and starts serving it,
    /// returning the connection id
    #[instrument(level = "debug", skip(self, stream))]
    pub async fn accept_async<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
        &mut self,
        stream: S,
    ) -> Result<String, ServerError> {
        let ws = async_tungstenite::tokio::accept_async(stream)
            .await
            .inspect_err(|err| warn!("Error during the websocket handshake: {}", err))?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(connection_id = %connection_id, "New WebSocket connection");

        let (sink, source) = ws.split();
        let (outbox, outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
        let writer = Self::spawn_writer(connection_id.clone(), sink, outbox_rx);

        // Held until the connection is inserted so that a connection closing
        // right away can't be removed before it was added
        let mut state = self.state.lock().unwrap();
        let reader = Self::spawn_reader(
            self.state.clone(),
            connection_id.clone(),
            source,
            state.inbox.clone(),
        );
        state.connections.insert(
            connection_id.clone(),
            Connection {
                reader,
                writer,
                outbox,
            },
        );

        Ok(connection_id)
    }
}
