// SPDX-License-Identifier: MPL-2.0

use anyhow::{bail, Error};
use audiolink_signalling_protocol as p;
use futures::prelude::*;
use futures::ready;
use pin_project_lite::pin_project;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tracing::{debug, info, instrument, warn};

type ConnectionId = String;
type DeviceId = String;

struct Registration {
    connection_id: ConnectionId,
    info: p::DeviceInfo,
}

pin_project! {
    /// Routes envelopes between registered devices.
    ///
    /// Consumes `(connection_id, message)` pairs, `None` signalling that the
    /// connection went away, and yields `(connection_id, message)` deliveries.
    #[must_use = "streams do nothing unless polled"]
    pub struct Handler {
        #[pin]
        stream: Pin<Box<dyn Stream<Item=(String, Option<p::IncomingMessage>)> + Send>>,
        items: VecDeque<(String, p::OutgoingMessage)>,
        devices: HashMap<DeviceId, Registration>,
        connections: HashMap<ConnectionId, DeviceId>,
    }
}

impl Handler {
    #[instrument(level = "debug", skip(stream))]
    /// Create a handler
    pub fn new(
        stream: Pin<Box<dyn Stream<Item = (String, Option<p::IncomingMessage>)> + Send>>,
    ) -> Self {
        Self {
            stream,
            items: VecDeque::new(),
            devices: Default::default(),
            connections: Default::default(),
        }
    }

    /// Currently registered devices, in no particular order
    pub fn devices(&self) -> impl Iterator<Item = &p::DeviceInfo> {
        self.devices.values().map(|registration| &registration.info)
    }

    pub fn device(&self, device_id: &str) -> Option<&p::DeviceInfo> {
        self.devices
            .get(device_id)
            .map(|registration| &registration.info)
    }

    #[instrument(level = "trace", skip(self))]
    fn handle(&mut self, connection_id: &str, msg: p::IncomingMessage) -> Result<(), Error> {
        match msg {
            p::IncomingMessage::Register(info) => self.register(connection_id, info),
            p::IncomingMessage::Message(msg) => self.forward(connection_id, msg),
        }
    }

    /// Associate a connection with a device, the last registration wins
    #[instrument(level = "debug", skip(self, info), fields(device_id = %info.id))]
    fn register(&mut self, connection_id: &str, info: p::DeviceInfo) -> Result<(), Error> {
        if info.id.is_empty() {
            bail!("Connection {connection_id} tried to register an empty device id");
        }

        if let Some(previous_id) = self.connections.get(connection_id).cloned() {
            if previous_id != info.id {
                debug!(previous_id = %previous_id, "connection re-registered under a new id");
                self.release(connection_id, &previous_id);
            }
        }

        let displaced = self
            .devices
            .get(&info.id)
            .map(|registration| registration.connection_id.clone())
            .filter(|id| id != connection_id);
        if let Some(displaced) = displaced {
            warn!(
                displaced_connection = %displaced,
                "device id already registered by another connection, replacing"
            );
            self.connections.remove(&displaced);
        }

        info!(
            connection_id,
            name = %info.name,
            device_type = ?info.device_type,
            "registered device"
        );

        self.connections
            .insert(connection_id.to_string(), info.id.clone());
        self.devices.insert(
            info.id.clone(),
            Registration {
                connection_id: connection_id.to_string(),
                info,
            },
        );

        Ok(())
    }

    /// Forward an envelope to its target, or to everybody else when unaddressed
    fn forward(&mut self, connection_id: &str, mut msg: p::SignallingMessage) -> Result<(), Error> {
        let Some(sender_id) = self.connections.get(connection_id) else {
            bail!(
                "Connection {connection_id} sent a {:?} message before registering",
                msg.kind
            );
        };

        msg.from = Some(sender_id.clone());

        match msg.to.clone() {
            Some(to) => {
                let Some(target) = self.devices.get(&to) else {
                    debug!(
                        from = %sender_id,
                        "dropping {:?} message for unknown device {to}",
                        msg.kind
                    );
                    return Ok(());
                };

                self.items.push_back((
                    target.connection_id.clone(),
                    p::OutgoingMessage::Message(msg),
                ));
            }
            None => {
                for registration in self.devices.values() {
                    if registration.connection_id == connection_id {
                        continue;
                    }

                    self.items.push_back((
                        registration.connection_id.clone(),
                        p::OutgoingMessage::Message(msg.clone()),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Drop the registry entry of `device_id` if it still belongs to `connection_id`
    fn release(&mut self, connection_id: &str, device_id: &str) {
        let owned = self
            .devices
            .get(device_id)
            .is_some_and(|registration| registration.connection_id == connection_id);

        if owned {
            self.devices.remove(device_id);
            info!(connection_id, device_id, "unregistered device");
        }
    }

    #[instrument(level = "debug", skip(self))]
    /// Remove a connection, its device becomes unroutable
    fn remove_connection(&mut self, connection_id: &str) {
        match self.connections.remove(connection_id) {
            Some(device_id) => self.release(connection_id, &device_id),
            None => debug!("connection closed without registering"),
        }
    }
}

impl Stream for Handler {
    type Item = (String, p::OutgoingMessage);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(item) = this.items.pop_front() {
                break Poll::Ready(Some(item));
            }

            match ready!(this.stream.poll_next(cx)) {
                Some((connection_id, msg)) => {
                    if let Some(msg) = msg {
                        if let Err(err) = self.handle(&connection_id, msg) {
                            warn!(connection_id = %connection_id, "Dropping message: {err}");
                        }
                    } else {
                        self.remove_connection(&connection_id);
                    }
                }
                None => {
                    break Poll::Ready(None);
                }
            }
        }
    }
}
