// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code)]

use audiolink_peer::protocol as p;
use audiolink_peer::{ClientError, ClientSettings, SignallingClient};
use audiolink_signalling::handlers::Handler;
use audiolink_signalling::server::Server;
use futures::channel::mpsc;
use futures::prelude::*;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task;

/// Starts a relay on an ephemeral port, returning it with its address
pub async fn spawn_relay() -> (Server, String) {
    let server = Server::spawn(Handler::new);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_clone = server.clone();
    task::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut server = server_clone.clone();
            task::spawn(async move {
                let _ = server.accept_async(stream).await;
            });
        }
    });

    (server, format!("ws://{addr}"))
}

pub fn settings(address: &str) -> ClientSettings {
    ClientSettings {
        address: address.to_string(),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        connect_timeout: Duration::from_secs(2),
    }
}

/// A connected client whose forwarded envelopes end up in the returned
/// receiver
pub async fn connected_client(
    address: &str,
    name: &str,
    device_type: p::DeviceType,
) -> (SignallingClient, mpsc::UnboundedReceiver<p::SignallingMessage>) {
    let client = SignallingClient::new(
        settings(address),
        p::DeviceInfo::new(name, device_type, "linux", "1.0.0"),
    );

    let (tx, rx) = mpsc::unbounded();
    client.on_message(move |msg| {
        let _ = tx.unbounded_send(msg);
    });

    client.connect().await.unwrap();

    (client, rx)
}

/// Sends until something shows up on `rx`.
///
/// Registration at the relay is asynchronous, a message sent right after
/// connecting may reach the relay before the target's registration.
pub async fn deliver<F, Fut>(
    mut send: F,
    rx: &mut mpsc::UnboundedReceiver<p::SignallingMessage>,
) -> p::SignallingMessage
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    for _ in 0..50 {
        send().await.unwrap();

        if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), rx.next()).await
        {
            return msg;
        }
    }

    panic!("message never delivered");
}

/// Everything received within `window`
pub async fn drain(
    rx: &mut mpsc::UnboundedReceiver<p::SignallingMessage>,
    window: Duration,
) -> Vec<p::SignallingMessage> {
    let mut received = vec![];
    while let Ok(Some(msg)) = tokio::time::timeout(window, rx.next()).await {
        received.push(msg);
    }

    received
}

pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("timed out waiting for {what}");
}
