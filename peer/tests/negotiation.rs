// SPDX-License-Identifier: MPL-2.0

mod common;

use audiolink_peer::protocol as p;
use audiolink_peer::transport::loopback::{LoopbackFactory, LoopbackNetwork};
use audiolink_peer::transport::{MediaStream, MediaTrack};
use audiolink_peer::{IceCandidateBuffer, PeerConnectionManager, PeerSettings, SignallingClient};
use common::*;
use futures::channel::mpsc;
use futures::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

struct Device {
    client: SignallingClient,
    manager: PeerConnectionManager,
    network: LoopbackFactory,
    states: mpsc::UnboundedReceiver<p::ConnectionState>,
    tracks: mpsc::UnboundedReceiver<MediaTrack>,
}

async fn device(
    address: &str,
    name: &str,
    device_type: p::DeviceType,
    network: LoopbackFactory,
) -> (Device, mpsc::UnboundedReceiver<p::SignallingMessage>) {
    let (client, messages) = connected_client(address, name, device_type).await;
    let manager = PeerConnectionManager::new(PeerSettings::default(), Arc::new(network.clone()));

    let (states_tx, states) = mpsc::unbounded();
    manager.on_state_change(move |state| {
        let _ = states_tx.unbounded_send(state.clone());
    });
    let (tracks_tx, tracks) = mpsc::unbounded();
    manager.on_track(move |track| {
        let _ = tracks_tx.unbounded_send(track);
    });

    manager.initialize().await.unwrap();

    (
        Device {
            client,
            manager,
            network,
            states,
            tracks,
        },
        messages,
    )
}

/// Trickles local candidates to `peer_id` as they are gathered
fn trickle_candidates(device: &Device, peer_id: String) {
    let (tx, mut rx) = mpsc::unbounded();
    device.manager.on_ice_candidate(move |candidate| {
        let _ = tx.unbounded_send(candidate);
    });

    let client = device.client.clone();
    task::spawn(async move {
        while let Some(candidate) = rx.next().await {
            client
                .send_ice_candidate(&candidate, &peer_id)
                .await
                .unwrap();
        }
    });
}

/// Answers offers and applies answers and candidates, in whatever order
/// they arrive
fn handle_signalling(
    device: &Device,
    mut messages: mpsc::UnboundedReceiver<p::SignallingMessage>,
) -> task::JoinHandle<()> {
    let client = device.client.clone();
    let manager = device.manager.clone();

    task::spawn(async move {
        let mut candidates = IceCandidateBuffer::new();

        while let Some(msg) = messages.next().await {
            let Some(from) = msg.from.clone() else {
                continue;
            };

            match msg.kind {
                p::MessageType::Offer => {
                    let offer = msg.payload_as::<p::SessionDescription>().unwrap();
                    candidates
                        .set_remote_description(&manager, offer)
                        .await
                        .unwrap();
                    let answer = manager.create_answer().await.unwrap();
                    client.send_answer(&answer, &from).await.unwrap();
                }
                p::MessageType::Answer => {
                    let answer = msg.payload_as::<p::SessionDescription>().unwrap();
                    candidates
                        .set_remote_description(&manager, answer)
                        .await
                        .unwrap();
                }
                p::MessageType::IceCandidate => {
                    let candidate = msg.payload_as::<p::IceCandidate>().unwrap();
                    candidates.add(&manager, candidate).await.unwrap();
                }
                _ => (),
            }
        }
    })
}

async fn wait_for(
    states: &mut mpsc::UnboundedReceiver<p::ConnectionState>,
    status: p::ConnectionStatus,
) -> p::ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = states.next().await.expect("state stream ended");
            if state.status == status {
                return state;
            }
        }
    })
    .await
    .expect("timed out waiting for the connection status")
}

#[test_log::test(tokio::test)]
async fn offer_answer_over_the_relay() {
    let (_server, address) = spawn_relay().await;
    let (desktop_network, phone_network) = LoopbackNetwork::pair();

    let (mut desktop, mut desktop_messages) = device(
        &address,
        "Studio Mac",
        p::DeviceType::Desktop,
        desktop_network,
    )
    .await;
    let (mut phone, phone_messages) =
        device(&address, "Pixel", p::DeviceType::Mobile, phone_network).await;

    // Both devices are registered once the phone's broadcast reaches the
    // desktop
    deliver(|| phone.client.join_room("studio"), &mut desktop_messages).await;

    let desktop_id = desktop.client.device_id();
    let phone_id = phone.client.device_id();
    trickle_candidates(&desktop, phone_id.clone());
    trickle_candidates(&phone, desktop_id.clone());

    let desktop_signalling = handle_signalling(&desktop, desktop_messages);
    let phone_signalling = handle_signalling(&phone, phone_messages);

    let desktop_microphone = MediaTrack::audio("desktop microphone");
    let phone_microphone = MediaTrack::audio("phone microphone");
    desktop
        .manager
        .add_local_stream(&MediaStream::new(vec![desktop_microphone.clone()]))
        .await
        .unwrap();
    phone
        .manager
        .add_local_stream(&MediaStream::new(vec![phone_microphone.clone()]))
        .await
        .unwrap();

    let offer = desktop.manager.create_offer().await.unwrap();
    desktop.client.send_offer(&offer, &phone_id).await.unwrap();

    wait_for(&mut desktop.states, p::ConnectionStatus::Connected).await;
    wait_for(&mut phone.states, p::ConnectionStatus::Connected).await;

    assert_eq!(phone.tracks.next().await.unwrap(), desktop_microphone);
    assert_eq!(desktop.tracks.next().await.unwrap(), phone_microphone);

    // Each side applied the candidate the other gathered, whichever of the
    // description or the candidate arrived first
    let phone_network = phone.network.clone();
    eventually("phone candidates", || {
        phone_network.remote_candidates().len() == 1
    })
    .await;
    let desktop_network = desktop.network.clone();
    eventually("desktop candidates", || {
        desktop_network.remote_candidates().len() == 1
    })
    .await;

    let state = wait_for(&mut desktop.states, p::ConnectionStatus::Connected).await;
    assert_eq!(state.quality, Some(p::ConnectionQuality::Excellent));
    let metrics = desktop.manager.get_stats().await.unwrap();
    assert_eq!(metrics.packets_lost, 0);

    phone.manager.close().await;
    wait_for(&mut desktop.states, p::ConnectionStatus::Disconnected).await;
    assert_eq!(phone.manager.state().status, p::ConnectionStatus::Closed);

    desktop.manager.close().await;
    desktop.client.disconnect().await;
    phone.client.disconnect().await;
    desktop_signalling.abort();
    phone_signalling.abort();
}
