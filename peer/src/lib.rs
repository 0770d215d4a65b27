// SPDX-License-Identifier: MPL-2.0

//! Device side of AudioLink: the signalling client talking to the relay and
//! the peer connection manager driving the offer/answer/ICE exchange.

pub use audiolink_signalling_protocol as protocol;

pub mod client;
pub mod config;
pub mod peer;
pub mod transport;

pub use client::{ClientError, ClientStatus, SignallingClient};
pub use config::{AudioConstraints, ClientSettings, IceServer, PeerSettings, Settings};
pub use peer::{IceCandidateBuffer, NegotiationError, PeerConnectionManager};
pub use transport::webrtc::WebRtcFactory;
