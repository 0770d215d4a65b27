// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::transport::RtcConfiguration;

pub const DEFAULT_RELAY_ADDRESS: &str = "ws://localhost:3001";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
pub const DEFAULT_ICE_CANDIDATE_POOL_SIZE: u8 = 10;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_CHANNEL_COUNT: u16 = 2;
pub const DEFAULT_BITRATE: u32 = 128_000;

/// (De)serializes a [`Duration`] as a number of milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Settings of the [`crate::SignallingClient`]
pub struct ClientSettings {
    /// WebSocket URL of the relay
    pub address: String,
    #[serde(rename = "reconnectIntervalMs", with = "millis")]
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(rename = "connectTimeoutMs", with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_RELAY_ADDRESS.to_string(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Settings of the [`crate::PeerConnectionManager`]
pub struct PeerSettings {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    /// Period of the statistics polling while connected
    #[serde(rename = "statsIntervalMs", with = "millis")]
    pub stats_interval: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            ice_candidate_pool_size: DEFAULT_ICE_CANDIDATE_POOL_SIZE,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl PeerSettings {
    pub fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// Local audio settings.
///
/// Sample rate, channel count and bitrate shape the Opus parameters offered
/// by [`crate::transport::webrtc::WebRtcFactory`]. The processing flags are
/// for whoever captures the local stream.
pub struct AudioConstraints {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Bits per second
    pub bitrate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_count: DEFAULT_CHANNEL_COUNT,
            bitrate: DEFAULT_BITRATE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
/// Everything a device needs, loadable from a JSON document
pub struct Settings {
    pub client: ClientSettings,
    pub peer: PeerSettings,
    pub audio: AudioConstraints,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).context("invalid settings document")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();

        assert_eq!(settings.client.address, "ws://localhost:3001");
        assert_eq!(settings.client.reconnect_interval, Duration::from_millis(5000));
        assert_eq!(settings.client.max_reconnect_attempts, 10);
        assert_eq!(settings.peer.ice_candidate_pool_size, 10);
        assert_eq!(settings.peer.ice_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert_eq!(settings.peer.stats_interval, Duration::from_secs(1));
        assert_eq!(settings.audio.sample_rate, 48000);
        assert_eq!(settings.audio.channel_count, 2);
        assert_eq!(settings.audio.bitrate, 128_000);
        assert!(settings.audio.echo_cancellation);
        assert!(settings.audio.noise_suppression);
        assert!(settings.audio.auto_gain_control);
    }

    #[test]
    fn partial_document() {
        let settings = Settings::from_json(
            r#"{
                "client": { "address": "ws://relay.lan:4000", "reconnectIntervalMs": 250 },
                "peer": { "iceServers": [{ "urls": ["turn:turn.lan"], "username": "u", "credential": "c" }] },
                "audio": { "echoCancellation": false }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.client.address, "ws://relay.lan:4000");
        assert_eq!(settings.client.reconnect_interval, Duration::from_millis(250));
        assert_eq!(settings.client.max_reconnect_attempts, 10);
        assert_eq!(settings.peer.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(settings.peer.ice_candidate_pool_size, 10);
        assert!(!settings.audio.echo_cancellation);
        assert!(settings.audio.noise_suppression);

        let rtc = settings.peer.rtc_configuration();
        assert_eq!(rtc.ice_servers, settings.peer.ice_servers);
    }

    #[test]
    fn invalid_document() {
        assert!(Settings::from_json(r#"{ "client": { "maxReconnectAttempts": "ten" } }"#).is_err());
    }
}
