// SPDX-License-Identifier: MPL-2.0

/// The protocol spoken between AudioLink devices and the signalling relay
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "kebab-case")]
/// Kind of a signalling envelope
pub enum MessageType {
    /// Carries a [`SessionDescription`] of type offer
    Offer,
    /// Carries a [`SessionDescription`] of type answer
    Answer,
    /// Carries a trickled [`IceCandidate`]
    IceCandidate,
    /// Carries a [`RoomPayload`]
    Join,
    /// Carries a [`RoomPayload`]
    Leave,
    /// Reserved for relay generated errors
    Error,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
/// The envelope forwarded by the relay between devices
pub struct SignallingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque to the relay
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Originating device, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target device, `None` broadcasts to every other registered device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Milliseconds since the UNIX epoch at creation, informative only
    #[serde(default)]
    pub timestamp: u64,
}

impl SignallingMessage {
    pub fn new(kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            from: None,
            to: None,
            timestamp: now_millis(),
        }
    }

    /// Builds an envelope from any serializable payload
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn from_device(mut self, device_id: impl Into<String>) -> Self {
        self.from = Some(device_id.into());
        self
    }

    pub fn to_device(mut self, device_id: impl Into<String>) -> Self {
        self.to = Some(device_id.into());
        self
    }

    /// Decodes the payload into its typed form
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Desktop,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
/// Identity of a device, sent to the relay at registration
pub struct DeviceInfo {
    /// Generated once per process, immutable for the life of a connection
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub platform: String,
    pub version: String,
}

impl DeviceInfo {
    /// Creates a descriptor with a freshly generated identifier
    pub fn new(
        name: impl Into<String>,
        device_type: DeviceType,
        platform: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            device_type,
            platform: platform.into(),
            version: version.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Classifies a sample, the first matching band wins.
    ///
    /// `jitter` and `round_trip_time` are in milliseconds.
    pub fn classify(packets_lost: u64, jitter: f64, round_trip_time: f64) -> Self {
        if packets_lost > 5 || jitter > 50. || round_trip_time > 200. {
            ConnectionQuality::Poor
        } else if packets_lost > 2 || jitter > 30. || round_trip_time > 100. {
            ConnectionQuality::Fair
        } else if packets_lost > 0 || jitter > 15. || round_trip_time > 50. {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Excellent
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
/// Observable state of a peer connection
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Round trip time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<ConnectionQuality>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(rename_all = "camelCase")]
/// One statistics sample of an audio connection
pub struct AudioMetrics {
    /// Normalized to 0..=1
    pub input_level: f64,
    /// Normalized to 0..=1
    pub output_level: f64,
    pub packets_lost: u64,
    /// Milliseconds
    pub jitter: f64,
    /// Milliseconds
    pub round_trip_time: f64,
}

impl AudioMetrics {
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::classify(self.packets_lost, self.jitter, self.round_trip_time)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
/// Conveys a SDP
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
/// Conveys an ICE candidate
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// The mline index the candidate applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
/// Payload of join and leave messages
pub struct RoomPayload {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "camelCase")]
/// Messages received by the server from devices
pub enum IncomingMessage {
    /// Associate the sending connection with a device
    Register(DeviceInfo),
    /// Forward an envelope to its target, or broadcast it
    Message(SignallingMessage),
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "camelCase")]
/// Messages sent from the server to devices
pub enum OutgoingMessage {
    /// An envelope forwarded from another device, `from` stamped by the relay
    Message(SignallingMessage),
}
