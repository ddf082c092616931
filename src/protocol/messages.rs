//! Message types carried over the broker
//!
//! The demo exchanges one payload shape, `{"message": {"event": .., "data": ..}}`,
//! JSON-encoded. [`Message`] is the transport-level value: topic, bytes, QoS
//! and retain flag.

use bytes::Bytes;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event name used for the demonstration reading
pub const HEARTRATE_EVENT: &str = "heartrate";

/// Payload encoding/decoding failures
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A single sensor reading
///
/// # Examples
/// ```
/// use heartrate_mqtt::protocol::Reading;
///
/// let reading = Reading { event: "heartrate".to_string(), data: 80 };
/// assert_eq!(reading.data, 80);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reading {
    pub event: String,
    pub data: i64,
}

/// Envelope published to the demo topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadingEnvelope {
    pub message: Reading,
}

impl ReadingEnvelope {
    pub fn new(event: impl Into<String>, data: i64) -> Self {
        Self {
            message: Reading {
                event: event.into(),
                data,
            },
        }
    }

    /// Heartrate reading in beats per minute
    pub fn heartrate(bpm: i64) -> Self {
        Self::new(HEARTRATE_EVENT, bpm)
    }

    /// Compact JSON encoding, field order `event` then `data`
    pub fn to_bytes(&self) -> Result<Vec<u8>, MarshalError> {
        serde_json::to_vec(self).map_err(MarshalError::Encode)
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, MarshalError> {
        serde_json::from_slice(payload).map_err(MarshalError::Decode)
    }
}

/// Message as produced for publish or received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    /// Payload rendered as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
