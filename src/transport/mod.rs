//! Transport layer for broker communication
//!
//! This module provides the transport abstraction used by the lifecycle
//! controller and its MQTT implementation.

use crate::transport::mqtt::{ConnectionState, MqttError, SharedHandler};
use rumqttc::QoS;
use std::time::Duration;

pub mod mqtt;

/// Transport trait for broker communication
///
/// This trait provides an abstraction over the broker session so the
/// lifecycle controller can be driven by a mock in tests. Implementations
/// must allow every method to be called concurrently through `&self`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to a topic name
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Subscribe to a topic filter; `None` routes to the session default handler
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<SharedHandler>,
    ) -> Result<(), MqttError>;

    /// Close the session within `grace`; never fails
    async fn disconnect(&self, grace: Duration);

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }
}
