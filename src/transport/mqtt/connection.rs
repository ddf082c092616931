//! Pure connection state management for the broker session
//!
//! This module contains the session configuration value, the connection
//! state machine and the translation into rumqttc options. Nothing here
//! touches the network.

use crate::config::AppConfig;
use crate::protocol::topics::TopicError;
use crate::tls::TlsContext;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No transport; carries the reason the last connection ended
    Disconnected(String),
    /// Transport opening, CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK received; publish and subscribe allowed
    Connected,
    /// Orderly shutdown in progress
    Disconnecting,
}

impl ConnectionState {
    /// State of a session that has never been connected
    pub fn initial() -> Self {
        ConnectionState::Disconnected("not connected".to_string())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Apply an event, returning `None` if the transition is not allowed
    pub fn transition(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Disconnected(_), E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::ConnAckReceived) => Some(S::Connected),
            (S::Connecting, E::ConnectFailed(reason)) => Some(S::Disconnected(reason)),
            (S::Connecting, E::TransportClosed(reason)) => Some(S::Disconnected(reason)),
            (S::Connected, E::DisconnectRequested) => Some(S::Disconnecting),
            (S::Connected, E::TransportClosed(reason)) => Some(S::Disconnected(reason)),
            (S::Disconnecting, E::DisconnectCompleted) => {
                Some(S::Disconnected("client disconnected".to_string()))
            }
            (S::Disconnecting, E::TransportClosed(reason)) => Some(S::Disconnected(reason)),
            _ => None,
        }
    }
}

/// Events that drive [`ConnectionState`] transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnAckReceived,
    ConnectFailed(String),
    DisconnectRequested,
    DisconnectCompleted,
    /// Network or protocol error, or broker-initiated close
    TransportClosed(String),
}

/// Log a state change
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!("MQTT connection lost: {}", reason);
        }
        _ => {
            info!("MQTT connection state: {:?} -> {:?}", from, to);
        }
    }
}

/// Broker session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// How the session reaches the broker
#[derive(Debug, Clone)]
pub enum SessionTransport {
    /// Mutual TLS using a prebuilt context
    Tls(TlsContext),
    /// Plain TCP, only meant for local test brokers
    Tcp,
}

/// Immutable parameters of one broker session
#[derive(Debug, Clone)]
pub struct SessionConfiguration {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub transport: SessionTransport,
}

impl SessionConfiguration {
    /// Session configuration for the configured broker over TLS
    pub fn from_app_config(config: &AppConfig, tls: TlsContext) -> Self {
        Self {
            host: config.broker.host.clone(),
            port: config.broker.port,
            client_id: config.session.client_id.clone(),
            clean_session: config.session.clean_session,
            keep_alive: config.session.keep_alive(),
            transport: SessionTransport::Tls(tls),
        }
    }

    pub fn validate(&self) -> Result<(), MqttError> {
        if self.host.trim().is_empty() {
            return Err(MqttError::InvalidConfig("broker host is empty".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(MqttError::InvalidConfig("client id is empty".to_string()));
        }
        if self.port == 0 {
            return Err(MqttError::InvalidConfig("broker port is 0".to_string()));
        }
        Ok(())
    }

    /// Broker URL for logging, `tcps://` for TLS and `tcp://` otherwise
    pub fn broker_url(&self) -> String {
        let scheme = match self.transport {
            SessionTransport::Tls(_) => "tcps",
            SessionTransport::Tcp => "tcp",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Translate a session configuration into rumqttc options
pub fn configure_mqtt_options(config: &SessionConfiguration) -> Result<MqttOptions, MqttError> {
    config.validate()?;

    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_clean_session(config.clean_session);
    options.set_keep_alive(config.keep_alive);

    if let SessionTransport::Tls(tls) = &config.transport {
        options.set_transport(tls.clone().into_transport());
    } else {
        options.set_transport(RumqttcTransport::Tcp);
    }

    Ok(options)
}
