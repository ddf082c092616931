//! Heartrate MQTT - mutual TLS publish/subscribe demonstration client
//!
//! Connects to an MQTT 3.1.1 broker over TLS with a client certificate,
//! publishes one JSON heartrate reading after a short delay, prints every
//! message received on the same topic and disconnects cleanly on interrupt.
//!
//! # Overview
//!
//! - [`config`] - environment configuration and fixed session defaults
//! - [`tls`] - PEM credentials to a rustls client configuration
//! - [`transport`] - the broker session and the [`Transport`](transport::Transport) seam
//! - [`dispatcher`] - default handler printing received messages
//! - [`lifecycle`] - startup order, delayed publish and bounded shutdown
//!
//! # Quick Start
//!
//! ```rust
//! use heartrate_mqtt::protocol::ReadingEnvelope;
//!
//! let payload = ReadingEnvelope::heartrate(80).to_bytes().unwrap();
//! assert_eq!(payload, br#"{"message":{"event":"heartrate","data":80}}"#);
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::{AppConfig, ConfigError};
pub use dispatcher::LoggingDispatcher;
pub use error::{AppError, AppResult};
pub use lifecycle::{LifecycleController, LifecycleError, LifecycleSettings};
pub use protocol::*;
pub use tls::{CertificateError, CredentialBundle, TlsContext};
pub use transport::mqtt::MqttSession;
pub use transport::Transport;
