//! MQTT 3.1.1 broker session over mutual TLS
//!
//! The session is split the same way as the rest of the transport layer,
//! separating pure functions from I/O:
//!
//! - [`connection`] - configuration, state machine and rumqttc options
//! - [`message_handler`] - event classification and handler routing
//! - [`acknowledgements`] - PUBACK/PUBCOMP/SUBACK waiters
//! - [`client`] - the session handle and its event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use heartrate_mqtt::transport::mqtt::{MqttSession, SessionConfiguration, SessionTransport, SharedHandler};
//! use heartrate_mqtt::protocol::Message;
//! use rumqttc::QoS;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfiguration {
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     client_id: "someThing".to_string(),
//!     clean_session: true,
//!     keep_alive: Duration::from_secs(30),
//!     transport: SessionTransport::Tcp,
//! };
//! let printer: SharedHandler = Arc::new(|m: &Message| println!("{}", m.payload_str()));
//!
//! let session = MqttSession::connect(config, printer).await?;
//! session.subscribe("/dummy", QoS::AtMostOnce, None).await?;
//! session.publish("/dummy", b"hello".to_vec(), QoS::AtMostOnce, false).await?;
//! session.disconnect(Duration::from_millis(250)).await;
//! # Ok(())
//! # }
//! ```

pub mod acknowledgements;
pub mod client;
pub mod connection;
pub mod message_handler;

pub use acknowledgements::AckTracker;
pub use client::MqttSession;
pub use connection::{
    configure_mqtt_options, ConnectionEvent, ConnectionState, MqttError,
    SessionConfiguration, SessionTransport,
};
pub use message_handler::{EventRoute, HandlerRegistry, MessageHandler, SharedHandler};
