//! Mock implementations for testing
//!
//! [`MockTransport`] behaves like a connected session on a loopback broker:
//! publishes are recorded and delivered to matching subscriptions through the
//! same handler routing the real session uses.

use crate::protocol::messages::Message;
use crate::protocol::topics::{topic_matches, validate_topic_filter, validate_topic_name};
use crate::transport::mqtt::{ConnectionState, HandlerRegistry, MqttError, SharedHandler};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

/// Mock transport for testing
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<Message>>>,
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
    /// Delay applied to subscribe, to let tests order it against publish
    pub subscribe_latency: Duration,
    handlers: HandlerRegistry,
    state: std::sync::Mutex<ConnectionState>,
    disconnects: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Connected mock whose default handler discards messages
    pub fn new() -> Self {
        Self::with_default_handler(Arc::new(|_: &Message| {}))
    }

    pub fn with_default_handler(default_handler: SharedHandler) -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            fail_publish: false,
            fail_subscribe: false,
            subscribe_latency: Duration::ZERO,
            handlers: HandlerRegistry::new(default_handler),
            state: std::sync::Mutex::new(ConnectionState::Connected),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn with_publish_failure(mut self) -> Self {
        self.fail_publish = true;
        self
    }

    pub fn with_subscribe_failure(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    pub fn with_subscribe_latency(mut self, latency: Duration) -> Self {
        self.subscribe_latency = latency;
        self
    }

    pub async fn published_messages(&self) -> Vec<Message> {
        self.published.lock().await.clone()
    }

    pub async fn subscribed_filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_topic_name(topic)?;
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        if self.fail_publish {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        let message = Message::new(topic, payload, qos, retain);
        self.published.lock().await.push(message.clone());

        let delivered = self
            .subscriptions
            .lock()
            .await
            .iter()
            .any(|(filter, _)| topic_matches(filter, topic));
        if delivered {
            self.handlers.dispatch(&message);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<SharedHandler>,
    ) -> Result<(), MqttError> {
        validate_topic_filter(filter)?;
        if !self.subscribe_latency.is_zero() {
            tokio::time::sleep(self.subscribe_latency).await;
        }
        if self.fail_subscribe {
            return Err(MqttError::SubscribeFailed("Mock subscribe failure".into()));
        }

        if let Some(handler) = handler {
            self.handlers.add_route(filter, handler);
        }
        self.subscriptions.lock().await.push((filter.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected(
            "client disconnected".to_string(),
        ));
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
