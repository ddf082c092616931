//! Impure I/O operations for the broker session
//!
//! [`MqttSession`] owns one rumqttc client and the task polling its event
//! loop. All operations take `&self`, so a session behind an `Arc` can be used
//! from several tasks at once.

use super::acknowledgements::AckTracker;
use super::connection::{
    configure_mqtt_options, log_state_transition, ConnectionEvent, ConnectionState, MqttError,
    SessionConfiguration,
};
use super::message_handler::{EventRoute, HandlerRegistry, SharedHandler};
use crate::protocol::topics::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, QoS};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// One logical connection to one broker
pub struct MqttSession {
    client: AsyncClient,
    client_id: String,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    handlers: Arc<HandlerRegistry>,
    acks: Arc<AckTracker>,
    // Serialises waiter registration with request hand-off
    request_lock: AsyncMutex<()>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Connect and complete the broker handshake
    ///
    /// `default_handler` receives every inbound message on a subscribed topic
    /// that has no handler of its own. Returns once CONNACK arrives; a refused
    /// or failed handshake is returned as [`MqttError::ConnectFailed`].
    pub async fn connect(
        config: SessionConfiguration,
        default_handler: SharedHandler,
    ) -> Result<Self, MqttError> {
        let options = configure_mqtt_options(&config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::initial());
        let state_tx = Arc::new(state_tx);
        let handlers = Arc::new(HandlerRegistry::new(default_handler));
        let acks = Arc::new(AckTracker::new());

        apply_event(&state_tx, ConnectionEvent::ConnectRequested);
        info!(
            broker = %config.broker_url(),
            client_id = %config.client_id,
            clean_session = config.clean_session,
            "Connecting to MQTT broker"
        );

        let span = crate::mqtt_span!(operation = "event_loop", client_id = %config.client_id);
        let handle = tokio::spawn(
            run_event_loop(event_loop, state_tx.clone(), handlers.clone(), acks.clone())
                .instrument(span),
        );

        Self::wait_for_connection_confirmation(state_rx.clone()).await?;

        Ok(Self {
            client,
            client_id: config.client_id,
            state_tx,
            state_rx,
            handlers,
            acks,
            request_lock: AsyncMutex::new(()),
            event_loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Wait until the state leaves `Connecting`
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
    ) -> Result<(), MqttError> {
        let settled = state_rx
            .wait_for(|state| !matches!(state, ConnectionState::Connecting))
            .await
            .map_err(|_| MqttError::ConnectFailed("event loop stopped before CONNACK".into()))?
            .clone();

        match settled {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected(reason) => Err(MqttError::ConnectFailed(reason.into())),
            other => Err(MqttError::ConnectFailed(
                format!("unexpected state after connect: {other:?}").into(),
            )),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Publishes still waiting for PUBACK/PUBCOMP
    pub fn inflight_publishes(&self) -> usize {
        self.acks.inflight()
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !state.is_connected() {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    /// Publish one message
    ///
    /// QoS 0 returns once the request is handed to the event loop; QoS 1 and
    /// 2 wait for PUBACK and PUBCOMP respectively.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_topic_name(topic)?;
        self.check_connection_state()?;

        debug!(target: "mqtt_transport", topic = %topic, qos = ?qos, retain, bytes = payload.len(), "Publishing");

        if qos == QoS::AtMostOnce {
            return self
                .client
                .publish(topic, qos, retain, payload)
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)));
        }

        let ack = {
            let _order = self.request_lock.lock().await;
            let ack = self.acks.expect_publish();
            if let Err(e) = self.client.publish(topic, qos, retain, payload).await {
                self.acks.cancel_last_publish();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            ack
        };

        ack.await.map_err(|_| {
            MqttError::PublishFailed("connection closed before acknowledgment".into())
        })
    }

    /// Subscribe to a filter, optionally with its own handler
    ///
    /// Without a handler, matching messages go to the session default.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<SharedHandler>,
    ) -> Result<(), MqttError> {
        validate_topic_filter(filter)?;
        self.check_connection_state()?;

        info!(filter = %filter, qos = ?qos, "Subscribing");

        // Registered before SUBACK so retained messages reach the right handler
        let replaced = handler.map(|handler| self.handlers.add_route(filter, handler));

        let ack = {
            let _order = self.request_lock.lock().await;
            let ack = self.acks.expect_subscribe();
            if let Err(e) = self.client.subscribe(filter, qos).await {
                self.acks.cancel_last_subscribe();
                self.undo_route(filter, replaced);
                return Err(MqttError::SubscribeFailed(Box::new(e)));
            }
            ack
        };

        match ack.await {
            Ok(Ok(())) => {
                info!(filter = %filter, "Subscription confirmed");
                Ok(())
            }
            Ok(Err(reason)) => {
                self.undo_route(filter, replaced);
                Err(MqttError::SubscribeFailed(reason.into()))
            }
            Err(_) => {
                self.undo_route(filter, replaced);
                Err(MqttError::SubscribeFailed(
                    "connection closed before SUBACK".into(),
                ))
            }
        }
    }

    /// Roll back a route this subscribe call registered, if any
    fn undo_route(&self, filter: &str, replaced: Option<Option<SharedHandler>>) {
        if let Some(previous) = replaced {
            self.handlers.restore_route(filter, previous);
        }
    }

    /// Orderly shutdown bounded by `grace`
    ///
    /// Waits for in-flight acknowledgments, sends DISCONNECT and lets the
    /// event loop flush it; whatever is still running when the grace period
    /// runs out is aborted. Always returns with the session disconnected.
    pub async fn disconnect(&self, grace: Duration) {
        let started = Instant::now();
        apply_event(&self.state_tx, ConnectionEvent::DisconnectRequested);

        if tokio::time::timeout(grace, self.acks.wait_idle()).await.is_err() {
            warn!(
                inflight = self.acks.inflight(),
                "Grace period ended with unacknowledged publishes"
            );
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!(target: "mqtt_transport", "DISCONNECT not queued: {}", e);
        }

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            let remaining = grace.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop did not stop within grace period, forcing close");
                    handle.abort();
                }
            }
        }

        // Covers the forced-close path where the task never reported back
        apply_event(&self.state_tx, ConnectionEvent::DisconnectCompleted);
        self.acks.fail_all();

        info!(client_id = %self.client_id, "MQTT session disconnected");
    }
}

/// Apply a state event, returning whether the state changed
fn apply_event(state_tx: &watch::Sender<ConnectionState>, event: ConnectionEvent) -> bool {
    state_tx.send_if_modified(|state| match state.transition(event.clone()) {
        Some(next) => {
            log_state_transition(state, &next);
            *state = next;
            true
        }
        None => {
            debug!(target: "mqtt_transport", "Ignoring {:?} in state {:?}", event, state);
            false
        }
    })
}

/// Poll the event loop until the connection ends; no reconnection
async fn run_event_loop(
    mut event_loop: EventLoop,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    handlers: Arc<HandlerRegistry>,
    acks: Arc<AckTracker>,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(event) => event,
            Err(ConnectionError::ConnectionRefused(code)) => {
                error!("Broker refused connection: {:?}", code);
                apply_event(
                    &state_tx,
                    ConnectionEvent::ConnectFailed(format!("broker refused connection: {code:?}")),
                );
                break;
            }
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                apply_event(&state_tx, ConnectionEvent::TransportClosed(e.to_string()));
                break;
            }
        };

        match EventRoute::from_event(&event) {
            EventRoute::ConnectionAcknowledged => {
                apply_event(&state_tx, ConnectionEvent::ConnAckReceived);
            }
            EventRoute::MessageReceived(message) => handlers.dispatch(&message),
            EventRoute::PublishAcknowledged { packet_id } => acks.publish_acknowledged(packet_id),
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                acks.subscribe_acknowledged(packet_id, granted)
            }
            EventRoute::PublishSent { packet_id } => acks.publish_sent(packet_id),
            EventRoute::SubscribeSent { packet_id } => acks.subscribe_sent(packet_id),
            EventRoute::Disconnected => {
                apply_event(
                    &state_tx,
                    ConnectionEvent::TransportClosed("broker sent DISCONNECT".to_string()),
                );
                break;
            }
            EventRoute::DisconnectSent => {
                apply_event(&state_tx, ConnectionEvent::DisconnectCompleted);
                break;
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    // Closing the request channel first makes late publishes fail instead of waiting
    drop(event_loop);
    acks.fail_all();
}

#[async_trait]
impl Transport for MqttSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        MqttSession::publish(self, topic, payload, qos, retain).await
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<SharedHandler>,
    ) -> Result<(), MqttError> {
        MqttSession::subscribe(self, filter, qos, handler).await
    }

    async fn disconnect(&self, grace: Duration) {
        MqttSession::disconnect(self, grace).await
    }

    fn connection_state(&self) -> ConnectionState {
        MqttSession::connection_state(self)
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // disconnect() is async; dropping without it only stops the task
        if let Some(handle) = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::connection::SessionTransport;

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result = MqttSession::wait_for_connection_confirmation(state_rx).await;
        assert!(result.is_ok(), "Should successfully wait for connection");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_failure_carries_reason() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("tls handshake failed".to_string()));
        });

        let result = MqttSession::wait_for_connection_confirmation(state_rx).await;
        let err = result.unwrap_err();
        assert!(matches!(err, MqttError::ConnectFailed(_)));
        assert!(err.to_string().contains("tls handshake failed"));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_channel_closed() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        drop(state_tx);

        let result = MqttSession::wait_for_connection_confirmation(state_rx).await;
        assert!(matches!(result, Err(MqttError::ConnectFailed(_))));
    }

    #[test]
    fn test_apply_event_ignores_invalid_transitions() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::initial());

        assert!(!apply_event(&state_tx, ConnectionEvent::ConnAckReceived));
        assert_eq!(*state_rx.borrow(), ConnectionState::initial());

        assert!(apply_event(&state_tx, ConnectionEvent::ConnectRequested));
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_refused_port_fails() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SessionConfiguration {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "refused-test".to_string(),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            transport: SessionTransport::Tcp,
        };
        let handler: SharedHandler = Arc::new(|_: &crate::protocol::Message| {});

        let result = MqttSession::connect(config, handler).await;
        assert!(matches!(result, Err(MqttError::ConnectFailed(_))));
    }
}
