//! Lifecycle controller for the demonstration client
//!
//! Startup order once the session is connected: spawn the delayed publish
//! task, then subscribe to the same topic through the session default
//! handler. The two race; a QoS 0 message published before the SUBACK
//! arrives is lost. The controller then waits for an external shutdown
//! signal (or a fatal publish failure) and disconnects within the grace
//! period.

use crate::config::{AppConfig, SessionDefaults};
use crate::protocol::messages::{MarshalError, ReadingEnvelope};
use crate::transport::mqtt::MqttError;
use crate::transport::Transport;
use rumqttc::QoS;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

/// Demonstration heartrate reading, in beats per minute
pub const DEMO_HEARTRATE_BPM: i64 = 80;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Publishing the reading failed: {0}")]
    Publish(#[source] MqttError),
    #[error("Subscribing failed: {0}")]
    Subscribe(#[source] MqttError),
    #[error("Encoding the reading failed: {0}")]
    Marshal(#[from] MarshalError),
}

/// What the controller publishes and subscribes to, and when
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub publish_delay: Duration,
    pub disconnect_grace: Duration,
    pub reading: ReadingEnvelope,
}

impl LifecycleSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::from_session_defaults(&config.session)
    }

    pub fn from_session_defaults(session: &SessionDefaults) -> Self {
        Self {
            topic: session.topic.clone(),
            qos: QoS::AtMostOnce,
            retain: false,
            publish_delay: session.publish_delay(),
            disconnect_grace: session.disconnect_grace(),
            reading: ReadingEnvelope::heartrate(DEMO_HEARTRATE_BPM),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_session_defaults(&SessionDefaults::default())
    }
}

/// Orchestrates publish, subscribe and shutdown over one transport
pub struct LifecycleController<T>
where
    T: Transport + 'static,
{
    transport: Arc<T>,
    settings: LifecycleSettings,
    publish_handle: Option<JoinHandle<()>>,
    publish_outcome: Option<oneshot::Receiver<Result<(), LifecycleError>>>,
    shut_down: bool,
}

impl<T> LifecycleController<T>
where
    T: Transport + 'static,
{
    /// Create a controller over an already connected transport
    pub fn new(transport: T, settings: LifecycleSettings) -> Self {
        Self::with_shared(Arc::new(transport), settings)
    }

    pub fn with_shared(transport: Arc<T>, settings: LifecycleSettings) -> Self {
        Self {
            transport,
            settings,
            publish_handle: None,
            publish_outcome: None,
            shut_down: false,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Sleep, encode and publish one reading
    async fn delayed_publish(
        transport: Arc<T>,
        settings: LifecycleSettings,
    ) -> Result<(), LifecycleError> {
        tokio::time::sleep(settings.publish_delay).await;

        let payload = settings.reading.to_bytes()?;
        transport
            .publish(&settings.topic, payload, settings.qos, settings.retain)
            .await
            .map_err(LifecycleError::Publish)?;

        info!(
            topic = %settings.topic,
            event = %settings.reading.message.event,
            data = settings.reading.message.data,
            "Published reading"
        );
        Ok(())
    }

    fn spawn_publish_task(&mut self) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let transport = self.transport.clone();
        let settings = self.settings.clone();
        let span = crate::lifecycle_span!(operation = "delayed_publish", topic = %settings.topic);

        let handle = tokio::spawn(
            async move {
                let outcome = Self::delayed_publish(transport, settings).await;
                if let Err(e) = &outcome {
                    error!("Delayed publish failed: {}", e);
                }
                let _ = outcome_tx.send(outcome);
            }
            .instrument(span),
        );

        self.publish_handle = Some(handle);
        self.publish_outcome = Some(outcome_rx);
    }

    /// Start the delayed publish, then subscribe
    ///
    /// Only the subscribe outcome is reported here; publish failures surface
    /// from [`run_until`](Self::run_until).
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        info!(
            topic = %self.settings.topic,
            delay_ms = self.settings.publish_delay.as_millis() as u64,
            "Starting lifecycle"
        );

        self.spawn_publish_task();

        self.transport
            .subscribe(&self.settings.topic, self.settings.qos, None)
            .instrument(crate::lifecycle_span!(operation = "subscribe", topic = %self.settings.topic))
            .await
            .map_err(LifecycleError::Subscribe)?;

        info!(topic = %self.settings.topic, "Subscribed");
        Ok(())
    }

    /// Block until `shutdown` resolves or the publish task fails, then shut down
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = match self.publish_outcome.take() {
            Some(mut publish_outcome) => tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    Ok(())
                }
                result = &mut publish_outcome => match result {
                    Ok(Err(e)) => Err(e),
                    // Published, or the task is gone; only the signal ends the run now
                    Ok(Ok(())) | Err(_) => {
                        (&mut shutdown).await;
                        info!("Shutdown requested");
                        Ok(())
                    }
                },
            },
            None => {
                shutdown.await;
                info!("Shutdown requested");
                Ok(())
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Stop the publish task and disconnect within the grace period
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(handle) = self.publish_handle.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Publish task ended abnormally: {}", e);
                }
            }
        }

        self.transport
            .disconnect(self.settings.disconnect_grace)
            .await;
        info!(state = ?self.transport.connection_state(), "Disconnected");
    }
}
