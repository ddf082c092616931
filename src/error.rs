//! Top-level error taxonomy
//!
//! Every startup failure ends up as one [`AppError`]; `main` logs it once
//! and exits non-zero. Module errors convert in with `?`.

use crate::config::ConfigError;
use crate::lifecycle::LifecycleError;
use crate::protocol::messages::MarshalError;
use crate::tls::CertificateError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Fatal application errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Connection error: {0}")]
    Connect(#[source] MqttError),

    #[error("Publish error: {0}")]
    Publish(#[source] MqttError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[source] MqttError),

    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Publish(e) => AppError::Publish(e),
            LifecycleError::Subscribe(e) => AppError::Subscribe(e),
            LifecycleError::Marshal(e) => AppError::Marshal(e),
        }
    }
}
