//! Environment-driven configuration for the heartrate client
//!
//! The broker host and the three credential paths come from the process
//! environment, normally populated from a local `.env` file. Everything else
//! is fixed by the demonstration and lives in [`SessionDefaults`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable holding the broker hostname
pub const HOST_ENV: &str = "HOST";
/// Environment variable holding the trusted CA bundle path
pub const ROOT_PEM_ENV: &str = "ROOT_PEM";
/// Environment variable holding the client certificate path
pub const PUB_CERT_ENV: &str = "PUB_CERT";
/// Environment variable holding the client private key path
pub const PRIV_KEY_ENV: &str = "PRIV_KEY";

/// MQTT-over-TLS default port
pub const MQTTS_PORT: u16 = 8883;

/// Resolved client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub broker: BrokerSection,
    pub credentials: CredentialPaths,
    pub session: SessionDefaults,
}

/// Broker address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
}

/// Filesystem locations of the PEM material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialPaths {
    pub root_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Fixed session and demo parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDefaults {
    /// Must be unique per broker or the broker evicts the older session
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub topic: String,
    pub publish_delay_ms: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            client_id: "someThing".to_string(),
            clean_session: true,
            keep_alive_secs: 30,
            topic: "/dummy".to_string(),
            publish_delay_ms: 3000,
            disconnect_grace_ms: 250,
        }
    }
}

impl SessionDefaults {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn publish_delay(&self) -> Duration {
        Duration::from_millis(self.publish_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Failed to read credential file {path}: {source}")]
    CredentialRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Load an environment file into the process environment
///
/// Variables already present in the environment win over the file.
pub fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    })
}

impl AppConfig {
    /// Build the configuration from the current process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, ConfigError> {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()))
        };

        let config = AppConfig {
            broker: BrokerSection {
                host: required(HOST_ENV)?.trim().to_string(),
                port: MQTTS_PORT,
            },
            credentials: CredentialPaths {
                root_ca: PathBuf::from(required(ROOT_PEM_ENV)?),
                client_cert: PathBuf::from(required(PUB_CERT_ENV)?),
                client_key: PathBuf::from(required(PRIV_KEY_ENV)?),
            },
            session: SessionDefaults::default(),
        };

        config.broker_url()?;
        Ok(config)
    }

    /// Broker URL in the `tcps://host:port` form
    pub fn broker_url(&self) -> Result<Url, ConfigError> {
        let raw = format!("tcps://{}:{}", self.broker.host, self.broker.port);
        let url = Url::parse(&raw)
            .map_err(|e| ConfigError::InvalidConfig(format!("Invalid broker URL {raw}: {e}")))?;

        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(url),
            _ => Err(ConfigError::InvalidConfig(format!(
                "Broker URL {raw} has no host"
            ))),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        AppConfig {
            broker: BrokerSection {
                host: "broker.example.com".to_string(),
                port: MQTTS_PORT,
            },
            credentials: CredentialPaths {
                root_ca: PathBuf::from("certs/root.pem"),
                client_cert: PathBuf::from("certs/client.pem"),
                client_key: PathBuf::from("certs/client.key"),
            },
            session: SessionDefaults::default(),
        }
    }
}
