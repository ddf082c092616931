//! Configuration loading and validation tests
//!
//! Environment files are parsed with the same dotenvy reader the binary uses,
//! but resolved through `AppConfig::from_lookup` so tests do not race on the
//! process environment.

use heartrate_mqtt::config::{load_env_file, AppConfig, ConfigError, MQTTS_PORT};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn env_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn config_from_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let vars: HashMap<String, String> = dotenvy::from_path_iter(path)
        .unwrap()
        .map(|item| item.unwrap())
        .collect();
    AppConfig::from_lookup(|name| vars.get(name).cloned())
}

#[test]
fn test_config_loads_from_env_file() {
    let file = env_file(
        "HOST=broker.example.com\n\
         ROOT_PEM=certs/AmazonRootCA1.pem\n\
         PUB_CERT=certs/device.pem.crt\n\
         PRIV_KEY=certs/device.pem.key\n",
    );

    let config = config_from_file(file.path()).unwrap();

    assert_eq!(config.broker.host, "broker.example.com");
    assert_eq!(config.broker.port, MQTTS_PORT);
    assert_eq!(config.credentials.root_ca, PathBuf::from("certs/AmazonRootCA1.pem"));
    assert_eq!(config.credentials.client_cert, PathBuf::from("certs/device.pem.crt"));
    assert_eq!(config.credentials.client_key, PathBuf::from("certs/device.pem.key"));
    assert_eq!(
        config.broker_url().unwrap().as_str(),
        "tcps://broker.example.com:8883"
    );
}

#[test]
fn test_fixed_session_defaults() {
    let file = env_file("HOST=h\nROOT_PEM=a\nPUB_CERT=b\nPRIV_KEY=c\n");
    let config = config_from_file(file.path()).unwrap();

    assert_eq!(config.session.client_id, "someThing");
    assert!(config.session.clean_session);
    assert_eq!(config.session.topic, "/dummy");
    assert_eq!(config.session.publish_delay().as_secs(), 3);
    assert_eq!(config.session.disconnect_grace().as_millis(), 250);
    assert_eq!(config.session.keep_alive().as_secs(), 30);
}

#[test]
fn test_missing_variable_is_reported_by_name() {
    let file = env_file("HOST=broker.example.com\nROOT_PEM=a\nPUB_CERT=b\n");

    match config_from_file(file.path()) {
        Err(ConfigError::EnvVarNotFound(name)) => assert_eq!(name, "PRIV_KEY"),
        other => panic!("expected EnvVarNotFound, got {other:?}"),
    }
}

#[test]
fn test_blank_host_is_missing() {
    let file = env_file("HOST=\nROOT_PEM=a\nPUB_CERT=b\nPRIV_KEY=c\n");
    assert!(matches!(
        config_from_file(file.path()),
        Err(ConfigError::EnvVarNotFound(_))
    ));
}

#[test]
fn test_unusable_host_is_invalid() {
    let file = env_file("HOST=\"not a host\"\nROOT_PEM=a\nPUB_CERT=b\nPRIV_KEY=c\n");
    assert!(matches!(
        config_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_missing_env_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join(".env");

    match load_env_file(&missing) {
        Err(ConfigError::EnvFile { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected EnvFile error, got {other:?}"),
    }
}

#[test]
fn test_env_file_populates_process_environment() {
    let file = env_file("HEARTRATE_TEST_MARKER=loaded\n");

    load_env_file(file.path()).unwrap();

    assert_eq!(std::env::var("HEARTRATE_TEST_MARKER").unwrap(), "loaded");
}

#[test]
fn test_config_renders_as_toml() {
    let file = env_file("HOST=broker.example.com\nROOT_PEM=a\nPUB_CERT=b\nPRIV_KEY=c\n");
    let config = config_from_file(file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    assert!(rendered.contains("host = \"broker.example.com\""));
    assert!(rendered.contains("client_id = \"someThing\""));

    let parsed: AppConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, config);
}
