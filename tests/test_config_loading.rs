//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use courier::config::{ClientConfig, ConfigError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_minimal_config_uses_defaults() {
    let file = write_config(
        r#"
[broker]
host = "broker.internal"
"#,
    );

    let config = ClientConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.broker.host, "broker.internal");
    assert_eq!(config.broker.port, 1883);
    assert!(!config.broker.tls);
    assert_eq!(config.connection.connect_attempts, 3);
    assert_eq!(config.send.max_attempts, 3);
    assert_eq!(config.consume.max_consecutive_failures, 10);
    assert_eq!(config.presence.announce_interval(), Duration::from_secs(30));
    assert_eq!(config.presence.heartbeat_interval(), Duration::from_secs(10));
}

#[test]
fn test_full_config_overrides_every_section() {
    let file = write_config(
        r#"
[broker]
host = "mq.example.com"
port = 8883
tls = true
username_env = "COURIER_USER"
password_env = "COURIER_PASS"

[connection]
connect_attempts = 5
retry_delay_ms = 250

[send]
max_attempts = 4
throttle_ms = 0

[consume]
max_consecutive_failures = 3
backoff_step_ms = 100
backoff_max_ms = 400

[presence]
announce_interval_ms = 20000
heartbeat_interval_ms = 5000

[shutdown]
join_timeout_ms = 1500
"#,
    );

    let config = ClientConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.broker.port, 8883);
    assert!(config.broker.tls);
    assert_eq!(config.broker.username_env.as_deref(), Some("COURIER_USER"));
    assert_eq!(config.connection.connect_attempts, 5);
    assert_eq!(config.send.max_attempts, 4);
    assert_eq!(config.send.throttle(), Duration::ZERO);
    assert_eq!(config.consume.max_consecutive_failures, 3);
    assert_eq!(config.shutdown.join_timeout(), Duration::from_millis(1500));

    let policy = config.consume.retry_policy();
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(10), Duration::from_millis(400));
}

#[test]
fn test_missing_broker_section_is_rejected() {
    let file = write_config(
        r#"
[send]
max_attempts = 2
"#,
    );

    assert!(matches!(
        ClientConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_heartbeat_longer_than_announce_is_rejected() {
    let file = write_config(
        r#"
[broker]
host = "localhost"

[presence]
announce_interval_ms = 1000
heartbeat_interval_ms = 5000
"#,
    );

    assert!(matches!(
        ClientConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_zero_attempts_are_rejected() {
    let file = write_config(
        r#"
[broker]
host = "localhost"

[send]
max_attempts = 0
"#,
    );

    assert!(matches!(
        ClientConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_missing_file_reports_read_error() {
    let result = ClientConfig::load_from_file(std::path::Path::new("/nonexistent/courier.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = ClientConfig::for_broker("localhost", 1883);
    let rendered = toml::to_string_pretty(&config).unwrap();
    let file = write_config(&rendered);

    assert_eq!(ClientConfig::load_from_file(file.path()).unwrap(), config);
}
