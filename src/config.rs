//! Client configuration
//!
//! Everything the client needs is passed in explicitly through [`ClientConfig`];
//! there is no module-level broker state. Credentials are never stored in the
//! file, only the names of the environment variables that hold them.

use crate::client::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub send: SendSection,
    #[serde(default)]
    pub consume: ConsumeSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

/// Broker endpoint and session parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use TLS with the platform root store
    #[serde(default)]
    pub tls: bool,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long the broker keeps an offline client's mailbox subscription
    #[serde(default = "default_session_expiry_secs")]
    pub session_expiry_secs: u32,
    /// Upper bound on any single broker operation
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Connect attempts made by one `connect()` call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Time allowed for the broker to acknowledge a new session
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Send worker retry and pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendSection {
    #[serde(default = "default_send_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_send_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Pause between consecutive messages
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
}

/// Consume loop escalation and polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumeSection {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the inbound delivery channel
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

/// Presence announcer and heartbeat checker intervals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Attempts per announcement before it is given up
    #[serde(default = "default_announce_attempts")]
    pub announce_attempts: u32,
}

/// Shutdown bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownSection {
    /// How long `close()` waits for each background task
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Bound on the final offline announcement
    #[serde(default = "default_offline_timeout_ms")]
    pub offline_timeout_ms: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_session_expiry_secs() -> u32 {
    7 * 24 * 60 * 60
}

fn default_operation_timeout_ms() -> u64 {
    5000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_send_attempts() -> u32 {
    3
}

fn default_send_retry_delay_ms() -> u64 {
    500
}

fn default_throttle_ms() -> u64 {
    50
}

fn default_dequeue_timeout_ms() -> u64 {
    1000
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_backoff_step_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_inbound_buffer() -> usize {
    256
}

fn default_announce_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_announce_attempts() -> u32 {
    1
}

fn default_join_timeout_ms() -> u64 {
    2000
}

fn default_offline_timeout_ms() -> u64 {
    1000
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_connect_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for SendSection {
    fn default() -> Self {
        Self {
            max_attempts: default_send_attempts(),
            retry_delay_ms: default_send_retry_delay_ms(),
            throttle_ms: default_throttle_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
        }
    }
}

impl Default for ConsumeSection {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            backoff_step_ms: default_backoff_step_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            announce_interval_ms: default_announce_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            announce_attempts: default_announce_attempts(),
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
            offline_timeout_ms: default_offline_timeout_ms(),
        }
    }
}

impl BrokerSection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
            session_expiry_secs: default_session_expiry_secs(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }

    /// Resolve credentials from the configured environment variables
    ///
    /// Returns `None` when no username is configured or the variable is unset.
    /// A missing password resolves to an empty string.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl ConnectionSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.connect_attempts),
            Backoff::Fixed(Duration::from_millis(self.retry_delay_ms)),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SendSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.max_attempts),
            Backoff::Fixed(Duration::from_millis(self.retry_delay_ms)),
        )
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl ConsumeSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.max_consecutive_failures),
            Backoff::Linear {
                step: Duration::from_millis(self.backoff_step_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PresenceSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.announce_attempts),
            Backoff::Fixed(Duration::from_millis(self.heartbeat_interval_ms / 10)),
        )
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl ShutdownSection {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Configuration with defaults for everything except the broker address
    pub fn for_broker(host: impl Into<String>, port: u16) -> Self {
        Self {
            broker: BrokerSection::new(host, port),
            connection: ConnectionSection::default(),
            send: SendSection::default(),
            consume: ConsumeSection::default(),
            presence: PresenceSection::default(),
            shutdown: ShutdownSection::default(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(invalid("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker.port must be greater than 0"));
        }
        if self.broker.session_expiry_secs == 0 {
            return Err(invalid(
                "broker.session_expiry_secs must be greater than 0 or mailboxes are lost on disconnect",
            ));
        }
        if self.broker.operation_timeout_ms == 0 {
            return Err(invalid("broker.operation_timeout_ms must be greater than 0"));
        }
        if self.connection.connect_attempts == 0 {
            return Err(invalid("connection.connect_attempts must be greater than 0"));
        }
        if self.send.max_attempts == 0 {
            return Err(invalid("send.max_attempts must be greater than 0"));
        }
        if self.consume.max_consecutive_failures == 0 {
            return Err(invalid(
                "consume.max_consecutive_failures must be greater than 0",
            ));
        }
        if self.consume.poll_interval_ms == 0 || self.consume.inbound_buffer == 0 {
            return Err(invalid(
                "consume.poll_interval_ms and consume.inbound_buffer must be greater than 0",
            ));
        }
        if self.presence.announce_interval_ms == 0 || self.presence.heartbeat_interval_ms == 0 {
            return Err(invalid("presence intervals must be greater than 0"));
        }
        if self.presence.heartbeat_interval_ms > self.presence.announce_interval_ms {
            return Err(invalid(
                "presence.heartbeat_interval_ms must not exceed presence.announce_interval_ms",
            ));
        }
        if self.presence.announce_attempts == 0 {
            return Err(invalid("presence.announce_attempts must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}
