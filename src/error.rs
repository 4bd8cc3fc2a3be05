//! Client-facing error types
//!
//! Transport failures are translated into [`ClientError`] at the connection
//! manager boundary so callers only ever see "usable" or one of these kinds.

use crate::config::ConfigError;
use crate::crypto::KeyNotFound;
use crate::protocol::{CodecError, ValidationError};
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a reason string after sanitization
pub const MAX_REASON_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Broker rejected the credentials. Never retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Broker unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Operation attempted after `close()`
    #[error("Client is closed")]
    Closed,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    KeyNotFound(#[from] KeyNotFound),
}

impl ClientError {
    pub fn unreachable<S: Into<String>>(attempts: u32, reason: S) -> Self {
        Self::Unreachable {
            attempts,
            reason: sanitize_error_message(&reason.into()),
        }
    }

    /// Errors that no amount of retrying will fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Authentication(_)
                | ClientError::Closed
                | ClientError::InvalidIdentity(_)
                | ClientError::Config(_)
        )
    }
}

impl From<TransportError> for ClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Authentication(reason) => {
                ClientError::Authentication(sanitize_error_message(&reason))
            }
            TransportError::ChannelClosed(reason) => {
                ClientError::ChannelClosed(sanitize_error_message(&reason))
            }
            TransportError::InvalidConfig(reason) => {
                ClientError::Config(ConfigError::InvalidConfig(reason))
            }
            other => ClientError::unreachable(1, other.to_string()),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact credential-looking fragments and cap the length of a broker reason string
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_REASON_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REASON_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_secret_redaction() {
        let sanitized =
            sanitize_error_message("Connection refused: password=secret123 token: abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= MAX_REASON_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_REASON_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized = sanitize_error_message("cannot read /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("id_rsa"));
    }

    #[test]
    fn test_transport_error_translation() {
        let auth: ClientError =
            TransportError::Authentication("NotAuthorized password=hunter2".into()).into();
        assert!(matches!(auth, ClientError::Authentication(ref reason) if !reason.contains("hunter2")));
        assert!(auth.is_fatal());

        let channel: ClientError = TransportError::ChannelClosed("406".into()).into();
        assert!(matches!(channel, ClientError::ChannelClosed(_)));
        assert!(!channel.is_fatal());

        let timeout: ClientError = TransportError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(timeout, ClientError::Unreachable { attempts: 1, .. }));
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_closed_is_fatal() {
        assert!(ClientError::Closed.is_fatal());
        assert_eq!(ClientError::Closed.to_string(), "Client is closed");
    }
}
