//! Identity validation and broker destination naming
//!
//! Mailboxes are named deterministically from the owning identity and the
//! presence fanout has one well-known name shared by every client.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix for durable per-identity mailboxes: `mailbox.<identity>`
pub const MAILBOX_PREFIX: &str = "mailbox.";

/// The single presence fanout destination
pub const PRESENCE_TOPIC: &str = "chat.presence";

/// Upper bound on identity length, keeps mailbox names well inside broker topic limits
pub const MAX_IDENTITY_LEN: usize = 128;

/// Opaque name of a mailbox owner
///
/// Immutable once constructed. Only `[A-Za-z0-9._@-]` is accepted because the
/// broker reserves `/`, `+`, `#` and whitespace in destination names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        validate_identity(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of this identity's durable mailbox
    pub fn mailbox(&self) -> String {
        mailbox_name(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(value)
    }
}

impl TryFrom<&str> for Identity {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

pub fn mailbox_name(identity: &str) -> String {
    format!("{MAILBOX_PREFIX}{identity}")
}

pub fn validate_identity(identity: &str) -> Result<(), ValidationError> {
    if identity.is_empty() {
        return Err(ValidationError::EmptyIdentity);
    }

    if identity.len() > MAX_IDENTITY_LEN {
        return Err(ValidationError::IdentityTooLong {
            len: identity.len(),
            max: MAX_IDENTITY_LEN,
        });
    }

    for ch in identity.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '_' | '-' | '@') {
            return Err(ValidationError::InvalidIdentityChar(ch));
        }
    }

    Ok(())
}

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Identity cannot be empty")]
    EmptyIdentity,
    #[error("Identity contains invalid character: '{0}'")]
    InvalidIdentityChar(char),
    #[error("Identity is {len} bytes, maximum is {max}")]
    IdentityTooLong { len: usize, max: usize },
}
