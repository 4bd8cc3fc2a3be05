//! Idempotent declaration of mailboxes and the presence fanout

use crate::protocol::{Identity, PRESENCE_TOPIC};
use crate::transport::{BrokerSession, TransportError};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Tracks which destinations were declared on the current session
///
/// Declarations are idempotent on the broker, the cache only saves round trips
/// and is cleared whenever a new session or channel is opened.
pub struct MailboxRegistry {
    identity: Identity,
    declared: Mutex<HashSet<String>>,
}

impl MailboxRegistry {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Declare the identity's own mailbox and the presence fanout
    pub async fn declare_own(&self, session: &dyn BrokerSession) -> Result<(), TransportError> {
        let mailbox = self.identity.mailbox();
        session.declare_mailbox(&mailbox).await?;
        session.declare_fanout(PRESENCE_TOPIC).await?;

        self.remember(mailbox);
        self.remember(PRESENCE_TOPIC.to_string());
        debug!(identity = %self.identity, "Declared own mailbox and presence fanout");
        Ok(())
    }

    /// Declare a recipient's mailbox so messages wait for an offline recipient
    pub async fn declare_recipient(
        &self,
        session: &dyn BrokerSession,
        recipient: &Identity,
    ) -> Result<(), TransportError> {
        let mailbox = recipient.mailbox();
        if self.is_declared(&mailbox) {
            return Ok(());
        }

        session.declare_mailbox(&mailbox).await?;
        self.remember(mailbox);
        Ok(())
    }

    pub fn is_declared(&self, destination: &str) -> bool {
        self.declared
            .lock()
            .map(|declared| declared.contains(destination))
            .unwrap_or(false)
    }

    /// Forget everything; called after a new session or channel
    pub fn reset(&self) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.clear();
        }
    }

    fn remember(&self, destination: String) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use crate::transport::Connector;

    #[tokio::test]
    async fn test_declare_own_creates_mailbox() {
        let broker = MemoryBroker::new();
        let alice = Identity::new("alice").unwrap();
        let session = broker.connector().open(&alice).await.unwrap();
        let registry = MailboxRegistry::new(alice.clone());

        registry.declare_own(session.as_ref()).await.unwrap();

        assert!(broker.mailbox_exists("mailbox.alice"));
        assert!(registry.is_declared("mailbox.alice"));
        assert!(registry.is_declared(PRESENCE_TOPIC));
    }

    #[tokio::test]
    async fn test_declare_recipient_is_cached_until_reset() {
        let broker = MemoryBroker::new();
        let alice = Identity::new("alice").unwrap();
        let bob = Identity::new("bob").unwrap();
        let session = broker.connector().open(&alice).await.unwrap();
        let registry = MailboxRegistry::new(alice);

        registry.declare_recipient(session.as_ref(), &bob).await.unwrap();
        registry.declare_recipient(session.as_ref(), &bob).await.unwrap();
        assert_eq!(broker.declare_count("mailbox.bob"), 1);

        registry.reset();
        registry.declare_recipient(session.as_ref(), &bob).await.unwrap();
        assert_eq!(broker.declare_count("mailbox.bob"), 2);
    }
}
