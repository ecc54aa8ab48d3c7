//! Subscription bookkeeping and message fan-out for the shared connection.
//!
//! The registry tracks which topics have been subscribed (or are waiting for
//! the connection to come up) so that repeated requests from independent
//! consumers result in a single subscribe call. Handlers receive every
//! inbound message and filter by topic themselves.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Payload on '{topic}' is not valid UTF-8")]
    InvalidUtf8 { topic: String },
    #[error("Failed to parse message on '{topic}': {source}")]
    MalformedPayload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Callback invoked for every inbound message on the shared connection.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), HandlerError> {
        self(topic, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct RegisteredHandler {
    id: HandlerId,
    owner: ConsumerId,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribed: BTreeSet<String>,
    pending: Vec<String>,
    handlers: Vec<RegisteredHandler>,
    next_handler: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the topic is subscribed or already waiting to be.
    pub fn is_tracked(&self, topic: &str) -> bool {
        self.subscribed.contains(topic) || self.pending.iter().any(|t| t == topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.contains(topic)
    }

    /// Defers a subscribe request until the connection is ready.
    pub fn queue(&mut self, topic: &str) {
        if !self.is_tracked(topic) {
            self.pending.push(topic.to_string());
        }
    }

    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub fn mark_subscribed(&mut self, topic: String) {
        self.pending.retain(|t| *t != topic);
        self.subscribed.insert(topic);
    }

    /// Forgets a subscription whose request failed, leaving any deferred
    /// entry alone.
    pub fn unmark_subscribed(&mut self, topic: &str) -> bool {
        self.subscribed.remove(topic)
    }

    /// Moves a topic back to the deferred queue after a failed request.
    pub fn requeue(&mut self, topic: &str) {
        self.subscribed.remove(topic);
        self.queue(topic);
    }

    /// Moves every subscribed topic back to the deferred queue.
    pub fn requeue_all(&mut self) {
        let subscribed = std::mem::take(&mut self.subscribed);
        for topic in subscribed {
            self.queue(&topic);
        }
    }

    /// Forgets the topic. Returns whether it was actually subscribed.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.pending.retain(|t| t != topic);
        self.subscribed.remove(topic)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    pub fn pending_topics(&self) -> Vec<String> {
        self.pending.clone()
    }

    pub fn register(&mut self, owner: ConsumerId, handler: Arc<dyn MessageHandler>) -> HandlerId {
        self.next_handler += 1;
        let id = HandlerId(self.next_handler);
        self.handlers.push(RegisteredHandler { id, owner, handler });
        id
    }

    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| h.id != id);
        self.handlers.len() != before
    }

    /// Drops every handler registered by `owner`. Returns how many went away.
    pub fn remove_consumer(&mut self, owner: ConsumerId) -> usize {
        let before = self.handlers.len();
        self.handlers.retain(|h| h.owner != owner);
        before - self.handlers.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Handlers in registration order, detached from the registry so that
    /// dispatch can run without holding it.
    pub fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.iter().map(|h| h.handler.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.subscribed.clear();
        self.pending.clear();
        self.handlers.clear();
    }
}

/// Runs every handler for one message. A failing or panicking handler is
/// logged and does not stop the rest. Returns how many handlers succeeded.
pub fn dispatch(handlers: &[Arc<dyn MessageHandler>], topic: &str, payload: &[u8]) -> usize {
    debug!(
        "Received on topic {}: {}",
        topic,
        String::from_utf8_lossy(payload)
    );

    let mut delivered = 0;
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(topic, payload))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => error!("Error in message handler: {}", e),
            Err(_) => error!("Message handler panicked on topic {}", topic),
        }
    }
    delivered
}
