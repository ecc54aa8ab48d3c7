//! Broker seam used by the connection manager.
//!
//! A [`Connector`] opens one transport to the broker and hands back the
//! [`Link`] used to issue requests plus the stream of [`LinkEvent`]s the
//! transport produces. Reconnecting after unexpected drops is the
//! transport's job; the manager only observes it through events.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Notifications produced by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Offline,
    Error(String),
    Reconnecting,
    /// Terminal: the transport will not reconnect on its own.
    Closed,
}

#[async_trait]
pub trait Link: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn Link>, mpsc::Receiver<LinkEvent>), LinkError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// In-memory link that records every request it receives.
    #[derive(Default)]
    pub(crate) struct MockLink {
        pub subscribes: Mutex<Vec<String>>,
        pub unsubscribes: Mutex<Vec<String>>,
        pub publishes: Mutex<Vec<(String, String)>>,
        pub disconnects: AtomicUsize,
        pub fail_subscribe: AtomicBool,
        /// When set, subscribe requests wait for a notification first.
        pub subscribe_gate: Mutex<Option<Arc<Notify>>>,
    }

    impl MockLink {
        pub fn subscribes(&self) -> Vec<String> {
            self.subscribes.lock().unwrap().clone()
        }

        pub fn publishes(&self) -> Vec<(String, String)> {
            self.publishes.lock().unwrap().clone()
        }

        pub fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Link for MockLink {
        async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
            let gate = self.subscribe_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(LinkError::Unavailable("subscribe refused".to_string()));
            }
            self.subscribes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
            self.unsubscribes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
            let body = String::from_utf8(payload).unwrap();
            self.publishes.lock().unwrap().push((topic.to_string(), body));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), LinkError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Connector handing out the same [`MockLink`] and keeping the event
    /// senders so tests can drive the connection state.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub link: Arc<MockLink>,
        pub connects: AtomicUsize,
        pub senders: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
    }

    impl MockConnector {
        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn events(&self) -> mpsc::Sender<LinkEvent> {
            self.senders
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("no connection opened yet")
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<(Arc<dyn Link>, mpsc::Receiver<LinkEvent>), LinkError> {
            // Yield so concurrent attaches get a chance to interleave.
            tokio::task::yield_now().await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(64);
            self.senders.lock().unwrap().push(tx);
            let link: Arc<dyn Link> = self.link.clone();
            Ok((link, rx))
        }
    }
}
