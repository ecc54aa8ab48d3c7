//! Shared broker connection with reference-counted consumers.
//!
//! A [`ConnectionManager`] owns at most one live connection. Consumers call
//! [`ConnectionManager::attach`] and receive a [`ConnectionHandle`]; the
//! connection is created on the first attach and closed when the last handle
//! detaches. The create-if-absent check runs under the manager lock, so
//! concurrent first attaches share one connection attempt.
//!
//! The lock is never held across a subscribe or unsubscribe request: the
//! transport may need the event stream drained before it accepts more
//! requests, and draining takes the same lock.

use crate::registry::{dispatch, ConsumerId, HandlerId, MessageHandler, SubscriptionRegistry};
use crate::topics::Topic;
use crate::transport::{Connector, Link, LinkError, LinkEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a consumer wants from the shared connection when it attaches.
#[derive(Default, Clone)]
pub struct ConsumerOptions {
    pub topics: Vec<Topic>,
    pub on_message: Option<Arc<dyn MessageHandler>>,
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.on_message = Some(handler);
        self
    }
}

struct SharedConnection {
    generation: u64,
    link: Arc<dyn Link>,
    ever_connected: bool,
    events_task: JoinHandle<()>,
}

impl SharedConnection {
    async fn close(self) {
        self.events_task.abort();
        if let Err(e) = self.link.disconnect().await {
            warn!("Failed to close MQTT connection cleanly: {}", e);
        }
    }
}

struct Inner {
    connection: Option<SharedConnection>,
    state: ConnectionState,
    ref_count: usize,
    generation: u64,
    /// Bumped by `shutdown`. Handles from an older epoch no longer count.
    epoch: u64,
    registry: SubscriptionRegistry,
}

impl Inner {
    fn current(&mut self, generation: u64) -> Option<&mut SharedConnection> {
        self.connection
            .as_mut()
            .filter(|connection| connection.generation == generation)
    }

    fn connected_link(&self) -> Option<Arc<dyn Link>> {
        match (&self.connection, self.state) {
            (Some(connection), ConnectionState::Connected) => Some(connection.link.clone()),
            _ => None,
        }
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    settle_delay: Duration,
    inner: Mutex<Inner>,
    connected_tx: watch::Sender<bool>,
    next_consumer: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// `settle_delay` is how long to wait after `connected` before issuing
    /// deferred subscriptions.
    pub fn new(connector: Arc<dyn Connector>, settle_delay: Duration) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                connector,
                settle_delay,
                inner: Mutex::new(Inner {
                    connection: None,
                    state: ConnectionState::Disconnected,
                    ref_count: 0,
                    generation: 0,
                    epoch: 0,
                    registry: SubscriptionRegistry::new(),
                }),
                connected_tx,
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a consumer, opening the shared connection if none is live.
    pub async fn attach(&self, options: ConsumerOptions) -> Result<ConnectionHandle, LinkError> {
        let consumer = ConsumerId(self.shared.next_consumer.fetch_add(1, Ordering::SeqCst));
        let epoch = {
            let mut inner = self.shared.inner.lock().await;
            if inner.connection.is_some() {
                info!("Reusing existing MQTT connection");
            } else {
                self.shared.open(&mut inner).await?;
            }
            inner.ref_count += 1;
            if let Some(handler) = options.on_message {
                inner.registry.register(consumer, handler);
            }
            debug!("Consumer {:?} attached ({} active)", consumer, inner.ref_count);
            inner.epoch
        };

        let handle = ConnectionHandle {
            shared: self.shared.clone(),
            consumer,
            epoch,
            detached: false,
        };
        for topic in &options.topics {
            handle.ensure_subscribed(topic.as_str()).await;
        }
        Ok(handle)
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    pub async fn ref_count(&self) -> usize {
        self.shared.inner.lock().await.ref_count
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.shared.inner.lock().await.registry.subscribed_topics()
    }

    pub async fn pending_topics(&self) -> Vec<String> {
        self.shared.inner.lock().await.registry.pending_topics()
    }

    pub async fn handler_count(&self) -> usize {
        self.shared.inner.lock().await.registry.handler_count()
    }

    /// True when the transport gave up on the connection while consumers are
    /// still attached, i.e. nothing will reconnect on its own.
    pub async fn closed_by_transport(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.connection.is_none() && inner.ref_count > 0
    }

    /// Closes the connection regardless of attached consumers. Handles
    /// attached before the shutdown are inert afterwards: detaching or
    /// dropping them does not touch consumers attached later.
    pub async fn shutdown(&self) {
        let closing = {
            let mut inner = self.shared.inner.lock().await;
            info!("Shutting down MQTT connection ({} consumers attached)", inner.ref_count);
            inner.epoch += 1;
            inner.ref_count = 0;
            inner.registry.clear();
            self.shared.release(&mut inner)
        };
        if let Some(connection) = closing {
            connection.close().await;
        }
    }
}

impl Shared {
    async fn open(self: &Arc<Self>, inner: &mut Inner) -> Result<(), LinkError> {
        info!("Opening MQTT connection");
        let (link, events) = self.connector.connect().await?;
        inner.generation += 1;
        let generation = inner.generation;

        let shared = self.clone();
        let events_task = tokio::spawn(async move {
            shared.run_events(generation, events).await;
        });

        inner.connection = Some(SharedConnection {
            generation,
            link,
            ever_connected: false,
            events_task,
        });
        inner.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Detaches the live connection from the manager without closing it.
    fn release(&self, inner: &mut Inner) -> Option<SharedConnection> {
        inner.state = ConnectionState::Disconnected;
        self.connected_tx.send_replace(false);
        inner.connection.take()
    }

    async fn run_events(self: Arc<Self>, generation: u64, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => self.on_connected(generation).await,
                LinkEvent::Message { topic, payload } => {
                    self.on_message(generation, &topic, &payload).await
                }
                LinkEvent::Offline => {
                    info!("MQTT offline");
                    self.on_interrupted(generation).await;
                }
                LinkEvent::Error(message) => {
                    error!("MQTT error: {}", message);
                    self.on_interrupted(generation).await;
                }
                LinkEvent::Reconnecting => info!("MQTT reconnecting..."),
                LinkEvent::Closed => {
                    self.on_closed(generation).await;
                    break;
                }
            }
        }
        debug!("Event stream for connection {} ended", generation);
    }

    async fn on_connected(self: &Arc<Self>, generation: u64) {
        let resubscribe = {
            let mut inner = self.inner.lock().await;
            let Some(connection) = inner.current(generation) else {
                return;
            };
            let resubscribe = connection.ever_connected;
            connection.ever_connected = true;
            inner.state = ConnectionState::Connected;
            self.connected_tx.send_replace(true);
            resubscribe
        };
        info!("MQTT connected");

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.settle_delay).await;
            shared.flush_subscriptions(generation, resubscribe).await;
        });
    }

    async fn on_interrupted(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.current(generation).is_none() {
            return;
        }
        if inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Connecting;
        }
        self.connected_tx.send_replace(false);
    }

    async fn on_closed(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.current(generation).is_none() {
            return;
        }
        warn!("MQTT connection closed by transport");
        inner.registry.requeue_all();
        // Already closed on the transport side; the handle just goes away.
        drop(self.release(&mut inner));
    }

    async fn on_message(&self, generation: u64, topic: &str, payload: &[u8]) {
        let handlers = {
            let mut inner = self.inner.lock().await;
            if inner.current(generation).is_none() {
                return;
            }
            inner.registry.snapshot()
        };
        dispatch(&handlers, topic, payload);
    }

    /// Issues deferred subscriptions, and on a reconnect every known one.
    async fn flush_subscriptions(&self, generation: u64, resubscribe: bool) {
        let (link, topics) = {
            let mut inner = self.inner.lock().await;
            if inner.current(generation).is_none() {
                return;
            }
            let Some(link) = inner.connected_link() else {
                warn!("MQTT client not connected when trying to subscribe");
                return;
            };

            let pending = inner.registry.take_pending();
            let mut topics = if resubscribe {
                inner.registry.subscribed_topics()
            } else {
                Vec::new()
            };
            for topic in pending {
                inner.registry.mark_subscribed(topic.clone());
                topics.push(topic);
            }
            (link, topics)
        };

        let mut failed = Vec::new();
        for topic in topics {
            info!("Subscribing to topic: {}", topic);
            match link.subscribe(&topic).await {
                Ok(()) => info!("Successfully subscribed to {}", topic),
                Err(e) => {
                    error!("Failed to subscribe to {}: {}", topic, e);
                    failed.push(topic);
                }
            }
        }

        if failed.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.current(generation).is_some() {
            for topic in &failed {
                inner.registry.requeue(topic);
            }
        }
    }

    async fn detach(&self, consumer: ConsumerId, epoch: u64) {
        let closing = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.ref_count == 0 {
                debug!("Consumer {:?} detached after shutdown", consumer);
                return;
            }
            inner.registry.remove_consumer(consumer);
            inner.ref_count -= 1;
            if inner.ref_count > 0 {
                debug!("Consumer {:?} detached ({} remaining)", consumer, inner.ref_count);
                return;
            }
            info!("Closing MQTT connection (no more subscribers)");
            inner.registry.clear();
            self.release(&mut inner)
        };
        if let Some(connection) = closing {
            connection.close().await;
        }
    }
}

/// A consumer's share of the connection. Dropping it detaches the consumer.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    consumer: ConsumerId,
    epoch: u64,
    detached: bool,
}

impl ConnectionHandle {
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    pub async fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        self.shared
            .inner
            .lock()
            .await
            .registry
            .register(self.consumer, handler)
    }

    pub async fn unregister_handler(&self, id: HandlerId) -> bool {
        self.shared.inner.lock().await.registry.unregister(id)
    }

    /// Subscribes unless the topic is already subscribed or queued. Before
    /// the connection is up the request is deferred.
    pub async fn ensure_subscribed(&self, topic: &str) {
        let link = {
            let mut inner = self.shared.inner.lock().await;
            if inner.registry.is_tracked(topic) {
                debug!("Already subscribed to {}", topic);
                return;
            }
            let Some(link) = inner.connected_link() else {
                debug!("Deferring subscription to {} until connected", topic);
                inner.registry.queue(topic);
                return;
            };
            // Recorded before the request so concurrent callers skip it.
            inner.registry.mark_subscribed(topic.to_string());
            link
        };

        info!("Subscribing to topic: {}", topic);
        match link.subscribe(topic).await {
            Ok(()) => info!("Successfully subscribed to {}", topic),
            Err(e) => {
                error!("Failed to subscribe to {}: {}", topic, e);
                self.shared.inner.lock().await.registry.unmark_subscribed(topic);
            }
        }
    }

    /// Drops the topic for every consumer of the connection.
    pub async fn unsubscribe(&self, topic: &str) {
        let link = {
            let mut inner = self.shared.inner.lock().await;
            if !inner.registry.remove(topic) {
                return;
            }
            inner.connected_link()
        };
        if let Some(link) = link {
            match link.unsubscribe(topic).await {
                Ok(()) => info!("Unsubscribed from {}", topic),
                Err(e) => error!("Failed to unsubscribe from {}: {}", topic, e),
            }
        }
    }

    /// Fire-and-forget publish. Dropped with a warning when disconnected.
    pub async fn publish(&self, topic: &str, payload: &str) {
        let link = self.shared.inner.lock().await.connected_link();
        let Some(link) = link else {
            warn!("MQTT client not connected, cannot publish to {}", topic);
            return;
        };

        match link.publish(topic, payload.as_bytes().to_vec()).await {
            Ok(()) => info!("Published to {}: {}", topic, payload),
            Err(e) => error!("Failed to publish to {}: {}", topic, e),
        }
    }

    /// Serializes `payload` as JSON, keeping field order, and publishes it.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(body) => self.publish(topic, &body).await,
            Err(e) => error!("Failed to encode payload for {}: {}", topic, e),
        }
    }

    /// Opens a new shared connection if the previous one was closed by the
    /// transport while this consumer stayed attached.
    pub async fn reconnect(&self) -> Result<(), LinkError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.connection.is_none() && !self.detached && inner.epoch == self.epoch {
            self.shared.open(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn detach(mut self) {
        self.detached = true;
        self.shared.detach(self.consumer, self.epoch).await;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let shared = self.shared.clone();
        let consumer = self.consumer;
        let epoch = self.epoch;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    shared.detach(consumer, epoch).await;
                });
            }
            Err(_) => warn!("Consumer {:?} dropped outside a runtime; not detached", consumer),
        }
    }
}
