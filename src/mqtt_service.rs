use crate::config::{Config, Protocol};
use crate::transport::{Connector, Link, LinkError, LinkEvent};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const REQUEST_QUEUE_SIZE: usize = 10;
const EVENT_QUEUE_SIZE: usize = 64;

/// Opens rumqttc connections to the configured broker.
pub struct MqttConnector {
    config: Arc<Config>,
}

impl MqttConnector {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn client_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.mqtt_client_prefix, &suffix[..8])
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let config = &self.config;
        // Websocket transports take the full URL as the broker address.
        let broker = if config.mqtt_protocol.is_websocket() {
            config.broker_url()
        } else {
            config.mqtt_host.clone()
        };

        let mut mqtt_options = MqttOptions::new(client_id, broker, config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs));
        mqtt_options.set_clean_session(true);

        match config.mqtt_protocol {
            Protocol::Ws => {
                mqtt_options.set_transport(Transport::Ws);
            }
            Protocol::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
            Protocol::Mqtts => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
            Protocol::Mqtt => {}
        }

        if !config.mqtt_username.is_empty() && !config.mqtt_password.is_empty() {
            mqtt_options.set_credentials(&config.mqtt_username, &config.mqtt_password);
        }

        mqtt_options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self) -> Result<(Arc<dyn Link>, mpsc::Receiver<LinkEvent>), LinkError> {
        let client_id = self.client_id();
        info!("Connecting to MQTT: {} as {}", self.config.broker_url(), client_id);

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(&client_id), REQUEST_QUEUE_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let stopping = Arc::new(AtomicBool::new(false));

        let driver = EventLoopDriver {
            eventloop,
            events: events_tx,
            retry_interval: Duration::from_millis(self.config.mqtt_retry_interval_ms),
            max_retries: self.config.mqtt_max_retries,
            stopping: stopping.clone(),
        };
        tokio::spawn(driver.run());

        let link: Arc<dyn Link> = Arc::new(MqttLink { client, stopping });
        Ok((link, events_rx))
    }
}

struct MqttLink {
    client: AsyncClient,
    stopping: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client.publish(topic, QoS::AtMostOnce, false, payload).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.stopping.store(true, Ordering::SeqCst);
        self.client.disconnect().await?;
        Ok(())
    }
}

/// Whether the driver should stop retrying after `failures` consecutive
/// errors. A negative `max_retries` retries forever.
fn retries_exhausted(failures: i32, max_retries: i32) -> bool {
    max_retries >= 0 && failures > max_retries
}

/// Polls the rumqttc event loop and turns its output into [`LinkEvent`]s.
/// rumqttc reconnects on the next poll after an error, so retrying is a
/// matter of waiting the fixed interval and polling again.
struct EventLoopDriver {
    eventloop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    retry_interval: Duration,
    max_retries: i32,
    stopping: Arc<AtomicBool>,
}

impl EventLoopDriver {
    async fn run(mut self) {
        let mut failures: i32 = 0;
        let mut online = false;

        loop {
            let event = match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT Connected");
                    failures = 0;
                    online = true;
                    Some(LinkEvent::Connected)
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => Some(LinkEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("Subscription acknowledged (pkid {})", ack.pkid);
                    None
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT Disconnected");
                    let _ = self.events.send(LinkEvent::Closed).await;
                    break;
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                    None
                }
                Err(e) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        let _ = self.events.send(LinkEvent::Closed).await;
                        break;
                    }

                    error!("Error in MQTT event loop: {:?}", e);
                    if self.events.send(LinkEvent::Error(e.to_string())).await.is_err() {
                        break;
                    }
                    if online {
                        online = false;
                        if self.events.send(LinkEvent::Offline).await.is_err() {
                            break;
                        }
                    }

                    failures = failures.saturating_add(1);
                    if retries_exhausted(failures, self.max_retries) {
                        error!(
                            "Maximum number of retries ({}) reached. Closing the connection.",
                            self.max_retries
                        );
                        let _ = self.events.send(LinkEvent::Closed).await;
                        break;
                    }

                    warn!(
                        "Lost connection to MQTT broker. Retrying in {:?}...",
                        self.retry_interval
                    );
                    sleep(self.retry_interval).await;
                    Some(LinkEvent::Reconnecting)
                }
            };

            if let Some(event) = event {
                if self.events.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(pairs: &[(&str, &str)]) -> MqttConnector {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|key| {
            pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        MqttConnector::new(Arc::new(config))
    }

    #[test]
    fn negative_max_retries_never_gives_up() {
        assert!(!retries_exhausted(1, -1));
        assert!(!retries_exhausted(i32::MAX, -1));
    }

    #[test]
    fn zero_max_retries_gives_up_on_first_failure() {
        assert!(retries_exhausted(1, 0));
    }

    #[test]
    fn gives_up_once_failures_exceed_max_retries() {
        assert!(!retries_exhausted(1, 3));
        assert!(!retries_exhausted(3, 3));
        assert!(retries_exhausted(4, 3));
    }

    #[test]
    fn client_id_uses_prefix_and_short_suffix() {
        let connector = connector(&[("MQTT_CLIENT_PREFIX", "line-dash")]);

        let id = connector.client_id();

        assert!(id.starts_with("line-dash-"));
        assert_eq!(id.len(), "line-dash-".len() + 8);
        assert_ne!(id, connector.client_id());
    }

    #[test]
    fn websocket_options_use_full_url() {
        let connector = connector(&[]);

        let options = connector.mqtt_options("client");

        assert_eq!(
            options.broker_address(),
            ("ws://localhost:8083/mqtt".to_string(), 8083)
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert!(options.clean_session());
        assert!(options.credentials().is_none());
    }

    #[test]
    fn tcp_options_use_host_and_credentials() {
        let connector = connector(&[
            ("MQTT_PROTOCOL", "mqtt"),
            ("MQTT_HOST", "emqx"),
            ("MQTT_USERNAME", "line"),
            ("MQTT_PASSWORD", "secret"),
        ]);

        let options = connector.mqtt_options("client");

        assert_eq!(options.broker_address(), ("emqx".to_string(), 1883));
        assert_eq!(
            options.credentials(),
            Some(("line".to_string(), "secret".to_string()))
        );
    }
}
