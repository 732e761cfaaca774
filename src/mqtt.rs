use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::TransportError;
use crate::normalize::{normalize, TargetZone};
use crate::pipeline::{PipelineStats, QueueProducer};
use crate::reading::{decode, RawMessage};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Queued,
    Malformed,
    Dropped,
}

/// Per-message path of the listener: decode, stamp, enqueue. Never touches
/// the store and never fails back into the broker client.
#[derive(Clone)]
pub struct MessageHandler {
    producer: QueueProducer,
    zone: TargetZone,
    stats: Arc<PipelineStats>,
}

impl MessageHandler {
    pub fn new(producer: QueueProducer, zone: TargetZone) -> Self {
        let stats = producer.stats();
        Self {
            producer,
            zone,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn handle(&self, raw: RawMessage, now: DateTime<Utc>) -> HandleOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let reading = match decode(&raw.payload) {
            Ok(reading) => reading,
            Err(err) => {
                let malformed = self.stats.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    error = %err,
                    topic = %raw.topic,
                    bytes = raw.payload.len(),
                    malformed,
                    "discarding malformed payload"
                );
                return HandleOutcome::Malformed;
            }
        };
        tracing::debug!(topic = %raw.topic, fields = reading.len(), "received message");

        let record = normalize(reading, now, &self.zone);
        if self.producer.enqueue(record).await {
            HandleOutcome::Queued
        } else {
            HandleOutcome::Dropped
        }
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

/// Keeps one subscription to `config.mqtt_topic` alive until `shutdown`
/// fires. Drops its handler (and with it the queue producer) on return.
pub async fn run_listener(
    config: Config,
    handler: MessageHandler,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let qos = qos_from_level(config.mqtt_qos).unwrap_or(QoS::AtLeastOnce);
    let stats = handler.stats();
    let mut backoff = Backoff::new(config.mqtt_reconnect_base(), config.mqtt_reconnect_max());
    let mut ever_connected = false;
    let mut consecutive_failures = 0u32;

    while !shutdown.is_cancelled() {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 32);
        let mut connected = false;

        let last_error = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    disconnect(&client, &mut eventloop, &config.mqtt_topic, connected).await;
                    stats.set_mqtt_connected(false);
                    tracing::info!("MQTT listener stopped");
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    connected = true;
                    ever_connected = true;
                    consecutive_failures = 0;
                    backoff.reset();
                    stats.set_mqtt_connected(true);
                    stats.clear_mqtt_error();
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        session_present = ack.session_present,
                        "connected to MQTT broker"
                    );
                    if let Err(err) = client.subscribe(config.mqtt_topic.clone(), qos).await {
                        break err.to_string();
                    }
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    tracing::info!(
                        topic = %config.mqtt_topic,
                        return_codes = ?ack.return_codes,
                        "subscribed to sensor feed"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let raw = RawMessage::new(publish.topic, publish.payload);
                    handler.handle(raw, Utc::now()).await;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    break "broker sent disconnect".to_string();
                }
                Ok(_) => {}
                Err(err) => break err.to_string(),
            }
        };

        stats.set_mqtt_connected(false);
        stats.record_mqtt_error(last_error.clone());
        if !connected {
            consecutive_failures = consecutive_failures.saturating_add(1);
        }
        if !ever_connected
            && config.mqtt_max_connect_failures > 0
            && consecutive_failures >= config.mqtt_max_connect_failures
        {
            return Err(TransportError::ConnectCeiling {
                attempts: consecutive_failures,
                last_error,
            });
        }

        let delay = backoff.next_delay();
        tracing::warn!(
            error = %last_error,
            consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "MQTT connection dropped; reconnecting"
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    stats.set_mqtt_connected(false);
    tracing::info!("MQTT listener stopped");
    Ok(())
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop, topic: &str, connected: bool) {
    if !connected {
        return;
    }
    let _ = client.try_unsubscribe(topic);
    let _ = client.try_disconnect();
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        tracing::debug!("MQTT disconnect not acknowledged before timeout");
    }
}
