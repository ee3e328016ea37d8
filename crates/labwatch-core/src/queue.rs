/// Message bus adapter over NATS JetStream.
///
/// Four durable work-queue streams (`metrics`, `discovery`, `alerts`,
/// `dead_letter`), each capped at 100k messages with a 24h TTL. Producers
/// publish persistent JSON messages best-effort; consumers pull with a
/// prefetch window and ack/nak per message. A message that cannot be
/// decoded is copied to the dead-letter stream and terminated so the
/// broker stops redelivering it.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind,
};
use async_nats::ConnectOptions;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerSection;
use crate::error::Error;
use crate::types::{DiscoveredHost, HostId, MetricsReport};
use crate::{
    QUEUE_ALERTS, QUEUE_DEAD_LETTER, QUEUE_DISCOVERY, QUEUE_MAX_LENGTH, QUEUE_MESSAGE_TTL_SECS,
    QUEUE_METRICS,
};

/// Every message on the bus. The `type` tag and field names are the wire
/// contract shared with the ingest side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Metric {
        system_id: HostId,
        timestamp: String,
        data: MetricsReport,
    },
    Discovery {
        timestamp: String,
        systems: Vec<DiscoveredHost>,
        count: usize,
    },
    Alert {
        timestamp: String,
        data: serde_json::Value,
    },
}

impl BusMessage {
    pub fn metric(system_id: HostId, data: MetricsReport) -> Self {
        BusMessage::Metric {
            system_id,
            timestamp: Utc::now().to_rfc3339(),
            data,
        }
    }

    pub fn discovery(systems: Vec<DiscoveredHost>) -> Self {
        BusMessage::Discovery {
            timestamp: Utc::now().to_rfc3339(),
            count: systems.len(),
            systems,
        }
    }

    pub fn alert(data: serde_json::Value) -> Self {
        BusMessage::Alert {
            timestamp: Utc::now().to_rfc3339(),
            data,
        }
    }

    /// The queue this message belongs on.
    pub fn queue(&self) -> &'static str {
        match self {
            BusMessage::Metric { .. } => QUEUE_METRICS,
            BusMessage::Discovery { .. } => QUEUE_DISCOVERY,
            BusMessage::Alert { .. } => QUEUE_ALERTS,
        }
    }
}

/// Parse a wire timestamp (RFC 3339) into unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Depth snapshot for a single queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub messages: u64,
}

pub struct MessageBus {
    context: jetstream::Context,
}

impl MessageBus {
    /// Connect to the broker and declare the four streams. Connection
    /// failure here is surfaced so the caller can fall back to direct
    /// store writes.
    pub async fn connect(broker: &BrokerSection) -> Result<MessageBus, Error> {
        let mut options = ConnectOptions::new().ping_interval(Duration::from_secs(600));
        if let (Some(user), Some(password)) = (&broker.user, &broker.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }
        let client = options
            .connect(broker.url())
            .await
            .map_err(|e| Error::Queue(format!("broker connect failed: {}", e)))?;
        let context = jetstream::new(client);

        for queue in [QUEUE_METRICS, QUEUE_DISCOVERY, QUEUE_ALERTS, QUEUE_DEAD_LETTER] {
            context
                .get_or_create_stream(StreamConfig {
                    name: queue.to_string(),
                    subjects: vec![queue.to_string()],
                    retention: RetentionPolicy::WorkQueue,
                    storage: StorageType::File,
                    max_messages: QUEUE_MAX_LENGTH,
                    max_age: Duration::from_secs(QUEUE_MESSAGE_TTL_SECS),
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Queue(format!("declare {}: {}", queue, e)))?;
        }

        info!(url = %broker.url(), "connected to message broker");
        Ok(MessageBus { context })
    }

    /// Publish a message to its queue. Best-effort: one retry on failure,
    /// then `Ok(false)` so the caller can decide to drop or buffer.
    pub async fn publish(&self, message: &BusMessage) -> Result<bool, Error> {
        let queue = message.queue();
        let payload = serde_json::to_vec(message)?;

        for attempt in 0..2 {
            match self
                .context
                .publish(queue.to_string(), payload.clone().into())
                .await
            {
                Ok(ack) => match ack.await {
                    Ok(_) => {
                        debug!(queue = queue, "message published");
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!(queue = queue, attempt = attempt, error = %e, "publish not acknowledged");
                    }
                },
                Err(e) => {
                    warn!(queue = queue, attempt = attempt, error = %e, "publish failed");
                }
            }
        }
        error!(queue = queue, "dropping message after failed publish");
        Ok(false)
    }

    /// Copy a raw payload to the dead-letter stream.
    async fn publish_dead_letter(&self, payload: Vec<u8>) {
        match self
            .context
            .publish(QUEUE_DEAD_LETTER.to_string(), payload.into())
            .await
        {
            Ok(ack) => {
                if let Err(e) = ack.await {
                    error!(error = %e, "dead-letter publish not acknowledged");
                }
            }
            Err(e) => error!(error = %e, "dead-letter publish failed"),
        }
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, Error> {
        let mut stream = self
            .context
            .get_stream(queue)
            .await
            .map_err(|e| Error::Queue(format!("get stream {}: {}", queue, e)))?;
        let info = stream
            .info()
            .await
            .map_err(|e| Error::Queue(format!("stream info {}: {}", queue, e)))?;
        Ok(QueueStats {
            queue: queue.to_string(),
            messages: info.state.messages,
        })
    }

    /// Consume `queue` until cancelled. The callback returns `true` to
    /// ack, `false` to nak with requeue. Malformed JSON goes to the
    /// dead-letter stream; a panicking callback naks with requeue.
    pub async fn consume(
        &self,
        queue: &str,
        durable: &str,
        prefetch: usize,
        cancel: CancellationToken,
        mut callback: impl FnMut(BusMessage) -> bool,
    ) -> Result<(), Error> {
        let stream = self
            .context
            .get_stream(queue)
            .await
            .map_err(|e| Error::Queue(format!("get stream {}: {}", queue, e)))?;
        let consumer = stream
            .get_or_create_consumer(
                durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Queue(format!("create consumer on {}: {}", queue, e)))?;

        let mut messages = consumer
            .stream()
            .max_messages_per_batch(prefetch)
            .messages()
            .await
            .map_err(|e| Error::Queue(format!("open message stream on {}: {}", queue, e)))?;

        info!(queue = queue, prefetch = prefetch, "consumer ready, waiting for messages");

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(queue = queue, "consumer shutting down");
                    return Ok(());
                }
                next = messages.next() => next,
            };

            let message = match delivery {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(queue = queue, error = %e, "consumer stream error");
                    continue;
                }
                None => {
                    warn!(queue = queue, "consumer stream ended");
                    return Ok(());
                }
            };

            match serde_json::from_slice::<BusMessage>(&message.payload) {
                Ok(parsed) => {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(parsed)
                    }));
                    let ack = match outcome {
                        Ok(true) => message.ack().await,
                        Ok(false) => {
                            warn!(queue = queue, "message processing failed, requeueing");
                            message.ack_with(AckKind::Nak(None)).await
                        }
                        Err(_) => {
                            error!(queue = queue, "message handler panicked, requeueing");
                            message.ack_with(AckKind::Nak(None)).await
                        }
                    };
                    if let Err(e) = ack {
                        warn!(queue = queue, error = %e, "ack failed");
                    }
                }
                Err(e) => {
                    error!(queue = queue, error = %e, "invalid message, sending to dead letter");
                    self.publish_dead_letter(message.payload.to_vec()).await;
                    if let Err(e) = message.ack_with(AckKind::Term).await {
                        warn!(queue = queue, error = %e, "terminate failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_message_wire_shape() {
        let msg = BusMessage::metric(
            HostId(7),
            MetricsReport {
                cpu_percent: Some(55.5),
                ..Default::default()
            },
        );
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "metric");
        assert_eq!(value["system_id"], 7);
        assert_eq!(value["data"]["cpu_percent"], 55.5);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn discovery_message_carries_count() {
        let msg = BusMessage::discovery(vec![]);
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "discovery");
        assert_eq!(value["count"], 0);
        assert!(value["systems"].as_array().unwrap().is_empty());
    }

    #[test]
    fn messages_round_trip() {
        let original = BusMessage::metric(
            HostId(3),
            MetricsReport {
                cpu_percent: Some(10.0),
                ram_percent: Some(41.0),
                logged_in_users: Some(2),
                collection_latency_ms: Some(120),
                ..Default::default()
            },
        );
        let bytes = serde_json::to_vec(&original).unwrap();
        let back: BusMessage = serde_json::from_slice(&bytes).unwrap();
        match back {
            BusMessage::Metric { system_id, data, .. } => {
                assert_eq!(system_id, HostId(3));
                assert_eq!(data.cpu_percent, Some(10.0));
                assert_eq!(data.ram_percent, Some(41.0));
                assert_eq!(data.logged_in_users, Some(2));
                assert_eq!(data.collection_latency_ms, Some(120));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn queue_routing_by_variant() {
        assert_eq!(BusMessage::metric(HostId(1), Default::default()).queue(), "metrics");
        assert_eq!(BusMessage::discovery(vec![]).queue(), "discovery");
        assert_eq!(BusMessage::alert(serde_json::json!({})).queue(), "alerts");
    }

    #[test]
    fn timestamp_parses_rfc3339() {
        let secs = parse_timestamp("2026-03-01T12:00:00+00:00").unwrap();
        assert_eq!(secs, 1772366400);
        assert!(parse_timestamp("yesterday-ish").is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = br#"{"type": "telemetry", "timestamp": "2026-03-01T12:00:00Z"}"#;
        assert!(serde_json::from_slice::<BusMessage>(raw).is_err());
    }
}
