//! Kafka implementations of the event log traits.
//!
//! Consumers run with auto-commit disabled; offsets move only through
//! [`EventConsumer::commit`]. Two flavors exist: group-subscribed consumers
//! for the job loops, and assignment-based consumers for seek-heavy readers
//! (the reference-horizon scan) that manage their own positions and never
//! commit.

use crate::config::KafkaConfig;
use crate::event_log::{EventConsumer, EventLogError, EventProducer};
use crate::events::{ConsumedEvent, DeliveryPosition, Event};
use chrono::{DateTime, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{info, warn};

/// Timeout for broker metadata and seek operations.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

fn broker_error<E: std::fmt::Display>(e: E) -> EventLogError {
    EventLogError::Broker(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionMode {
    /// Partitions assigned by the consumer group.
    Subscribed,
    /// Partitions assigned explicitly on seek; no group balancing.
    Assigned,
}

/// Kafka consumer over one topic.
pub struct KafkaEventConsumer {
    consumer: StreamConsumer,
    topic: String,
    mode: PartitionMode,
}

impl KafkaEventConsumer {
    /// Group-subscribed consumer for `topic`.
    pub fn subscribed(
        config: &KafkaConfig,
        topic: &str,
        group: &str,
    ) -> Result<Self, EventLogError> {
        let consumer: StreamConsumer = config
            .build_consumer_config(group)
            .create()
            .map_err(broker_error)?;
        consumer.subscribe(&[topic]).map_err(broker_error)?;

        info!(topic, group, "subscribed to topic");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            mode: PartitionMode::Subscribed,
        })
    }

    /// Assignment-based consumer for `topic`. Partitions are assigned by
    /// the first [`EventConsumer::seek_to_timestamp`] call; the consumer
    /// takes no part in group balancing.
    pub fn assigned(
        config: &KafkaConfig,
        topic: &str,
        group: &str,
    ) -> Result<Self, EventLogError> {
        let consumer: StreamConsumer = config
            .build_consumer_config(group)
            .create()
            .map_err(broker_error)?;

        info!(topic, group, "created assignment-based consumer");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            mode: PartitionMode::Assigned,
        })
    }

    fn partitions(&self) -> Result<Vec<i32>, EventLogError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), OPERATION_TIMEOUT)
            .map_err(broker_error)?;
        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| EventLogError::Broker(format!("unknown topic {}", self.topic)))?;
        Ok(topic.partitions().iter().map(|p| p.id()).collect())
    }

    fn convert(&self, message: &BorrowedMessage<'_>) -> Result<ConsumedEvent, EventLogError> {
        let payload = message
            .payload()
            .ok_or_else(|| EventLogError::Decode("message has no payload".to_string()))?;
        let event: Event =
            serde_json::from_slice(payload).map_err(|e| EventLogError::Decode(e.to_string()))?;
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Ok(ConsumedEvent {
            event,
            timestamp,
            position: DeliveryPosition {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }
}

#[async_trait::async_trait]
impl EventConsumer for KafkaEventConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumedEvent>, EventLogError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(broker_error(e)),
            Ok(Ok(message)) => self.convert(&message).map(Some),
        }
    }

    async fn seek(&self, position: &DeliveryPosition) -> Result<(), EventLogError> {
        self.consumer
            .seek(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
                OPERATION_TIMEOUT,
            )
            .map_err(broker_error)
    }

    async fn seek_to_timestamp(&self, timestamp: DateTime<Utc>) -> Result<(), EventLogError> {
        let millis = timestamp.timestamp_millis();
        let mut request = TopicPartitionList::new();
        for partition in self.partitions()? {
            request
                .add_partition_offset(&self.topic, partition, Offset::Offset(millis))
                .map_err(broker_error)?;
        }

        let looked_up = self
            .consumer
            .offsets_for_times(request, OPERATION_TIMEOUT)
            .map_err(broker_error)?;

        // Partitions with no message at or after the timestamp come back
        // without a concrete offset; position those at the end.
        let mut target = TopicPartitionList::new();
        for element in looked_up.elements() {
            let offset = match element.offset() {
                Offset::Offset(offset) => Offset::Offset(offset),
                _ => Offset::End,
            };
            target
                .add_partition_offset(element.topic(), element.partition(), offset)
                .map_err(broker_error)?;
        }

        match self.mode {
            PartitionMode::Assigned => self.consumer.assign(&target).map_err(broker_error),
            PartitionMode::Subscribed => {
                for element in target.elements() {
                    self.consumer
                        .seek(
                            element.topic(),
                            element.partition(),
                            element.offset(),
                            OPERATION_TIMEOUT,
                        )
                        .map_err(broker_error)?;
                }
                Ok(())
            }
        }
    }

    async fn commit(&self, position: &DeliveryPosition) -> Result<(), EventLogError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset + 1),
            )
            .map_err(|e| EventLogError::Commit {
                topic: position.topic.clone(),
                partition: position.partition,
                message: e.to_string(),
            })?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| EventLogError::Commit {
                topic: position.topic.clone(),
                partition: position.partition,
                message: e.to_string(),
            })
    }
}

/// Kafka producer for the tessera topics.
pub struct KafkaEventProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaEventProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, EventLogError> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(broker_error)?;
        Ok(Self {
            producer,
            timeout: config.request_timeout(),
        })
    }
}

#[async_trait::async_trait]
impl EventProducer for KafkaEventProducer {
    async fn send(&self, topic: &str, event: &Event) -> Result<(), EventLogError> {
        let payload = serde_json::to_vec(event).map_err(|e| EventLogError::Send {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        let key = event.key();
        let record = FutureRecord::to(topic).payload(&payload).key(&key);

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| EventLogError::Send {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

impl Drop for KafkaEventProducer {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(error = %e, "failed to flush producer on shutdown");
        }
    }
}
