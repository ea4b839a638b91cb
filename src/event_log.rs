//! Event log abstraction: append-only, partitioned, at-least-once pub/sub
//! with manual offset commit and timestamp-based seek.
//!
//! The Kafka implementations live in [`crate::kafka`]. The in-memory log in
//! this module backs tests and single-process development; it models a
//! single partition per topic and shares committed offsets per consumer
//! group, which is enough for the job loops but not for multi-instance
//! partition balancing.

use crate::events::{ConsumedEvent, DeliveryPosition, Event};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the event log backends.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("failed to commit offset for {topic}[{partition}]: {message}")]
    Commit {
        topic: String,
        partition: i32,
        message: String,
    },

    #[error("failed to decode event payload: {0}")]
    Decode(String),

    #[error("failed to send event to {topic}: {message}")]
    Send { topic: String, message: String },
}

/// Consumer side of the event log.
///
/// Implementations poll a single topic. Offsets advance in process as
/// messages are polled; nothing is durable until [`commit`] is called, and
/// [`seek`] rewinds the live position so uncommitted messages are re-read.
///
/// [`commit`]: EventConsumer::commit
/// [`seek`]: EventConsumer::seek
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing
    /// was available, which is not an error.
    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumedEvent>, EventLogError>;

    /// Move the live position so the message at `position` is the next one
    /// polled.
    async fn seek(&self, position: &DeliveryPosition) -> Result<(), EventLogError>;

    /// Move the live position of every partition to the earliest message
    /// with a broker timestamp at or after `timestamp`.
    async fn seek_to_timestamp(&self, timestamp: DateTime<Utc>) -> Result<(), EventLogError>;

    /// Durably mark the message at `position` as processed.
    async fn commit(&self, position: &DeliveryPosition) -> Result<(), EventLogError>;
}

/// Producer side of the event log.
#[async_trait::async_trait]
pub trait EventProducer: Send + Sync {
    /// Durably send one event to `topic`. Returns once the broker has
    /// acknowledged the write.
    async fn send(&self, topic: &str, event: &Event) -> Result<(), EventLogError>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    timestamp: DateTime<Utc>,
    event: Event,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<StoredRecord>>,
    // (topic, group) -> next offset to hand to a fresh consumer
    committed: HashMap<(String, String), i64>,
}

/// In-memory event log for tests and single-process development.
///
/// One partition per topic; consumers created through [`consumer`] resume
/// from their group's committed offset, mirroring a broker restart.
///
/// [`consumer`]: InMemoryEventLog::consumer
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<LogState>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event with an explicit broker timestamp. Test hook: lets
    /// suites construct precise event timelines.
    pub fn append_at(&self, topic: &str, event: Event, timestamp: DateTime<Utc>) {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(StoredRecord {
                timestamp,
                event,
            });
    }

    /// Create a consumer for `topic` in `group`, positioned at the group's
    /// committed offset.
    pub fn consumer(&self, topic: &str, group: &str) -> InMemoryEventConsumer {
        let start = {
            let state = self.state.lock();
            state
                .committed
                .get(&(topic.to_string(), group.to_string()))
                .copied()
                .unwrap_or(0)
        };
        InMemoryEventConsumer {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            group: group.to_string(),
            position: Mutex::new(start),
        }
    }

    /// Number of events currently stored on `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Events currently stored on `topic`, oldest first.
    pub fn events(&self, topic: &str) -> Vec<Event> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|records| records.iter().map(|r| r.event.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl EventProducer for InMemoryEventLog {
    async fn send(&self, topic: &str, event: &Event) -> Result<(), EventLogError> {
        self.append_at(topic, event.clone(), Utc::now());
        Ok(())
    }
}

/// Single-partition consumer over an [`InMemoryEventLog`].
pub struct InMemoryEventConsumer {
    state: Arc<Mutex<LogState>>,
    topic: String,
    group: String,
    position: Mutex<i64>,
}

#[async_trait::async_trait]
impl EventConsumer for InMemoryEventConsumer {
    async fn poll(&self, _timeout: Duration) -> Result<Option<ConsumedEvent>, EventLogError> {
        let state = self.state.lock();
        let mut position = self.position.lock();
        let records = match state.topics.get(&self.topic) {
            Some(records) => records,
            None => return Ok(None),
        };
        let offset = *position;
        match records.get(offset as usize) {
            Some(record) => {
                *position = offset + 1;
                Ok(Some(ConsumedEvent {
                    event: record.event.clone(),
                    timestamp: record.timestamp,
                    position: DeliveryPosition {
                        topic: self.topic.clone(),
                        partition: 0,
                        offset,
                    },
                }))
            }
            None => Ok(None),
        }
    }

    async fn seek(&self, position: &DeliveryPosition) -> Result<(), EventLogError> {
        *self.position.lock() = position.offset;
        Ok(())
    }

    async fn seek_to_timestamp(&self, timestamp: DateTime<Utc>) -> Result<(), EventLogError> {
        let state = self.state.lock();
        let records = state.topics.get(&self.topic);
        let next = records
            .map(|records| {
                records
                    .iter()
                    .position(|r| r.timestamp >= timestamp)
                    .unwrap_or(records.len())
            })
            .unwrap_or(0);
        *self.position.lock() = next as i64;
        Ok(())
    }

    async fn commit(&self, position: &DeliveryPosition) -> Result<(), EventLogError> {
        let mut state = self.state.lock();
        state.committed.insert(
            (self.topic.clone(), self.group.clone()),
            position.offset + 1,
        );
        Ok(())
    }
}
