//! Event envelope for the tessera topics.
//!
//! All events are immutable, produced once and delivered at least once.
//! Messages on the wire are JSON with an internal `type` tag so every topic
//! carries a self-describing, discriminated envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Discriminated event envelope carried on the tessera topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An upload session was opened. Consumed by the binaries cleanup job.
    SessionCreating {
        session_id: Uuid,
        expires_at: DateTime<Utc>,
        template_id: i64,
        template_version_id: String,
    },
    /// A committed object version references an uploaded binary. The leading
    /// path segment of `file_key` encodes the upload session id.
    BinaryReferenced {
        object_id: i64,
        object_version_id: String,
        template_code: String,
        file_key: String,
    },
    /// Low-information trigger: something changed on `object_id`.
    /// `current_version_id` is the latest version *before* the write (None
    /// for a first write), so consumers enumerate everything after it.
    ObjectVersionCreating {
        object_id: i64,
        current_version_id: Option<String>,
    },
    /// Enriched, public description of one committed object version.
    ObjectVersionCreated {
        object_id: i64,
        version_id: String,
        version_index: u32,
        author: String,
        properties: HashMap<String, String>,
        last_modified: DateTime<Utc>,
    },
}

impl Event {
    /// Partitioning key for the event, chosen so that all events of one
    /// logical entity land on the same partition.
    pub fn key(&self) -> String {
        match self {
            Event::SessionCreating { session_id, .. } => session_id.to_string(),
            Event::BinaryReferenced { object_id, .. } => object_id.to_string(),
            Event::ObjectVersionCreating { object_id, .. } => object_id.to_string(),
            Event::ObjectVersionCreated { object_id, .. } => object_id.to_string(),
        }
    }
}

/// Exact position of a consumed message within the log, committed back only
/// after the corresponding side effect is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// An event as observed by a consumer: payload, broker timestamp and the
/// delivery position to commit once it is processed.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    pub event: Event,
    pub timestamp: DateTime<Utc>,
    pub position: DeliveryPosition,
}

/// Extract the upload session id from a binary file key.
///
/// Binaries live under `{session_id}/...`, so the leading path segment is
/// the session the binary was uploaded in. Returns None for keys that do not
/// follow the scheme.
pub fn session_id_from_file_key(file_key: &str) -> Option<Uuid> {
    let head = file_key.split('/').next()?;
    Uuid::parse_str(head).ok()
}
