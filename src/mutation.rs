//! Safe create/modify semantics over the versioned object store.
//!
//! Writes on one root object are serialized by an exclusive lock and guarded
//! by optimistic concurrency on the backend's opaque version tokens. The
//! backend does not synchronously return the version id it assigns, so the
//! service re-queries the latest version after writing, still under the
//! lock.

use crate::document::ObjectDocument;
use crate::event_log::{EventLogError, EventProducer};
use crate::events::Event;
use crate::lock::{LockError, LockStore};
use crate::object_store::{ObjectStore, StoreError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Metadata header carrying the author of a version.
pub const AUTHOR_METADATA_KEY: &str = "author";

/// Errors surfaced by the mutation service.
#[derive(Error, Debug)]
pub enum MutationError {
    /// The supplied version token is not the store's current version. The
    /// caller recovers by re-reading and retrying the whole
    /// read-modify-write cycle; it is never retried here.
    #[error(
        "concurrent modification of object {object_id}: expected version {expected:?}, current version {current:?}"
    )]
    Concurrency {
        object_id: i64,
        expected: Option<String>,
        current: Option<String>,
    },

    #[error("object {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Events(#[from] EventLogError),

    #[error("failed to encode object document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identifies one live revision of an object, oldest-first ordered by
/// [`versions_after`]. `index` is the 1-based position among the object's
/// live versions.
#[derive(Debug, Clone)]
pub struct RevisionDescriptor {
    pub version_id: String,
    pub last_modified: DateTime<Utc>,
    pub index: u32,
}

/// Storage key of a root object's content.
pub fn object_key(object_id: i64) -> String {
    format!("objects/{object_id}")
}

/// Lock resource name for a root object.
pub fn lock_resource(object_id: i64) -> String {
    format!("object:{object_id}")
}

/// The version flagged current by the backend that is not itself a delete
/// marker, or None.
pub async fn latest_live_version(
    store: &dyn ObjectStore,
    object_id: i64,
) -> Result<Option<String>, StoreError> {
    let versions = store.list_versions(&object_key(object_id)).await?;
    Ok(versions
        .iter()
        .find(|v| v.is_current)
        .filter(|v| !v.is_delete_marker)
        .map(|v| v.version_id.clone()))
}

/// Live versions of an object strictly after `after_version`, oldest first.
///
/// The anchor is matched case-insensitively; if it is absent from history
/// (the backend may have expired it), every live version is returned.
pub async fn versions_after(
    store: &dyn ObjectStore,
    object_id: i64,
    after_version: Option<&str>,
) -> Result<Vec<RevisionDescriptor>, StoreError> {
    let mut versions = store.list_versions(&object_key(object_id)).await?;
    versions.retain(|v| !v.is_delete_marker);
    // Backend order is newest first; derivation wants version order.
    versions.reverse();

    let descriptors: Vec<RevisionDescriptor> = versions
        .into_iter()
        .enumerate()
        .map(|(position, v)| RevisionDescriptor {
            version_id: v.version_id,
            last_modified: v.last_modified,
            index: position as u32 + 1,
        })
        .collect();

    let skip = after_version
        .and_then(|anchor| {
            descriptors
                .iter()
                .position(|d| d.version_id.eq_ignore_ascii_case(anchor))
                .map(|found| found + 1)
        })
        .unwrap_or(0);

    Ok(descriptors.into_iter().skip(skip).collect())
}

/// Lock-serialized, optimistically-concurrent writes on root objects.
pub struct ObjectMutationService {
    store: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockStore>,
    events: Arc<dyn EventProducer>,
    object_events_topic: String,
    lock_ttl: Duration,
}

impl ObjectMutationService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        locks: Arc<dyn LockStore>,
        events: Arc<dyn EventProducer>,
        object_events_topic: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            object_events_topic: object_events_topic.into(),
            lock_ttl,
        }
    }

    /// Write a new version of `object_id`.
    ///
    /// When `expected_version` is supplied the write only happens if it is
    /// the store's current version at execution time (case-insensitive);
    /// otherwise [`MutationError::Concurrency`] is raised without writing.
    /// Returns the version id the backend assigned.
    pub async fn put(
        &self,
        object_id: i64,
        expected_version: Option<&str>,
        document: &ObjectDocument,
        author: &str,
    ) -> Result<String, MutationError> {
        let resource = lock_resource(object_id);
        let handle = self.locks.acquire(&resource, self.lock_ttl).await?;

        let result = self
            .put_locked(object_id, expected_version, document, author)
            .await;

        // The lock is released on every exit path; a failed release only
        // delays the next writer until TTL expiry.
        if let Err(e) = self.locks.release(&handle).await {
            warn!(resource = %resource, error = %e, "failed to release lock");
        }

        result
    }

    async fn put_locked(
        &self,
        object_id: i64,
        expected_version: Option<&str>,
        document: &ObjectDocument,
        author: &str,
    ) -> Result<String, MutationError> {
        let current = latest_live_version(self.store.as_ref(), object_id).await?;

        let version_matches = match (expected_version, current.as_deref()) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        };
        if !version_matches {
            return Err(MutationError::Concurrency {
                object_id,
                expected: expected_version.map(String::from),
                current,
            });
        }

        let body = Bytes::from(serde_json::to_vec(document)?);
        let metadata =
            HashMap::from([(AUTHOR_METADATA_KEY.to_string(), author.to_string())]);
        self.store
            .put(&object_key(object_id), body, &metadata)
            .await?;

        let new_version = latest_live_version(self.store.as_ref(), object_id)
            .await?
            .ok_or(MutationError::NotFound(object_id))?;

        debug!(object_id, version = %new_version, "object version written");

        // Low-information trigger carrying the pre-write version, so the
        // enrichment jobs enumerate everything created after it.
        self.events
            .send(
                &self.object_events_topic,
                &Event::ObjectVersionCreating {
                    object_id,
                    current_version_id: current,
                },
            )
            .await?;

        Ok(new_version)
    }

    /// Current live version of `object_id`.
    pub async fn get_latest_version(&self, object_id: i64) -> Result<String, MutationError> {
        latest_live_version(self.store.as_ref(), object_id)
            .await?
            .ok_or(MutationError::NotFound(object_id))
    }

    /// Live versions strictly after `after_version`, oldest first.
    pub async fn get_versions(
        &self,
        object_id: i64,
        after_version: Option<&str>,
    ) -> Result<Vec<RevisionDescriptor>, MutationError> {
        Ok(versions_after(self.store.as_ref(), object_id, after_version).await?)
    }
}
