//! Enrichment of low-information object change triggers.
//!
//! Two independent long-running consumers, each with its own consumer group
//! over the object-events topic, both keyed off `ObjectVersionCreating`:
//! the versions task publishes one enriched `ObjectVersionCreated` per
//! discovered version, the binaries task publishes one `BinaryReferenced`
//! per binary-valued element of each discovered version. A single trigger
//! may correspond to several rapidly-created versions, so both enumerate
//! everything the store holds after the trigger's anchor version.

use crate::document::ObjectDocument;
use crate::event_log::{EventConsumer, EventLogError, EventProducer};
use crate::events::{ConsumedEvent, Event};
use crate::jobs::cancelled_within;
use crate::mutation::{object_key, versions_after, RevisionDescriptor, AUTHOR_METADATA_KEY};
use crate::object_store::{ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which derivation this job instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionMode {
    /// Emit enriched `ObjectVersionCreated` events to the public topic.
    Versions,
    /// Emit `BinaryReferenced` events to the binaries-references topic.
    Binaries,
}

impl ProductionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductionMode::Versions => "versions",
            ProductionMode::Binaries => "binaries",
        }
    }
}

/// Errors surfaced while deriving events for one trigger.
#[derive(Error, Debug)]
pub enum ProductionError {
    #[error(transparent)]
    Events(#[from] EventLogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to decode object document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of deriving events for one consumed trigger.
///
/// "Not yet visible" is an expected transient state (a read racing ahead of
/// store consistency) inspected by the loop, not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum DerivationOutcome {
    /// All derived events were durably sent; the trigger may be committed.
    Published(usize),
    /// The store does not yet show what the trigger announced; retry later
    /// without advancing offsets.
    NotYetVisible,
}

/// Tuning of the production loop.
#[derive(Debug, Clone)]
pub struct ProductionOptions {
    /// Poll timeout per message; bounds cancellation responsiveness.
    pub poll_timeout: Duration,
    /// Delay before retrying a trigger after a transient failure.
    pub retry_delay: Duration,
}

/// One event production task.
pub struct EventProductionJob {
    mode: ProductionMode,
    consumer: Arc<dyn EventConsumer>,
    producer: Arc<dyn EventProducer>,
    store: Arc<dyn ObjectStore>,
    output_topic: String,
    options: ProductionOptions,
}

impl EventProductionJob {
    pub fn new(
        mode: ProductionMode,
        consumer: Arc<dyn EventConsumer>,
        producer: Arc<dyn EventProducer>,
        store: Arc<dyn ObjectStore>,
        output_topic: impl Into<String>,
        options: ProductionOptions,
    ) -> Self {
        Self {
            mode,
            consumer,
            producer,
            store,
            output_topic: output_topic.into(),
            options,
        }
    }

    /// Consume triggers until cancelled. Transient failures (including
    /// not-yet-visible reads) are logged and retried from the same
    /// uncommitted position; this loop never terminates on them.
    pub async fn run(&self, token: CancellationToken) {
        info!(mode = self.mode.as_str(), "event production job started");
        while !token.is_cancelled() {
            match self.step(&token).await {
                Ok(()) => {}
                Err(e) => {
                    error!(mode = self.mode.as_str(), error = %e, "production step failed");
                    if cancelled_within(&token, self.options.retry_delay).await {
                        break;
                    }
                }
            }
        }
        info!(mode = self.mode.as_str(), "event production job stopped");
    }

    /// Poll one trigger and resolve it: publish-and-commit, or rewind for
    /// retry.
    pub async fn step(&self, token: &CancellationToken) -> Result<(), ProductionError> {
        let consumed = match self.consumer.poll(self.options.poll_timeout).await? {
            Some(consumed) => consumed,
            None => return Ok(()),
        };

        match self.derive(&consumed).await {
            Ok(DerivationOutcome::Published(count)) => {
                if count > 0 {
                    metrics::counter!(
                        "production.events_published",
                        "mode" => self.mode.as_str()
                    )
                    .increment(count as u64);
                }
                self.consumer.commit(&consumed.position).await?;
            }
            Ok(DerivationOutcome::NotYetVisible) => {
                debug!(
                    mode = self.mode.as_str(),
                    offset = consumed.position.offset,
                    "object not yet visible; will retry"
                );
                self.consumer.seek(&consumed.position).await?;
                cancelled_within(token, self.options.retry_delay).await;
            }
            Err(e) => {
                // Same treatment as not-yet-visible: rewind, wait, retry.
                self.consumer.seek(&consumed.position).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Derive and durably send every event implied by one trigger.
    pub async fn derive(
        &self,
        consumed: &ConsumedEvent,
    ) -> Result<DerivationOutcome, ProductionError> {
        let (object_id, anchor) = match &consumed.event {
            Event::ObjectVersionCreating {
                object_id,
                current_version_id,
            } => (*object_id, current_version_id.clone()),
            _ => {
                warn!(
                    topic = %consumed.position.topic,
                    offset = consumed.position.offset,
                    "unexpected event on object-events topic; skipping"
                );
                return Ok(DerivationOutcome::Published(0));
            }
        };

        let revisions = versions_after(self.store.as_ref(), object_id, anchor.as_deref()).await?;
        if revisions.is_empty() {
            // The trigger was emitted after a successful write, so at least
            // one newer version must exist; the read raced ahead of store
            // consistency.
            return Ok(DerivationOutcome::NotYetVisible);
        }

        let mut published = 0usize;
        for revision in &revisions {
            let stored = match self
                .store
                .get_version(&object_key(object_id), &revision.version_id)
                .await
            {
                Ok(stored) => stored,
                Err(StoreError::NotFound { .. }) => return Ok(DerivationOutcome::NotYetVisible),
                Err(e) => return Err(e.into()),
            };
            let document: ObjectDocument = serde_json::from_slice(&stored.body)?;

            match self.mode {
                ProductionMode::Versions => {
                    let author = stored
                        .metadata
                        .get(AUTHOR_METADATA_KEY)
                        .cloned()
                        .unwrap_or_default();
                    self.producer
                        .send(
                            &self.output_topic,
                            &created_event(object_id, revision, &document, author),
                        )
                        .await?;
                    published += 1;
                }
                ProductionMode::Binaries => {
                    for (template_code, file_key) in document.binary_references() {
                        self.producer
                            .send(
                                &self.output_topic,
                                &Event::BinaryReferenced {
                                    object_id,
                                    object_version_id: revision.version_id.clone(),
                                    template_code: template_code.to_string(),
                                    file_key: file_key.to_string(),
                                },
                            )
                            .await?;
                        published += 1;
                    }
                }
            }
        }

        debug!(
            mode = self.mode.as_str(),
            object_id,
            revisions = revisions.len(),
            published,
            "trigger enriched"
        );
        Ok(DerivationOutcome::Published(published))
    }
}

fn created_event(
    object_id: i64,
    revision: &RevisionDescriptor,
    document: &ObjectDocument,
    author: String,
) -> Event {
    Event::ObjectVersionCreated {
        object_id,
        version_id: revision.version_id.clone(),
        version_index: revision.index,
        author,
        properties: document.properties.clone(),
        last_modified: revision.last_modified,
    }
}
