//! Event-sourced garbage collection of orphaned uploaded binaries.
//!
//! A binary is uploaded before it is known whether any committed object
//! version will reference it, and the reference signal may arrive well after
//! the session's nominal expiry, over an at-least-once, independently
//! partitioned log. Each pass therefore establishes a reference horizon
//! first and only disposes of sessions whose expiry lies inside it: a
//! session is deleted only when the window that could have carried its
//! reference events has been observed and none appeared.

use crate::event_log::{EventConsumer, EventLogError};
use crate::events::{session_id_from_file_key, DeliveryPosition, Event};
use crate::jobs::cancelled_within;
use crate::object_store::{ObjectStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Margin subtracted from the oldest still-open session's timestamp so that
/// in-flight reference events are never mistaken for already accounted for.
const SAFETY_PERIOD_SECS: i64 = 300;

fn safety_period() -> ChronoDuration {
    ChronoDuration::seconds(SAFETY_PERIOD_SECS)
}

/// Errors surfaced by a cleanup pass.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error(transparent)]
    Events(#[from] EventLogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tuning of the cleanup loop. `range` and `delay` are operator-supplied;
/// the rest have serviceable defaults.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Lookback window bounding how far the reference horizon may start
    /// before now.
    pub range: ChronoDuration,
    /// Sleep between successful passes.
    pub delay: Duration,
    /// Poll timeout per message; bounds cancellation responsiveness.
    pub poll_timeout: Duration,
    /// Back-off after a failed pass before retrying the same uncommitted
    /// position.
    pub error_backoff: Duration,
    /// Session events disposed per drain batch.
    pub batch_size: usize,
}

/// What one pass did; logged and asserted on in tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub collected_sessions: usize,
    pub deleted_objects: usize,
    pub kept_sessions: usize,
}

/// The garbage collection job over session and binary-reference streams.
pub struct BinariesCleanupJob {
    sessions: Arc<dyn EventConsumer>,
    references: Arc<dyn EventConsumer>,
    binaries: Arc<dyn ObjectStore>,
    options: CleanupOptions,
}

impl BinariesCleanupJob {
    pub fn new(
        sessions: Arc<dyn EventConsumer>,
        references: Arc<dyn EventConsumer>,
        binaries: Arc<dyn ObjectStore>,
        options: CleanupOptions,
    ) -> Self {
        Self {
            sessions,
            references,
            binaries,
            options,
        }
    }

    /// Run passes until cancelled. A failed pass is logged and retried from
    /// the same uncommitted position after a short back-off; the job never
    /// terminates on transient failure.
    pub async fn run(&self, token: CancellationToken) {
        info!("binaries cleanup job started");
        while !token.is_cancelled() {
            let wait = match self.run_pass(&token).await {
                Ok(report) => {
                    if report.collected_sessions > 0 {
                        info!(
                            collected = report.collected_sessions,
                            deleted = report.deleted_objects,
                            kept = report.kept_sessions,
                            "cleanup pass finished"
                        );
                    }
                    self.options.delay
                }
                Err(e) => {
                    error!(error = %e, "cleanup pass failed");
                    self.options.error_backoff
                }
            };
            if cancelled_within(&token, wait).await {
                break;
            }
        }
        info!("binaries cleanup job stopped");
    }

    /// One full pass: probe the oldest open session, establish the
    /// reference horizon, then dispose of every session whose expiry lies
    /// inside it.
    pub async fn run_pass(&self, token: &CancellationToken) -> Result<PassReport, CleanupError> {
        let mut report = PassReport::default();

        // Probe the oldest not-yet-committed session event, then restore
        // the live position: the main drain must re-read it, and a crash
        // here must not shift the safety window computed on retry.
        let probe = match self.sessions.poll(self.options.poll_timeout).await? {
            Some(event) => event,
            None => {
                debug!("no pending session events; nothing to collect");
                return Ok(report);
            }
        };
        self.sessions.seek(&probe.position).await?;
        let oldest_session_date = probe.timestamp;

        let date_to_start = std::cmp::min(
            Utc::now() - self.options.range,
            oldest_session_date - safety_period(),
        );

        let (referenced, period_end) = self.reference_horizon(token, date_to_start).await?;
        let period_end = match period_end {
            Some(end) => end,
            None => {
                // No horizon means no proof that reference events for any
                // candidate session had a chance to appear yet.
                info!(
                    %date_to_start,
                    "no reference events in window; refusing to collect"
                );
                return Ok(report);
            }
        };

        debug!(
            %date_to_start,
            %period_end,
            referenced = referenced.len(),
            "reference horizon established"
        );

        // Drain session events in batches; stop once a whole batch falls
        // past the horizon. Offsets commit per event, only after its
        // disposition is resolved.
        let mut resume_at: Option<DeliveryPosition> = None;
        'drain: while !token.is_cancelled() {
            let mut batch = Vec::with_capacity(self.options.batch_size);
            while batch.len() < self.options.batch_size {
                match self.sessions.poll(self.options.poll_timeout).await? {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let mut resolved = 0usize;
            for consumed in batch {
                if token.is_cancelled() {
                    break 'drain;
                }
                let (session_id, expires_at) = match &consumed.event {
                    Event::SessionCreating {
                        session_id,
                        expires_at,
                        ..
                    } => (*session_id, *expires_at),
                    _ => {
                        warn!(
                            topic = %consumed.position.topic,
                            offset = consumed.position.offset,
                            "unexpected event on session topic; skipping"
                        );
                        self.sessions.commit(&consumed.position).await?;
                        continue;
                    }
                };

                if expires_at <= period_end {
                    resolved += 1;
                    if referenced.contains(&session_id) {
                        debug!(%session_id, "session referenced; kept");
                        report.kept_sessions += 1;
                    } else {
                        let deleted = self.delete_session_objects(session_id).await?;
                        info!(%session_id, deleted, "expired unreferenced session collected");
                        metrics::counter!("cleanup.binaries.objects_deleted")
                            .increment(deleted as u64);
                        report.collected_sessions += 1;
                        report.deleted_objects += deleted;
                    }
                    self.sessions.commit(&consumed.position).await?;
                } else if resume_at.is_none() {
                    resume_at = Some(consumed.position.clone());
                }
            }

            if resolved == 0 {
                break;
            }
        }

        // Leave the live position at the first unresolved session so the
        // next pass (and its probe) observes it again.
        if let Some(position) = resume_at {
            self.sessions.seek(&position).await?;
        }

        Ok(report)
    }

    /// Seek the reference stream to `date_to_start` and drain whatever is
    /// currently available. Returns the referenced session ids and the
    /// timestamp of the last reference observed.
    async fn reference_horizon(
        &self,
        token: &CancellationToken,
        date_to_start: DateTime<Utc>,
    ) -> Result<(HashSet<Uuid>, Option<DateTime<Utc>>), CleanupError> {
        self.references.seek_to_timestamp(date_to_start).await?;

        let mut referenced = HashSet::new();
        let mut period_end = None;
        while !token.is_cancelled() {
            let consumed = match self.references.poll(self.options.poll_timeout).await? {
                Some(event) => event,
                None => break,
            };
            match &consumed.event {
                Event::BinaryReferenced { file_key, .. } => {
                    match session_id_from_file_key(file_key) {
                        Some(session_id) => {
                            referenced.insert(session_id);
                        }
                        None => warn!(file_key, "reference with unparsable file key"),
                    }
                }
                _ => warn!(
                    topic = %consumed.position.topic,
                    offset = consumed.position.offset,
                    "unexpected event on references topic"
                ),
            }
            period_end = Some(consumed.timestamp);
        }
        Ok((referenced, period_end))
    }

    /// Best-effort deletion of everything a session uploaded. An
    /// already-absent object is success, so redoing this after a crash is
    /// idempotent.
    async fn delete_session_objects(&self, session_id: Uuid) -> Result<usize, CleanupError> {
        let keys = self.binaries.list_keys(&format!("{session_id}/")).await?;
        let count = keys.len();
        for key in &keys {
            self.binaries.delete(key).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;
    use crate::object_store::InMemoryObjectStore;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const SESSIONS_TOPIC: &str = "session-events";
    const REFERENCES_TOPIC: &str = "binaries-references";
    const GROUP: &str = "binaries-cleanup";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn options() -> CleanupOptions {
        CleanupOptions {
            range: ChronoDuration::hours(24),
            delay: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            batch_size: 10,
        }
    }

    fn session_event(session_id: Uuid, expires_at: DateTime<Utc>) -> Event {
        Event::SessionCreating {
            session_id,
            expires_at,
            template_id: 7,
            template_version_id: "tv-1".to_string(),
        }
    }

    fn reference_event(session_id: Uuid) -> Event {
        Event::BinaryReferenced {
            object_id: 1,
            object_version_id: "V1".to_string(),
            template_code: "photo".to_string(),
            file_key: format!("{session_id}/deadbeef"),
        }
    }

    async fn seed_binary(store: &InMemoryObjectStore, session_id: Uuid, name: &str) -> String {
        let key = format!("{session_id}/{name}");
        store
            .put(&key, Bytes::from_static(b"binary"), &HashMap::new())
            .await
            .unwrap();
        key
    }

    fn job(log: &InMemoryEventLog, store: Arc<InMemoryObjectStore>) -> BinariesCleanupJob {
        BinariesCleanupJob::new(
            Arc::new(log.consumer(SESSIONS_TOPIC, GROUP)),
            Arc::new(log.consumer(REFERENCES_TOPIC, "cleanup-references")),
            store,
            options(),
        )
    }

    #[tokio::test]
    async fn referenced_session_is_kept_even_when_reference_arrives_after_expiry() {
        // Scenario: session created at t=0, expires at t=1000, reference
        // observed at t=1050, safety period 300.
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let s1 = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(s1, at(1000)), at(0));
        log.append_at(REFERENCES_TOPIC, reference_event(s1), at(1050));
        let key = seed_binary(&store, s1, "deadbeef").await;

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.collected_sessions, 0);
        assert_eq!(report.kept_sessions, 1);
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn orphaned_expired_session_is_collected_once_a_horizon_exists() {
        // An unreferenced session past its expiry is deleted as soon as at
        // least one reference event establishes the horizon.
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let orphan = Uuid::new_v4();
        let referenced = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(orphan, at(500)), at(0));
        log.append_at(SESSIONS_TOPIC, session_event(referenced, at(800)), at(10));
        log.append_at(REFERENCES_TOPIC, reference_event(referenced), at(900));

        let orphan_key = seed_binary(&store, orphan, "a").await;
        let orphan_staging = seed_binary(&store, orphan, "staging/b").await;
        let kept_key = seed_binary(&store, referenced, "c").await;

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.collected_sessions, 1);
        assert_eq!(report.deleted_objects, 2);
        assert!(store.get(&orphan_key).await.is_err());
        assert!(store.get(&orphan_staging).await.is_err());
        assert!(store.get(&kept_key).await.is_ok());
    }

    #[tokio::test]
    async fn no_reference_events_means_no_deletions() {
        // Conservative refusal: without a horizon nothing is deleted, no
        // matter how old the session is.
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let stale = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(stale, at(100)), at(0));
        let key = seed_binary(&store, stale, "a").await;

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, PassReport::default());
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn session_expiring_after_the_horizon_waits_for_a_later_pass() {
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let pending = Uuid::new_v4();
        let other = Uuid::new_v4();

        // Horizon ends at t=900 but the session expires at t=2000.
        log.append_at(SESSIONS_TOPIC, session_event(pending, at(2000)), at(0));
        log.append_at(REFERENCES_TOPIC, reference_event(other), at(900));
        let key = seed_binary(&store, pending, "a").await;

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.collected_sessions, 0);
        assert!(store.get(&key).await.is_ok());

        // A later pass with a horizon past the expiry collects it.
        log.append_at(REFERENCES_TOPIC, reference_event(other), at(2100));
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.collected_sessions, 1);
        assert!(store.get(&key).await.is_err());
    }

    #[tokio::test]
    async fn rerunning_a_pass_with_no_new_events_deletes_nothing() {
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let orphan = Uuid::new_v4();
        let referenced = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(orphan, at(500)), at(0));
        log.append_at(REFERENCES_TOPIC, reference_event(referenced), at(900));
        seed_binary(&store, orphan, "a").await;

        let job = job(&log, store.clone());
        let first = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.collected_sessions, 1);

        let second = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(second, PassReport::default());
    }

    #[tokio::test]
    async fn redoing_a_pass_after_a_crash_is_idempotent() {
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let orphan = Uuid::new_v4();
        let referenced = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(orphan, at(500)), at(0));
        log.append_at(REFERENCES_TOPIC, reference_event(referenced), at(900));
        seed_binary(&store, orphan, "a").await;

        let first_job = job(&log, store.clone());
        first_job.run_pass(&CancellationToken::new()).await.unwrap();

        // A restarted job resumes from the committed offsets and redoes
        // nothing.
        let restarted = job(&log, store.clone());
        let report = restarted.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn reference_inside_the_safety_margin_protects_the_session() {
        // The reference lands between expiry and expiry + safety period;
        // with periodEnd past the reference timestamp the session must not
        // be deleted.
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let s1 = Uuid::new_v4();
        let other = Uuid::new_v4();

        let expiry = at(1000);
        log.append_at(SESSIONS_TOPIC, session_event(s1, expiry), at(700));
        log.append_at(REFERENCES_TOPIC, reference_event(s1), at(1200));
        log.append_at(REFERENCES_TOPIC, reference_event(other), at(1300));
        let key = seed_binary(&store, s1, "a").await;

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.collected_sessions, 0);
        assert_eq!(report.kept_sessions, 1);
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn empty_session_topic_is_a_quiet_pass() {
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let job = job(&log, store);
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn deleting_an_already_collected_session_succeeds() {
        // Objects already absent count as successfully deleted.
        let log = InMemoryEventLog::new();
        let store = Arc::new(InMemoryObjectStore::new());
        let orphan = Uuid::new_v4();
        let referenced = Uuid::new_v4();

        log.append_at(SESSIONS_TOPIC, session_event(orphan, at(500)), at(0));
        log.append_at(REFERENCES_TOPIC, reference_event(referenced), at(900));

        let job = job(&log, store.clone());
        let report = job.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.collected_sessions, 1);
        assert_eq!(report.deleted_objects, 0);
    }
}
