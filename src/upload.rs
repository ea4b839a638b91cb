//! Multipart binary upload sessions.
//!
//! A session is created once per upload workflow, uploads staged parts into
//! the binaries bucket under the session's prefix, and on completion the
//! validated binary is published at a content-addressed key derived from the
//! final ETag. The staging object is deleted on every completion path, so
//! nothing but the published key (or nothing at all) survives a workflow.
//!
//! Sessions are single-writer: concurrent `upload_part` calls on the same
//! session are outside the correctness guarantees.

use crate::event_log::{EventLogError, EventProducer};
use crate::events::Event;
use crate::object_store::{ObjectStore, StoreError, UploadedPart};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata header carrying a descriptor or staging object's expiry.
pub const EXPIRES_AT_METADATA_KEY: &str = "expires-at";
/// Metadata header carrying the original file name of a staged upload.
pub const FILENAME_METADATA_KEY: &str = "filename";

/// Typed rejection from the binary content validator. The content itself is
/// rejected; retrying without changing it cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("binary content rejected for template {template_code}: {reason}")]
pub struct ValidationError {
    pub template_code: String,
    pub reason: String,
}

/// Errors surfaced by the upload session workflow.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload session {0} not found")]
    SessionNotFound(Uuid),

    #[error("upload session {session_id} expired at {expires_at}")]
    SessionExpired {
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[error("upload for session {0} was aborted")]
    Aborted(Uuid),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Events(#[from] EventLogError),

    #[error("failed to encode session descriptor: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Collaborator validating uploaded binary content against the element
/// template it will be attached to. Opaque to this core.
#[async_trait::async_trait]
pub trait BinaryValidator: Send + Sync {
    async fn validate(
        &self,
        template_id: i64,
        template_version_id: &str,
        template_code: &str,
        content: &Bytes,
    ) -> Result<(), ValidationError>;
}

/// Validator that accepts everything. Stand-in where the schema layer is not
/// wired, e.g. worker processes that never complete uploads.
pub struct AcceptAllValidator;

#[async_trait::async_trait]
impl BinaryValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _template_id: i64,
        _template_version_id: &str,
        _template_code: &str,
        _content: &Bytes,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Immutable description of one upload workflow, persisted at
/// `{session_id}/session` in the binaries bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub template_id: i64,
    pub template_version_id: String,
    pub expires_at: DateTime<Utc>,
    pub upload_uris: Vec<String>,
}

/// State of one multipart upload within a session.
///
/// Part numbers are strictly increasing from 1; `completed` and `aborted`
/// are terminal, idempotent states.
#[derive(Debug, Clone)]
pub struct MultipartUploadSession {
    pub session_id: Uuid,
    pub file_name: String,
    pub upload_id: String,
    pub staging_key: String,
    pub parts: Vec<UploadedPart>,
    pub completed: bool,
    pub aborted: bool,
    pub content_key: Option<String>,
}

impl MultipartUploadSession {
    pub fn next_part_number(&self) -> i32 {
        self.parts.len() as i32 + 1
    }
}

fn descriptor_key(session_id: Uuid) -> String {
    format!("{session_id}/session")
}

fn staging_key(session_id: Uuid) -> String {
    format!("{session_id}/staging/{}", Uuid::new_v4())
}

/// Multipart upload lifecycle over the binaries bucket.
pub struct UploadSessionManager {
    binaries: Arc<dyn ObjectStore>,
    validator: Arc<dyn BinaryValidator>,
    events: Arc<dyn EventProducer>,
    session_events_topic: String,
    session_ttl: Duration,
}

impl UploadSessionManager {
    pub fn new(
        binaries: Arc<dyn ObjectStore>,
        validator: Arc<dyn BinaryValidator>,
        events: Arc<dyn EventProducer>,
        session_events_topic: impl Into<String>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            binaries,
            validator,
            events,
            session_events_topic: session_events_topic.into(),
            session_ttl,
        }
    }

    /// Open a new upload workflow: persist the descriptor and announce the
    /// session on the session-events topic so the cleanup job can track it.
    pub async fn create_session(
        &self,
        template_id: i64,
        template_version_id: &str,
        file_count: usize,
    ) -> Result<SessionDescriptor, UploadError> {
        let session_id = Uuid::new_v4();
        let expires_at = Utc::now() + self.session_ttl;
        let descriptor = SessionDescriptor {
            session_id,
            template_id,
            template_version_id: template_version_id.to_string(),
            expires_at,
            upload_uris: (0..file_count)
                .map(|_| format!("{session_id}/{}", Uuid::new_v4()))
                .collect(),
        };

        let body = Bytes::from(serde_json::to_vec(&descriptor)?);
        let metadata = HashMap::from([(
            EXPIRES_AT_METADATA_KEY.to_string(),
            expires_at.to_rfc3339(),
        )]);
        self.binaries
            .put(&descriptor_key(session_id), body, &metadata)
            .await?;

        self.events
            .send(
                &self.session_events_topic,
                &Event::SessionCreating {
                    session_id,
                    expires_at,
                    template_id,
                    template_version_id: template_version_id.to_string(),
                },
            )
            .await?;

        info!(%session_id, %expires_at, "upload session created");
        Ok(descriptor)
    }

    async fn load_descriptor(&self, session_id: Uuid) -> Result<SessionDescriptor, UploadError> {
        let stored = match self.binaries.get(&descriptor_key(session_id)).await {
            Ok(stored) => stored,
            Err(StoreError::NotFound { .. }) => {
                return Err(UploadError::SessionNotFound(session_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&stored.body)?)
    }

    /// Begin a multipart upload inside an existing, unexpired session.
    pub async fn initiate_upload(
        &self,
        session_id: Uuid,
        file_name: &str,
        content_type: &str,
    ) -> Result<MultipartUploadSession, UploadError> {
        let descriptor = self.load_descriptor(session_id).await?;
        if descriptor.expires_at <= Utc::now() {
            return Err(UploadError::SessionExpired {
                session_id,
                expires_at: descriptor.expires_at,
            });
        }

        let staging_key = staging_key(session_id);
        let metadata = HashMap::from([
            (FILENAME_METADATA_KEY.to_string(), file_name.to_string()),
            (
                EXPIRES_AT_METADATA_KEY.to_string(),
                descriptor.expires_at.to_rfc3339(),
            ),
        ]);
        let upload_id = self
            .binaries
            .create_multipart_upload(&staging_key, content_type, &metadata)
            .await?;

        debug!(%session_id, staging_key, upload_id, "multipart upload initiated");
        Ok(MultipartUploadSession {
            session_id,
            file_name: file_name.to_string(),
            upload_id,
            staging_key,
            parts: Vec::new(),
            completed: false,
            aborted: false,
            content_key: None,
        })
    }

    /// Upload one fully-buffered chunk as the next part.
    pub async fn upload_part(
        &self,
        session: &mut MultipartUploadSession,
        chunk: Bytes,
    ) -> Result<(), UploadError> {
        if session.aborted {
            return Err(UploadError::Aborted(session.session_id));
        }
        if session.completed {
            // Terminal state; there is nothing to append to.
            return Ok(());
        }

        let part_number = session.next_part_number();
        let etag = self
            .binaries
            .upload_part(&session.staging_key, &session.upload_id, part_number, chunk)
            .await?;
        session.parts.push(UploadedPart { part_number, etag });
        Ok(())
    }

    /// Finalize the upload: assemble the parts, validate the result and
    /// publish it at a content-addressed key.
    ///
    /// The staging object is deleted on every exit path, success and
    /// validation failure alike; a validation failure then propagates the
    /// structured error.
    pub async fn complete_upload(
        &self,
        session: &mut MultipartUploadSession,
        template_id: i64,
        template_version_id: &str,
        template_code: &str,
    ) -> Result<String, UploadError> {
        if session.aborted {
            return Err(UploadError::Aborted(session.session_id));
        }
        if session.completed {
            if let Some(key) = &session.content_key {
                return Ok(key.clone());
            }
        }

        let etag = self
            .binaries
            .complete_multipart_upload(&session.staging_key, &session.upload_id, &session.parts)
            .await?;
        let etag = etag.trim_matches('"').to_string();

        let outcome = self
            .validate_and_publish(session, template_id, template_version_id, template_code, &etag)
            .await;

        // Guaranteed cleanup: the staging object never outlives the call.
        if let Err(e) = self.binaries.delete(&session.staging_key).await {
            warn!(
                staging_key = %session.staging_key,
                error = %e,
                "failed to delete staging object"
            );
        }

        let content_key = outcome?;
        session.completed = true;
        session.content_key = Some(content_key.clone());
        info!(
            session_id = %session.session_id,
            content_key = %content_key,
            "upload completed"
        );
        Ok(content_key)
    }

    async fn validate_and_publish(
        &self,
        session: &MultipartUploadSession,
        template_id: i64,
        template_version_id: &str,
        template_code: &str,
        etag: &str,
    ) -> Result<String, UploadError> {
        let staged = self.binaries.get(&session.staging_key).await?;
        self.validator
            .validate(template_id, template_version_id, template_code, &staged.body)
            .await?;

        let content_key = format!("{}/{etag}", session.session_id);
        self.binaries
            .copy(&session.staging_key, &content_key, true)
            .await?;
        Ok(content_key)
    }

    /// Cancel the backend multipart upload. No-op once completed.
    pub async fn abort_upload(
        &self,
        session: &mut MultipartUploadSession,
    ) -> Result<(), UploadError> {
        if session.completed || session.aborted {
            return Ok(());
        }
        self.binaries
            .abort_multipart_upload(&session.staging_key, &session.upload_id)
            .await?;
        session.aborted = true;
        debug!(session_id = %session.session_id, "upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;
    use crate::object_store::InMemoryObjectStore;

    const TOPIC: &str = "session-events";

    /// Validator rejecting everything with a fixed reason.
    struct RejectAllValidator;

    #[async_trait::async_trait]
    impl BinaryValidator for RejectAllValidator {
        async fn validate(
            &self,
            _template_id: i64,
            _template_version_id: &str,
            template_code: &str,
            _content: &Bytes,
        ) -> Result<(), ValidationError> {
            Err(ValidationError {
                template_code: template_code.to_string(),
                reason: "unsupported content".to_string(),
            })
        }
    }

    fn manager(
        store: Arc<InMemoryObjectStore>,
        validator: Arc<dyn BinaryValidator>,
        log: InMemoryEventLog,
    ) -> UploadSessionManager {
        UploadSessionManager::new(store, validator, Arc::new(log), TOPIC, Duration::hours(1))
    }

    #[tokio::test]
    async fn create_session_persists_descriptor_and_emits_event() {
        let store = Arc::new(InMemoryObjectStore::new());
        let log = InMemoryEventLog::new();
        let manager = manager(store.clone(), Arc::new(AcceptAllValidator), log.clone());

        let descriptor = manager.create_session(7, "tv-1", 2).await.unwrap();
        assert_eq!(descriptor.upload_uris.len(), 2);

        let stored = store
            .get(&descriptor_key(descriptor.session_id))
            .await
            .unwrap();
        let loaded: SessionDescriptor = serde_json::from_slice(&stored.body).unwrap();
        assert_eq!(loaded.session_id, descriptor.session_id);
        assert!(stored.metadata.contains_key(EXPIRES_AT_METADATA_KEY));

        match &log.events(TOPIC)[..] {
            [Event::SessionCreating {
                session_id,
                template_id,
                ..
            }] => {
                assert_eq!(*session_id, descriptor.session_id);
                assert_eq!(*template_id, 7);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_upload_is_the_ordered_concatenation_of_parts() {
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = manager(
            store.clone(),
            Arc::new(AcceptAllValidator),
            InMemoryEventLog::new(),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let mut session = manager
            .initiate_upload(descriptor.session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap();

        manager
            .upload_part(&mut session, Bytes::from_static(b"first "))
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"second "))
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"third"))
            .await
            .unwrap();
        assert_eq!(
            session.parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let content_key = manager
            .complete_upload(&mut session, 7, "tv-1", "photo")
            .await
            .unwrap();

        let published = store.get(&content_key).await.unwrap();
        assert_eq!(published.body, Bytes::from_static(b"first second third"));
        assert!(content_key.starts_with(&format!("{}/", descriptor.session_id)));

        // Staging never outlives completion.
        assert!(matches!(
            store.get(&session.staging_key).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.has_open_uploads());
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = manager(
            store.clone(),
            Arc::new(AcceptAllValidator),
            InMemoryEventLog::new(),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let mut session = manager
            .initiate_upload(descriptor.session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let first = manager
            .complete_upload(&mut session, 7, "tv-1", "photo")
            .await
            .unwrap();
        let second = manager
            .complete_upload(&mut session, 7, "tv-1", "photo")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn validation_failure_still_deletes_staging_and_publishes_nothing() {
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = manager(
            store.clone(),
            Arc::new(RejectAllValidator),
            InMemoryEventLog::new(),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let session_id = descriptor.session_id;
        let mut session = manager
            .initiate_upload(session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let err = manager
            .complete_upload(&mut session, 7, "tv-1", "photo")
            .await
            .unwrap_err();
        match err {
            UploadError::Validation(validation) => {
                assert_eq!(validation.template_code, "photo");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            store.get(&session.staging_key).await,
            Err(StoreError::NotFound { .. })
        ));
        // Only the descriptor remains under the session prefix.
        assert_eq!(
            store.list_keys(&format!("{session_id}/")).await.unwrap(),
            vec![descriptor_key(session_id)]
        );
        assert!(!session.completed);
    }

    #[tokio::test]
    async fn abort_cancels_the_backend_upload_and_is_idempotent() {
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = manager(
            store.clone(),
            Arc::new(AcceptAllValidator),
            InMemoryEventLog::new(),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let mut session = manager
            .initiate_upload(descriptor.session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        manager.abort_upload(&mut session).await.unwrap();
        assert!(!store.has_open_uploads());

        manager.abort_upload(&mut session).await.unwrap();
        assert!(matches!(
            manager
                .upload_part(&mut session, Bytes::from_static(b"late"))
                .await,
            Err(UploadError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn abort_after_complete_is_a_no_op() {
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = manager(
            store.clone(),
            Arc::new(AcceptAllValidator),
            InMemoryEventLog::new(),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let mut session = manager
            .initiate_upload(descriptor.session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap();
        manager
            .upload_part(&mut session, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let content_key = manager
            .complete_upload(&mut session, 7, "tv-1", "photo")
            .await
            .unwrap();

        manager.abort_upload(&mut session).await.unwrap();
        assert!(store.get(&content_key).await.is_ok());
    }

    #[tokio::test]
    async fn initiate_on_unknown_session_fails() {
        let manager = manager(
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(AcceptAllValidator),
            InMemoryEventLog::new(),
        );

        let err = manager
            .initiate_upload(Uuid::new_v4(), "photo.jpg", "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn initiate_on_expired_session_fails() {
        let store = Arc::new(InMemoryObjectStore::new());
        let log = InMemoryEventLog::new();
        let manager = UploadSessionManager::new(
            store.clone(),
            Arc::new(AcceptAllValidator),
            Arc::new(log),
            TOPIC,
            Duration::seconds(-1),
        );

        let descriptor = manager.create_session(7, "tv-1", 1).await.unwrap();
        let err = manager
            .initiate_upload(descriptor.session_id, "photo.jpg", "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired { .. }));
    }
}
