//! S3-style object store abstraction with versioning and multipart uploads.
//!
//! [`S3ObjectStore`](crate::s3_store::S3ObjectStore) is the production
//! backend; [`InMemoryObjectStore`] models the same surface (including
//! delete markers on versioned buckets) for tests and single-process
//! development. Side-channel fields ride object metadata headers rather
//! than a separate catalog.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors surfaced by object store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object {key} not found")]
    NotFound { key: String },

    #[error("multipart upload {upload_id} not found for {key}")]
    UploadNotFound { key: String, upload_id: String },

    #[error("object store backend error: {0}")]
    Backend(String),
}

/// One entry in a key's version history, newest first, as the S3
/// list-versions API reports it.
#[derive(Debug, Clone)]
pub struct ObjectVersion {
    pub version_id: String,
    pub is_current: bool,
    pub is_delete_marker: bool,
    pub last_modified: DateTime<Utc>,
}

/// A stored object revision: payload plus its metadata headers.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub metadata: HashMap<String, String>,
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Versioned object store surface used by the core.
///
/// Versioning is enabled on every bucket the mutation path touches, so
/// `put` creates a new version and `delete` places a delete marker.
/// `delete` has delete-if-exists semantics: an already-absent key is
/// success.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Fetch the current version of `key`. NotFound if the key is absent or
    /// its current version is a delete marker.
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    /// Fetch one specific version of `key`.
    async fn get_version(&self, key: &str, version_id: &str) -> Result<StoredObject, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys under `prefix` whose current version is live (not a delete
    /// marker).
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Full version history of `key`, newest first. Empty for an unknown
    /// key.
    async fn list_versions(&self, key: &str) -> Result<Vec<ObjectVersion>, StoreError>;

    /// Copy the current version of `from` to `to`. `public` grants
    /// public-read on the copy where the backend supports ACLs.
    async fn copy(&self, from: &str, to: &str, public: bool) -> Result<(), StoreError>;

    /// Open a multipart upload, returning the backend upload id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, StoreError>;

    /// Upload one fully-buffered part, returning its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Assemble the object from the ordered parts, returning the final
    /// object's ETag.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String, StoreError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    body: Bytes,
    metadata: HashMap<String, String>,
    last_modified: DateTime<Utc>,
    delete_marker: bool,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, Vec<StoredVersion>>,
    uploads: HashMap<String, PendingUpload>,
    version_counter: u64,
    upload_counter: u64,
}

/// In-memory versioned object store for tests and single-process
/// development.
///
/// Version ids are opaque uppercase-hex strings so case-insensitive token
/// comparison is exercised the way an S3 backend would.
#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Mutex<MemoryState>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any multipart upload is still open. Test hook.
    pub fn has_open_uploads(&self) -> bool {
        !self.state.lock().uploads.is_empty()
    }

    fn next_version_id(state: &mut MemoryState) -> String {
        state.version_counter += 1;
        // Letters in the token keep case-insensitive comparison honest.
        format!("VER{:013X}", state.version_counter)
    }

    fn current<'a>(versions: &'a [StoredVersion]) -> Option<&'a StoredVersion> {
        versions.last()
    }
}

fn content_etag(body: &[u8]) -> String {
    // FNV-1a, hex: stable content fingerprint standing in for the
    // backend-computed ETag.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in body {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let version_id = Self::next_version_id(&mut state);
        state
            .objects
            .entry(key.to_string())
            .or_default()
            .push(StoredVersion {
                version_id,
                body,
                metadata: metadata.clone(),
                last_modified: Utc::now(),
                delete_marker: false,
            });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let state = self.state.lock();
        let current = state
            .objects
            .get(key)
            .and_then(|versions| Self::current(versions))
            .filter(|version| !version.delete_marker)
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        Ok(StoredObject {
            body: current.body.clone(),
            metadata: current.metadata.clone(),
        })
    }

    async fn get_version(&self, key: &str, version_id: &str) -> Result<StoredObject, StoreError> {
        let state = self.state.lock();
        let version = state
            .objects
            .get(key)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|v| v.version_id.eq_ignore_ascii_case(version_id) && !v.delete_marker)
            })
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        Ok(StoredObject {
            body: version.body.clone(),
            metadata: version.metadata.clone(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let version_id = Self::next_version_id(&mut state);
        if let Some(versions) = state.objects.get_mut(key) {
            let live = Self::current(versions)
                .map(|v| !v.delete_marker)
                .unwrap_or(false);
            if live {
                versions.push(StoredVersion {
                    version_id,
                    body: Bytes::new(),
                    metadata: HashMap::new(),
                    last_modified: Utc::now(),
                    delete_marker: true,
                });
            }
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .objects
            .iter()
            .filter(|(key, versions)| {
                key.starts_with(prefix)
                    && Self::current(versions)
                        .map(|v| !v.delete_marker)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<ObjectVersion>, StoreError> {
        let state = self.state.lock();
        let versions = match state.objects.get(key) {
            Some(versions) => versions,
            None => return Ok(Vec::new()),
        };
        let last = versions.len().saturating_sub(1);
        Ok(versions
            .iter()
            .enumerate()
            .rev()
            .map(|(index, v)| ObjectVersion {
                version_id: v.version_id.clone(),
                is_current: index == last,
                is_delete_marker: v.delete_marker,
                last_modified: v.last_modified,
            })
            .collect())
    }

    async fn copy(&self, from: &str, to: &str, _public: bool) -> Result<(), StoreError> {
        let source = self.get(from).await?;
        self.put(to, source.body, &source.metadata).await
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        _content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.upload_counter += 1;
        let upload_id = format!("upload-{:08}", state.upload_counter);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })?;
        let etag = content_etag(&body);
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })?;

        let mut body = Vec::new();
        for part in parts {
            let (etag, bytes) =
                upload
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| StoreError::Backend(format!(
                        "part {} was never uploaded for {}",
                        part.part_number, upload_id
                    )))?;
            if !etag.eq_ignore_ascii_case(&part.etag) {
                return Err(StoreError::Backend(format!(
                    "etag mismatch for part {} of {}",
                    part.part_number, upload_id
                )));
            }
            body.extend_from_slice(bytes);
        }

        let etag = content_etag(&body);
        let version_id = Self::next_version_id(&mut state);
        state
            .objects
            .entry(upload.key.clone())
            .or_default()
            .push(StoredVersion {
                version_id,
                body: Bytes::from(body),
                metadata: upload.metadata,
                last_modified: Utc::now(),
                delete_marker: false,
            });
        Ok(etag)
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_metadata() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn put_creates_a_new_version_each_time() {
        let store = InMemoryObjectStore::new();
        store
            .put("objects/1", Bytes::from_static(b"one"), &no_metadata())
            .await
            .unwrap();
        store
            .put("objects/1", Bytes::from_static(b"two"), &no_metadata())
            .await
            .unwrap();

        let versions = store.list_versions("objects/1").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_current);
        assert!(!versions[1].is_current);
        assert_ne!(versions[0].version_id, versions[1].version_id);

        let current = store.get("objects/1").await.unwrap();
        assert_eq!(current.body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn get_version_is_case_insensitive() {
        let store = InMemoryObjectStore::new();
        store
            .put("objects/1", Bytes::from_static(b"one"), &no_metadata())
            .await
            .unwrap();
        let version_id = store.list_versions("objects/1").await.unwrap()[0]
            .version_id
            .clone();

        let fetched = store
            .get_version("objects/1", &version_id.to_lowercase())
            .await
            .unwrap();
        assert_eq!(fetched.body, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn delete_places_a_marker_and_hides_the_key() {
        let store = InMemoryObjectStore::new();
        store
            .put("objects/1", Bytes::from_static(b"one"), &no_metadata())
            .await
            .unwrap();
        store.delete("objects/1").await.unwrap();

        assert!(matches!(
            store.get("objects/1").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.list_keys("objects/").await.unwrap().is_empty());

        let versions = store.list_versions("objects/1").await.unwrap();
        assert!(versions[0].is_current && versions[0].is_delete_marker);
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_success() {
        let store = InMemoryObjectStore::new();
        store.delete("objects/missing").await.unwrap();
        store.delete("objects/missing").await.unwrap();
        assert!(store.list_versions("objects/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multipart_complete_concatenates_parts_in_order() {
        let store = InMemoryObjectStore::new();
        let upload_id = store
            .create_multipart_upload("staging/a", "application/octet-stream", &no_metadata())
            .await
            .unwrap();

        let mut parts = Vec::new();
        for (number, chunk) in [(1, "alpha "), (2, "beta "), (3, "gamma")] {
            let etag = store
                .upload_part("staging/a", &upload_id, number, Bytes::from(chunk))
                .await
                .unwrap();
            parts.push(UploadedPart {
                part_number: number,
                etag,
            });
        }

        store
            .complete_multipart_upload("staging/a", &upload_id, &parts)
            .await
            .unwrap();

        let assembled = store.get("staging/a").await.unwrap();
        assert_eq!(assembled.body, Bytes::from_static(b"alpha beta gamma"));
        assert!(!store.has_open_uploads());
    }

    #[tokio::test]
    async fn abort_discards_the_pending_upload() {
        let store = InMemoryObjectStore::new();
        let upload_id = store
            .create_multipart_upload("staging/a", "application/octet-stream", &no_metadata())
            .await
            .unwrap();
        store
            .upload_part("staging/a", &upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        store
            .abort_multipart_upload("staging/a", &upload_id)
            .await
            .unwrap();

        assert!(!store.has_open_uploads());
        assert!(matches!(
            store.get("staging/a").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn copy_duplicates_the_current_version() {
        let store = InMemoryObjectStore::new();
        let mut metadata = HashMap::new();
        metadata.insert("author".to_string(), "ada".to_string());
        store
            .put("staging/a", Bytes::from_static(b"payload"), &metadata)
            .await
            .unwrap();

        store.copy("staging/a", "published/a", true).await.unwrap();

        let copy = store.get("published/a").await.unwrap();
        assert_eq!(copy.body, Bytes::from_static(b"payload"));
        assert_eq!(copy.metadata.get("author").map(String::as_str), Some("ada"));
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let store = InMemoryObjectStore::new();
        store
            .put("a/1", Bytes::from_static(b"x"), &no_metadata())
            .await
            .unwrap();
        store
            .put("a/2", Bytes::from_static(b"x"), &no_metadata())
            .await
            .unwrap();
        store
            .put("b/1", Bytes::from_static(b"x"), &no_metadata())
            .await
            .unwrap();

        assert_eq!(store.list_keys("a/").await.unwrap(), vec!["a/1", "a/2"]);
    }
}
