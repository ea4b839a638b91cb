//! Tessera: concurrency and cleanup core of the content object store.
//!
//! This crate provides the pieces that keep a multi-instance content store
//! safe and eventually consistent:
//!
//! - distributed mutual exclusion per root object ([`lock`])
//! - optimistic-concurrency writes over store versioning ([`mutation`])
//! - multipart binary upload sessions ([`upload`])
//! - the event log abstraction and its Kafka backend ([`event_log`],
//!   [`kafka`])
//! - long-running jobs deriving enriched events and garbage-collecting
//!   orphaned uploads ([`jobs`])
//!
//! HTTP routing, template schema validation and client wire formats live
//! outside this crate and are consumed through the trait seams
//! ([`upload::BinaryValidator`], [`lock::LockReplica`]).

pub mod config;
pub mod document;
pub mod event_log;
pub mod events;
pub mod jobs;
pub mod kafka;
pub mod lock;
pub mod mutation;
pub mod object_store;
pub mod s3_store;
pub mod upload;

pub use config::Config;
pub use document::{Element, ElementContent, ObjectDocument};
pub use event_log::{EventConsumer, EventLogError, EventProducer, InMemoryEventLog};
pub use events::{ConsumedEvent, DeliveryPosition, Event};
pub use lock::{LockError, LockHandle, LockStore};
pub use mutation::{MutationError, ObjectMutationService};
pub use object_store::{ObjectStore, StoreError};
pub use upload::{BinaryValidator, UploadError, UploadSessionManager, ValidationError};
