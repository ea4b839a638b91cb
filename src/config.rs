//! Layered service configuration.
//!
//! Values come from defaults, then `config/tessera.*` and
//! `/etc/tessera/tessera.*` files if present, then `TESSERA__`-prefixed
//! environment variables (`TESSERA__KAFKA__BOOTSTRAP_SERVERS` →
//! `kafka.bootstrap_servers`).

use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the tessera core and worker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub production: ProductionConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka connection and topic configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Enable SASL_SSL.
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_ca_location: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub topics: TopicConfig,
}

/// Topic names for the tessera event streams.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_session_events_topic")]
    pub session_events: String,
    #[serde(default = "default_object_events_topic")]
    pub object_events: String,
    #[serde(default = "default_object_versions_topic")]
    pub object_versions: String,
    #[serde(default = "default_binaries_references_topic")]
    pub binaries_references: String,
}

/// S3 configuration shared by both buckets.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding object version content.
    #[serde(default = "default_objects_bucket")]
    pub objects_bucket: String,
    /// Bucket holding upload sessions and published binaries.
    #[serde(default = "default_binaries_bucket")]
    pub binaries_bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (MinIO, LocalStack).
    pub endpoint_url: Option<String>,
    /// Path-style access, required for MinIO.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Which lock store implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Quorum over independent replicas. The only mode safe across
    /// multiple service instances.
    Quorum,
    /// Process-local map. Development and single-instance only.
    #[default]
    Memory,
}

/// Lock store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub mode: LockMode,
    /// TTL bounding the longest protected critical section.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Per-replica vote timeout.
    #[serde(default = "default_replica_timeout_ms")]
    pub replica_timeout_ms: u64,
    /// Clock drift allowance as a fraction of the TTL.
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,
    /// Sweep interval of the lock cleanup job.
    #[serde(default = "default_lock_sweep_secs")]
    pub sweep_interval_secs: u64,
}

/// Upload session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime bounding abandoned uploads.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: i64,
}

/// Binaries cleanup job configuration (the operator-facing `range` and
/// `delay` come from the CLI).
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_group")]
    pub consumer_group: String,
    #[serde(default = "default_cleanup_references_group")]
    pub references_group: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: usize,
}

/// Event production jobs configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductionConfig {
    #[serde(default = "default_versions_group")]
    pub versions_group: String,
    #[serde(default = "default_binaries_group")]
    pub binaries_group: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

// Default value functions

fn default_service_name() -> String {
    "tessera".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "tessera-worker".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_session_events_topic() -> String {
    "session-events".to_string()
}

fn default_object_events_topic() -> String {
    "object-events".to_string()
}

fn default_object_versions_topic() -> String {
    "object-versions".to_string()
}

fn default_binaries_references_topic() -> String {
    "binaries-references".to_string()
}

fn default_objects_bucket() -> String {
    "tessera-objects".to_string()
}

fn default_binaries_bucket() -> String {
    "tessera-binaries".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_replica_timeout_ms() -> u64 {
    200
}

fn default_drift_factor() -> f64 {
    0.01
}

fn default_lock_sweep_secs() -> u64 {
    60
}

fn default_session_ttl_secs() -> i64 {
    3600
}

fn default_cleanup_group() -> String {
    "binaries-cleanup".to_string()
}

fn default_cleanup_references_group() -> String {
    "binaries-cleanup-references".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_error_backoff_secs() -> u64 {
    10
}

fn default_cleanup_batch_size() -> usize {
    100
}

fn default_versions_group() -> String {
    "event-production-versions".to_string()
}

fn default_binaries_group() -> String {
    "event-production-binaries".to_string()
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            topics: TopicConfig::default(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            session_events: default_session_events_topic(),
            object_events: default_object_events_topic(),
            object_versions: default_object_versions_topic(),
            binaries_references: default_binaries_references_topic(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            objects_bucket: default_objects_bucket(),
            binaries_bucket: default_binaries_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mode: LockMode::default(),
            ttl_secs: default_lock_ttl_secs(),
            replica_timeout_ms: default_replica_timeout_ms(),
            drift_factor: default_drift_factor(),
            sweep_interval_secs: default_lock_sweep_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            consumer_group: default_cleanup_group(),
            references_group: default_cleanup_references_group(),
            poll_timeout_ms: default_poll_timeout_ms(),
            error_backoff_secs: default_error_backoff_secs(),
            batch_size: default_cleanup_batch_size(),
        }
    }
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            versions_group: default_versions_group(),
            binaries_group: default_binaries_group(),
            poll_timeout_ms: default_poll_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/tessera").required(false))
            .add_source(config::File::with_name("/etc/tessera/tessera").required(false))
            .add_source(
                config::Environment::with_prefix("TESSERA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_secs)
    }

    pub fn lock_replica_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.replica_timeout_ms)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock.sweep_interval_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sessions.ttl_secs)
    }

    pub fn cleanup_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup.poll_timeout_ms)
    }

    pub fn cleanup_error_backoff(&self) -> Duration {
        Duration::from_secs(self.cleanup.error_backoff_secs)
    }

    pub fn production_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.production.poll_timeout_ms)
    }

    pub fn production_retry_delay(&self) -> Duration {
        Duration::from_millis(self.production.retry_delay_ms)
    }
}

impl KafkaConfig {
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id);

        if self.ssl_enabled {
            config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = self.ssl_ca_location {
                config.set("ssl.ca.location", ca_location);
            }
        }
        if let (Some(ref username), Some(ref password)) =
            (&self.sasl_username, &self.sasl_password)
        {
            config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        config
    }

    /// Consumer configuration for `group`. Auto-commit is always off; the
    /// jobs commit manually after their side effects are durable.
    pub fn build_consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("group.id", group)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set(
                "max.poll.interval.ms",
                self.max_poll_interval_ms.to_string(),
            );
        config
    }

    /// Producer configuration: idempotent, full acknowledgment.
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();
        config
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("request.timeout.ms", self.request_timeout_ms.to_string());
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topics_match_the_wire_contract() {
        let topics = TopicConfig::default();
        assert_eq!(topics.session_events, "session-events");
        assert_eq!(topics.object_events, "object-events");
        assert_eq!(topics.object_versions, "object-versions");
        assert_eq!(topics.binaries_references, "binaries-references");
    }

    #[test]
    fn default_lock_mode_is_memory() {
        assert_eq!(LockConfig::default().mode, LockMode::Memory);
    }

    #[test]
    fn consumer_config_disables_auto_commit() {
        let config = KafkaConfig::default().build_consumer_config("test-group");
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("test-group"));
    }

    #[test]
    fn producer_config_is_idempotent() {
        let config = KafkaConfig::default().build_producer_config();
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("acks"), Some("all"));
    }

    #[test]
    fn lock_mode_deserializes_from_snake_case() {
        #[derive(Deserialize)]
        struct Probe {
            mode: LockMode,
        }
        let probe: Probe = serde_json::from_str(r#"{"mode":"quorum"}"#).unwrap();
        assert_eq!(probe.mode, LockMode::Quorum);
    }
}
