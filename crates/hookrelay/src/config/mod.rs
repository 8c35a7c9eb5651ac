//! Configuration for the relay.
//!
//! Loaded from one or more YAML files. Later files are deep-merged over
//! earlier ones so a base file can be combined with an environment overlay.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use hookrelay_core::error::{InvalidFieldSnafu, MultipleErrorsSnafu};
use hookrelay_core::{ConfigError, MetricsConfig, load_yaml, parse_yaml};

use crate::event::TenantDirectory;
use crate::retry::RetryPolicy;

/// HTTP ingress settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressConfig {
    /// Address to bind the webhook endpoint.
    #[serde(default = "default_ingress_address")]
    pub address: String,
    /// Upper bound on a single cascade tier attempt.
    #[serde(default = "default_tier_timeout_ms")]
    pub tier_timeout_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            address: default_ingress_address(),
            tier_timeout_ms: default_tier_timeout_ms(),
        }
    }
}

impl IngressConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }
}

fn default_ingress_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_tier_timeout_ms() -> u64 {
    5000
}

/// Which broker implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Amqp,
    /// In-process retained log. Producer and consumer must share a process.
    Memory,
}

/// Broker connection and topic settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Connection name announced to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic new events are published to.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Topic exhausted events are parked on.
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    /// First delay of the connection backoff; doubles per attempt.
    #[serde(default = "default_initial_retry_ms")]
    pub initial_retry_ms: u64,
    /// Connection attempts before giving up.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: default_broker_url(),
            client_id: default_client_id(),
            topic: default_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            consumer_tag: default_consumer_tag(),
            initial_retry_ms: default_initial_retry_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

fn default_broker_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_client_id() -> String {
    "hookrelay".to_string()
}

fn default_topic() -> String {
    "webhook-events".to_string()
}

fn default_dead_letter_topic() -> String {
    "webhook-events-dlq".to_string()
}

fn default_consumer_tag() -> String {
    "webhook-processor".to_string()
}

fn default_initial_retry_ms() -> u64 {
    100
}

fn default_connect_retries() -> u32 {
    8
}

/// Column settings for one entity table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Columns created at startup.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Drop payload keys not listed in `columns` instead of adding columns.
    #[serde(default)]
    pub restrict_columns: bool,
}

/// Persistent store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// MySQL connection URL. Required.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_raw_table")]
    pub raw_table: String,
    /// Entity tables provisioned at startup, keyed by entity name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            raw_table: default_raw_table(),
            tables: BTreeMap::new(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_raw_table() -> String {
    "webhook_full_log".to_string()
}

/// Fallback file store location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_root")]
    pub root: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            root: default_fallback_root(),
        }
    }
}

fn default_fallback_root() -> PathBuf {
    PathBuf::from("fallback-webhooks")
}

/// Consumer-side retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5000
}

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// How long the dead-letter topic is drained per run.
    #[serde(default = "default_dead_letter_window_secs")]
    pub dead_letter_window_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            dead_letter_window_secs: default_dead_letter_window_secs(),
        }
    }
}

impl ReconcilerConfig {
    pub fn dead_letter_window(&self) -> Duration {
        Duration::from_secs(self.dead_letter_window_secs)
    }
}

fn default_dead_letter_window_secs() -> u64 {
    10
}

/// Company id to tenant label mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantsConfig {
    /// Label used for unknown or missing company ids.
    #[serde(default = "default_tenant_label")]
    pub default_label: String,
    #[serde(default = "default_tenant_labels")]
    pub labels: BTreeMap<i64, String>,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            default_label: default_tenant_label(),
            labels: default_tenant_labels(),
        }
    }
}

impl TenantsConfig {
    pub fn directory(&self) -> TenantDirectory {
        TenantDirectory::new(self.default_label.clone(), self.labels.clone())
    }
}

fn default_tenant_label() -> String {
    "Itapema".to_string()
}

fn default_tenant_labels() -> BTreeMap<i64, String> {
    BTreeMap::from([
        (13881612, "Matriz".to_string()),
        (23342970, "Itapema".to_string()),
    ])
}

/// Main configuration for hookrelay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub tenants: TenantsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl RelayConfig {
    /// Load and merge the given files in order, then validate.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = Value::Mapping(Default::default());
        for path in paths {
            let layer: Value = load_yaml(path)?;
            merge_values(&mut merged, layer);
        }
        Self::from_value(merged)
    }

    /// Load a single file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_files(&[path.to_path_buf()])
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let value: Value = parse_yaml(contents)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        // An empty document parses as null.
        let value = if value.is_null() {
            Value::Mapping(Default::default())
        } else {
            value
        };
        let config: RelayConfig = serde_yaml::from_value(value)
            .map_err(|source| ConfigError::YamlParse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.ingress.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "ingress.address: '{}' is not a socket address",
                self.ingress.address
            ));
        }
        if self.ingress.tier_timeout_ms == 0 {
            errors.push("ingress.tier_timeout_ms: must be greater than zero".to_string());
        }
        if self.broker.topic.trim().is_empty() {
            errors.push("broker.topic: cannot be empty".to_string());
        }
        if self.broker.dead_letter_topic.trim().is_empty() {
            errors.push("broker.dead_letter_topic: cannot be empty".to_string());
        }
        if self.broker.topic == self.broker.dead_letter_topic {
            errors.push("broker.dead_letter_topic: must differ from broker.topic".to_string());
        }
        if self.broker.connect_retries == 0 {
            errors.push("broker.connect_retries: must be at least 1".to_string());
        }
        if self
            .store
            .url
            .as_deref()
            .is_none_or(|url| url.trim().is_empty())
        {
            errors.push("store.url: required".to_string());
        }
        if self.store.raw_table.trim().is_empty() {
            errors.push("store.raw_table: cannot be empty".to_string());
        }
        if self.fallback.root.as_os_str().is_empty() {
            errors.push("fallback.root: cannot be empty".to_string());
        }
        if self.retry.max_retries == 0 {
            errors.push("retry.max_retries: must be at least 1".to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => {
                let message = errors.remove(0);
                let (field, message) = message
                    .split_once(": ")
                    .unwrap_or(("config", message.as_str()));
                InvalidFieldSnafu { field, message }.fail()
            }
            _ => MultipleErrorsSnafu { errors }.fail(),
        }
    }
}

/// Deep-merge `layer` into `base`. Mappings merge key by key, anything else
/// is replaced.
fn merge_values(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base), Value::Mapping(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, layer) => *base = layer,
    }
}
