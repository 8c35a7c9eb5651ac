//! Error types for the relay.
//!
//! One enum per concern. Variant names are unique across the crate because
//! snafu generates a context selector per variant.

use std::path::PathBuf;

use hookrelay_core::{ConfigError, MetricsError};
use snafu::prelude::*;

// ============ Validation Errors ============

/// A webhook body that cannot become an event. Never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The request body was not a JSON object.
    #[snafu(display("Webhook body must be a JSON object"))]
    NotAnObject,

    /// A required identifier was missing or blank.
    #[snafu(display("Missing required field 'meta.{field}'"))]
    MissingField { field: &'static str },
}

// ============ Channel Errors ============

/// Errors raised by a broker client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChannelError {
    /// Could not open a broker connection after exhausting the backoff.
    #[snafu(display("Failed to connect to broker after {attempts} attempt(s): {source}"))]
    BrokerConnect { attempts: u32, source: lapin::Error },

    /// Channel or queue setup failed on an open connection.
    #[snafu(display("Failed to set up broker channel for '{topic}': {source}"))]
    ChannelSetup { topic: String, source: lapin::Error },

    /// The publish call itself failed.
    #[snafu(display("Failed to publish to '{topic}': {source}"))]
    BrokerPublish { topic: String, source: lapin::Error },

    /// The broker negatively acknowledged a publish.
    #[snafu(display("Broker rejected message published to '{topic}'"))]
    PublishRejected { topic: String },

    /// Consuming from a topic failed.
    #[snafu(display("Subscription to '{topic}' failed: {source}"))]
    BrokerSubscribe { topic: String, source: lapin::Error },

    /// Settling a delivered message failed.
    #[snafu(display("Failed to settle message from '{topic}': {source}"))]
    BrokerAck { topic: String, source: lapin::Error },

    /// Closing the connection failed.
    #[snafu(display("Failed to close broker connection: {source}"))]
    BrokerClose { source: lapin::Error },

    /// The broker is unreachable.
    #[snafu(display("Broker unavailable during {operation}"))]
    BrokerUnavailable { operation: String },

    /// A value could not be encoded as a message body.
    #[snafu(display("Failed to encode message body: {source}"))]
    EncodeMessage { source: serde_json::Error },

    /// A message body could not be decoded.
    #[snafu(display("Failed to decode message from '{topic}': {source}"))]
    DecodeMessage {
        topic: String,
        source: serde_json::Error,
    },
}

impl ChannelError {
    /// Whether trying again later may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ChannelError::EncodeMessage { .. } | ChannelError::DecodeMessage { .. }
        )
    }
}

// ============ Store Errors ============

/// Errors raised by the persistent store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Could not open the connection pool.
    #[snafu(display("Failed to connect to store: {source}"))]
    StoreConnect { source: sqlx::Error },

    /// A statement failed.
    #[snafu(display("Store query on '{table}' failed: {source}"))]
    StoreQuery { table: String, source: sqlx::Error },

    /// The payload could not be serialized for a JSON column.
    #[snafu(display("Failed to encode payload: {source}"))]
    EncodePayload { source: serde_json::Error },

    /// A table or column name has no usable characters.
    #[snafu(display("Invalid identifier '{name}'"))]
    InvalidIdentifier { name: String },

    /// The store is known to be unreachable.
    #[snafu(display("Store unavailable: {message}"))]
    StoreUnavailable { message: String },
}

impl StoreError {
    /// Whether trying again later may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StoreError::EncodePayload { .. } | StoreError::InvalidIdentifier { .. }
        )
    }
}

// ============ Fallback Errors ============

/// Errors raised by the fallback file store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FallbackError {
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write {}: {source}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to move {} to {}: {source}", from.display(), to.display()))]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse fallback record {}: {source}", path.display()))]
    ParseRecord {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to serialize fallback record: {source}"))]
    SerializeRecord { source: serde_json::Error },

    #[snafu(display("Failed to list {}: {source}", path.display()))]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The name does not look like `webhook-<id>.json`.
    #[snafu(display("Not a fallback file name: '{name}'"))]
    InvalidFileName { name: String },
}

// ============ Delivery Errors ============

/// Why a single cascade tier did not accept an event.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeliveryError {
    #[snafu(display("Transport error: {source}"))]
    Transport { source: ChannelError },

    #[snafu(display("Persistence error: {source}"))]
    Persistence { source: StoreError },

    #[snafu(display("Filesystem error: {source}"))]
    Filesystem { source: FallbackError },

    #[snafu(display("Tier '{tier}' timed out after {timeout_ms}ms"))]
    TierTimeout { tier: &'static str, timeout_ms: u64 },
}

// ============ Reconcile Errors ============

/// Errors that stop a reconcile run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReconcileError {
    /// Another reconcile run holds the lock.
    #[snafu(display("Reconciler already running (lock file {})", path.display()))]
    AlreadyRunning { path: PathBuf },

    #[snafu(display("Failed to acquire reconcile lock {}: {source}", path.display()))]
    AcquireLock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to scan fallback files: {source}"))]
    ScanFallback { source: FallbackError },

    #[snafu(display("Dead-letter subscription failed: {source}"))]
    DeadLetterSubscribe { source: ChannelError },
}

// ============ Relay Errors ============

/// Top-level error returned by the commands.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RelayError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("Failed to bind ingress to {address}: {source}"))]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Ingress server error: {source}"))]
    Serve { source: std::io::Error },

    #[snafu(display("Consumer error: {source}"))]
    Consumer { source: ChannelError },

    #[snafu(display("Store initialization failed: {source}"))]
    StoreInit { source: StoreError },

    #[snafu(display("Reconcile failed: {source}"))]
    Reconcile { source: ReconcileError },

    #[snafu(display("Background task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The in-memory broker loses anything not consumed in this process.
    #[snafu(display("The memory broker cannot be used for '{command}'; {hint}"))]
    UnsupportedBroker {
        command: &'static str,
        hint: &'static str,
    },
}
