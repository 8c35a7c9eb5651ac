//! hookrelay: guaranteed-delivery relay for webhook change notifications.
//!
//! This crate handles:
//! - Accepting webhooks over HTTP and recording each one through a cascade
//!   of tiers (broker, direct store write, local fallback file)
//! - Consuming the broker topic into MySQL with bounded retries and a
//!   dead-letter topic for exhausted events
//! - Reconciling fallback files and dead letters back into the store

pub mod app;
pub mod cascade;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod fallback;
pub mod ingress;
pub mod metrics;
pub mod reconcile;
pub mod retry;
pub mod store;

// Re-export commonly used items
pub use app::Relay;
pub use cascade::{DeliveryCascade, DeliveryReport, DeliveryTier};
pub use channel::{ChannelClient, MemoryBroker};
pub use cli::{CliArgs, Command};
pub use config::RelayConfig;
pub use error::RelayError;
pub use event::{DeliveryMethod, Event, EventId};
pub use fallback::{FallbackStore, FileState};
pub use reconcile::{ReconcileReport, Reconciler};
pub use retry::{EventProcessor, RetryPolicy};
pub use store::EventStore;

pub use hookrelay_core::{init_tracing, spawn_shutdown_handler};
