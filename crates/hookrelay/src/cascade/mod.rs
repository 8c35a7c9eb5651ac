//! Ingress-side delivery cascade.
//!
//! An event is offered to each tier in order until one records it: the
//! broker, then a direct write to the raw log table, then a fallback file.
//! Every tier is tried at most once and bounded by the same timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{info, warn};

use hookrelay_core::emit;

use crate::channel::{ChannelClient, Envelope};
use crate::error::{
    DeliveryError, FilesystemSnafu, PersistenceSnafu, TierTimeoutSnafu, TransportSnafu,
};
use crate::event::{DeliveryMethod, Event, EventId};
use crate::fallback::FallbackStore;
use crate::metrics::events::{DeliveryCompleted, TierAttempted, TierOutcome};
use crate::store::{self, EventStore};

/// One way of durably recording an event.
#[async_trait]
pub trait DeliveryTier: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    /// Record `event`. `reason` describes why earlier tiers did not.
    async fn attempt(&self, event: &Event, reason: &str) -> Result<(), DeliveryError>;
}

/// Publishes to the ingest topic.
pub struct BrokerTier {
    channel: Arc<dyn ChannelClient>,
    topic: String,
}

impl BrokerTier {
    pub fn new(channel: Arc<dyn ChannelClient>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeliveryTier for BrokerTier {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Broker
    }

    async fn attempt(&self, event: &Event, _reason: &str) -> Result<(), DeliveryError> {
        let envelope = Envelope::for_event(event).context(TransportSnafu)?;
        self.channel
            .publish(&self.topic, envelope)
            .await
            .context(TransportSnafu)
    }
}

/// Writes the raw log row directly.
pub struct StoreTier {
    store: Arc<dyn EventStore>,
}

impl StoreTier {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeliveryTier for StoreTier {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::DirectStore
    }

    async fn attempt(&self, event: &Event, _reason: &str) -> Result<(), DeliveryError> {
        store::record_direct(self.store.as_ref(), event)
            .await
            .context(PersistenceSnafu)
    }
}

/// Saves a pending fallback file.
pub struct FileTier {
    fallback: Arc<FallbackStore>,
}

impl FileTier {
    pub fn new(fallback: Arc<FallbackStore>) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl DeliveryTier for FileTier {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::File
    }

    async fn attempt(&self, event: &Event, reason: &str) -> Result<(), DeliveryError> {
        self.fallback
            .save(event, reason)
            .await
            .map(|_| ())
            .context(FilesystemSnafu)
    }
}

/// Outcome of [`DeliveryCascade::deliver`].
#[derive(Debug)]
pub struct DeliveryReport {
    pub event_id: EventId,
    pub accepted: bool,
    /// The tier that recorded the event.
    pub method: Option<DeliveryMethod>,
    /// The last tier error; set only when no tier accepted.
    pub error: Option<DeliveryError>,
    pub elapsed: Duration,
}

/// Ordered delivery tiers with a per-tier timeout.
pub struct DeliveryCascade {
    tiers: Vec<Arc<dyn DeliveryTier>>,
    tier_timeout: Duration,
}

impl DeliveryCascade {
    pub fn new(tiers: Vec<Arc<dyn DeliveryTier>>, tier_timeout: Duration) -> Self {
        Self {
            tiers,
            tier_timeout,
        }
    }

    /// The standard broker, direct store, fallback file order.
    pub fn standard(
        channel: Arc<dyn ChannelClient>,
        topic: impl Into<String>,
        store: Arc<dyn EventStore>,
        fallback: Arc<FallbackStore>,
        tier_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Arc::new(BrokerTier::new(channel, topic)),
                Arc::new(StoreTier::new(store)),
                Arc::new(FileTier::new(fallback)),
            ],
            tier_timeout,
        )
    }

    pub async fn deliver(&self, event: &Event) -> DeliveryReport {
        let started = Instant::now();
        let mut reasons: Vec<String> = Vec::new();
        let mut last_error = None;

        for tier in &self.tiers {
            let method = tier.method();
            let stamped = event.stamped(method);
            let reason = reasons.join("; ");

            let result = match tokio::time::timeout(
                self.tier_timeout,
                tier.attempt(&stamped, &reason),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => TierTimeoutSnafu {
                    tier: method.as_str(),
                    timeout_ms: self.tier_timeout.as_millis() as u64,
                }
                .fail(),
            };

            match result {
                Ok(()) => {
                    emit!(TierAttempted {
                        tier: method,
                        outcome: TierOutcome::Accepted,
                    });
                    info!(event_id = %event.id, tier = %method, "Event accepted");
                    let elapsed = started.elapsed();
                    emit!(DeliveryCompleted {
                        method: Some(method),
                        duration: elapsed,
                    });
                    return DeliveryReport {
                        event_id: event.id.clone(),
                        accepted: true,
                        method: Some(method),
                        error: None,
                        elapsed,
                    };
                }
                Err(e) => {
                    let outcome = match e {
                        DeliveryError::TierTimeout { .. } => TierOutcome::TimedOut,
                        _ => TierOutcome::Failed,
                    };
                    emit!(TierAttempted {
                        tier: method,
                        outcome,
                    });
                    warn!(event_id = %event.id, tier = %method, "Tier failed: {}", e);
                    reasons.push(format!("{method}: {e}"));
                    last_error = Some(e);
                }
            }
        }

        let elapsed = started.elapsed();
        emit!(DeliveryCompleted {
            method: None,
            duration: elapsed,
        });
        DeliveryReport {
            event_id: event.id.clone(),
            accepted: false,
            method: None,
            error: last_error,
            elapsed,
        }
    }
}
