//! Internal events for relay metrics emission.
//!
//! Each struct is one measurable occurrence. Emitting it with `emit!` records
//! the corresponding Prometheus metric and a trace line.

use std::time::Duration;

use hookrelay_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use tracing::trace;

use crate::event::DeliveryMethod;
use crate::fallback::FileState;

/// Result of a single cascade tier attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    Accepted,
    Failed,
    TimedOut,
}

impl TierOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierOutcome::Accepted => "accepted",
            TierOutcome::Failed => "failed",
            TierOutcome::TimedOut => "timed_out",
        }
    }
}

/// Event emitted after each cascade tier attempt.
pub struct TierAttempted {
    pub tier: DeliveryMethod,
    pub outcome: TierOutcome,
}

impl InternalEvent for TierAttempted {
    fn emit(self) {
        trace!(tier = self.tier.as_str(), outcome = self.outcome.as_str(), "Tier attempted");
        counter!(
            "hookrelay_tier_attempts_total",
            "tier" => self.tier.as_str(),
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when the cascade returns, accepted or not.
pub struct DeliveryCompleted {
    /// Accepting tier, or `None` when every tier failed.
    pub method: Option<DeliveryMethod>,
    pub duration: Duration,
}

impl InternalEvent for DeliveryCompleted {
    fn emit(self) {
        let method = self.method.map_or("none", |m| m.as_str());
        trace!(method, duration_ms = self.duration.as_millis() as u64, "Delivery completed");
        counter!("hookrelay_deliveries_total", "method" => method).increment(1);
        histogram!("hookrelay_delivery_duration_seconds", "method" => method)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a webhook fails validation.
pub struct WebhookRejected;

impl InternalEvent for WebhookRejected {
    fn emit(self) {
        trace!("Webhook rejected");
        counter!("hookrelay_webhooks_rejected_total").increment(1);
    }
}

/// How the consumer settled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    Delivered,
    RetryScheduled,
    Parked,
    Undecodable,
}

impl ConsumerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerOutcome::Delivered => "delivered",
            ConsumerOutcome::RetryScheduled => "retry_scheduled",
            ConsumerOutcome::Parked => "parked",
            ConsumerOutcome::Undecodable => "undecodable",
        }
    }
}

/// Event emitted for every message the consumer handles.
pub struct MessageConsumed {
    pub outcome: ConsumerOutcome,
    pub duration: Duration,
}

impl InternalEvent for MessageConsumed {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "Message consumed");
        counter!("hookrelay_consumer_messages_total", "outcome" => self.outcome.as_str())
            .increment(1);
        histogram!("hookrelay_consumer_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Gauge of events currently waiting on a retry.
pub struct RetriesPending {
    pub count: usize,
}

impl InternalEvent for RetriesPending {
    fn emit(self) {
        trace!(count = self.count, "Retries pending");
        gauge!("hookrelay_retries_pending").set(self.count as f64);
    }
}

/// Event emitted when a parked event is published to the dead-letter topic.
pub struct DeadLetterPublished {
    pub success: bool,
}

impl InternalEvent for DeadLetterPublished {
    fn emit(self) {
        let status = if self.success { "published" } else { "failed" };
        trace!(status, "Dead letter publish");
        counter!("hookrelay_dead_letters_total", "status" => status).increment(1);
    }
}

/// Event emitted when a fallback file is written or moved.
pub struct FallbackTransition {
    pub state: FileState,
}

impl InternalEvent for FallbackTransition {
    fn emit(self) {
        trace!(state = self.state.dir_name(), "Fallback file transition");
        counter!("hookrelay_fallback_files_total", "state" => self.state.dir_name()).increment(1);
    }
}

/// Event emitted at the end of a reconcile run.
pub struct ReconcileCompleted {
    pub files_processed: usize,
    pub files_failed: usize,
    pub dead_letters_seen: usize,
    pub dead_letters_reprocessed: usize,
}

impl InternalEvent for ReconcileCompleted {
    fn emit(self) {
        trace!(
            files_processed = self.files_processed,
            files_failed = self.files_failed,
            dead_letters_seen = self.dead_letters_seen,
            dead_letters_reprocessed = self.dead_letters_reprocessed,
            "Reconcile completed"
        );
        counter!("hookrelay_reconcile_files_total", "result" => "processed")
            .increment(self.files_processed as u64);
        counter!("hookrelay_reconcile_files_total", "result" => "failed")
            .increment(self.files_failed as u64);
        counter!("hookrelay_reconcile_dead_letters_total", "result" => "seen")
            .increment(self.dead_letters_seen as u64);
        counter!("hookrelay_reconcile_dead_letters_total", "result" => "reprocessed")
            .increment(self.dead_letters_reprocessed as u64);
    }
}
