//! Consumer-side retry and escalation.
//!
//! A failed write schedules a re-publish of the same event after a linear
//! backoff. Once the failure count reaches the policy limit the event is
//! parked on the dead-letter topic instead.

mod processor;

pub use processor::{EventProcessor, Topics};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId};

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the re-publish following failure number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether failure number `attempt` exhausts the policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Retry bookkeeping for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// In-memory retry state keyed by event id.
///
/// Entries exist only between an event's first failure and its success or
/// escalation.
#[derive(Debug, Default)]
pub struct RetryTracker {
    states: Mutex<HashMap<EventId, RetryState>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<EventId, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one more failure for `id` and return the new count.
    ///
    /// `carried` is the count recorded on the event itself, so a copy
    /// re-published before a restart resumes where it left off. The result
    /// never exceeds `cap`.
    pub fn record_failure(&self, id: &EventId, carried: u32, cap: u32) -> u32 {
        let mut states = self.states();
        let state = states.entry(id.clone()).or_insert(RetryState {
            attempt_count: 0,
            next_attempt_at: None,
        });
        state.attempt_count = (state.attempt_count.max(carried) + 1).min(cap);
        state.next_attempt_at = None;
        state.attempt_count
    }

    pub fn schedule(&self, id: &EventId, at: DateTime<Utc>) {
        if let Some(state) = self.states().get_mut(id) {
            state.next_attempt_at = Some(at);
        }
    }

    pub fn get(&self, id: &EventId) -> Option<RetryState> {
        self.states().get(id).cloned()
    }

    /// Drop the state for `id`, on success or escalation.
    pub fn clear(&self, id: &EventId) -> Option<RetryState> {
        self.states().remove(id)
    }

    pub fn len(&self) -> usize {
        self.states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A parked event as published on the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub original_topic: String,
    pub event: Event,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    pub fn new(
        original_topic: impl Into<String>,
        event: Event,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            original_topic: original_topic.into(),
            event,
            error: error.into(),
            timestamp: Utc::now(),
            retry_count,
        }
    }
}
