//! The consumer's message handler.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use hookrelay_core::emit;

use crate::channel::{ChannelClient, Disposition, Envelope, Message, MessageHandler};
use crate::config::BrokerConfig;
use crate::error::StoreError;
use crate::event::{DeliveryState, Event};
use crate::fallback::FallbackStore;
use crate::metrics::events::{
    ConsumerOutcome, DeadLetterPublished, MessageConsumed, RetriesPending,
};
use crate::store::{self, EventStore};

use super::{DeadLetterEntry, RetryPolicy, RetryTracker};

/// Topic names the processor publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub ingest: String,
    pub dead_letter: String,
}

impl Topics {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            ingest: config.topic.clone(),
            dead_letter: config.dead_letter_topic.clone(),
        }
    }
}

/// Persists consumed events, scheduling retries and parking exhausted ones.
///
/// Every decodable message is acknowledged: a retry goes out as a new
/// message and a parked event lives on in the dead-letter topic.
pub struct EventProcessor {
    store: Arc<dyn EventStore>,
    channel: Arc<dyn ChannelClient>,
    fallback: Arc<FallbackStore>,
    policy: RetryPolicy,
    tracker: Arc<RetryTracker>,
    topics: Topics,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        channel: Arc<dyn ChannelClient>,
        fallback: Arc<FallbackStore>,
        policy: RetryPolicy,
        topics: Topics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            channel,
            fallback,
            policy,
            tracker: Arc::new(RetryTracker::new()),
            topics,
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    pub fn tracker(&self) -> &RetryTracker {
        &self.tracker
    }

    /// Persist one event and decide what happens if that fails.
    pub async fn process(&self, event: Event) -> ConsumerOutcome {
        let outcome = match store::persist(self.store.as_ref(), &event).await {
            Ok(()) => {
                self.tracker.clear(&event.id);
                if event.attempts > 0 {
                    info!(
                        event_id = %event.id,
                        attempts = event.attempts,
                        "Event persisted after retry"
                    );
                } else {
                    debug!(event_id = %event.id, "Event persisted");
                }
                ConsumerOutcome::Delivered
            }
            Err(e) => {
                let attempt = self.tracker.record_failure(
                    &event.id,
                    event.attempts,
                    self.policy.max_retries(),
                );
                warn!(
                    event_id = %event.id,
                    attempt,
                    max_retries = self.policy.max_retries(),
                    "Failed to persist event: {}",
                    e
                );

                if self.policy.is_exhausted(attempt) || !e.is_recoverable() {
                    self.escalate(event, attempt, &e).await;
                    ConsumerOutcome::Parked
                } else {
                    self.schedule_retry(event, attempt);
                    ConsumerOutcome::RetryScheduled
                }
            }
        };

        emit!(RetriesPending {
            count: self.tracker.len(),
        });
        outcome
    }

    /// Re-publish `event` to the ingest topic after the backoff delay, on a
    /// detached task. On shutdown the event is written to the fallback store
    /// instead of waiting out the delay.
    ///
    /// The tracker entry lives until the event is handed off, to the broker or
    /// to a fallback file. The re-published copy carries its attempt count.
    fn schedule_retry(&self, mut event: Event, attempt: u32) {
        let delay = self.policy.delay_for(attempt);
        let due =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.tracker.schedule(&event.id, due);

        event.attempts = attempt;
        event.delivery_state = DeliveryState::Undelivered;
        info!(
            event_id = %event.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let channel = Arc::clone(&self.channel);
        let fallback = Arc::clone(&self.fallback);
        let topic = self.topics.ingest.clone();
        let shutdown = self.shutdown.clone();
        let tracker = Arc::clone(&self.tracker);

        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracker.clear(&event.id);
                    save_to_fallback(&fallback, &event, "shutdown before scheduled retry").await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            tracker.clear(&event.id);

            let published = match Envelope::for_event(&event) {
                Ok(envelope) => channel.publish(&topic, envelope).await,
                Err(e) => Err(e),
            };
            match published {
                Ok(()) => debug!(event_id = %event.id, attempt, topic = %topic, "Retry published"),
                Err(e) => {
                    warn!(event_id = %event.id, attempt, "Retry re-publish failed: {}", e);
                    let reason = format!("retry re-publish failed: {e}");
                    save_to_fallback(&fallback, &event, &reason).await;
                }
            }
        });
    }

    /// Park `event` on the dead-letter topic, once. If that publish fails the
    /// event goes to the fallback store so it is not lost.
    async fn escalate(&self, mut event: Event, attempt: u32, cause: &StoreError) {
        self.tracker.clear(&event.id);
        event.attempts = attempt;
        event.delivery_state = DeliveryState::Parked;

        let entry = DeadLetterEntry::new(&self.topics.ingest, event, cause.to_string(), attempt);
        let published = match Envelope::for_dead_letter(&entry) {
            Ok(envelope) => self.channel.publish(&self.topics.dead_letter, envelope).await,
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                emit!(DeadLetterPublished { success: true });
                warn!(
                    event_id = %entry.event.id,
                    attempts = attempt,
                    topic = %self.topics.dead_letter,
                    "Event parked on dead-letter topic"
                );
            }
            Err(e) => {
                emit!(DeadLetterPublished { success: false });
                error!(event_id = %entry.event.id, "Dead-letter publish failed: {}", e);
                let reason = format!("dead-letter publish failed: {e}; last error: {cause}");
                save_to_fallback(&self.fallback, &entry.event, &reason).await;
            }
        }
    }

    /// Wait for scheduled retries to finish. Call after `shutdown` is
    /// cancelled so pending retries are flushed to the fallback store.
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(pending = self.tasks.len(), "Waiting for scheduled retries");
        }
        self.tasks.wait().await;
    }
}

async fn save_to_fallback(fallback: &FallbackStore, event: &Event, reason: &str) {
    if let Err(e) = fallback.save(event, reason).await {
        error!(event_id = %event.id, "Event could not be saved to fallback file: {}", e);
    }
}

#[async_trait]
impl MessageHandler for EventProcessor {
    async fn handle(&self, message: Message) -> Disposition {
        let started = Instant::now();

        let event: Event = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(
                    topic = %message.topic,
                    offset = message.offset,
                    "Dropping undecodable message: {}",
                    e
                );
                emit!(MessageConsumed {
                    outcome: ConsumerOutcome::Undecodable,
                    duration: started.elapsed(),
                });
                return Disposition::Reject;
            }
        };

        debug!(event_id = %event.id, key = %message.key, "Message received");
        let outcome = self.process(event).await;
        emit!(MessageConsumed {
            outcome,
            duration: started.elapsed(),
        });
        Disposition::Ack
    }
}
