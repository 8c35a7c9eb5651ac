//! On-demand recovery of parked and fallback events.
//!
//! A run first drains the `pending` fallback directory, re-delivering each
//! file through the broker or, failing that, straight to the store. It then
//! replays the dead-letter topic for a bounded window and writes each parked
//! event to the store. Only one run may be active per fallback root.

mod lock;

pub use lock::{LOCK_FILE_NAME, ReconcileLock};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hookrelay_core::emit;

use crate::channel::{
    ChannelClient, Disposition, Envelope, Message, MessageHandler, SubscribeOptions,
};
use crate::error::{DeadLetterSubscribeSnafu, ReconcileError, ScanFallbackSnafu};
use crate::event::{DeliveryMethod, Event};
use crate::fallback::FallbackStore;
use crate::metrics::events::ReconcileCompleted;
use crate::retry::{DeadLetterEntry, Topics};
use crate::store::{self, EventStore};

/// Outcome of one reconcile run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Fallback files moved to `processed`.
    pub files_processed: Vec<String>,
    /// Fallback files moved to `failed`.
    pub files_failed: Vec<String>,
    /// Dead-letter messages read during the window.
    pub dead_letters_seen: usize,
    /// Dead-letter events written to the store.
    pub dead_letters_reprocessed: usize,
}

pub struct Reconciler {
    channel: Arc<dyn ChannelClient>,
    store: Arc<dyn EventStore>,
    fallback: Arc<FallbackStore>,
    topics: Topics,
    consumer_tag: String,
    window: Duration,
    republish: bool,
}

impl Reconciler {
    pub fn new(
        channel: Arc<dyn ChannelClient>,
        store: Arc<dyn EventStore>,
        fallback: Arc<FallbackStore>,
        topics: Topics,
        consumer_tag: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            channel,
            store,
            fallback,
            topics,
            consumer_tag: consumer_tag.into(),
            window,
            republish: true,
        }
    }

    /// Write fallback events to the store without trying the broker first.
    pub fn store_only(mut self) -> Self {
        self.republish = false;
        self
    }

    /// Run both passes under the reconcile lock.
    ///
    /// An unreachable broker does not fail the run: fallback files are then
    /// written to the store directly and the dead-letter pass is skipped.
    pub async fn run(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<ReconcileReport, ReconcileError> {
        let lock = ReconcileLock::acquire(self.fallback.root())?;
        info!(lock = %lock.path().display(), "Reconcile started");

        let mut report = ReconcileReport::default();
        self.reconcile_files(&mut report, shutdown).await?;

        if shutdown.is_cancelled() {
            info!("Shutdown requested, skipping dead-letter pass");
        } else {
            match self.reconcile_dead_letters(shutdown).await {
                Ok((seen, reprocessed)) => {
                    report.dead_letters_seen = seen;
                    report.dead_letters_reprocessed = reprocessed;
                }
                Err(e) => warn!("Dead-letter pass skipped: {}", e),
            }
        }

        if let Err(e) = self.channel.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }

        emit!(ReconcileCompleted {
            files_processed: report.files_processed.len(),
            files_failed: report.files_failed.len(),
            dead_letters_seen: report.dead_letters_seen,
            dead_letters_reprocessed: report.dead_letters_reprocessed,
        });
        info!(
            files_processed = report.files_processed.len(),
            files_failed = report.files_failed.len(),
            dead_letters_seen = report.dead_letters_seen,
            dead_letters_reprocessed = report.dead_letters_reprocessed,
            "Reconcile finished"
        );

        drop(lock);
        Ok(report)
    }

    async fn reconcile_files(
        &self,
        report: &mut ReconcileReport,
        shutdown: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let pending = self.fallback.list_pending().await.context(ScanFallbackSnafu)?;
        info!(count = pending.len(), "Reconciling fallback files");

        for name in pending {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving remaining files pending");
                break;
            }

            let redelivered = match self.fallback.load(&name).await {
                Ok(record) => self.redeliver(&record.event).await,
                Err(e) => {
                    warn!(file = %name, "Unreadable fallback file: {}", e);
                    false
                }
            };

            let moved = if redelivered {
                self.fallback.mark_processed(&name).await
            } else {
                self.fallback.mark_failed(&name).await
            };
            match moved {
                Ok(_) if redelivered => report.files_processed.push(name),
                Ok(_) => report.files_failed.push(name),
                Err(e) => error!(file = %name, "Failed to move fallback file: {}", e),
            }
        }
        Ok(())
    }

    /// Publish to the ingest topic, else write the raw log row.
    async fn redeliver(&self, event: &Event) -> bool {
        if self.republish {
            let event = event.stamped(DeliveryMethod::Broker);
            let published = match Envelope::for_event(&event) {
                Ok(envelope) => self.channel.publish(&self.topics.ingest, envelope).await,
                Err(e) => Err(e),
            };
            match published {
                Ok(()) => {
                    debug!(event_id = %event.id, "Fallback event re-published");
                    return true;
                }
                Err(e) => warn!(event_id = %event.id, "Re-publish failed, writing to store: {}", e),
            }
        }

        let event = event.stamped(DeliveryMethod::DirectStore);
        match store::record_direct(self.store.as_ref(), &event).await {
            Ok(()) => {
                debug!(event_id = %event.id, "Fallback event written to store");
                true
            }
            Err(e) => {
                warn!(event_id = %event.id, "Store write failed: {}", e);
                false
            }
        }
    }

    async fn reconcile_dead_letters(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(usize, usize), ReconcileError> {
        let window = shutdown.child_token();
        let timer = window.clone();
        let duration = self.window;
        let timer_task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });

        let handler = Arc::new(DeadLetterHandler {
            store: Arc::clone(&self.store),
            fallback: Arc::clone(&self.fallback),
            seen: AtomicUsize::new(0),
            reprocessed: AtomicUsize::new(0),
        });
        info!(
            topic = %self.topics.dead_letter,
            window_ms = self.window.as_millis() as u64,
            "Replaying dead-letter topic"
        );

        let subscribed = self
            .channel
            .subscribe(
                &self.topics.dead_letter,
                SubscribeOptions::new(&self.consumer_tag).from_beginning(),
                Arc::clone(&handler) as Arc<dyn MessageHandler>,
                window.clone(),
            )
            .await;
        window.cancel();
        if let Err(e) = timer_task.await {
            warn!("Dead-letter window timer failed: {}", e);
        }
        subscribed.context(DeadLetterSubscribeSnafu)?;

        Ok((
            handler.seen.load(Ordering::SeqCst),
            handler.reprocessed.load(Ordering::SeqCst),
        ))
    }
}

/// Writes parked events to the store during the dead-letter pass.
struct DeadLetterHandler {
    store: Arc<dyn EventStore>,
    fallback: Arc<FallbackStore>,
    seen: AtomicUsize,
    reprocessed: AtomicUsize,
}

#[async_trait]
impl MessageHandler for DeadLetterHandler {
    async fn handle(&self, message: Message) -> Disposition {
        self.seen.fetch_add(1, Ordering::SeqCst);

        let entry: DeadLetterEntry = match message.decode() {
            Ok(entry) => entry,
            Err(e) => {
                error!(offset = message.offset, "Dropping undecodable dead letter: {}", e);
                return Disposition::Reject;
            }
        };

        let event = entry.event.stamped(DeliveryMethod::DirectStore);
        match store::record_direct(self.store.as_ref(), &event).await {
            Ok(()) => {
                self.reprocessed.fetch_add(1, Ordering::SeqCst);
                info!(
                    event_id = %event.id,
                    retry_count = entry.retry_count,
                    "Dead-lettered event reprocessed"
                );
            }
            Err(e) => {
                error!(event_id = %event.id, "Dead-lettered event failed again: {}", e);
                let reason = format!(
                    "dead-letter reprocess failed: {e}; parked after: {}",
                    entry.error
                );
                if let Err(e) = self.fallback.park_failed(&event, &reason).await {
                    error!(event_id = %event.id, "Failed to park event: {}", e);
                }
            }
        }
        Disposition::Ack
    }
}
