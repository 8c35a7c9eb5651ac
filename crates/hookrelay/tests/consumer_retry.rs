//! Consumer retry and dead-letter escalation over the in-memory broker.
//!
//! Run with: cargo test -p hookrelay --test consumer_retry

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hookrelay::app::run_consumer;
use hookrelay::channel::{ChannelClient, Disposition, Envelope, Message, MessageHandler};
use hookrelay::event::DeliveryState;
use hookrelay::fallback::FallbackStore;
use hookrelay::retry::{DeadLetterEntry, EventProcessor, RetryPolicy, Topics};
use hookrelay::{Event, FileState, MemoryBroker};

use common::{ScriptedStore, event, wait_until};

const INGEST: &str = "webhook-events";
const DLQ: &str = "webhook-events-dlq";
const TAG: &str = "webhook-processor";

fn topics() -> Topics {
    Topics {
        ingest: INGEST.to_string(),
        dead_letter: DLQ.to_string(),
    }
}

struct Harness {
    broker: MemoryBroker,
    store: Arc<ScriptedStore>,
    fallback: Arc<FallbackStore>,
    processor: Arc<EventProcessor>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(store: Arc<ScriptedStore>, base_delay: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let fallback = Arc::new(FallbackStore::new(dir.path()));
        let shutdown = CancellationToken::new();
        let processor = Arc::new(EventProcessor::new(
            store.clone(),
            Arc::new(broker.clone()),
            Arc::clone(&fallback),
            RetryPolicy::new(3, base_delay),
            topics(),
            shutdown.clone(),
        ));
        Self {
            broker,
            store,
            fallback,
            processor,
            shutdown,
            _dir: dir,
        }
    }

    fn spawn_consumer(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.broker.clone();
        let processor = Arc::clone(&self.processor);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_consumer(&broker, INGEST, TAG, processor, &shutdown)
                .await
                .unwrap();
        })
    }

    async fn publish(&self, event: &Event) {
        self.broker
            .publish(INGEST, Envelope::for_event(event).unwrap())
            .await
            .unwrap();
    }

    async fn stop(self, consumer: tokio::task::JoinHandle<()>) -> Self {
        self.shutdown.cancel();
        consumer.await.unwrap();
        self.processor.drain().await;
        self
    }
}

/// Test: an event that fails fewer times than the limit is stored and never
/// reaches the dead-letter topic.
#[tokio::test]
async fn test_recovers_before_exhaustion() {
    let harness = Harness::new(ScriptedStore::failing(2), Duration::from_millis(10));
    let consumer = harness.spawn_consumer();
    harness.publish(&event("deal")).await;

    let store = Arc::clone(&harness.store);
    assert!(wait_until(|| store.raw_rows().len() == 1).await);

    let harness = harness.stop(consumer).await;
    assert_eq!(harness.store.raw_attempts(), 3);
    assert_eq!(harness.store.entity_rows().len(), 1);
    // original plus two retries
    assert_eq!(harness.broker.messages(INGEST).len(), 3);
    assert!(harness.broker.messages(DLQ).is_empty());
    assert!(harness.processor.tracker().is_empty());
}

/// Test: an event failing on every attempt is parked exactly once.
#[tokio::test]
async fn test_exhausted_event_is_parked_once() {
    let harness = Harness::new(ScriptedStore::offline(), Duration::from_millis(10));
    let consumer = harness.spawn_consumer();
    let original = event("deal");
    harness.publish(&original).await;

    let broker = harness.broker.clone();
    assert!(wait_until(|| broker.messages(DLQ).len() == 1).await);
    // nothing further should arrive once parked
    tokio::time::sleep(Duration::from_millis(100)).await;

    let harness = harness.stop(consumer).await;
    let dead_letters = harness.broker.messages(DLQ);
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(harness.broker.messages(INGEST).len(), 3);
    assert_eq!(harness.store.raw_attempts(), 3);
    assert!(harness.processor.tracker().is_empty());

    let entry: DeadLetterEntry = dead_letters[0].decode().unwrap();
    assert_eq!(entry.original_topic, INGEST);
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.event.id, original.id);
    assert_eq!(entry.event.delivery_state, DeliveryState::Parked);
    assert!(entry.error.contains("store offline"));
    assert_eq!(
        dead_letters[0].headers.get("original-topic").map(String::as_str),
        Some(INGEST)
    );
}

/// Test: retry delays grow linearly with the attempt number.
#[tokio::test]
async fn test_retry_is_delayed() {
    let harness = Harness::new(ScriptedStore::failing(1), Duration::from_millis(300));
    let event = event("deal");

    harness.processor.process(event.clone()).await;
    let state = harness.processor.tracker().get(&event.id).unwrap();
    assert_eq!(state.attempt_count, 1);
    assert!(state.next_attempt_at.is_some());

    // not re-published before the delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.broker.messages(INGEST).is_empty());

    let broker = harness.broker.clone();
    assert!(wait_until(|| broker.messages(INGEST).len() == 1).await);
    let retried: Event = harness.broker.messages(INGEST)[0].decode().unwrap();
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.id, event.id);
}

/// Test: a re-published copy resumes from the attempt count it carries.
#[tokio::test]
async fn test_carried_attempts_survive_restart() {
    let harness = Harness::new(ScriptedStore::offline(), Duration::from_millis(10));
    let mut event = event("deal");
    event.attempts = 2;

    harness.processor.process(event).await;

    assert_eq!(harness.broker.messages(DLQ).len(), 1);
    assert!(harness.broker.messages(INGEST).is_empty());
}

/// Test: errors retrying cannot fix are parked without a retry.
#[tokio::test]
async fn test_unrecoverable_error_parks_immediately() {
    let harness = Harness::new(ScriptedStore::rejecting(), Duration::from_millis(10));

    harness.processor.process(event("deal")).await;

    assert_eq!(harness.store.raw_attempts(), 1);
    assert_eq!(harness.broker.messages(DLQ).len(), 1);
    assert!(harness.broker.messages(INGEST).is_empty());
    assert!(harness.processor.tracker().is_empty());
}

/// Test: a retry still waiting at shutdown is written to the fallback store.
#[tokio::test]
async fn test_pending_retry_is_saved_on_shutdown() {
    let harness = Harness::new(ScriptedStore::failing(1), Duration::from_secs(60));
    let event = event("deal");

    harness.processor.process(event.clone()).await;
    harness.shutdown.cancel();
    harness.processor.drain().await;

    let name = hookrelay::fallback::file_name(&event.id);
    assert_eq!(harness.fallback.locate(&name).await, Some(FileState::Pending));
    let record = harness.fallback.load(&name).await.unwrap();
    assert_eq!(record.event.attempts, 1);
    assert!(harness.broker.messages(INGEST).is_empty());
}

/// Test: when the dead-letter publish fails the event lands in a fallback file.
#[tokio::test]
async fn test_dead_letter_publish_failure_falls_back_to_file() {
    let harness = Harness::new(ScriptedStore::offline(), Duration::from_millis(10));
    harness.broker.set_online(false);
    let mut event = event("deal");
    event.attempts = 2;

    harness.processor.process(event.clone()).await;

    let name = hookrelay::fallback::file_name(&event.id);
    assert_eq!(harness.fallback.locate(&name).await, Some(FileState::Pending));
}

/// Test: undecodable messages are rejected and never stored.
#[tokio::test]
async fn test_undecodable_message_is_rejected() {
    let harness = Harness::new(ScriptedStore::new(), Duration::from_millis(10));
    let message = Message {
        topic: INGEST.to_string(),
        key: "deal-13881612".to_string(),
        payload: b"not json".to_vec(),
        headers: Default::default(),
        offset: 0,
    };

    let disposition = harness.processor.handle(message).await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(harness.store.raw_attempts(), 0);
}

/// Test: retries that end up in fallback files leave no retry state behind.
#[tokio::test]
async fn test_retry_state_cleared_when_retry_falls_back() {
    let harness = Harness::new(ScriptedStore::offline(), Duration::from_millis(5));
    harness.broker.set_online(false);
    let events: Vec<Event> = (0..5).map(|_| event("deal")).collect();

    for event in &events {
        harness.processor.process(event.clone()).await;
    }
    assert_eq!(harness.processor.tracker().len(), 5);
    harness.processor.drain().await;

    assert!(harness.processor.tracker().is_empty());
    assert_eq!(harness.fallback.list_pending().await.unwrap().len(), 5);
    for event in &events {
        let name = hookrelay::fallback::file_name(&event.id);
        assert_eq!(harness.fallback.locate(&name).await, Some(FileState::Pending));
    }
}

/// Test: a re-published retry hands its attempt count to the copy and drops
/// the local state, whichever consumer picks the copy up.
#[tokio::test]
async fn test_retry_state_cleared_once_republished() {
    let harness = Harness::new(ScriptedStore::failing(1), Duration::from_millis(5));
    let event = event("deal");

    harness.processor.process(event.clone()).await;
    harness.processor.drain().await;

    assert!(harness.processor.tracker().is_empty());
    let retried: Event = harness.broker.messages(INGEST)[0].decode().unwrap();
    assert_eq!(retried.attempts, 1);
}

/// Test: a pending retry flushed at shutdown also drops its state.
#[tokio::test]
async fn test_retry_state_cleared_on_shutdown_flush() {
    let harness = Harness::new(ScriptedStore::failing(1), Duration::from_secs(60));

    harness.processor.process(event("deal")).await;
    harness.shutdown.cancel();
    harness.processor.drain().await;

    assert!(harness.processor.tracker().is_empty());
}
