//! End-to-end delivery scenarios: ingress through the cascade, the consumer
//! and the reconciler, with the broker and store failing on demand.
//!
//! Run with: cargo test -p hookrelay --test delivery_scenarios

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Extension, Json};
use tokio_util::sync::CancellationToken;

use hookrelay::config::{BrokerKind, RelayConfig};
use hookrelay::error::RelayError;
use hookrelay::ingress::{IngressState, WebhookResponse, receive_webhook};
use hookrelay::store::EventStore;
use hookrelay::{DeliveryMethod, FallbackStore, FileState, MemoryBroker, Relay};

use common::{ScriptedStore, wait_until, webhook};

struct Scenario {
    broker: MemoryBroker,
    store: Arc<ScriptedStore>,
    fallback: Arc<FallbackStore>,
    relay: Relay,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Scenario {
    fn new(store: Arc<ScriptedStore>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.broker.kind = BrokerKind::Memory;
        config.retry.base_delay_ms = 10;
        config.reconciler.dead_letter_window_secs = 0;
        config.fallback.root = dir.path().to_path_buf();
        config.ingress.address = "127.0.0.1:0".to_string();

        let broker = MemoryBroker::new();
        let fallback = Arc::new(FallbackStore::new(dir.path()));
        let shutdown = CancellationToken::new();
        let store_handle: Arc<dyn EventStore> = store.clone();
        let relay = Relay::with_parts(
            config,
            Arc::new(broker.clone()),
            store_handle,
            Arc::clone(&fallback),
            shutdown.clone(),
        );
        Self {
            broker,
            store,
            fallback,
            relay,
            shutdown,
            _dir: dir,
        }
    }

    fn ingress(&self) -> IngressState {
        IngressState {
            cascade: Arc::new(self.relay.cascade()),
            tenants: Arc::new(self.relay.config().tenants.directory()),
            shutdown: self.shutdown.clone(),
        }
    }

    async fn post(&self, entity: &str, action: &str) -> (StatusCode, WebhookResponse) {
        let (status, Json(body)) = receive_webhook(
            Extension(self.ingress()),
            Ok(Json(webhook(entity, action))),
        )
        .await;
        (status, body)
    }
}

/// Test: with the broker up the event is published and answered with 202.
#[tokio::test]
async fn test_broker_up() {
    let scenario = Scenario::new(ScriptedStore::new());

    let (status, body) = scenario.post("deal", "added").await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body.method, Some(DeliveryMethod::Broker));
    let messages = scenario.broker.messages("webhook-events");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, "deal-13881612");
    assert_eq!(
        messages[0].headers.get("companyId").map(String::as_str),
        Some("13881612")
    );
    assert!(scenario.store.raw_rows().is_empty());
}

/// Test: with the broker down the raw log row is written directly and no
/// fallback file is created.
#[tokio::test]
async fn test_broker_down_store_up() {
    let scenario = Scenario::new(ScriptedStore::new());
    scenario.broker.set_online(false);

    let (status, body) = scenario.post("deal", "added").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.method, Some(DeliveryMethod::DirectStore));
    let rows = scenario.store.raw_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].delivery_method, DeliveryMethod::DirectStore);
    assert_eq!(rows[0].tenant, "Matriz");
    assert!(scenario.fallback.list_pending().await.unwrap().is_empty());
}

/// Test: with both down the event waits in a pending file until the
/// reconciler finds the store back.
#[tokio::test]
async fn test_both_down_then_reconciled() {
    let scenario = Scenario::new(ScriptedStore::offline());
    scenario.broker.set_online(false);

    let (status, body) = scenario.post("deal", "added").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.method, Some(DeliveryMethod::File));
    let event_id = body.event_id.unwrap();
    let name = format!("webhook-{event_id}.json");
    assert_eq!(scenario.fallback.list_pending().await.unwrap(), vec![name.clone()]);

    scenario.store.set_online(true);
    let report = scenario.relay.reconcile().await.unwrap();

    assert_eq!(report.files_processed, vec![name.clone()]);
    assert!(report.files_failed.is_empty());
    assert_eq!(scenario.fallback.locate(&name).await, Some(FileState::Processed));
    assert_eq!(scenario.store.raw_rows()[0].event_id, event_id);
}

/// Test: a broker-accepted event flows through the consumer into both the
/// raw log and the entity table.
#[tokio::test]
async fn test_consumer_persists_published_event() {
    let scenario = Scenario::new(ScriptedStore::new());
    let processor = Arc::new(scenario.relay.processor());
    let consumer = {
        let broker = scenario.broker.clone();
        let processor = Arc::clone(&processor);
        let shutdown = scenario.shutdown.clone();
        tokio::spawn(async move {
            hookrelay::app::run_consumer(
                &broker,
                "webhook-events",
                "webhook-processor",
                processor,
                &shutdown,
            )
            .await
        })
    };

    let (status, _) = scenario.post("deal", "deleted").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let store = Arc::clone(&scenario.store);
    assert!(wait_until(|| store.entity_rows().len() == 1).await);

    scenario.shutdown.cancel();
    consumer.await.unwrap().unwrap();
    processor.drain().await;

    let raw = scenario.store.raw_rows();
    assert_eq!(raw[0].delivery_method, DeliveryMethod::Broker);
    assert_eq!(raw[0].event, "deleted");
    let entity = &scenario.store.entity_rows()[0];
    assert_eq!(entity.entity, "deal");
    assert_eq!(entity.event, "deleted");
    assert_eq!(entity.tenant, "Matriz");
    assert_eq!(entity.fields.get("deleted"), Some(&serde_json::json!(true)));
    assert_eq!(entity.fields.get("title"), Some(&serde_json::json!("Big deal")));
    assert_eq!(scenario.broker.committed("webhook-events", "webhook-processor"), 1);
}

/// Test: invalid webhooks are rejected before any tier is tried.
#[tokio::test]
async fn test_validation_failure_is_not_delivered() {
    let scenario = Scenario::new(ScriptedStore::new());

    let (status, body) = scenario.post("", "added").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.accepted);
    assert!(scenario.broker.messages("webhook-events").is_empty());
    assert_eq!(scenario.store.raw_attempts(), 0);
    assert!(scenario.fallback.list_pending().await.unwrap().is_empty());
}

/// Test: the in-memory broker is refused where nothing in the process would
/// consume what it accepts.
#[tokio::test]
async fn test_memory_broker_needs_in_process_consumer() {
    let scenario = Scenario::new(ScriptedStore::new());

    let err = scenario.relay.serve(false).await.unwrap_err();
    assert!(matches!(err, RelayError::UnsupportedBroker { command: "serve", .. }));

    let err = scenario.relay.consume().await.unwrap_err();
    assert!(matches!(err, RelayError::UnsupportedBroker { command: "consume", .. }));
}

/// Test: events still queued in memory at shutdown are saved as pending
/// fallback files, and a later reconcile stores them.
#[tokio::test]
async fn test_unconsumed_events_saved_at_shutdown() {
    let scenario = Scenario::new(ScriptedStore::new());

    let (status, body) = scenario.post("deal", "added").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let name = format!("webhook-{}.json", body.event_id.unwrap());

    // shut down before the consumer gets a chance to run
    scenario.shutdown.cancel();
    scenario.relay.serve(true).await.unwrap();

    assert_eq!(scenario.fallback.list_pending().await.unwrap(), vec![name.clone()]);
    assert!(scenario.store.raw_rows().is_empty());

    let report = scenario
        .relay
        .reconciler()
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.files_processed, vec![name]);
    assert_eq!(scenario.store.raw_rows().len(), 1);
    assert_eq!(scenario.store.raw_rows()[0].delivery_method, DeliveryMethod::DirectStore);
}

/// Test: config problems surface as configuration errors.
#[tokio::test]
async fn test_load_reports_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.yaml");
    std::fs::write(&path, "ingress:\n  address: nowhere\n").unwrap();

    let err = Relay::load(&[path], CancellationToken::new()).err().unwrap();
    assert!(matches!(err, RelayError::Config { .. }));
}
