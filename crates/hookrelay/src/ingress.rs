//! HTTP ingress: `POST /webhook`.
//!
//! Each request is validated, turned into an [`Event`] and handed to the
//! delivery cascade. The status code names the outcome: 202 when the broker
//! took the event, 200 when a later tier did, 400 for invalid input, 500 when
//! nothing could record it and 503 once shutdown has begun.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hookrelay_core::emit;

use crate::cascade::DeliveryCascade;
use crate::event::{DeliveryMethod, Event, TenantDirectory};
use crate::metrics::events::WebhookRejected;

/// Shared request context.
#[derive(Clone)]
pub struct IngressState {
    pub cascade: Arc<DeliveryCascade>,
    pub tenants: Arc<TenantDirectory>,
    pub shutdown: CancellationToken,
}

/// Response body for every webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<DeliveryMethod>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn refused(error: String) -> Self {
        Self {
            accepted: false,
            event_id: None,
            method: None,
            elapsed_ms: 0,
            error: Some(error),
        }
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .layer(Extension(state))
}

pub async fn receive_webhook(
    Extension(state): Extension<IngressState>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<WebhookResponse>) {
    if state.shutdown.is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WebhookResponse::refused("shutting down".to_string())),
        );
    }

    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            emit!(WebhookRejected);
            warn!("Rejected webhook body: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::refused(rejection.body_text())),
            );
        }
    };

    let event = match Event::from_webhook(&body, &state.tenants, Utc::now()) {
        Ok(event) => event,
        Err(e) => {
            emit!(WebhookRejected);
            warn!("Rejected webhook: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::refused(e.to_string())),
            );
        }
    };

    let report = state.cascade.deliver(&event).await;
    let status = match report.method {
        Some(DeliveryMethod::Broker) => StatusCode::ACCEPTED,
        Some(_) => StatusCode::OK,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let response = WebhookResponse {
        accepted: report.accepted,
        event_id: Some(report.event_id.to_string()),
        method: report.method,
        elapsed_ms: report.elapsed.as_millis() as u64,
        error: report.error.map(|e| e.to_string()),
    };
    (status, Json(response))
}

/// Serve the ingress on `listener` until `shutdown` is cancelled. In-flight
/// requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: IngressState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Ingress listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryBroker;
    use crate::error::StoreError;
    use crate::fallback::FallbackStore;
    use crate::store::{EntityRow, EventStore, RawLogRow};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct DownStore;

    #[async_trait]
    impl EventStore for DownStore {
        async fn prepare(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn insert_raw(&self, _row: &RawLogRow) -> Result<(), StoreError> {
            crate::error::StoreUnavailableSnafu { message: "down" }.fail()
        }

        async fn insert_entity(&self, _row: &EntityRow) -> Result<(), StoreError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn state(broker: &MemoryBroker, root: &std::path::Path) -> IngressState {
        IngressState {
            cascade: Arc::new(DeliveryCascade::standard(
                Arc::new(broker.clone()),
                "webhook-events",
                Arc::new(DownStore),
                Arc::new(FallbackStore::new(root)),
                Duration::from_secs(1),
            )),
            tenants: Arc::new(TenantDirectory::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn deal() -> Value {
        json!({
            "meta": {"action": "added", "entity": "deal", "company_id": 13881612},
            "current": {"id": 1}
        })
    }

    #[tokio::test]
    async fn test_broker_delivery_is_202() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();

        let (status, Json(body)) =
            receive_webhook(Extension(state(&broker, dir.path())), Ok(Json(deal()))).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.accepted);
        assert_eq!(body.method, Some(DeliveryMethod::Broker));
        assert!(body.event_id.unwrap().starts_with("deal-added-"));
        assert!(body.error.is_none());
    }

    #[tokio::test]
    async fn test_file_delivery_is_200() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        broker.set_online(false);

        let (status, Json(body)) =
            receive_webhook(Extension(state(&broker, dir.path())), Ok(Json(deal()))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.method, Some(DeliveryMethod::File));
    }

    #[tokio::test]
    async fn test_missing_entity_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let body = json!({"meta": {"action": "added"}});

        let (status, Json(body)) =
            receive_webhook(Extension(state(&broker, dir.path())), Ok(Json(body))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.accepted);
        assert_eq!(
            body.error.as_deref(),
            Some("Missing required field 'meta.entity'")
        );
        assert!(broker.messages("webhook-events").is_empty());
    }

    #[tokio::test]
    async fn test_refuses_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();
        let state = state(&broker, dir.path());
        state.shutdown.cancel();

        let (status, _) = receive_webhook(Extension(state), Ok(Json(deal()))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(broker.messages("webhook-events").is_empty());
    }

    #[test]
    fn test_response_field_names() {
        let response = WebhookResponse {
            accepted: true,
            event_id: Some("deal-added-1-00000000".to_string()),
            method: Some(DeliveryMethod::DirectStore),
            elapsed_ms: 4,
            error: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "accepted": true,
                "eventId": "deal-added-1-00000000",
                "method": "direct-store",
                "elapsedMs": 4
            })
        );
    }
}
