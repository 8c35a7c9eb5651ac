//! Persistent store for delivered events.
//!
//! Every delivered event lands in the raw log table. The consumer also writes
//! it to a per-entity table whose columns follow the payload keys.

mod mysql;
mod schema;

pub use mysql::MySqlStore;
pub use schema::{
    ACTION_COLUMN, SchemaProvisioner, TENANT_COLUMN, entity_table_name, sanitize_identifier,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::event::{DeliveryMethod, Event};

/// One row of the raw log table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogRow {
    pub event_id: String,
    /// The webhook action, stored in the `event` column.
    pub event: String,
    pub entity: String,
    pub payload: Map<String, Value>,
    pub tenant: String,
    pub delivery_method: DeliveryMethod,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl RawLogRow {
    pub fn from_event(event: &Event, method: DeliveryMethod, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id.to_string(),
            event: event.action.clone(),
            entity: event.entity.clone(),
            payload: event.payload.clone(),
            tenant: event.tenant.clone(),
            delivery_method: method,
            processing_time_ms: (now - event.processing_start_time)
                .num_milliseconds()
                .max(0),
            created_at: now,
        }
    }
}

/// One row of an entity table: the action and tenant, plus one value per
/// payload field.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub entity: String,
    /// The webhook action.
    pub event: String,
    pub tenant: String,
    pub fields: Map<String, Value>,
}

impl EntityRow {
    /// Delete actions are marked with `deleted: true`.
    pub fn from_event(event: &Event) -> Self {
        let mut fields = event.payload.clone();
        if event.is_delete() {
            fields.insert("deleted".to_string(), Value::Bool(true));
        }
        Self {
            entity: event.entity.clone(),
            event: event.action.clone(),
            tenant: event.tenant.clone(),
            fields,
        }
    }
}

/// Durable event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create the raw log table and configured entity tables if missing.
    async fn prepare(&self) -> Result<(), StoreError>;

    async fn insert_raw(&self, row: &RawLogRow) -> Result<(), StoreError>;

    /// Insert into the entity table, provisioning columns as needed.
    async fn insert_entity(&self, row: &EntityRow) -> Result<(), StoreError>;

    /// Release pooled connections.
    async fn close(&self);
}

/// Full consumer write: raw log row, then entity row.
pub async fn persist(store: &dyn EventStore, event: &Event) -> Result<(), StoreError> {
    let method = event.delivery_method.unwrap_or(DeliveryMethod::Broker);
    store
        .insert_raw(&RawLogRow::from_event(event, method, Utc::now()))
        .await?;
    store.insert_entity(&EntityRow::from_event(event)).await
}

/// Direct write used when the broker is unreachable: raw log row only.
pub async fn record_direct(store: &dyn EventStore, event: &Event) -> Result<(), StoreError> {
    store
        .insert_raw(&RawLogRow::from_event(
            event,
            DeliveryMethod::DirectStore,
            Utc::now(),
        ))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TenantDirectory;
    use chrono::Duration;
    use serde_json::json;

    fn event(action: &str) -> Event {
        let body = json!({
            "meta": {"action": action, "entity": "deal", "company_id": 13881612},
            "current": {"id": 1, "title": "t"}
        });
        Event::from_webhook(&body, &TenantDirectory::default(), Utc::now()).unwrap()
    }

    #[test]
    fn test_raw_row_layout() {
        let event = event("added");
        let now = event.processing_start_time + Duration::milliseconds(42);
        let row = RawLogRow::from_event(&event, DeliveryMethod::DirectStore, now);

        assert_eq!(row.event, "added");
        assert_eq!(row.entity, "deal");
        assert_eq!(row.tenant, "Matriz");
        assert_eq!(row.processing_time_ms, 42);
        assert_eq!(row.delivery_method, DeliveryMethod::DirectStore);
        assert_eq!(row.event_id, event.id.as_str());
    }

    #[test]
    fn test_processing_time_never_negative() {
        let event = event("added");
        let earlier = event.processing_start_time - Duration::seconds(1);
        let row = RawLogRow::from_event(&event, DeliveryMethod::Broker, earlier);
        assert_eq!(row.processing_time_ms, 0);
    }

    #[test]
    fn test_entity_row_marks_deletes() {
        let row = EntityRow::from_event(&event("deleted"));
        assert_eq!(row.fields["deleted"], json!(true));
        assert_eq!(row.event, "deleted");
        assert_eq!(row.tenant, "Matriz");

        let row = EntityRow::from_event(&event("updated"));
        assert!(!row.fields.contains_key("deleted"));
        assert_eq!(row.fields["title"], json!("t"));
    }
}
