//! MySQL-backed event store.

use std::time::Duration;

use async_trait::async_trait;
use snafu::prelude::*;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{
    EncodePayloadSnafu, StoreConnectSnafu, StoreError, StoreQuerySnafu, StoreUnavailableSnafu,
};

use super::schema::{ACTION_COLUMN, SchemaProvisioner, TENANT_COLUMN, entity_table_name};
use super::{EntityRow, EventStore, RawLogRow};

/// Event store over a lazily created connection pool.
///
/// The pool is opened on first use; a failed open is retried on the next
/// call rather than cached.
pub struct MySqlStore {
    url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    pool: OnceCell<MySqlPool>,
    schema: SchemaProvisioner,
}

impl MySqlStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .url
            .clone()
            .context(StoreUnavailableSnafu {
                message: "store.url is not configured",
            })?;

        Ok(Self {
            url,
            max_connections: config.max_connections,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            pool: OnceCell::new(),
            schema: SchemaProvisioner::new(&config.raw_table, config.tables.clone())?,
        })
    }

    async fn pool(&self) -> Result<&MySqlPool, StoreError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = MySqlPoolOptions::new()
                    .max_connections(self.max_connections)
                    .acquire_timeout(self.acquire_timeout)
                    .connect(&self.url)
                    .await
                    .context(StoreConnectSnafu)?;
                info!(max_connections = self.max_connections, "Store pool opened");
                Ok::<_, StoreError>(pool)
            })
            .await
    }
}

/// Entity columns are TEXT: strings are stored as-is, other JSON values as
/// their JSON text, nulls as NULL.
fn column_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl EventStore for MySqlStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        self.schema.prepare(pool).await
    }

    async fn insert_raw(&self, row: &RawLogRow) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&row.payload).context(EncodePayloadSnafu)?;
        let pool = self.pool().await?;

        sqlx::query(&self.schema.raw_insert_sql())
            .bind(&row.event_id)
            .bind(&row.event)
            .bind(&row.entity)
            .bind(payload)
            .bind(&row.tenant)
            .bind(row.delivery_method.as_str())
            .bind(row.processing_time_ms)
            .bind(row.created_at)
            .execute(pool)
            .await
            .context(StoreQuerySnafu {
                table: self.schema.raw_table(),
            })?;

        debug!(event_id = %row.event_id, "Raw log row inserted");
        Ok(())
    }

    async fn insert_entity(&self, row: &EntityRow) -> Result<(), StoreError> {
        let table = entity_table_name(&row.entity)?;
        let selected = self.schema.select_columns(&row.entity, &row.fields);

        let mut columns = vec![ACTION_COLUMN.to_string(), TENANT_COLUMN.to_string()];
        let mut values = vec![Some(row.event.clone()), Some(row.tenant.clone())];
        for (column, value) in selected {
            columns.push(column);
            values.push(column_text(value));
        }

        let pool = self.pool().await?;
        self.schema
            .ensure_entity_table(pool, &table, &columns)
            .await?;

        let sql = SchemaProvisioner::entity_insert_sql(&table, &columns);
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }
        query
            .execute(pool)
            .await
            .context(StoreQuerySnafu { table: &table })?;

        debug!(table = %table, columns = columns.len(), "Entity row inserted");
        Ok(())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("Store pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_url() {
        let err = MySqlStore::new(&StoreConfig::default()).err().unwrap();
        assert!(matches!(err, StoreError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_column_text() {
        assert_eq!(column_text(&json!(null)), None);
        assert_eq!(column_text(&json!("x")).as_deref(), Some("x"));
        assert_eq!(column_text(&json!(12)).as_deref(), Some("12"));
        assert_eq!(column_text(&json!(true)).as_deref(), Some("true"));
        assert_eq!(column_text(&json!({"a": 1})).as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_connect_error() {
        let config = StoreConfig {
            url: Some("mysql://relay@127.0.0.1:1/webhooks".to_string()),
            acquire_timeout_ms: 200,
            ..StoreConfig::default()
        };
        let store = MySqlStore::new(&config).unwrap();
        let err = store.prepare().await.unwrap_err();

        assert!(matches!(err, StoreError::StoreConnect { .. }));
        assert!(err.is_recoverable());
    }
}
