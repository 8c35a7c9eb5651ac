//! Table and column provisioning.
//!
//! Entity tables start with only their bookkeeping columns and grow one TEXT
//! column per payload key the first time that key is seen. Known columns are
//! cached per process, so the information schema is read once per table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use snafu::prelude::*;
use sqlx::MySqlPool;
use tracing::{debug, info};

use crate::config::TableConfig;
use crate::error::{InvalidIdentifierSnafu, StoreError, StoreQuerySnafu};

/// MySQL identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 64;

const ENTITY_TABLE_PREFIX: &str = "webhook_";

/// Entity table column holding the webhook action.
pub const ACTION_COLUMN: &str = "_event";

/// Entity table column holding the resolved tenant label.
pub const TENANT_COLUMN: &str = "_tenant";

/// Bookkeeping columns a payload key may never write.
const RESERVED_COLUMNS: [&str; 4] = ["_row_id", "_received_at", ACTION_COLUMN, TENANT_COLUMN];

/// SQLSTATE for "duplicate column name".
const DUPLICATE_COLUMN: &str = "42S21";

/// Map an arbitrary name onto lowercase `[a-z0-9_]`, at most 64 characters.
/// Returns `None` if nothing usable remains.
///
/// MySQL column names are case-insensitive, so `Title` and `title` must land
/// on the same column.
pub fn sanitize_identifier(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_IDENTIFIER_LEN)
        .collect();

    cleaned
        .chars()
        .any(|c| c.is_ascii_alphanumeric())
        .then_some(cleaned)
}

/// `webhook_<entity>`, sanitized.
pub fn entity_table_name(entity: &str) -> Result<String, StoreError> {
    let entity = sanitize_identifier(entity).context(InvalidIdentifierSnafu { name: entity })?;
    let mut table = format!("{ENTITY_TABLE_PREFIX}{entity}");
    table.truncate(MAX_IDENTIFIER_LEN);
    Ok(table)
}

fn is_duplicate_column(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == DUPLICATE_COLUMN)
}

/// Creates tables and columns on demand.
pub struct SchemaProvisioner {
    raw_table: String,
    tables: BTreeMap<String, TableConfig>,
    known: Mutex<HashMap<String, HashSet<String>>>,
}

impl SchemaProvisioner {
    pub fn new(
        raw_table: &str,
        tables: BTreeMap<String, TableConfig>,
    ) -> Result<Self, StoreError> {
        let raw_table =
            sanitize_identifier(raw_table).context(InvalidIdentifierSnafu { name: raw_table })?;
        Ok(Self {
            raw_table,
            tables,
            known: Mutex::new(HashMap::new()),
        })
    }

    pub fn raw_table(&self) -> &str {
        &self.raw_table
    }

    pub fn raw_table_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS `{}` (\
             id BIGINT AUTO_INCREMENT PRIMARY KEY, \
             event_id VARCHAR(191) NOT NULL, \
             event VARCHAR(255) NOT NULL, \
             entity VARCHAR(255) NOT NULL, \
             payload JSON NOT NULL, \
             tenant VARCHAR(255) NOT NULL, \
             delivery_method VARCHAR(32) NOT NULL, \
             processing_time_ms BIGINT NOT NULL, \
             created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3), \
             INDEX idx_event_id (event_id))",
            self.raw_table
        )
    }

    pub fn raw_insert_sql(&self) -> String {
        format!(
            "INSERT INTO `{}` (event_id, event, entity, payload, tenant, delivery_method, \
             processing_time_ms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.raw_table
        )
    }

    /// Bookkeeping columns are underscore-prefixed so payload keys such as
    /// `id` never collide with them.
    pub fn entity_table_ddl(table: &str, columns: &[String]) -> String {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS `{table}` (\
             _row_id BIGINT AUTO_INCREMENT PRIMARY KEY, \
             _received_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3), \
             `{ACTION_COLUMN}` VARCHAR(255) NULL, \
             `{TENANT_COLUMN}` VARCHAR(255) NULL"
        );
        for column in columns {
            ddl.push_str(&format!(", `{column}` TEXT NULL"));
        }
        ddl.push(')');
        ddl
    }

    pub fn add_column_ddl(table: &str, column: &str) -> String {
        format!("ALTER TABLE `{table}` ADD COLUMN `{column}` TEXT NULL")
    }

    pub fn entity_insert_sql(table: &str, columns: &[String]) -> String {
        let names = columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!("INSERT INTO `{table}` ({names}) VALUES ({placeholders})")
    }

    /// Payload fields to write for `entity`, keyed by column name.
    ///
    /// Keys without a usable identifier or naming a bookkeeping column are
    /// dropped, as are keys outside the configured columns when the table
    /// restricts them. Keys equal up to case share one column.
    pub fn select_columns<'a>(
        &self,
        entity: &str,
        fields: &'a Map<String, Value>,
    ) -> BTreeMap<String, &'a Value> {
        let allowed: Option<HashSet<String>> = self
            .tables
            .get(entity)
            .filter(|table| table.restrict_columns)
            .map(|table| {
                table
                    .columns
                    .iter()
                    .filter_map(|c| sanitize_identifier(c))
                    .collect()
            });

        fields
            .iter()
            .filter_map(|(key, value)| sanitize_identifier(key).map(|column| (column, value)))
            .filter(|(column, _)| !RESERVED_COLUMNS.contains(&column.as_str()))
            .filter(|(column, _)| allowed.as_ref().is_none_or(|a| a.contains(column)))
            .collect()
    }

    fn known(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Columns not yet known for `table`, or `None` if the table has not
    /// been loaded this process.
    pub fn missing_columns(&self, table: &str, columns: &[String]) -> Option<Vec<String>> {
        let known = self.known();
        let existing = known.get(table)?;
        Some(
            columns
                .iter()
                .filter(|c| !existing.contains(c.as_str()))
                .cloned()
                .collect(),
        )
    }

    pub fn remember<I>(&self, table: &str, columns: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.known()
            .entry(table.to_string())
            .or_default()
            .extend(columns);
    }

    /// Create the raw log table and every configured entity table.
    pub async fn prepare(&self, pool: &MySqlPool) -> Result<(), StoreError> {
        sqlx::query(&self.raw_table_ddl())
            .execute(pool)
            .await
            .context(StoreQuerySnafu {
                table: self.raw_table.clone(),
            })?;
        info!(table = %self.raw_table, "Raw log table ready");

        for (entity, config) in &self.tables {
            let table = entity_table_name(entity)?;
            let columns: Vec<String> = config
                .columns
                .iter()
                .filter_map(|c| sanitize_identifier(c))
                .collect();
            self.ensure_entity_table(pool, &table, &columns).await?;
            info!(table = %table, columns = columns.len(), "Entity table ready");
        }
        Ok(())
    }

    /// Make sure `table` exists with at least `columns`.
    pub async fn ensure_entity_table(
        &self,
        pool: &MySqlPool,
        table: &str,
        columns: &[String],
    ) -> Result<(), StoreError> {
        let missing = match self.missing_columns(table, columns) {
            Some(missing) => missing,
            None => {
                sqlx::query(&Self::entity_table_ddl(table, &[]))
                    .execute(pool)
                    .await
                    .context(StoreQuerySnafu { table })?;

                let existing = sqlx::query_scalar::<_, String>(
                    "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                )
                .bind(table)
                .fetch_all(pool)
                .await
                .context(StoreQuerySnafu { table })?;
                debug!(table, columns = existing.len(), "Loaded table columns");

                self.remember(table, existing.iter().map(|c| c.to_ascii_lowercase()));
                self.missing_columns(table, columns).unwrap_or_default()
            }
        };

        for column in missing {
            match sqlx::query(&Self::add_column_ddl(table, &column))
                .execute(pool)
                .await
            {
                Ok(_) => info!(table, column = %column, "Column added"),
                // Another writer added it first.
                Err(e) if is_duplicate_column(&e) => {}
                Err(source) => return Err(source).context(StoreQuerySnafu { table }),
            }
            self.remember(table, [column]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provisioner(tables: BTreeMap<String, TableConfig>) -> SchemaProvisioner {
        SchemaProvisioner::new("webhook_full_log", tables).unwrap()
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("title").as_deref(), Some("title"));
        assert_eq!(
            sanitize_identifier("custom field-1").as_deref(),
            Some("custom_field_1")
        );
        assert_eq!(sanitize_identifier("a`; DROP").as_deref(), Some("a___drop"));
        assert_eq!(sanitize_identifier("Title").as_deref(), Some("title"));
        assert_eq!(sanitize_identifier("---"), None);
        assert_eq!(sanitize_identifier(""), None);
        assert_eq!(sanitize_identifier(&"x".repeat(100)).unwrap().len(), 64);
    }

    #[test]
    fn test_entity_table_name() {
        assert_eq!(entity_table_name("deal").unwrap(), "webhook_deal");
        assert_eq!(
            entity_table_name(&"e".repeat(80)).unwrap().len(),
            MAX_IDENTIFIER_LEN
        );
        assert!(matches!(
            entity_table_name("!!"),
            Err(StoreError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_invalid_raw_table_rejected() {
        assert!(SchemaProvisioner::new("", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_ddl_and_insert_sql() {
        let p = provisioner(BTreeMap::new());
        assert!(
            p.raw_table_ddl()
                .starts_with("CREATE TABLE IF NOT EXISTS `webhook_full_log`")
        );
        assert!(p.raw_table_ddl().contains("payload JSON NOT NULL"));

        let columns = vec!["id".to_string(), "title".to_string()];
        let ddl = SchemaProvisioner::entity_table_ddl("webhook_deal", &columns);
        assert!(ddl.contains("`id` TEXT NULL"));
        assert!(ddl.contains("_row_id BIGINT AUTO_INCREMENT PRIMARY KEY"));
        assert!(ddl.contains("`_event` VARCHAR(255) NULL"));
        assert!(ddl.contains("`_tenant` VARCHAR(255) NULL"));

        assert_eq!(
            SchemaProvisioner::entity_insert_sql("webhook_deal", &columns),
            "INSERT INTO `webhook_deal` (`id`, `title`) VALUES (?, ?)"
        );
        assert_eq!(
            SchemaProvisioner::add_column_ddl("webhook_deal", "stage"),
            "ALTER TABLE `webhook_deal` ADD COLUMN `stage` TEXT NULL"
        );
    }

    #[test]
    fn test_select_columns_without_allow_list() {
        let p = provisioner(BTreeMap::new());
        let fields = json!({"id": 1, "custom field": "x", "$$": 2});
        let selected = p.select_columns("deal", fields.as_object().unwrap());

        let names: Vec<&str> = selected.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["custom_field", "id"]);
    }

    #[test]
    fn test_select_columns_folds_case() {
        let p = provisioner(BTreeMap::new());
        let fields = json!({"Title": "a", "title": "b", "ID": 1});
        let selected = p.select_columns("deal", fields.as_object().unwrap());

        let names: Vec<&str> = selected.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["id", "title"]);
    }

    #[test]
    fn test_select_columns_skips_bookkeeping_names() {
        let p = provisioner(BTreeMap::new());
        let fields = json!({"_tenant": "x", "_row_id": 9, "_event": "y", "id": 1});
        let selected = p.select_columns("deal", fields.as_object().unwrap());

        let names: Vec<&str> = selected.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["id"]);
    }

    #[test]
    fn test_select_columns_with_allow_list() {
        let tables = BTreeMap::from([(
            "deal".to_string(),
            TableConfig {
                columns: vec!["id".to_string(), "title".to_string()],
                restrict_columns: true,
            },
        )]);
        let p = provisioner(tables);
        let fields = json!({"id": 1, "title": "t", "stage": 3});

        let selected = p.select_columns("deal", fields.as_object().unwrap());
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains_key("stage"));

        // other entities are unrestricted
        let selected = p.select_columns("person", fields.as_object().unwrap());
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_missing_columns_tracks_known_set() {
        let p = provisioner(BTreeMap::new());
        let wanted = vec!["id".to_string(), "title".to_string()];

        assert_eq!(p.missing_columns("webhook_deal", &wanted), None);

        p.remember("webhook_deal", ["_row_id".to_string(), "id".to_string()]);
        assert_eq!(
            p.missing_columns("webhook_deal", &wanted),
            Some(vec!["title".to_string()])
        );

        p.remember("webhook_deal", ["title".to_string()]);
        assert_eq!(p.missing_columns("webhook_deal", &wanted), Some(vec![]));
    }
}
