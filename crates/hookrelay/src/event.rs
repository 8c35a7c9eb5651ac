//! The event model: one accepted webhook and the identifiers derived from it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::{MissingFieldSnafu, NotAnObjectSnafu, ValidationError};

/// Placeholder for missing parts of a message key or header.
pub const UNKNOWN: &str = "unknown";

/// Longest entity or action segment kept in an id.
const MAX_ID_SEGMENT: usize = 64;

/// Globally unique event identifier: `<entity>-<action>-<unix millis>-<8 hex>`.
///
/// The entity and action segments are reduced to `[A-Za-z0-9_]` and capped
/// at 64 characters so an id is always usable as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh id for an event received at `at`.
    pub fn generate(entity: &str, action: &str, at: DateTime<Utc>) -> Self {
        let suffix: u32 = rand::random();
        Self(format!(
            "{}-{}-{}-{suffix:08x}",
            id_segment(entity),
            id_segment(action),
            at.timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn id_segment(value: &str) -> String {
    value
        .chars()
        .take(MAX_ID_SEGMENT)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an event is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryState {
    #[default]
    Undelivered,
    Delivered,
    /// Retries exhausted; waiting on the dead-letter topic.
    Parked,
}

/// Which tier recorded an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMethod {
    Broker,
    DirectStore,
    File,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Broker => "broker",
            DeliveryMethod::DirectStore => "direct-store",
            DeliveryMethod::File => "file",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated webhook and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub entity: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    pub tenant: String,
    /// Flat merge of the body, `previous` and `meta` objects.
    pub payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
    pub processing_start_time: DateTime<Utc>,
    #[serde(default)]
    pub delivery_state: DeliveryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_method: Option<DeliveryMethod>,
    /// Consumer-side failures so far; carried on re-published copies.
    #[serde(default)]
    pub attempts: u32,
}

impl Event {
    /// Build an event from a raw webhook body.
    ///
    /// The body must be an object with `meta.action` and `meta.entity`. The
    /// company id is read from `meta.company_id` or `meta.companyId`.
    pub fn from_webhook(
        body: &Value,
        tenants: &TenantDirectory,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let body = body.as_object().context(NotAnObjectSnafu)?;
        let meta = body.get("meta").and_then(Value::as_object);

        let action = required_text(meta, "action")?;
        let entity = required_text(meta, "entity")?;
        let company_id = meta.and_then(|meta| {
            meta.get("company_id")
                .or_else(|| meta.get("companyId"))
                .and_then(scalar_text)
        });

        let mut payload = Map::new();
        let sections = [
            body.get("current").or_else(|| body.get("data")),
            body.get("previous"),
            body.get("meta"),
        ];
        for section in sections.into_iter().flatten() {
            if let Some(fields) = section.as_object() {
                payload.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        Ok(Self {
            id: EventId::generate(&entity, &action, now),
            tenant: tenants.resolve(company_id.as_deref()).to_string(),
            entity,
            action,
            company_id,
            payload,
            received_at: now,
            processing_start_time: now,
            delivery_state: DeliveryState::Undelivered,
            delivery_method: None,
            attempts: 0,
        })
    }

    /// Broker message key: `<entity>-<companyId>`.
    pub fn message_key(&self) -> String {
        format!(
            "{}-{}",
            non_empty_or_unknown(&self.entity),
            self.company_id.as_deref().unwrap_or(UNKNOWN)
        )
    }

    /// Headers attached to every broker message carrying this event.
    pub fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            (
                "entity".to_string(),
                non_empty_or_unknown(&self.entity).to_string(),
            ),
            (
                "action".to_string(),
                non_empty_or_unknown(&self.action).to_string(),
            ),
            (
                "companyId".to_string(),
                self.company_id.as_deref().unwrap_or(UNKNOWN).to_string(),
            ),
        ])
    }

    pub fn is_delete(&self) -> bool {
        self.action.eq_ignore_ascii_case("delete") || self.action.eq_ignore_ascii_case("deleted")
    }

    /// A copy stamped with the tier about to record it.
    pub fn stamped(&self, method: DeliveryMethod) -> Self {
        let mut event = self.clone();
        event.delivery_method = Some(method);
        event
    }
}

fn non_empty_or_unknown(value: &str) -> &str {
    if value.is_empty() { UNKNOWN } else { value }
}

fn required_text(
    meta: Option<&Map<String, Value>>,
    field: &'static str,
) -> Result<String, ValidationError> {
    meta.and_then(|meta| meta.get(field))
        .and_then(scalar_text)
        .context(MissingFieldSnafu { field })
}

/// Strings and numbers as trimmed text; blanks and other types are absent.
fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Static company id to tenant label lookup.
#[derive(Debug, Clone)]
pub struct TenantDirectory {
    default_label: String,
    labels: BTreeMap<i64, String>,
}

impl TenantDirectory {
    pub fn new(default_label: String, labels: BTreeMap<i64, String>) -> Self {
        Self {
            default_label,
            labels,
        }
    }

    /// Resolve a company id; unknown, missing and non-numeric ids get the
    /// default label.
    pub fn resolve(&self, company_id: Option<&str>) -> &str {
        company_id
            .and_then(|id| id.trim().parse::<i64>().ok())
            .and_then(|id| self.labels.get(&id))
            .unwrap_or(&self.default_label)
    }
}

impl Default for TenantDirectory {
    fn default() -> Self {
        crate::config::TenantsConfig::default().directory()
    }
}
