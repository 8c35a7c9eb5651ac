//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use hookrelay::error::{InvalidIdentifierSnafu, StoreError, StoreUnavailableSnafu};
use hookrelay::event::{Event, TenantDirectory};
use hookrelay::store::{EntityRow, EventStore, RawLogRow};

/// Event store double whose failures are scripted by the test.
#[derive(Default)]
pub struct ScriptedStore {
    failures_left: AtomicU32,
    offline: AtomicBool,
    invalid: AtomicBool,
    failing_entities: Mutex<HashSet<String>>,
    raw_attempts: AtomicUsize,
    raw: Mutex<Vec<RawLogRow>>,
    entities: Mutex<Vec<EntityRow>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` raw inserts, then succeed.
    pub fn failing(n: u32) -> Arc<Self> {
        let store = Self::default();
        store.failures_left.store(n, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn offline() -> Arc<Self> {
        let store = Self::default();
        store.offline.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    /// Fail every insert with an error that retrying cannot fix.
    pub fn rejecting() -> Arc<Self> {
        let store = Self::default();
        store.invalid.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Fail raw inserts for events of `entity`.
    pub fn fail_entity(&self, entity: &str) {
        self.failing_entities
            .lock()
            .unwrap()
            .insert(entity.to_string());
    }

    pub fn raw_attempts(&self) -> usize {
        self.raw_attempts.load(Ordering::SeqCst)
    }

    pub fn raw_rows(&self) -> Vec<RawLogRow> {
        self.raw.lock().unwrap().clone()
    }

    pub fn entity_rows(&self) -> Vec<EntityRow> {
        self.entities.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for ScriptedStore {
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_raw(&self, row: &RawLogRow) -> Result<(), StoreError> {
        self.raw_attempts.fetch_add(1, Ordering::SeqCst);

        if self.invalid.load(Ordering::SeqCst) {
            return InvalidIdentifierSnafu { name: "!!" }.fail();
        }
        if self.offline.load(Ordering::SeqCst)
            || self.failing_entities.lock().unwrap().contains(&row.entity)
        {
            return StoreUnavailableSnafu { message: "store offline" }.fail();
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return StoreUnavailableSnafu {
                message: "scripted failure",
            }
            .fail();
        }

        self.raw.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn insert_entity(&self, row: &EntityRow) -> Result<(), StoreError> {
        self.entities.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn close(&self) {}
}

pub fn webhook(entity: &str, action: &str) -> Value {
    json!({
        "meta": {"action": action, "entity": entity, "company_id": 13881612},
        "current": {"id": 42, "title": "Big deal", "value": 1000}
    })
}

pub fn event(entity: &str) -> Event {
    Event::from_webhook(
        &webhook(entity, "added"),
        &TenantDirectory::default(),
        Utc::now(),
    )
    .unwrap()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
