//! In-memory stand-ins for the bus and the inventory service.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::bus::EventPublisher;
use crate::inventory::{InventoryClient, InventoryError, InventorySnapshot, InventoryUpdate};
use crate::retry::Message;

/// Records every publish; topics can be switched to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Message>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing.lock().unwrap().insert(topic.to_string());
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        if self.failing.lock().unwrap().contains(topic) {
            anyhow::bail!("broker unavailable for {}", topic);
        }
        self.published
            .lock()
            .unwrap()
            .push(Message::new(topic, Some(key.to_string()), payload.to_vec()));
        Ok(())
    }
}

/// A fixed set of inventory records. `set_on_hand` overwrites the first
/// matching record, like the real service's absolute PUT.
#[derive(Default)]
pub struct StaticInventory {
    records: Mutex<Vec<InventorySnapshot>>,
    updates: Mutex<Vec<InventoryUpdate>>,
    lookups: Mutex<usize>,
    fail_lookups: AtomicBool,
    fail_updates: AtomicBool,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(self, hub_id: &str, sku_id: &str, on_hand: i64, reserved: i64) -> Self {
        self.records.lock().unwrap().push(InventorySnapshot {
            hub_id: hub_id.to_string(),
            sku_id: sku_id.to_string(),
            quantity_on_hand: on_hand,
            quantity_reserved: reserved,
            updated_at: None,
        });
        self
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<InventoryUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }

    pub fn on_hand(&self, hub_id: &str, sku_id: &str) -> Option<i64> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.hub_id == hub_id && r.sku_id == sku_id)
            .map(|r| r.quantity_on_hand)
    }
}

#[async_trait]
impl InventoryClient for StaticInventory {
    async fn lookup(&self, hub_id: &str, sku_id: &str) -> Result<Vec<InventorySnapshot>, InventoryError> {
        *self.lookups.lock().unwrap() += 1;
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(InventoryError::Lookup("connection refused".to_string()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.hub_id == hub_id && r.sku_id == sku_id)
            .cloned()
            .collect())
    }

    async fn set_on_hand(&self, update: &InventoryUpdate) -> Result<(), InventoryError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(InventoryError::Update("503 Service Unavailable".to_string()));
        }
        self.updates.lock().unwrap().push(update.clone());
        if let Some(record) = self
            .records
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.hub_id == update.hub_id && r.sku_id == update.sku_id)
        {
            record.quantity_on_hand = update.quantity;
        }
        Ok(())
    }
}
