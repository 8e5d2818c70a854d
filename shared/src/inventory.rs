//! The inventory service boundary.
//!
//! [`InventoryClient`] mirrors the service's GET/PUT contract. Everything that
//! decrements stock goes through [`ReservationService`], so the check-then-set
//! sequence lives in one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub hub_id: String,
    pub sku_id: String,
    pub quantity_on_hand: i64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub quantity_reserved: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

impl InventorySnapshot {
    /// Never negative and never more than what is on hand.
    pub fn available(&self, rule: AvailabilityRule) -> i64 {
        let on_hand = self.quantity_on_hand.max(0);
        match rule {
            AvailabilityRule::OnHand => on_hand,
            AvailabilityRule::OnHandLessReserved => on_hand.saturating_sub(self.quantity_reserved.max(0)),
        }
    }
}

/// Body of `PUT /inventory`. `quantity` is the new absolute on-hand figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub tenant_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i64,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory lookup failed: {0}")]
    Lookup(String),
    #[error("no inventory record for hub {hub_id} / sku {sku_id}")]
    NotFound { hub_id: String, sku_id: String },
    #[error("{count} inventory records for hub {hub_id} / sku {sku_id}, expected exactly one")]
    Ambiguous {
        hub_id: String,
        sku_id: String,
        count: usize,
    },
    #[error("inventory update failed: {0}")]
    Update(String),
}

impl InventoryError {
    /// True when the service answered but the hub/SKU does not resolve to a
    /// single record. Retrying will not change that.
    pub fn is_missing_record(&self) -> bool {
        matches!(self, InventoryError::NotFound { .. } | InventoryError::Ambiguous { .. })
    }
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn lookup(&self, hub_id: &str, sku_id: &str) -> Result<Vec<InventorySnapshot>, InventoryError>;

    async fn set_on_hand(&self, update: &InventoryUpdate) -> Result<(), InventoryError>;
}

pub struct HttpInventoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInventoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn lookup(&self, hub_id: &str, sku_id: &str) -> Result<Vec<InventorySnapshot>, InventoryError> {
        let url = format!("{}/inventory", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("hub_id", hub_id), ("sku_ids", sku_id)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| InventoryError::Lookup(e.to_string()))?;

        response
            .json::<Vec<InventorySnapshot>>()
            .await
            .map_err(|e| InventoryError::Lookup(format!("undecodable inventory response: {}", e)))
    }

    async fn set_on_hand(&self, update: &InventoryUpdate) -> Result<(), InventoryError> {
        let url = format!("{}/inventory", self.base_url);
        self.client
            .put(&url)
            .json(update)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| InventoryError::Update(e.to_string()))?;
        Ok(())
    }
}

/// How much of a snapshot counts as available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityRule {
    OnHand,
    OnHandLessReserved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { on_hand_before: i64, on_hand_after: i64 },
    Insufficient { available: i64 },
}

/// Single entry point for decrementing stock.
///
/// Order intake and the finalizer each reserve against the figure they read,
/// so an order accepted through intake is deducted twice. The lookup and the
/// PUT are separate calls with no version check: concurrent reservations on the
/// same hub/SKU can overwrite each other.
#[derive(Clone)]
pub struct ReservationService {
    client: Arc<dyn InventoryClient>,
}

impl ReservationService {
    pub fn new(client: Arc<dyn InventoryClient>) -> Self {
        Self { client }
    }

    /// Exactly one record for the hub/SKU, or an error saying why not.
    pub async fn snapshot(&self, hub_id: &str, sku_id: &str) -> Result<InventorySnapshot, InventoryError> {
        let mut records = self.client.lookup(hub_id, sku_id).await?;
        match records.len() {
            1 => Ok(records.remove(0)),
            0 => Err(InventoryError::NotFound {
                hub_id: hub_id.to_string(),
                sku_id: sku_id.to_string(),
            }),
            count => Err(InventoryError::Ambiguous {
                hub_id: hub_id.to_string(),
                sku_id: sku_id.to_string(),
                count,
            }),
        }
    }

    pub async fn reserve(
        &self,
        tenant_id: &str,
        hub_id: &str,
        sku_id: &str,
        quantity: i64,
        rule: AvailabilityRule,
    ) -> Result<ReserveOutcome, InventoryError> {
        let snapshot = self.snapshot(hub_id, sku_id).await?;
        let available = snapshot.available(rule);
        let on_hand_after = match snapshot.quantity_on_hand.checked_sub(quantity) {
            Some(after) if available >= quantity && after >= 0 => after,
            _ => return Ok(ReserveOutcome::Insufficient { available }),
        };
        self.client
            .set_on_hand(&InventoryUpdate {
                tenant_id: tenant_id.to_string(),
                hub_id: hub_id.to_string(),
                sku_id: sku_id.to_string(),
                quantity: on_hand_after,
            })
            .await?;

        debug!(hub_id, sku_id, quantity, on_hand_after, "Inventory reserved");
        Ok(ReserveOutcome::Reserved {
            on_hand_before: snapshot.quantity_on_hand,
            on_hand_after,
        })
    }
}
