use chrono::Utc;
use shared::bus::{publish_json, EventPublisher};
use shared::inventory::{AvailabilityRule, InventoryError, ReservationService, ReserveOutcome};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{Order, OrderRequest, ValidationError};
use crate::store::OrderStore;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("inventory unavailable: {0}")]
    InventoryUnavailable(InventoryError),
    #[error("insufficient inventory: {available} available, {requested} requested")]
    InsufficientInventory { available: i64, requested: i32 },
    #[error("inventory update failed: {0}")]
    InventoryUpdateFailed(InventoryError),
    #[error("failed to persist order: {0:#}")]
    Persistence(anyhow::Error),
}

/// Accepts single orders: validate, reserve stock, persist `on_hold`, announce.
pub struct OrderIntake {
    reservations: ReservationService,
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn EventPublisher>,
    created_topic: String,
}

impl OrderIntake {
    pub fn new(
        reservations: ReservationService,
        store: Arc<dyn OrderStore>,
        publisher: Arc<dyn EventPublisher>,
        created_topic: impl Into<String>,
    ) -> Self {
        Self {
            reservations,
            store,
            publisher,
            created_topic: created_topic.into(),
        }
    }

    pub async fn create_order(&self, request: OrderRequest) -> Result<Uuid, IntakeError> {
        let request = request.trimmed();
        request.validate()?;

        let outcome = self
            .reservations
            .reserve(
                &request.tenant_id,
                &request.hub_id,
                &request.sku_id,
                i64::from(request.quantity),
                AvailabilityRule::OnHand,
            )
            .await
            .map_err(|e| match e {
                InventoryError::Update(_) => IntakeError::InventoryUpdateFailed(e),
                other => IntakeError::InventoryUnavailable(other),
            })?;

        if let ReserveOutcome::Insufficient { available } = outcome {
            return Err(IntakeError::InsufficientInventory {
                available,
                requested: request.quantity,
            });
        }

        let order = self
            .store
            .insert(request.into_new_order(Utc::now()))
            .await
            .map_err(IntakeError::Persistence)?;

        info!(order_id = %order.id, tenant_id = %order.tenant_id, "Order created");

        if let Err(e) = announce_created(self.publisher.as_ref(), &self.created_topic, &order).await {
            error!(order_id = %order.id, "Error publishing order created event: {:#}", e);
        }

        Ok(order.id)
    }
}

/// Publishes the `order.created` event for a freshly persisted order, keyed by its id.
pub async fn announce_created(
    publisher: &dyn EventPublisher,
    topic: &str,
    order: &Order,
) -> anyhow::Result<()> {
    publish_json(publisher, topic, &order.id.to_string(), &order.created_event()).await
}
