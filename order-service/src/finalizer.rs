use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::bus::{publish_json, EventPublisher};
use shared::inventory::{AvailabilityRule, ReservationService, ReserveOutcome};
use shared::retry::{Message, MessageHandler};
use shared::{OrderCreatedEvent, OrderUpdatedEvent};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::OrderStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Finalized,
    OnHold { available: i64 },
    NoInventoryRecord,
}

/// Moves freshly created orders to `new_order` once stock covers them.
pub struct OrderFinalizer {
    reservations: ReservationService,
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn EventPublisher>,
    updated_topic: String,
}

impl OrderFinalizer {
    pub fn new(
        reservations: ReservationService,
        store: Arc<dyn OrderStore>,
        publisher: Arc<dyn EventPublisher>,
        updated_topic: impl Into<String>,
    ) -> Self {
        Self {
            reservations,
            store,
            publisher,
            updated_topic: updated_topic.into(),
        }
    }

    /// Errors are transient dependency failures and worth retrying. A retry
    /// after a successful PUT reserves the stock again.
    pub async fn finalize(&self, event: &OrderCreatedEvent) -> Result<Finalization> {
        let outcome = match self
            .reservations
            .reserve(
                &event.tenant_id,
                &event.hub_id,
                &event.sku_id,
                i64::from(event.quantity),
                AvailabilityRule::OnHandLessReserved,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_missing_record() => {
                warn!(order_id = %event.order_id, "Leaving order on hold: {}", e);
                return Ok(Finalization::NoInventoryRecord);
            }
            Err(e) => return Err(e.into()),
        };

        if let ReserveOutcome::Insufficient { available } = outcome {
            info!(
                order_id = %event.order_id,
                available,
                requested = event.quantity,
                "Insufficient inventory, order stays on hold"
            );
            return Ok(Finalization::OnHold { available });
        }

        if !self.store.mark_new_order(event.order_id).await? {
            warn!(order_id = %event.order_id, "Order was not on hold, publishing update anyway");
        }

        let updated = OrderUpdatedEvent::finalized(event, Utc::now());
        publish_json(
            self.publisher.as_ref(),
            &self.updated_topic,
            &event.order_id.to_string(),
            &updated,
        )
        .await?;

        info!(order_id = %event.order_id, "Order finalized");
        Ok(Finalization::Finalized)
    }
}

#[async_trait]
impl MessageHandler for OrderFinalizer {
    async fn process(&self, message: &Message) -> Result<()> {
        let event: OrderCreatedEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(key = ?message.key, "Dropping undecodable order created event: {}", e);
                return Ok(());
            }
        };

        self.finalize(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderRequest;
    use crate::store::memory::MemoryOrderStore;
    use shared::retry::RetryHandler;
    use shared::testing::{RecordingPublisher, StaticInventory};
    use shared::{topics, OrderStatus};
    use std::time::Duration;

    struct Fixture {
        inventory: Arc<StaticInventory>,
        store: Arc<MemoryOrderStore>,
        publisher: Arc<RecordingPublisher>,
        finalizer: Arc<OrderFinalizer>,
    }

    fn fixture(inventory: StaticInventory) -> Fixture {
        let inventory = Arc::new(inventory);
        let store = Arc::new(MemoryOrderStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let finalizer = Arc::new(OrderFinalizer::new(
            ReservationService::new(inventory.clone()),
            store.clone(),
            publisher.clone(),
            topics::ORDER_UPDATED,
        ));
        Fixture { inventory, store, publisher, finalizer }
    }

    async fn created(store: &MemoryOrderStore, quantity: i32) -> OrderCreatedEvent {
        let request = OrderRequest {
            tenant_id: "t1".to_string(),
            seller_id: "s1".to_string(),
            hub_id: "h1".to_string(),
            sku_id: "k1".to_string(),
            quantity,
        };
        store
            .insert(request.into_new_order(Utc::now()))
            .await
            .unwrap()
            .created_event()
    }

    fn message(event: &OrderCreatedEvent) -> Message {
        Message::new(
            topics::ORDER_CREATED,
            Some(event.order_id.to_string()),
            serde_json::to_vec(event).unwrap(),
        )
    }

    async fn status(store: &MemoryOrderStore, event: &OrderCreatedEvent) -> String {
        store.find(event.order_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn exact_stock_finalizes_the_order() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 10, 0));
        let event = created(&f.store, 10).await;

        let result = f.finalizer.finalize(&event).await.unwrap();

        assert_eq!(result, Finalization::Finalized);
        assert_eq!(f.inventory.updates()[0].quantity, 0);
        assert_eq!(status(&f.store, &event).await, "new_order");

        let published = f.publisher.on_topic(topics::ORDER_UPDATED);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key.as_deref(), Some(event.order_id.to_string().as_str()));
        let updated: OrderUpdatedEvent = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(updated.status, OrderStatus::NewOrder);
        assert_eq!(updated.order_id, event.order_id);
        assert_eq!(updated.created_at, event.created_at);
    }

    #[tokio::test]
    async fn reserved_stock_keeps_the_order_on_hold() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 10, 4));
        let event = created(&f.store, 8).await;

        let result = f.finalizer.finalize(&event).await.unwrap();

        assert_eq!(result, Finalization::OnHold { available: 6 });
        assert!(f.inventory.updates().is_empty());
        assert_eq!(status(&f.store, &event).await, "on_hold");
        assert!(f.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn missing_inventory_record_is_not_retried() {
        let f = fixture(StaticInventory::new());
        let event = created(&f.store, 1).await;
        let handler = RetryHandler::new(f.finalizer.clone(), 3, Duration::from_millis(1));

        handler.process(&message(&event)).await.unwrap();

        assert_eq!(f.inventory.lookups(), 1);
        assert_eq!(status(&f.store, &event).await, "on_hold");
    }

    #[tokio::test]
    async fn lookup_failures_are_retried_then_surfaced() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 10, 0));
        f.inventory.fail_lookups(true);
        let event = created(&f.store, 1).await;
        let handler = RetryHandler::new(f.finalizer.clone(), 3, Duration::from_millis(1));

        let err = handler.process(&message(&event)).await.unwrap_err();

        assert!(format!("{:#}", err).contains("inventory lookup failed"));
        assert_eq!(f.inventory.lookups(), 3);
        assert_eq!(status(&f.store, &event).await, "on_hold");
    }

    #[tokio::test]
    async fn retry_after_status_failure_reserves_again() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 20, 0));
        f.store.fail_next_updates(1);
        let event = created(&f.store, 5).await;
        let handler = RetryHandler::new(f.finalizer.clone(), 3, Duration::from_millis(1));

        handler.process(&message(&event)).await.unwrap();

        assert_eq!(status(&f.store, &event).await, "new_order");
        assert_eq!(f.inventory.updates().len(), 2);
        assert_eq!(f.inventory.on_hand("h1", "k1"), Some(10));
    }

    #[tokio::test]
    async fn publish_failure_is_returned() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 10, 0));
        f.publisher.fail_topic(topics::ORDER_UPDATED);
        let event = created(&f.store, 1).await;

        assert!(f.finalizer.finalize(&event).await.is_err());
        assert_eq!(status(&f.store, &event).await, "new_order");
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let f = fixture(StaticInventory::new().with_stock("h1", "k1", 10, 0));

        f.finalizer
            .process(&Message::new(topics::ORDER_CREATED, None, b"not json".to_vec()))
            .await
            .unwrap();

        assert_eq!(f.inventory.lookups(), 0);
    }
}
