use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

pub mod bus;
pub mod inventory;
pub mod retry;
pub mod shutdown;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub mod topics {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_UPDATED: &str = "order.updated";
    pub const WEBHOOK_FAILED: &str = "webhook.failed";
    pub const BULK_ORDERS: &str = "order.bulk";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    OnHold,
    NewOrder,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::OnHold => "on_hold",
            OrderStatus::NewOrder => "new_order",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: Uuid,
    pub tenant_id: String,
    pub seller_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdatedEvent {
    pub order_id: Uuid,
    pub tenant_id: String,
    pub seller_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderUpdatedEvent {
    pub fn finalized(created: &OrderCreatedEvent, updated_at: DateTime<Utc>) -> Self {
        Self {
            order_id: created.order_id,
            tenant_id: created.tenant_id.clone(),
            seller_id: created.seller_id.clone(),
            hub_id: created.hub_id.clone(),
            sku_id: created.sku_id.clone(),
            quantity: created.quantity,
            status: OrderStatus::NewOrder,
            created_at: created.created_at,
            updated_at,
        }
    }
}

/// Dead-letter record for one failed webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeliveryFailure {
    pub subscription_id: Uuid,
    pub event: String,
    pub callback_url: String,
    pub error: String,
    pub payload: Value,
}

/// Points the bulk worker at an uploaded CSV object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkIngestionJob {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("payload carries no tenant_id")]
    MissingTenant,
    #[error("invalid {event} payload: {source}")]
    Schema {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An order lifecycle event, decoded by the name it was published under.
///
/// Names without a dedicated decoder are kept as raw JSON so new event types
/// can be fanned out without a code change.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    OrderCreated(OrderCreatedEvent),
    OrderUpdated(OrderUpdatedEvent),
    Other { name: String, payload: Value },
}

impl LifecycleEvent {
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self, EventDecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(EventDecodeError::Malformed)?;
        if value.get("tenant_id").and_then(Value::as_str).is_none() {
            return Err(EventDecodeError::MissingTenant);
        }

        let schema = |source| EventDecodeError::Schema {
            event: name.to_string(),
            source,
        };
        match name {
            topics::ORDER_CREATED => serde_json::from_value(value)
                .map(LifecycleEvent::OrderCreated)
                .map_err(schema),
            topics::ORDER_UPDATED => serde_json::from_value(value)
                .map(LifecycleEvent::OrderUpdated)
                .map_err(schema),
            _ => Ok(LifecycleEvent::Other {
                name: name.to_string(),
                payload: value,
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LifecycleEvent::OrderCreated(_) => topics::ORDER_CREATED,
            LifecycleEvent::OrderUpdated(_) => topics::ORDER_UPDATED,
            LifecycleEvent::Other { name, .. } => name,
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            LifecycleEvent::OrderCreated(e) => &e.tenant_id,
            LifecycleEvent::OrderUpdated(e) => &e.tenant_id,
            LifecycleEvent::Other { payload, .. } => payload
                .get("tenant_id")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        }
    }

    /// The `data` half of a webhook body.
    pub fn data(&self) -> serde_json::Result<Value> {
        match self {
            LifecycleEvent::OrderCreated(e) => serde_json::to_value(e),
            LifecycleEvent::OrderUpdated(e) => serde_json::to_value(e),
            LifecycleEvent::Other { payload, .. } => Ok(payload.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn created_payload() -> Value {
        json!({
            "order_id": "6f1c1a52-6a0e-4a4e-9d55-0d8d1c1f2b11",
            "tenant_id": "t1",
            "seller_id": "s1",
            "hub_id": "h1",
            "sku_id": "k1",
            "quantity": 5,
            "created_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn decodes_order_created_by_name() {
        let bytes = serde_json::to_vec(&created_payload()).unwrap();
        let event = LifecycleEvent::decode(topics::ORDER_CREATED, &bytes).unwrap();

        assert_eq!(event.name(), "order.created");
        assert_eq!(event.tenant_id(), "t1");
        match event {
            LifecycleEvent::OrderCreated(e) => assert_eq!(e.quantity, 5),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn unknown_names_keep_the_raw_payload() {
        let payload = json!({"tenant_id": "t9", "note": "hello"});
        let bytes = serde_json::to_vec(&payload).unwrap();
        let event = LifecycleEvent::decode("order.cancelled", &bytes).unwrap();

        assert_eq!(event.name(), "order.cancelled");
        assert_eq!(event.tenant_id(), "t9");
        assert_eq!(event.data().unwrap(), payload);
    }

    #[test]
    fn missing_tenant_is_reported_before_schema_checks() {
        let bytes = serde_json::to_vec(&json!({"order_id": "x"})).unwrap();
        let err = LifecycleEvent::decode(topics::ORDER_UPDATED, &bytes).unwrap_err();
        assert!(matches!(err, EventDecodeError::MissingTenant));

        let err = LifecycleEvent::decode(topics::ORDER_UPDATED, b"not json").unwrap_err();
        assert!(matches!(err, EventDecodeError::Malformed(_)));
    }

    #[test]
    fn known_name_with_wrong_shape_is_a_schema_error() {
        let bytes = serde_json::to_vec(&json!({"tenant_id": "t1", "quantity": "many"})).unwrap();
        let err = LifecycleEvent::decode(topics::ORDER_CREATED, &bytes).unwrap_err();
        assert!(matches!(err, EventDecodeError::Schema { .. }));
    }

    #[test]
    fn finalized_event_carries_order_attributes() {
        let created: OrderCreatedEvent = serde_json::from_value(created_payload()).unwrap();
        let now = Utc::now();
        let updated = OrderUpdatedEvent::finalized(&created, now);

        assert_eq!(updated.order_id, created.order_id);
        assert_eq!(updated.quantity, 5);
        assert_eq!(updated.status, OrderStatus::NewOrder);
        assert_eq!(updated.updated_at, now);
        assert_eq!(
            serde_json::to_value(&updated).unwrap()["status"],
            json!("new_order")
        );
    }

    #[test]
    fn status_column_form_matches_its_wire_form() {
        for status in [OrderStatus::OnHold, OrderStatus::NewOrder] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
            assert_eq!(status.to_string(), status.as_str());
        }
        assert!(serde_json::from_str::<OrderStatus>("\"cancelled\"").is_err());
    }
}
