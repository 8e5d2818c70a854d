use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use shared::*;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: String,
    pub seller_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub tenant_id: String,
    pub seller_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn created_event(&self) -> OrderCreatedEvent {
        OrderCreatedEvent {
            order_id: self.id,
            tenant_id: self.tenant_id.clone(),
            seller_id: self.seller_id.clone(),
            hub_id: self.hub_id.clone(),
            sku_id: self.sku_id.clone(),
            quantity: self.quantity,
            created_at: self.created_at,
        }
    }
}

impl From<NewOrder> for Order {
    fn from(order: NewOrder) -> Self {
        Self {
            id: order.id,
            tenant_id: order.tenant_id,
            seller_id: order.seller_id,
            hub_id: order.hub_id,
            sku_id: order.sku_id,
            quantity: order.quantity,
            status: order.status,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("quantity must be greater than zero, got {0}")]
    NonPositiveQuantity(i32),
    #[error("quantity {0:?} is not a whole number")]
    NonNumericQuantity(String),
    #[error("{0} is not valid UTF-8")]
    Encoding(&'static str),
}

/// One order as submitted, before it has an id or a status.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRequest {
    pub tenant_id: String,
    pub seller_id: String,
    pub hub_id: String,
    pub sku_id: String,
    pub quantity: i32,
}

impl OrderRequest {
    /// Identifiers without surrounding whitespace, the form they are stored in.
    pub fn trimmed(self) -> Self {
        Self {
            tenant_id: self.tenant_id.trim().to_string(),
            seller_id: self.seller_id.trim().to_string(),
            hub_id: self.hub_id.trim().to_string(),
            sku_id: self.sku_id.trim().to_string(),
            quantity: self.quantity,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let identifiers = [
            ("tenant_id", &self.tenant_id),
            ("seller_id", &self.seller_id),
            ("hub_id", &self.hub_id),
            ("sku_id", &self.sku_id),
        ];
        for (name, value) in identifiers {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(name));
            }
        }
        if self.quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity(self.quantity));
        }
        Ok(())
    }

    /// An `on_hold` order with a fresh id. Callers validate first.
    pub fn into_new_order(self, now: DateTime<Utc>) -> NewOrder {
        NewOrder {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            seller_id: self.seller_id,
            hub_id: self.hub_id,
            sku_id: self.sku_id,
            quantity: self.quantity,
            status: OrderStatus::OnHold.as_str().to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
