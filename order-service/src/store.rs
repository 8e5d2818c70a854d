use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use shared::OrderStatus;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilter {
    pub tenant_id: Option<String>,
    pub seller_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: NewOrder) -> Result<Order>;

    /// Moves an `on_hold` order to `new_order`. Returns false when the order
    /// is missing or already past `on_hold`.
    async fn mark_new_order(&self, id: Uuid) -> Result<bool>;

    async fn find(&self, id: Uuid) -> Result<Option<Order>>;

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>>;
}

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: NewOrder) -> Result<Order> {
        let mut conn = self.pool.get().await?;

        let order = diesel::insert_into(orders::table)
            .values(&order)
            .get_result::<Order>(&mut conn)
            .await?;

        Ok(order)
    }

    async fn mark_new_order(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let updated_rows = diesel::update(
            orders::table
                .filter(orders::id.eq(id))
                .filter(orders::status.eq(OrderStatus::OnHold.as_str())),
        )
        .set((
            orders::status.eq(OrderStatus::NewOrder.as_str()),
            orders::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated_rows > 0)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;

        let order = orders::table
            .filter(orders::id.eq(id))
            .first::<Order>(&mut conn)
            .await
            .optional()?;

        Ok(order)
    }

    async fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let mut conn = self.pool.get().await?;

        let mut query = orders::table.into_boxed();
        if let Some(tenant_id) = &filter.tenant_id {
            query = query.filter(orders::tenant_id.eq(tenant_id.clone()));
        }
        if let Some(seller_id) = &filter.seller_id {
            query = query.filter(orders::seller_id.eq(seller_id.clone()));
        }
        if let Some(status) = filter.status {
            query = query.filter(orders::status.eq(status.as_str()));
        }
        if let Some(from) = filter.from {
            query = query.filter(orders::created_at.ge(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(orders::created_at.le(to));
        }

        let orders = query
            .order(orders::created_at.desc())
            .load::<Order>(&mut conn)
            .await?;

        Ok(orders)
    }
}
