use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions of `tenant_id` whose event set contains `event`.
    async fn active_for(&self, tenant_id: &str, event: &str) -> Result<Vec<WebhookSubscription>>;
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn record(&self, failure: NewWebhookFailure) -> Result<WebhookFailureRecord>;

    /// Newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<WebhookFailureRecord>>;
}

pub struct PgWebhookStore {
    pool: DbPool,
}

impl PgWebhookStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgWebhookStore {
    async fn active_for(&self, tenant_id: &str, event: &str) -> Result<Vec<WebhookSubscription>> {
        let mut conn = self.pool.get().await?;

        let subscriptions = webhook_subscriptions::table
            .filter(webhook_subscriptions::tenant_id.eq(tenant_id))
            .filter(webhook_subscriptions::is_active.eq(true))
            .filter(webhook_subscriptions::events.contains(vec![event.to_string()]))
            .order(webhook_subscriptions::created_at.asc())
            .load::<WebhookSubscription>(&mut conn)
            .await?;

        Ok(subscriptions)
    }
}

#[async_trait]
impl FailureStore for PgWebhookStore {
    async fn record(&self, failure: NewWebhookFailure) -> Result<WebhookFailureRecord> {
        let mut conn = self.pool.get().await?;

        let record = diesel::insert_into(webhook_failures::table)
            .values(&failure)
            .get_result::<WebhookFailureRecord>(&mut conn)
            .await?;

        Ok(record)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<WebhookFailureRecord>> {
        let mut conn = self.pool.get().await?;

        let records = webhook_failures::table
            .order(webhook_failures::recorded_at.desc())
            .limit(limit)
            .load::<WebhookFailureRecord>(&mut conn)
            .await?;

        Ok(records)
    }
}
