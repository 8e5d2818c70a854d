use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::retry::{Message, MessageHandler};
use shared::WebhookDeliveryFailure;
use std::sync::Arc;
use tracing::{error, info};

use crate::models::{NewWebhookFailure, WebhookFailureRecord};
use crate::store::FailureStore;

/// Appends dead-lettered deliveries to the failure audit table.
pub struct FailureSink {
    store: Arc<dyn FailureStore>,
}

impl FailureSink {
    pub fn new(store: Arc<dyn FailureStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, failure: WebhookDeliveryFailure) -> Result<WebhookFailureRecord> {
        let record = self
            .store
            .record(NewWebhookFailure::from_dead_letter(failure, Utc::now()))
            .await?;

        info!(
            subscription_id = %record.subscription_id,
            event = %record.event,
            "Recorded webhook failure"
        );
        Ok(record)
    }
}

#[async_trait]
impl MessageHandler for FailureSink {
    async fn process(&self, message: &Message) -> Result<()> {
        let failure: WebhookDeliveryFailure = match serde_json::from_slice(&message.payload) {
            Ok(failure) => failure,
            Err(e) => {
                error!(key = ?message.key, "Invalid webhook failure payload: {}", e);
                return Err(e).context("malformed webhook failure record");
            }
        };

        self.record(failure).await?;
        Ok(())
    }
}
