use chrono::{DateTime, Utc};
use diesel::prelude::*;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use shared::WebhookDeliveryFailure;
use tracing::warn;
use uuid::Uuid;

/// A tenant's registration for one callback URL. Managed elsewhere; read-only here.
#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
#[diesel(table_name = crate::schema::webhook_subscriptions)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub callback_url: String,
    pub events: Vec<String>,
    pub headers: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Custom headers stored as a JSON object of strings. Entries that are not
    /// valid HTTP headers are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        let Some(headers) = self.headers.as_object() else {
            return map;
        };

        for (name, value) in headers {
            let parsed = value.as_str().and_then(|v| {
                let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
                let value = HeaderValue::from_str(v).ok()?;
                Some((name, value))
            });
            match parsed {
                Some((name, value)) => {
                    map.append(name, value);
                }
                None => warn!(subscription_id = %self.id, header = %name, "Skipping invalid webhook header"),
            }
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
#[diesel(table_name = crate::schema::webhook_failures)]
pub struct WebhookFailureRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event: String,
    pub callback_url: String,
    pub error: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_failures)]
pub struct NewWebhookFailure {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event: String,
    pub callback_url: String,
    pub error: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl NewWebhookFailure {
    pub fn from_dead_letter(failure: WebhookDeliveryFailure, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: failure.subscription_id,
            event: failure.event,
            callback_url: failure.callback_url,
            error: failure.error,
            payload: failure.payload,
            recorded_at,
        }
    }
}

impl From<NewWebhookFailure> for WebhookFailureRecord {
    fn from(failure: NewWebhookFailure) -> Self {
        Self {
            id: failure.id,
            subscription_id: failure.subscription_id,
            event: failure.event,
            callback_url: failure.callback_url,
            error: failure.error,
            payload: failure.payload,
            recorded_at: failure.recorded_at,
        }
    }
}
