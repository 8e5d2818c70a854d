use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use shared::bus::{publish_json, EventPublisher};
use shared::retry::{Message, MessageHandler};
use shared::{EventDecodeError, LifecycleEvent, WebhookDeliveryFailure};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::models::WebhookSubscription;
use crate::store::SubscriptionStore;

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event: &'a str,
    data: &'a Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Fans lifecycle events out to every matching subscriber.
///
/// Subscribers are attempted one after another and a failure never stops the
/// rest; each failed delivery is dead-lettered on its own. A retry of the whole
/// message delivers to every subscriber again, including the ones that succeeded.
pub struct WebhookDispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    http: reqwest::Client,
    publisher: Arc<dyn EventPublisher>,
    failed_topic: String,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        http: reqwest::Client,
        publisher: Arc<dyn EventPublisher>,
        failed_topic: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            subscriptions,
            http,
            publisher,
            failed_topic: failed_topic.into(),
            timeout,
        }
    }

    pub async fn dispatch(&self, event: &LifecycleEvent) -> Result<DispatchSummary> {
        let tenant_id = event.tenant_id();
        if tenant_id.trim().is_empty() {
            warn!(event = event.name(), "Event has a blank tenant_id, nothing to dispatch");
            return Ok(DispatchSummary::default());
        }

        let subscriptions = self.subscriptions.active_for(tenant_id, event.name()).await?;
        if subscriptions.is_empty() {
            return Ok(DispatchSummary::default());
        }

        let data = event.data()?;
        let body = WebhookBody {
            event: event.name(),
            data: &data,
        };

        let mut summary = DispatchSummary {
            matched: subscriptions.len(),
            ..Default::default()
        };
        for subscription in &subscriptions {
            match self.deliver(subscription, &body).await {
                Ok(()) => {
                    summary.delivered += 1;
                    info!(
                        subscription_id = %subscription.id,
                        callback_url = %subscription.callback_url,
                        "Webhook delivered"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        subscription_id = %subscription.id,
                        callback_url = %subscription.callback_url,
                        "Webhook delivery failed: {}",
                        e
                    );
                    self.dead_letter(subscription, event.name(), &e, &data).await;
                }
            }
        }

        Ok(summary)
    }

    async fn deliver(&self, subscription: &WebhookSubscription, body: &WebhookBody<'_>) -> reqwest::Result<()> {
        self.http
            .post(&subscription.callback_url)
            .headers(subscription.header_map())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn dead_letter(&self, subscription: &WebhookSubscription, event: &str, e: &reqwest::Error, data: &Value) {
        let failure = WebhookDeliveryFailure {
            subscription_id: subscription.id,
            event: event.to_string(),
            callback_url: subscription.callback_url.clone(),
            error: e.to_string(),
            payload: data.clone(),
        };

        if let Err(e) = publish_json(
            self.publisher.as_ref(),
            &self.failed_topic,
            &subscription.id.to_string(),
            &failure,
        )
        .await
        {
            error!(subscription_id = %subscription.id, "Error dead-lettering webhook failure: {:#}", e);
        }
    }
}

#[async_trait]
impl MessageHandler for WebhookDispatcher {
    async fn process(&self, message: &Message) -> Result<()> {
        let event = match LifecycleEvent::decode(&message.topic, &message.payload) {
            Ok(event) => event,
            Err(EventDecodeError::MissingTenant) => {
                warn!(topic = %message.topic, key = ?message.key, "Event has no tenant_id, skipping");
                return Ok(());
            }
            Err(e) => {
                error!(topic = %message.topic, key = ?message.key, "Dropping undecodable event: {}", e);
                return Ok(());
            }
        };

        let summary = self.dispatch(&event).await?;
        if summary.matched > 0 {
            info!(
                event = event.name(),
                matched = summary.matched,
                delivered = summary.delivered,
                failed = summary.failed,
                "Event dispatched"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryWebhookStore;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use shared::retry::RetryHandler;
    use shared::testing::RecordingPublisher;
    use shared::topics;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct Delivery {
        path: String,
        headers: HeaderMap,
        body: Value,
    }

    type Deliveries = Arc<Mutex<Vec<Delivery>>>;

    async fn capture(
        State(seen): State<Deliveries>,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let path = uri.path().to_string();
        let status = if path == "/fail" {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        seen.lock().unwrap().push(Delivery { path, headers, body });
        status
    }

    async fn callback_server() -> (String, Deliveries) {
        let seen: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/ok", post(capture))
            .route("/also-ok", post(capture))
            .route("/fail", post(capture))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn subscription(tenant: &str, url: String, events: &[&str], active: bool) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            callback_url: url,
            events: events.iter().map(|e| e.to_string()).collect(),
            headers: json!({}),
            is_active: active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Fixture {
        store: Arc<MemoryWebhookStore>,
        publisher: Arc<RecordingPublisher>,
        dispatcher: Arc<WebhookDispatcher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryWebhookStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            store.clone(),
            reqwest::Client::new(),
            publisher.clone(),
            topics::WEBHOOK_FAILED,
            Duration::from_secs(5),
        ));
        Fixture { store, publisher, dispatcher }
    }

    fn created_message(tenant: &str) -> Message {
        let payload = json!({
            "order_id": Uuid::new_v4(),
            "tenant_id": tenant,
            "seller_id": "s1",
            "hub_id": "h1",
            "sku_id": "k1",
            "quantity": 2,
            "created_at": "2024-05-01T10:00:00Z"
        });
        Message::new(topics::ORDER_CREATED, None, serde_json::to_vec(&payload).unwrap())
    }

    #[tokio::test]
    async fn one_failing_subscriber_does_not_block_the_others() {
        let (base, seen) = callback_server().await;
        let f = fixture();
        f.store.subscribe(subscription("t1", format!("{}/ok", base), &["order.created"], true));
        f.store.subscribe(subscription("t1", format!("{}/also-ok", base), &["order.created"], true));
        let failing = subscription("t1", format!("{}/fail", base), &["order.created"], true);
        f.store.subscribe(failing.clone());
        f.store.subscribe(subscription("t1", format!("{}/ok", base), &["order.created"], false));

        let event = LifecycleEvent::decode(topics::ORDER_CREATED, &created_message("t1").payload).unwrap();
        let summary = f.dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(summary, DispatchSummary { matched: 3, delivered: 2, failed: 1 });
        assert_eq!(seen.lock().unwrap().len(), 3);

        let dead = f.publisher.on_topic(topics::WEBHOOK_FAILED);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key.as_deref(), Some(failing.id.to_string().as_str()));
        let failure: WebhookDeliveryFailure = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(failure.subscription_id, failing.id);
        assert_eq!(failure.event, "order.created");
        assert_eq!(failure.callback_url, failing.callback_url);
        assert!(failure.error.contains("500"));
        assert_eq!(failure.payload["tenant_id"], "t1");
    }

    #[tokio::test]
    async fn delivers_event_envelope_with_custom_headers() {
        let (base, seen) = callback_server().await;
        let f = fixture();
        let mut sub = subscription("t1", format!("{}/ok", base), &["order.created"], true);
        sub.headers = json!({"X-Api-Key": "k-123"});
        f.store.subscribe(sub);

        f.dispatcher.process(&created_message("t1")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, "/ok");
        assert_eq!(seen[0].headers.get("x-api-key").unwrap(), "k-123");
        assert_eq!(seen[0].body["event"], "order.created");
        assert_eq!(seen[0].body["data"]["tenant_id"], "t1");
        assert_eq!(seen[0].body["data"]["quantity"], 2);
    }

    #[tokio::test]
    async fn only_subscribers_of_the_event_and_tenant_are_called() {
        let (base, seen) = callback_server().await;
        let f = fixture();
        f.store.subscribe(subscription("t1", format!("{}/ok", base), &["order.updated"], true));
        f.store.subscribe(subscription("t2", format!("{}/ok", base), &["order.created"], true));

        f.dispatcher.process(&created_message("t1")).await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert!(f.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn events_without_a_tenant_or_valid_json_are_skipped() {
        let f = fixture();
        f.store.fail_lookups(true);

        let no_tenant = Message::new(topics::ORDER_CREATED, None, b"{\"order_id\":\"x\"}".to_vec());
        f.dispatcher.process(&no_tenant).await.unwrap();

        let garbage = Message::new(topics::ORDER_UPDATED, None, b"<xml/>".to_vec());
        f.dispatcher.process(&garbage).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_event_names_are_fanned_out_raw() {
        let (base, seen) = callback_server().await;
        let f = fixture();
        f.store.subscribe(subscription("t1", format!("{}/ok", base), &["order.cancelled"], true));

        let payload = json!({"tenant_id": "t1", "reason": "customer request"});
        f.dispatcher
            .process(&Message::new("order.cancelled", None, serde_json::to_vec(&payload).unwrap()))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, json!({"event": "order.cancelled", "data": payload}));
    }

    #[tokio::test]
    async fn unreachable_callback_is_dead_lettered() {
        let f = fixture();
        f.store.subscribe(subscription("t1", "http://127.0.0.1:1/hook".to_string(), &["order.created"], true));

        f.dispatcher.process(&created_message("t1")).await.unwrap();

        assert_eq!(f.publisher.on_topic(topics::WEBHOOK_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_publish_failure_is_swallowed() {
        let (base, _seen) = callback_server().await;
        let f = fixture();
        f.publisher.fail_topic(topics::WEBHOOK_FAILED);
        f.store.subscribe(subscription("t1", format!("{}/fail", base), &["order.created"], true));

        let event = LifecycleEvent::decode(topics::ORDER_CREATED, &created_message("t1").payload).unwrap();
        let summary = f.dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert!(f.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn subscription_lookup_failure_is_retried() {
        let f = fixture();
        f.store.fail_lookups(true);
        let handler = RetryHandler::new(f.dispatcher.clone(), 3, Duration::from_millis(1));

        let err = handler.process(&created_message("t1")).await.unwrap_err();

        assert!(format!("{:#}", err).contains("subscription store unreachable"));
    }

    #[tokio::test]
    async fn redelivered_message_is_delivered_again() {
        let (base, seen) = callback_server().await;
        let f = fixture();
        f.store.subscribe(subscription("t1", format!("{}/ok", base), &["order.created"], true));
        let handler = RetryHandler::new(f.dispatcher.clone(), 3, Duration::from_millis(1));
        let message = created_message("t1");

        handler.process(&message).await.unwrap();
        handler.process(&message).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
