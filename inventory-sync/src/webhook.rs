//! Webhook ingress: authenticate, record, enqueue, acknowledge.
//!
//! Once a delivery is authenticated the platform always gets a 200. The
//! audit row is what guarantees the event is not lost; a failure after
//! authentication is logged and left for the processor's database sweep.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use shared::{WebhookEnvelope, WebhookTopic};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::NewWebhookEvent;
use crate::queue::TaskQueue;
use crate::store::SyncStore;

pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";
pub const WEBHOOK_ID_HEADER: &str = "x-shopify-webhook-id";
pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";

/// Check a base64 HMAC-SHA256 signature over the exact request bytes.
/// Comparison is constant-time (`Mac::verify_slice`).
pub fn verify_hmac(body: &[u8], signature: Option<&str>, secret: Option<&str>) -> bool {
    let (Some(signature), Some(secret)) = (signature, secret) else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct WebhookIngress {
    store: Arc<dyn SyncStore>,
    queue: Arc<dyn TaskQueue>,
    secret: Option<String>,
    queue_topic: String,
}

impl WebhookIngress {
    pub fn new(
        store: Arc<dyn SyncStore>,
        queue: Arc<dyn TaskQueue>,
        secret: Option<String>,
        queue_topic: String,
    ) -> Self {
        Self {
            store,
            queue,
            secret,
            queue_topic,
        }
    }

    /// Handle one delivery. `fallback_topic` is used when the topic header is
    /// absent, i.e. the topic the receiving endpoint is dedicated to.
    pub async fn receive(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        fallback_topic: &WebhookTopic,
    ) -> StatusCode {
        if !verify_hmac(body, header(headers, HMAC_HEADER), self.secret.as_deref()) {
            warn!(topic = %fallback_topic, "webhook rejected: signature mismatch or missing secret");
            return StatusCode::UNAUTHORIZED;
        }

        let topic = header(headers, TOPIC_HEADER)
            .map(WebhookTopic::from)
            .unwrap_or_else(|| fallback_topic.clone());

        let payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%topic, "webhook body is not JSON, acknowledged without processing: {}", e);
                return StatusCode::OK;
            }
        };

        let event = NewWebhookEvent {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            shop_domain: header(headers, SHOP_DOMAIN_HEADER).map(str::to_string),
            webhook_id: header(headers, WEBHOOK_ID_HEADER).map(str::to_string),
            payload,
            received_at: Utc::now(),
        };
        let envelope = WebhookEnvelope {
            event_id: event.id,
            topic: topic.clone(),
            shop_domain: event.shop_domain.clone(),
            webhook_id: event.webhook_id.clone(),
            payload: event.payload.clone(),
            received_at: event.received_at,
        };

        match self.store.record_webhook_event(event).await {
            Ok(Some(event_id)) => {
                info!(%event_id, %topic, webhook_id = ?envelope.webhook_id, "webhook recorded");
            }
            Ok(None) => {
                info!(%topic, webhook_id = ?envelope.webhook_id, "duplicate webhook delivery ignored");
                return StatusCode::OK;
            }
            Err(e) => {
                error!(%topic, webhook_id = ?envelope.webhook_id, "failed to record webhook: {}", e);
                return StatusCode::OK;
            }
        }

        if self.queue.is_enabled() {
            self.enqueue(&envelope).await;
        }
        StatusCode::OK
    }

    async fn enqueue(&self, envelope: &WebhookEnvelope) {
        let key = envelope
            .webhook_id
            .clone()
            .unwrap_or_else(|| envelope.event_id.to_string());

        let result = match serde_json::to_string(envelope) {
            Ok(json) => self.queue.enqueue(&self.queue_topic, &key, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(event_id = %envelope.event_id, "webhook enqueue failed, left for database sweep: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{MemoryStore, RecordingQueue};
    use crate::queue::NoopQueue;

    const SECRET: &str = "hush";

    pub(crate) fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        STANDARD.encode(mac.finalize().into_bytes())
    }

    fn headers(body: &[u8], topic: Option<&str>, webhook_id: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HMAC_HEADER, sign(body, SECRET).parse().unwrap());
        headers.insert(SHOP_DOMAIN_HEADER, "demo.myshopify.com".parse().unwrap());
        if let Some(topic) = topic {
            headers.insert(TOPIC_HEADER, topic.parse().unwrap());
        }
        if let Some(id) = webhook_id {
            headers.insert(WEBHOOK_ID_HEADER, id.parse().unwrap());
        }
        headers
    }

    fn ingress(store: &MemoryStore, queue: Arc<dyn TaskQueue>) -> WebhookIngress {
        WebhookIngress::new(
            Arc::new(store.clone()),
            queue,
            Some(SECRET.to_string()),
            "shopify-webhooks".to_string(),
        )
    }

    #[test]
    fn accepts_signature_over_identical_bytes() {
        let body = br#"{"inventory_item_id":1,"available":7}"#;
        assert!(verify_hmac(body, Some(&sign(body, SECRET)), Some(SECRET)));
    }

    #[test]
    fn rejects_single_flipped_byte() {
        let body = br#"{"inventory_item_id":1,"available":7}"#.to_vec();
        let signature = sign(&body, SECRET);
        let mut tampered = body.clone();
        tampered[25] ^= 0x01;
        assert!(!verify_hmac(&tampered, Some(&signature), Some(SECRET)));
    }

    #[test]
    fn rejects_missing_secret_or_signature() {
        let body = b"{}";
        let signature = sign(body, SECRET);
        assert!(!verify_hmac(body, None, Some(SECRET)));
        assert!(!verify_hmac(body, Some(&signature), None));
        assert!(!verify_hmac(body, Some(&signature), Some("")));
        assert!(!verify_hmac(body, Some("not base64!"), Some(SECRET)));
    }

    #[tokio::test]
    async fn bad_signature_has_no_side_effects() {
        let store = MemoryStore::new();
        let queue = RecordingQueue::new();
        let body = br#"{"id":1}"#;
        let mut h = headers(body, Some("orders/create"), Some("w-1"));
        h.insert(HMAC_HEADER, sign(b"other", SECRET).parse().unwrap());

        let status = ingress(&store, Arc::new(queue.clone()))
            .receive(&h, body, &WebhookTopic::OrdersCreate)
            .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(store.webhook_events().is_empty());
        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_records_one_row_and_enqueues_once() {
        let store = MemoryStore::new();
        let queue = RecordingQueue::new();
        let ingress = ingress(&store, Arc::new(queue.clone()));
        let body = br#"{"inventory_item_id":1,"location_id":2,"available":7}"#;
        let h = headers(body, Some("inventory_levels/update"), Some("w-42"));

        for _ in 0..3 {
            let status = ingress
                .receive(&h, body, &WebhookTopic::InventoryLevelsUpdate)
                .await;
            assert_eq!(status, StatusCode::OK);
        }

        let events = store.webhook_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].webhook_id.as_deref(), Some("w-42"));
        assert_eq!(events[0].shop_domain.as_deref(), Some("demo.myshopify.com"));

        let sent = queue.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "shopify-webhooks");
        assert_eq!(sent[0].1, "w-42");
        let envelope: WebhookEnvelope = serde_json::from_str(&sent[0].2).unwrap();
        assert_eq!(envelope.event_id, events[0].id);
        assert_eq!(envelope.topic, WebhookTopic::InventoryLevelsUpdate);
    }

    #[tokio::test]
    async fn missing_topic_header_falls_back_to_endpoint_topic() {
        let store = MemoryStore::new();
        let body = br#"{"id":5}"#;
        let h = headers(body, None, None);

        let status = ingress(&store, Arc::new(NoopQueue))
            .receive(&h, body, &WebhookTopic::FulfillmentsUpdate)
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.webhook_events()[0].topic, "fulfillments/update");
    }

    #[tokio::test]
    async fn enqueue_failure_still_acknowledges() {
        let store = MemoryStore::new();
        let body = br#"{"id":9}"#;
        let h = headers(body, Some("orders/updated"), Some("w-9"));

        let status = ingress(&store, Arc::new(RecordingQueue::unavailable()))
            .receive(&h, body, &WebhookTopic::OrdersUpdated)
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.webhook_events().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_body_is_acknowledged() {
        let store = MemoryStore::new();
        let body = b"not json";
        let h = headers(body, Some("orders/create"), Some("w-x"));

        let status = ingress(&store, Arc::new(NoopQueue))
            .receive(&h, body, &WebhookTopic::OrdersCreate)
            .await;

        assert_eq!(status, StatusCode::OK);
        assert!(store.webhook_events().is_empty());
    }
}
