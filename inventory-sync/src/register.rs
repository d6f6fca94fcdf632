//! Ensures the platform delivers every topic we consume to our ingress.

use serde::Serialize;
use shared::{PlatformWebhook, WebhookTopic};
use tracing::{error, info};

use crate::api::webhook_path;
use crate::error::PlatformError;
use crate::platform::PlatformApi;

/// Routed topics plus the ones delivered to the generic endpoint.
pub fn subscribed_topics() -> Vec<WebhookTopic> {
    let mut topics = WebhookTopic::ROUTED.to_vec();
    topics.extend([
        WebhookTopic::OrdersFulfilled,
        WebhookTopic::ProductsCreate,
        WebhookTopic::ProductsDelete,
    ]);
    topics
}

#[derive(Debug, Default, Serialize)]
pub struct RegistrationReport {
    pub created: usize,
    pub existing: usize,
    pub failed: Vec<String>,
}

/// Create each missing topic/address subscription. Failing to list the
/// current subscriptions aborts; a failed create is reported and skipped.
pub async fn ensure_webhooks(
    platform: &dyn PlatformApi,
    public_url: &str,
) -> Result<RegistrationReport, PlatformError> {
    let existing = platform.list_webhooks().await?;
    let mut report = RegistrationReport::default();

    for topic in subscribed_topics() {
        let wanted = PlatformWebhook {
            id: None,
            topic: topic.to_string(),
            address: format!("{}{}", public_url, webhook_path(&topic)),
            format: "json".to_string(),
        };

        if existing
            .iter()
            .any(|w| w.topic == wanted.topic && w.address == wanted.address)
        {
            info!(%topic, address = %wanted.address, "webhook already registered");
            report.existing += 1;
            continue;
        }

        match platform.create_webhook(&wanted).await {
            Ok(created) => {
                info!(%topic, id = ?created.id, "webhook registered");
                report.created += 1;
            }
            Err(e) => {
                error!(%topic, "Failed to register webhook: {}", e);
                report.failed.push(topic.to_string());
            }
        }
    }
    Ok(report)
}
