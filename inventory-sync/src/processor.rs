use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::*;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::error::StoreError;
use crate::merge::LevelUpdate;
use crate::models::WebhookEvent;
use crate::queue::{TaskHandler, TaskQueue};
use crate::store::SyncStore;

const MAX_EVENTS_PER_SWEEP: usize = 500;

/// Applies the local effect of one webhook topic. Must be safe to run twice
/// for the same event.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEnvelope) -> Result<()>;
}

/// `inventory_levels/update`: last-writer-wins upsert plus a ledger row.
pub struct InventoryLevelHandler {
    store: Arc<dyn SyncStore>,
}

#[async_trait]
impl TopicHandler for InventoryLevelHandler {
    async fn handle(&self, event: &WebhookEnvelope) -> Result<()> {
        let level: PlatformInventoryLevel = match serde_json::from_value(event.payload.clone()) {
            Ok(level) => level,
            Err(e) => {
                warn!(event_id = %event.event_id, "inventory webhook payload not understood: {}", e);
                return Ok(());
            }
        };
        let Some(update) = LevelUpdate::from_platform(&level, Source::Platform) else {
            debug!(event_id = %event.event_id, "inventory webhook without quantity");
            return Ok(());
        };

        let report = self.store.apply_inventory_levels(vec![update]).await?;
        info!(
            event_id = %event.event_id,
            inventory_item_id = level.inventory_item_id,
            location_id = level.location_id,
            applied = report.applied,
            stale = report.stale,
            "inventory webhook applied"
        );
        Ok(())
    }
}

/// `products/create` and `products/update`.
pub struct ProductHandler {
    store: Arc<dyn SyncStore>,
}

#[async_trait]
impl TopicHandler for ProductHandler {
    async fn handle(&self, event: &WebhookEnvelope) -> Result<()> {
        let product: PlatformProduct = match serde_json::from_value(event.payload.clone()) {
            Ok(product) => product,
            Err(e) => {
                warn!(event_id = %event.event_id, "product webhook payload not understood: {}", e);
                return Ok(());
            }
        };
        let written = self.store.upsert_products(std::slice::from_ref(&product)).await?;
        info!(event_id = %event.event_id, product_id = product.id, written, "product webhook applied");
        Ok(())
    }
}

/// Topics with no local effect yet. The audit row is the whole record.
pub struct LogOnlyHandler;

#[async_trait]
impl TopicHandler for LogOnlyHandler {
    async fn handle(&self, event: &WebhookEnvelope) -> Result<()> {
        let resource_id = event.payload.get("id").and_then(|v| v.as_i64());
        match event.topic {
            WebhookTopic::AppUninstalled => {
                warn!(shop_domain = ?event.shop_domain, "app uninstalled from shop")
            }
            _ => info!(event_id = %event.event_id, topic = %event.topic, ?resource_id, "webhook acknowledged"),
        }
        Ok(())
    }
}

/// Handler lookup keyed by topic. Unknown topics go to the fallback.
pub struct HandlerRegistry {
    handlers: HashMap<WebhookTopic, Arc<dyn TopicHandler>>,
    fallback: Arc<dyn TopicHandler>,
}

impl HandlerRegistry {
    pub fn new(fallback: Arc<dyn TopicHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    pub fn register(mut self, topic: WebhookTopic, handler: Arc<dyn TopicHandler>) -> Self {
        self.handlers.insert(topic, handler);
        self
    }

    pub fn with_defaults(store: Arc<dyn SyncStore>) -> Self {
        let products: Arc<dyn TopicHandler> = Arc::new(ProductHandler {
            store: store.clone(),
        });
        Self::new(Arc::new(LogOnlyHandler))
            .register(
                WebhookTopic::InventoryLevelsUpdate,
                Arc::new(InventoryLevelHandler { store }),
            )
            .register(WebhookTopic::ProductsCreate, products.clone())
            .register(WebhookTopic::ProductsUpdate, products)
    }

    pub fn handler_for(&self, topic: &WebhookTopic) -> Arc<dyn TopicHandler> {
        self.handlers
            .get(topic)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct WebhookProcessor {
    store: Arc<dyn SyncStore>,
    registry: HandlerRegistry,
    config: ProcessorConfig,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn SyncStore>, registry: HandlerRegistry, config: ProcessorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Consume the queue (when there is one) and sweep the table until shutdown.
    pub async fn run(self: Arc<Self>, queue: Arc<dyn TaskQueue>, shutdown: CancellationToken) {
        let consumer = {
            let handler: Arc<dyn TaskHandler> = self.clone();
            let queue = queue.clone();
            let topic = self.config.topic.clone();
            let concurrency = self.config.concurrency;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.consume(&topic, handler, concurrency, shutdown).await {
                    error!("Webhook queue consumer stopped: {}", e);
                }
            })
        };

        let mut interval = time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(processed) => info!(processed, "webhook sweep finished"),
                        Err(e) => error!("Error sweeping webhook events: {}", e),
                    }
                }
            }
        }

        if let Err(e) = consumer.await {
            error!("Webhook queue consumer task failed: {}", e);
        }
        info!("webhook processor stopped");
    }

    /// Claim and process unprocessed events from the table, `concurrency` at a time.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let mut processed = 0;

        while processed < MAX_EVENTS_PER_SWEEP {
            let mut batch = Vec::with_capacity(self.config.concurrency);
            while batch.len() < self.config.concurrency {
                match self.store.claim_next_webhook_event(self.config.lease).await? {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let claimed = batch.len();
            let results =
                futures::future::join_all(batch.into_iter().map(|event| self.process_event(event)))
                    .await;
            for result in results {
                result?;
            }
            processed += claimed;

            if claimed < self.config.concurrency {
                break;
            }
        }

        Ok(processed)
    }

    /// Process a queued envelope unless another worker already has it.
    pub async fn process_envelope(&self, envelope: &WebhookEnvelope) -> Result<bool, StoreError> {
        match self
            .store
            .claim_webhook_event(envelope.event_id, self.config.lease)
            .await?
        {
            Some(event) => {
                self.process_event(event).await?;
                Ok(true)
            }
            None => {
                debug!(event_id = %envelope.event_id, "webhook event already claimed or processed");
                Ok(false)
            }
        }
    }

    async fn process_event(&self, event: WebhookEvent) -> Result<(), StoreError> {
        let envelope = event.envelope();
        let handler = self.registry.handler_for(&envelope.topic);

        match handler.handle(&envelope).await {
            Ok(()) => {
                self.store.mark_webhook_processed(event.id).await?;
                debug!(event_id = %event.id, topic = %envelope.topic, "webhook event processed");
            }
            Err(e) => {
                warn!(event_id = %event.id, topic = %envelope.topic, "webhook handler failed: {:#}", e);
                self.store.mark_webhook_failed(event.id, &format!("{e:#}")).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for WebhookProcessor {
    async fn handle(&self, payload: &str) -> Result<()> {
        let envelope: WebhookEnvelope = serde_json::from_str(payload)?;
        self.process_envelope(&envelope).await?;
        Ok(())
    }
}
