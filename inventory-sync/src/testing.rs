//! In-memory stand-ins for the database and the platform, shared by the
//! engine's unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use shared::*;
use uuid::Uuid;

use crate::error::{PlatformError, QueueError, StoreError};
use crate::ledger;
use crate::merge::{self, Decision, LevelUpdate};
use crate::models::*;
use crate::platform::{InventoryLevelQuery, PlatformApi};
use crate::queue::{TaskHandler, TaskQueue};
use crate::store::{ApplyReport, StaleJobs, SyncStore, LEASE_EXPIRED};

// ── Store ───────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    products: HashMap<i64, Product>,
    locations: Vec<Location>,
    levels: HashMap<i64, InventoryLevel>,
    movements: Vec<InventoryMovement>,
    local_inventory: Vec<Value>,
    webhooks: Vec<WebhookEvent>,
    jobs: Vec<DbOutboxJob>,
}

/// Mirrors the conflict rules of `PgStore` without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_inventory(self, records: Vec<Value>) -> Self {
        self.state.lock().unwrap().local_inventory = records;
        self
    }

    pub fn with_locations(self, ids: &[i64]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for id in ids {
                state.locations.push(Location::from_platform(
                    &location(*id),
                    Utc::now(),
                ));
            }
        }
        self
    }

    pub fn product(&self, id: i64) -> Option<Product> {
        self.state.lock().unwrap().products.get(&id).cloned()
    }

    pub fn levels(&self) -> Vec<InventoryLevel> {
        let mut levels: Vec<_> = self.state.lock().unwrap().levels.values().cloned().collect();
        levels.sort_by_key(|l| l.inventory_item_id);
        levels
    }

    pub fn movements(&self) -> Vec<InventoryMovement> {
        self.state.lock().unwrap().movements.clone()
    }

    pub fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.state.lock().unwrap().webhooks.clone()
    }

    /// Pretends the claim on a webhook event was taken long ago.
    pub fn expire_webhook_claims(&self) {
        let mut state = self.state.lock().unwrap();
        for event in state.webhooks.iter_mut() {
            if let Some(at) = event.claimed_at.as_mut() {
                *at -= chrono::Duration::days(1);
            }
        }
    }

    pub fn jobs(&self) -> Vec<DbOutboxJob> {
        self.state.lock().unwrap().jobs.clone()
    }

    /// Rewinds a job's `updated_at`, simulating a worker that died mid-call.
    pub fn age_job(&self, id: Uuid, by: chrono::Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.updated_at -= by;
        }
    }

    /// Overwrites a stored job payload, e.g. with one that no longer decodes.
    pub fn corrupt_job(&self, id: Uuid, payload: serde_json::Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.payload = payload;
        }
    }

    /// Makes a retried job due immediately.
    pub fn make_due(&self, id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.run_after = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

fn claimable(claimed_at: Option<DateTime<Utc>>, lease: Duration) -> bool {
    let cutoff = Utc::now() - chrono::Duration::from_std(lease).unwrap();
    claimed_at.map_or(true, |at| at < cutoff)
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn upsert_products(&self, products: &[PlatformProduct]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut written = 0;
        for p in products {
            let replace = match state.products.get(&p.id) {
                None => true,
                Some(existing) => merge::supersedes(existing.platform_updated_at, p.updated_at),
            };
            if replace {
                state.products.insert(p.id, Product::from_platform(p, now));
                written += 1;
            }
        }
        Ok(written)
    }

    async fn upsert_locations(&self, locations: &[PlatformLocation]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        for loc in locations {
            let row = Location::from_platform(loc, now);
            match state.locations.iter_mut().find(|l| l.id == loc.id) {
                Some(existing) => *existing = row,
                None => state.locations.push(row),
            }
        }
        state.locations.sort_by_key(|l| l.id);
        Ok(locations.len())
    }

    async fn list_locations(&self) -> Result<Vec<Location>, StoreError> {
        Ok(self.state.lock().unwrap().locations.clone())
    }

    async fn apply_inventory_levels(
        &self,
        updates: Vec<LevelUpdate>,
    ) -> Result<ApplyReport, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut report = ApplyReport::default();

        for update in updates {
            let existing = state.levels.get(&update.inventory_item_id).cloned();
            if merge::decide(existing.as_ref(), &update) == Decision::KeepExisting {
                report.stale += 1;
                continue;
            }
            let source = update.source;
            let row = update.into_row(now);
            let previous = ledger::available_at(existing.as_ref(), row.location_id).or_else(|| {
                state
                    .movements
                    .iter()
                    .rev()
                    .find(|m| {
                        m.inventory_item_id == row.inventory_item_id
                            && m.location_id == Some(row.location_id)
                    })
                    .map(|m| m.new_available)
            });
            if let Some(movement) = ledger::movement_for(previous, &row, source, now) {
                state.movements.push(movement);
                report.movements += 1;
            }
            state.levels.insert(row.inventory_item_id, row);
            report.applied += 1;
        }
        Ok(report)
    }

    async fn inventory_level(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<InventoryLevel>, StoreError> {
        Ok(self.state.lock().unwrap().levels.get(&inventory_item_id).cloned())
    }

    async fn movements_for_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .movements
            .iter()
            .filter(|m| m.inventory_item_id == inventory_item_id)
            .cloned()
            .collect())
    }

    async fn list_local_inventory(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.state.lock().unwrap().local_inventory.clone())
    }

    async fn record_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if event.webhook_id.is_some()
            && state.webhooks.iter().any(|w| w.webhook_id == event.webhook_id)
        {
            return Ok(None);
        }
        state.webhooks.push(WebhookEvent {
            id: event.id,
            topic: event.topic,
            shop_domain: event.shop_domain,
            webhook_id: event.webhook_id,
            payload: event.payload,
            received_at: event.received_at,
            claimed_at: None,
            processed_at: None,
            last_error: None,
        });
        Ok(Some(event.id))
    }

    async fn claim_webhook_event(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.id == id && w.processed_at.is_none() && claimable(w.claimed_at, lease))
        else {
            return Ok(None);
        };
        event.claimed_at = Some(Utc::now());
        Ok(Some(event.clone()))
    }

    async fn claim_next_webhook_event(
        &self,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(event) = state
            .webhooks
            .iter_mut()
            .filter(|w| w.processed_at.is_none() && claimable(w.claimed_at, lease))
            .min_by_key(|w| w.received_at)
        else {
            return Ok(None);
        };
        event.claimed_at = Some(Utc::now());
        Ok(Some(event.clone()))
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.id == id && w.processed_at.is_none())
        {
            event.processed_at = Some(Utc::now());
            event.last_error = None;
        }
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state.webhooks.iter_mut().find(|w| w.id == id) {
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn enqueue_job(&self, job: NewOutboxJob) -> Result<Enqueued, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = state
                .jobs
                .iter()
                .find(|j| j.idempotency_key.as_ref() == Some(key))
            {
                return Ok(Enqueued {
                    job_id: existing.id,
                    created: false,
                });
            }
        }
        let now = Utc::now();
        state.jobs.push(DbOutboxJob {
            id: job.id,
            job_type: job.job_type,
            idempotency_key: job.idempotency_key,
            payload: job.payload,
            status: job.status,
            attempts: 0,
            last_error: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        });
        Ok(Enqueued {
            job_id: job.id,
            created: true,
        })
    }

    async fn claim_next_job(&self) -> Result<Option<OutboxJob>, StoreError> {
        loop {
            let claimed = {
                let mut state = self.state.lock().unwrap();
                let now = Utc::now();
                let Some(job) = state
                    .jobs
                    .iter_mut()
                    .filter(|j| j.status == JobStatus::Queued.as_str() && j.run_after <= now)
                    .min_by_key(|j| (j.run_after, j.created_at))
                else {
                    return Ok(None);
                };
                job.status = JobStatus::Processing.as_str().to_string();
                job.updated_at = now;
                job.clone()
            };
            let id = claimed.id;
            match OutboxJob::try_from(claimed) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => self.fail_job(id, &e.to_string()).await?,
            }
        }
    }

    async fn complete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.transition(id, |job| {
            job.status = JobStatus::Done.as_str().to_string();
            job.last_error = None;
        }))
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition(id, |job| {
            job.status = JobStatus::Queued.as_str().to_string();
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.run_after = run_after;
        });
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.transition(id, |job| {
            job.status = JobStatus::Failed.as_str().to_string();
            job.attempts += 1;
            job.last_error = Some(error.to_string());
        });
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<OutboxJob>, StoreError> {
        let row = self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned();
        row.map(OutboxJob::try_from).transpose()
    }

    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<StaleJobs, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut swept = StaleJobs::default();
        for job in state.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Processing.as_str() && j.updated_at < older_than
        }) {
            job.attempts += 1;
            job.last_error = Some(LEASE_EXPIRED.to_string());
            job.updated_at = now;
            if job.attempts >= max_attempts {
                job.status = JobStatus::Failed.as_str().to_string();
                swept.failed += 1;
            } else {
                job.status = JobStatus::Queued.as_str().to_string();
                job.run_after = now;
                swept.requeued += 1;
            }
        }
        Ok(swept)
    }
}

impl MemoryStore {
    /// Applies `f` only while the job is `processing`, like the guarded UPDATEs.
    fn transition(&self, id: Uuid, f: impl FnOnce(&mut DbOutboxJob)) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Processing.as_str())
        else {
            return false;
        };
        f(job);
        job.updated_at = Utc::now();
        true
    }
}

// ── Platform ────────────────────────────────────────────────────

pub fn location(id: i64) -> PlatformLocation {
    PlatformLocation {
        id,
        name: Some(format!("Location {id}")),
        address1: None,
        address2: None,
        city: None,
        province: None,
        country: None,
        zip: None,
    }
}

pub fn level(
    inventory_item_id: i64,
    location_id: i64,
    available: i32,
    updated_at: Option<DateTime<Utc>>,
) -> PlatformInventoryLevel {
    PlatformInventoryLevel {
        inventory_item_id,
        location_id,
        available: Some(available),
        updated_at,
    }
}

#[derive(Default)]
struct PlatformState {
    products: Vec<PlatformProduct>,
    locations: Vec<PlatformLocation>,
    levels: HashMap<i64, Vec<PlatformInventoryLevel>>,
    orders: Vec<PlatformOrder>,
    fulfillments: HashMap<i64, Vec<PlatformFulfillment>>,
    webhooks: Vec<PlatformWebhook>,
    failing_locations: HashSet<i64>,
    failing_items: HashSet<i64>,
    fail_level_reads: bool,
    fail_location_list: bool,
    scripted_failures: VecDeque<StatusCode>,
    write_delay: Option<Duration>,
    level_queries: Vec<InventoryLevelQuery>,
    set_calls: Vec<(i64, i64, i32)>,
    adjust_calls: Vec<(i64, i64, i32)>,
    product_updates: Vec<(i64, Value)>,
    created_webhooks: Vec<PlatformWebhook>,
}

/// Scripted platform. Writes mutate its level table so later reads see them.
#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(self, products: Vec<PlatformProduct>) -> Self {
        self.state.lock().unwrap().products = products;
        self
    }

    pub fn with_locations(self, ids: &[i64]) -> Self {
        self.state.lock().unwrap().locations = ids.iter().map(|id| location(*id)).collect();
        self
    }

    pub fn with_levels(self, location_id: i64, levels: Vec<PlatformInventoryLevel>) -> Self {
        self.state.lock().unwrap().levels.insert(location_id, levels);
        self
    }

    pub fn with_orders(self, orders: Vec<PlatformOrder>) -> Self {
        self.state.lock().unwrap().orders = orders;
        self
    }

    pub fn with_fulfillments(self, order_id: i64, fulfillments: Vec<PlatformFulfillment>) -> Self {
        self.state
            .lock()
            .unwrap()
            .fulfillments
            .insert(order_id, fulfillments);
        self
    }

    pub fn with_webhooks(self, webhooks: Vec<PlatformWebhook>) -> Self {
        self.state.lock().unwrap().webhooks = webhooks;
        self
    }

    pub fn failing_location(self, location_id: i64) -> Self {
        self.state.lock().unwrap().failing_locations.insert(location_id);
        self
    }

    /// Writes for this item fail with 500.
    pub fn failing_item(self, inventory_item_id: i64) -> Self {
        self.state.lock().unwrap().failing_items.insert(inventory_item_id);
        self
    }

    pub fn failing_location_list(self) -> Self {
        self.state.lock().unwrap().fail_location_list = true;
        self
    }

    pub fn failing_level_reads(self) -> Self {
        self.state.lock().unwrap().fail_level_reads = true;
        self
    }

    /// The next writes fail with these statuses, in order.
    pub fn script_failures(&self, statuses: &[StatusCode]) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .extend(statuses.iter().copied());
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    pub fn set_level(&self, level: PlatformInventoryLevel) {
        let mut state = self.state.lock().unwrap();
        let levels = state.levels.entry(level.location_id).or_default();
        levels.retain(|l| l.inventory_item_id != level.inventory_item_id);
        levels.push(level);
    }

    pub fn level_queries(&self) -> Vec<InventoryLevelQuery> {
        self.state.lock().unwrap().level_queries.clone()
    }

    pub fn set_calls(&self) -> Vec<(i64, i64, i32)> {
        self.state.lock().unwrap().set_calls.clone()
    }

    pub fn adjust_calls(&self) -> Vec<(i64, i64, i32)> {
        self.state.lock().unwrap().adjust_calls.clone()
    }

    pub fn product_updates(&self) -> Vec<(i64, Value)> {
        self.state.lock().unwrap().product_updates.clone()
    }

    pub fn created_webhooks(&self) -> Vec<PlatformWebhook> {
        self.state.lock().unwrap().created_webhooks.clone()
    }

    async fn before_write(&self, inventory_item_id: Option<i64>) -> Result<(), PlatformError> {
        let delay = self.state.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.scripted_failures.pop_front() {
            return Err(http_error(status));
        }
        if inventory_item_id.is_some_and(|id| state.failing_items.contains(&id)) {
            return Err(http_error(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(())
    }

    fn store_level(&self, inventory_item_id: i64, location_id: i64, available: i32) -> PlatformInventoryLevel {
        let level = level(inventory_item_id, location_id, available, Some(Utc::now()));
        self.set_level(level.clone());
        level
    }
}

fn http_error(status: StatusCode) -> PlatformError {
    PlatformError::Http {
        status,
        body: format!("scripted {}", status.as_u16()),
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn list_products(&self) -> Result<Vec<PlatformProduct>, PlatformError> {
        Ok(self.state.lock().unwrap().products.clone())
    }

    async fn list_locations(&self) -> Result<Vec<PlatformLocation>, PlatformError> {
        let state = self.state.lock().unwrap();
        if state.fail_location_list {
            return Err(http_error(StatusCode::BAD_GATEWAY));
        }
        Ok(state.locations.clone())
    }

    async fn list_inventory_levels(
        &self,
        query: &InventoryLevelQuery,
    ) -> Result<Vec<PlatformInventoryLevel>, PlatformError> {
        if query.location_ids.is_empty() {
            return Err(PlatformError::MissingLocationFilter);
        }
        let mut state = self.state.lock().unwrap();
        state.level_queries.push(query.clone());
        if state.fail_level_reads
            || query
                .location_ids
                .iter()
                .any(|id| state.failing_locations.contains(id))
        {
            return Err(http_error(StatusCode::BAD_GATEWAY));
        }
        Ok(query
            .location_ids
            .iter()
            .flat_map(|id| state.levels.get(id).cloned().unwrap_or_default())
            .filter(|l| {
                query.inventory_item_ids.is_empty()
                    || query.inventory_item_ids.contains(&l.inventory_item_id)
            })
            .collect())
    }

    async fn set_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError> {
        self.state
            .lock()
            .unwrap()
            .set_calls
            .push((inventory_item_id, location_id, available));
        self.before_write(Some(inventory_item_id)).await?;
        Ok(self.store_level(inventory_item_id, location_id, available))
    }

    async fn adjust_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available_adjustment: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError> {
        self.state
            .lock()
            .unwrap()
            .adjust_calls
            .push((inventory_item_id, location_id, available_adjustment));
        self.before_write(Some(inventory_item_id)).await?;
        let current = self
            .state
            .lock()
            .unwrap()
            .levels
            .get(&location_id)
            .and_then(|levels| {
                levels
                    .iter()
                    .find(|l| l.inventory_item_id == inventory_item_id)
                    .and_then(|l| l.available)
            })
            .unwrap_or(0);
        Ok(self.store_level(inventory_item_id, location_id, current + available_adjustment))
    }

    async fn update_product(
        &self,
        product_id: i64,
        patch: &Value,
    ) -> Result<PlatformProduct, PlatformError> {
        self.state
            .lock()
            .unwrap()
            .product_updates
            .push((product_id, patch.clone()));
        self.before_write(None).await?;
        Ok(PlatformProduct {
            id: product_id,
            title: patch.get("title").and_then(Value::as_str).map(str::to_string),
            handle: None,
            created_at: None,
            updated_at: Some(Utc::now()),
        })
    }

    async fn list_orders(
        &self,
        updated_at_min: DateTime<Utc>,
    ) -> Result<Vec<PlatformOrder>, PlatformError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.updated_at.map_or(true, |at| at >= updated_at_min))
            .cloned()
            .collect())
    }

    async fn list_order_fulfillments(
        &self,
        order_id: i64,
    ) -> Result<Vec<PlatformFulfillment>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.scripted_failures.pop_front() {
            return Err(http_error(status));
        }
        Ok(state.fulfillments.get(&order_id).cloned().unwrap_or_default())
    }

    async fn list_webhooks(&self) -> Result<Vec<PlatformWebhook>, PlatformError> {
        Ok(self.state.lock().unwrap().webhooks.clone())
    }

    async fn create_webhook(
        &self,
        webhook: &PlatformWebhook,
    ) -> Result<PlatformWebhook, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.scripted_failures.pop_front() {
            return Err(http_error(status));
        }
        let mut created = webhook.clone();
        created.id = Some(1000 + state.created_webhooks.len() as i64);
        state.created_webhooks.push(created.clone());
        state.webhooks.push(created.clone());
        Ok(created)
    }
}

// ── Queue ───────────────────────────────────────────────────────

/// Records enqueued payloads; optionally refuses them like an unreachable broker.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
    unavailable: bool,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// (topic, key, payload) triples in enqueue order.
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn enqueue(&self, topic: &str, key: &str, payload: &str) -> Result<(), QueueError> {
        if self.unavailable {
            return Err(QueueError::Kafka(rdkafka::error::KafkaError::Canceled));
        }
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), key.to_string(), payload.to_string()));
        Ok(())
    }

    async fn consume(
        &self,
        _topic: &str,
        handler: Arc<dyn TaskHandler>,
        _concurrency: usize,
        _shutdown: CancellationToken,
    ) -> Result<(), QueueError> {
        let pending: Vec<String> = self.sent().into_iter().map(|(_, _, p)| p).collect();
        for payload in pending {
            handler
                .handle(&payload)
                .await
                .map_err(|e| QueueError::Serialization(serde::de::Error::custom(e)))?;
        }
        Ok(())
    }
}
