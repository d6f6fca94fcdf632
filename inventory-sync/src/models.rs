use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: i64,
    pub title: Option<String>,
    pub handle: Option<String>,
    pub platform_created_at: Option<DateTime<Utc>>,
    pub platform_updated_at: Option<DateTime<Utc>>,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: String,
    pub source_of_truth: String,
}

impl Product {
    pub fn from_platform(product: &PlatformProduct, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: product.id,
            title: product.title.clone(),
            handle: product.handle.clone(),
            platform_created_at: product.created_at,
            platform_updated_at: product.updated_at,
            local_updated_at: None,
            last_synced_at: Some(synced_at),
            sync_status: SyncStatus::Synced.as_str().to_string(),
            source_of_truth: Source::Platform.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::locations)]
pub struct Location {
    pub id: i64,
    pub name: Option<String>,
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub country: Option<String>,
    pub zip: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Location {
    pub fn from_platform(location: &PlatformLocation, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: location.id,
            name: location.name.clone(),
            address1: location.address1.clone(),
            address2: location.address2.clone(),
            city: location.city.clone(),
            province: location.province.clone(),
            country: location.country.clone(),
            zip: location.zip.clone(),
            last_synced_at: Some(synced_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_levels)]
pub struct InventoryLevel {
    pub inventory_item_id: i64,
    pub location_id: i64,
    pub available: i32,
    pub platform_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: String,
    pub source_of_truth: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_movements)]
pub struct InventoryMovement {
    pub id: Uuid,
    pub inventory_item_id: i64,
    pub location_id: Option<i64>,
    pub previous_available: Option<i32>,
    pub new_available: i32,
    pub delta: i32,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, QueryableByName, Selectable, Serialize)]
#[diesel(table_name = crate::schema::webhook_events)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub topic: String,
    pub shop_domain: Option<String>,
    pub webhook_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WebhookEvent {
    pub fn envelope(&self) -> WebhookEnvelope {
        WebhookEnvelope {
            event_id: self.id,
            topic: WebhookTopic::from(self.topic.as_str()),
            shop_domain: self.shop_domain.clone(),
            webhook_id: self.webhook_id.clone(),
            payload: self.payload.clone(),
            received_at: self.received_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::webhook_events)]
pub struct NewWebhookEvent {
    pub id: Uuid,
    pub topic: String,
    pub shop_domain: Option<String>,
    pub webhook_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = crate::schema::outbox_jobs)]
pub struct DbOutboxJob {
    pub id: Uuid,
    pub job_type: String,
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_jobs)]
pub struct NewOutboxJob {
    pub id: Uuid,
    pub job_type: String,
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: String,
}

impl NewOutboxJob {
    pub fn new(
        command: &OutboxCommand,
        idempotency_key: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            job_type: command.job_type().as_str().to_string(),
            idempotency_key,
            payload: command.payload()?,
            status: JobStatus::Queued.as_str().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxJob {
    pub id: Uuid,
    pub command: OutboxCommand,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbOutboxJob> for OutboxJob {
    type Error = StoreError;

    fn try_from(db_job: DbOutboxJob) -> Result<Self, Self::Error> {
        let job_type: OutboxJobType = db_job.job_type.parse()?;
        let command = OutboxCommand::from_parts(job_type, db_job.payload)?;

        Ok(Self {
            id: db_job.id,
            command,
            idempotency_key: db_job.idempotency_key,
            status: db_job.status.parse()?,
            attempts: db_job.attempts,
            last_error: db_job.last_error,
            run_after: db_job.run_after,
            created_at: db_job.created_at,
            updated_at: db_job.updated_at,
        })
    }
}

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub job_id: Uuid,
    pub created: bool,
}

/// Local stock record as stored by the CRUD layer, kept as raw JSON so the
/// push service can resolve legacy field names.
#[derive(Debug, Clone, QueryableByName)]
pub struct LocalInventoryRecord {
    #[diesel(sql_type = diesel::sql_types::Jsonb)]
    pub record: serde_json::Value,
}
