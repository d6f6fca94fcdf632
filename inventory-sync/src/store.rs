use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text, Timestamptz};
use diesel::upsert::excluded;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::*;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger;
use crate::merge::{self, Decision, LevelUpdate};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

/// Outcome of merging a batch of inventory levels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub stale: usize,
    pub movements: usize,
}

impl ApplyReport {
    fn absorb(&mut self, applied: bool, moved: bool) {
        if applied {
            self.applied += 1;
        } else {
            self.stale += 1;
        }
        if moved {
            self.movements += 1;
        }
    }
}

/// Outcome of one stale-lease sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StaleJobs {
    pub requeued: usize,
    pub failed: usize,
}

pub const LEASE_EXPIRED: &str = "processing lease expired";

/// Everything the sync engine needs from the relational store.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Upserts products whose platform timestamp is newer than the stored one.
    /// Returns how many rows were written.
    async fn upsert_products(&self, products: &[PlatformProduct]) -> Result<usize, StoreError>;

    async fn upsert_locations(&self, locations: &[PlatformLocation]) -> Result<usize, StoreError>;

    async fn list_locations(&self) -> Result<Vec<Location>, StoreError>;

    /// Merges levels last-writer-wins and appends a ledger row for every
    /// quantity that changed, all in one transaction.
    async fn apply_inventory_levels(
        &self,
        updates: Vec<LevelUpdate>,
    ) -> Result<ApplyReport, StoreError>;

    async fn inventory_level(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<InventoryLevel>, StoreError>;

    async fn movements_for_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Vec<InventoryMovement>, StoreError>;

    async fn list_local_inventory(&self) -> Result<Vec<serde_json::Value>, StoreError>;

    /// Returns `None` when a delivery with the same webhook id already exists.
    async fn record_webhook_event(&self, event: NewWebhookEvent)
        -> Result<Option<Uuid>, StoreError>;

    async fn claim_webhook_event(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError>;

    async fn claim_next_webhook_event(
        &self,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError>;

    async fn mark_webhook_processed(&self, id: Uuid) -> Result<(), StoreError>;

    /// Records a processing failure. The claim is kept, so the event is
    /// retried once its lease expires.
    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Inserts a queued job unless its idempotency key is already taken,
    /// in which case the existing job's id is returned.
    async fn enqueue_job(&self, job: NewOutboxJob) -> Result<Enqueued, StoreError>;

    /// Atomically moves the oldest due job from `queued` to `processing`.
    /// A row that no longer decodes is marked failed and skipped.
    async fn claim_next_job(&self) -> Result<Option<OutboxJob>, StoreError>;

    /// Returns false when the job was no longer `processing`, e.g. because
    /// its lease expired and another worker picked it up.
    async fn complete_job(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn job(&self, id: Uuid) -> Result<Option<OutboxJob>, StoreError>;

    /// Returns jobs stuck in `processing` since before `older_than` to the
    /// queue. The expired lease counts as an attempt; a job that has used up
    /// `max_attempts` is failed instead.
    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<StaleJobs, StoreError>;
}

const UPSERT_PRODUCT_SQL: &str = "
    INSERT INTO products (id, title, handle, platform_created_at, platform_updated_at, last_synced_at, sync_status, source_of_truth)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (id) DO UPDATE SET
        title = EXCLUDED.title,
        handle = EXCLUDED.handle,
        platform_created_at = EXCLUDED.platform_created_at,
        platform_updated_at = EXCLUDED.platform_updated_at,
        last_synced_at = EXCLUDED.last_synced_at,
        sync_status = EXCLUDED.sync_status,
        source_of_truth = EXCLUDED.source_of_truth
    WHERE EXCLUDED.platform_updated_at IS NOT NULL
      AND (products.platform_updated_at IS NULL
           OR EXCLUDED.platform_updated_at > products.platform_updated_at)";

const CLAIM_JOB_SQL: &str = "
    UPDATE outbox_jobs SET status = 'processing', updated_at = NOW()
    WHERE status = 'queued' AND id = (
        SELECT id FROM outbox_jobs
        WHERE status = 'queued' AND run_after <= NOW()
        ORDER BY run_after, created_at
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, job_type, idempotency_key, payload, status, attempts, last_error, run_after, created_at, updated_at";

const CLAIM_WEBHOOK_SQL: &str = "
    UPDATE webhook_events SET claimed_at = $1
    WHERE id = (
        SELECT id FROM webhook_events
        WHERE processed_at IS NULL AND (claimed_at IS NULL OR claimed_at < $2)
        ORDER BY received_at
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, topic, shop_domain, webhook_id, payload, received_at, claimed_at, processed_at, last_error";

const LOCAL_INVENTORY_SQL: &str =
    "SELECT row_to_json(i)::jsonb AS record FROM inventory i ORDER BY i.created_at DESC NULLS LAST, i.id";

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn lease_cutoff(lease: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Merges one level into the locked row. Returns (applied, movement written).
async fn apply_level(
    conn: &mut AsyncPgConnection,
    update: LevelUpdate,
    now: DateTime<Utc>,
) -> Result<(bool, bool), StoreError> {
    let source = update.source;

    // A concurrent insert can win the race for a brand new item; the second
    // pass then sees that row and goes through the timestamp comparison.
    for _ in 0..2 {
        let existing = inventory_levels::table
            .find(update.inventory_item_id)
            .for_update()
            .first::<InventoryLevel>(conn)
            .await
            .optional()?;

        let row = update.clone().into_row(now);
        match merge::decide(existing.as_ref(), &update) {
            Decision::Insert => {
                let inserted = diesel::insert_into(inventory_levels::table)
                    .values(&row)
                    .on_conflict(inventory_levels::inventory_item_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    continue;
                }
            }
            Decision::Update => {
                diesel::update(inventory_levels::table.find(row.inventory_item_id))
                    .set((
                        inventory_levels::location_id.eq(row.location_id),
                        inventory_levels::available.eq(row.available),
                        inventory_levels::platform_updated_at.eq(row.platform_updated_at),
                        inventory_levels::last_synced_at.eq(row.last_synced_at),
                        inventory_levels::sync_status.eq(&row.sync_status),
                        inventory_levels::source_of_truth.eq(&row.source_of_truth),
                    ))
                    .execute(conn)
                    .await?;
            }
            Decision::KeepExisting => return Ok((false, false)),
        }

        let previous = match ledger::available_at(existing.as_ref(), row.location_id) {
            Some(available) => Some(available),
            None => ledger::last_recorded(conn, row.inventory_item_id, row.location_id).await?,
        };
        let movement = ledger::movement_for(previous, &row, source, now);
        if let Some(movement) = &movement {
            ledger::append(conn, movement).await?;
        }
        return Ok((true, movement.is_some()));
    }

    Err(StoreError::Invalid(format!(
        "inventory item {} changed concurrently during merge",
        update.inventory_item_id
    )))
}

#[async_trait]
impl SyncStore for PgStore {
    async fn upsert_products(&self, products: &[PlatformProduct]) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let rows: Vec<Product> = products
            .iter()
            .map(|p| Product::from_platform(p, now))
            .collect();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let mut written = 0;
                for row in rows {
                    written += diesel::sql_query(UPSERT_PRODUCT_SQL)
                        .bind::<BigInt, _>(row.id)
                        .bind::<Nullable<Text>, _>(row.title)
                        .bind::<Nullable<Text>, _>(row.handle)
                        .bind::<Nullable<Timestamptz>, _>(row.platform_created_at)
                        .bind::<Nullable<Timestamptz>, _>(row.platform_updated_at)
                        .bind::<Nullable<Timestamptz>, _>(row.last_synced_at)
                        .bind::<Text, _>(row.sync_status)
                        .bind::<Text, _>(row.source_of_truth)
                        .execute(conn)
                        .await?;
                }
                Ok(written)
            })
        })
        .await
    }

    async fn upsert_locations(&self, locations: &[PlatformLocation]) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let rows: Vec<Location> = locations
            .iter()
            .map(|loc| Location::from_platform(loc, now))
            .collect();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let mut written = 0;
                for row in rows {
                    written += diesel::insert_into(locations::table)
                        .values(&row)
                        .on_conflict(locations::id)
                        .do_update()
                        .set((
                            locations::name.eq(excluded(locations::name)),
                            locations::address1.eq(excluded(locations::address1)),
                            locations::address2.eq(excluded(locations::address2)),
                            locations::city.eq(excluded(locations::city)),
                            locations::province.eq(excluded(locations::province)),
                            locations::country.eq(excluded(locations::country)),
                            locations::zip.eq(excluded(locations::zip)),
                            locations::last_synced_at.eq(excluded(locations::last_synced_at)),
                        ))
                        .execute(conn)
                        .await?;
                }
                Ok(written)
            })
        })
        .await
    }

    async fn list_locations(&self) -> Result<Vec<Location>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = locations::table
            .order(locations::id.asc())
            .load::<Location>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn apply_inventory_levels(
        &self,
        updates: Vec<LevelUpdate>,
    ) -> Result<ApplyReport, StoreError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        let report = conn
            .transaction::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let mut report = ApplyReport::default();
                    for update in updates {
                        let (applied, moved) = apply_level(conn, update, now).await?;
                        report.absorb(applied, moved);
                    }
                    Ok(report)
                })
            })
            .await?;

        debug!(?report, "inventory levels merged");
        Ok(report)
    }

    async fn inventory_level(
        &self,
        inventory_item_id: i64,
    ) -> Result<Option<InventoryLevel>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row = inventory_levels::table
            .find(inventory_item_id)
            .first::<InventoryLevel>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    async fn movements_for_item(
        &self,
        inventory_item_id: i64,
    ) -> Result<Vec<InventoryMovement>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = inventory_movements::table
            .filter(inventory_movements::inventory_item_id.eq(inventory_item_id))
            .order(inventory_movements::occurred_at.asc())
            .load::<InventoryMovement>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn list_local_inventory(&self) -> Result<Vec<serde_json::Value>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = diesel::sql_query(LOCAL_INVENTORY_SQL)
            .load::<LocalInventoryRecord>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(|r| r.record).collect())
    }

    async fn record_webhook_event(
        &self,
        event: NewWebhookEvent,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut conn = self.pool.get().await?;
        let id = diesel::insert_into(webhook_events::table)
            .values(&event)
            .on_conflict(webhook_events::webhook_id)
            .do_nothing()
            .returning(webhook_events::id)
            .get_result::<Uuid>(&mut conn)
            .await
            .optional()?;
        Ok(id)
    }

    async fn claim_webhook_event(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let mut conn = self.pool.get().await?;
        let cutoff = lease_cutoff(lease);
        let event = diesel::update(
            webhook_events::table
                .filter(webhook_events::id.eq(id))
                .filter(webhook_events::processed_at.is_null())
                .filter(
                    webhook_events::claimed_at
                        .is_null()
                        .or(webhook_events::claimed_at.lt(cutoff)),
                ),
        )
        .set(webhook_events::claimed_at.eq(Utc::now()))
        .returning(WebhookEvent::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        Ok(event)
    }

    async fn claim_next_webhook_event(
        &self,
        lease: Duration,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let mut conn = self.pool.get().await?;
        let event = diesel::sql_query(CLAIM_WEBHOOK_SQL)
            .bind::<Timestamptz, _>(Utc::now())
            .bind::<Timestamptz, _>(lease_cutoff(lease))
            .get_result::<WebhookEvent>(&mut conn)
            .await
            .optional()?;
        Ok(event)
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            webhook_events::table
                .filter(webhook_events::id.eq(id))
                .filter(webhook_events::processed_at.is_null()),
        )
        .set((
            webhook_events::processed_at.eq(Utc::now()),
            webhook_events::last_error.eq(None::<String>),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(webhook_events::table.filter(webhook_events::id.eq(id)))
            .set(webhook_events::last_error.eq(Some(error)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue_job(&self, job: NewOutboxJob) -> Result<Enqueued, StoreError> {
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(outbox_jobs::table)
            .values(&job)
            .on_conflict(outbox_jobs::idempotency_key)
            .do_nothing()
            .returning(outbox_jobs::id)
            .get_result::<Uuid>(&mut conn)
            .await
            .optional()?;

        if let Some(job_id) = inserted {
            return Ok(Enqueued { job_id, created: true });
        }

        let key = job.idempotency_key.ok_or_else(|| {
            StoreError::Invalid("insert without idempotency key was dropped".to_string())
        })?;
        let job_id = outbox_jobs::table
            .filter(outbox_jobs::idempotency_key.eq(&key))
            .select(outbox_jobs::id)
            .first::<Uuid>(&mut conn)
            .await?;
        Ok(Enqueued { job_id, created: false })
    }

    async fn claim_next_job(&self) -> Result<Option<OutboxJob>, StoreError> {
        loop {
            let claimed = {
                let mut conn = self.pool.get().await?;
                diesel::sql_query(CLAIM_JOB_SQL)
                    .get_result::<DbOutboxJob>(&mut conn)
                    .await
                    .optional()?
            };
            let Some(row) = claimed else {
                return Ok(None);
            };
            let id = row.id;
            match OutboxJob::try_from(row) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!(job_id = %id, "Failing undecodable outbox job: {}", e);
                    self.fail_job(id, &e.to_string()).await?;
                }
            }
        }
    }

    async fn complete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let completed = diesel::update(
            outbox_jobs::table
                .filter(outbox_jobs::id.eq(id))
                .filter(outbox_jobs::status.eq(JobStatus::Processing.as_str())),
        )
        .set((
            outbox_jobs::status.eq(JobStatus::Done.as_str()),
            outbox_jobs::last_error.eq(None::<String>),
            outbox_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(completed > 0)
    }

    async fn retry_job(
        &self,
        id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            outbox_jobs::table
                .filter(outbox_jobs::id.eq(id))
                .filter(outbox_jobs::status.eq(JobStatus::Processing.as_str())),
        )
        .set((
            outbox_jobs::status.eq(JobStatus::Queued.as_str()),
            outbox_jobs::attempts.eq(outbox_jobs::attempts + 1),
            outbox_jobs::last_error.eq(Some(error)),
            outbox_jobs::run_after.eq(run_after),
            outbox_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            outbox_jobs::table
                .filter(outbox_jobs::id.eq(id))
                .filter(outbox_jobs::status.eq(JobStatus::Processing.as_str())),
        )
        .set((
            outbox_jobs::status.eq(JobStatus::Failed.as_str()),
            outbox_jobs::attempts.eq(outbox_jobs::attempts + 1),
            outbox_jobs::last_error.eq(Some(error)),
            outbox_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<OutboxJob>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row = outbox_jobs::table
            .find(id)
            .select(DbOutboxJob::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(OutboxJob::try_from).transpose()
    }

    async fn requeue_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<StaleJobs, StoreError> {
        let mut conn = self.pool.get().await?;
        let last_attempt = max_attempts.max(1) - 1;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();
                let failed = diesel::update(
                    outbox_jobs::table
                        .filter(outbox_jobs::status.eq(JobStatus::Processing.as_str()))
                        .filter(outbox_jobs::updated_at.lt(older_than))
                        .filter(outbox_jobs::attempts.ge(last_attempt)),
                )
                .set((
                    outbox_jobs::status.eq(JobStatus::Failed.as_str()),
                    outbox_jobs::attempts.eq(outbox_jobs::attempts + 1),
                    outbox_jobs::last_error.eq(Some(LEASE_EXPIRED)),
                    outbox_jobs::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                let requeued = diesel::update(
                    outbox_jobs::table
                        .filter(outbox_jobs::status.eq(JobStatus::Processing.as_str()))
                        .filter(outbox_jobs::updated_at.lt(older_than)),
                )
                .set((
                    outbox_jobs::status.eq(JobStatus::Queued.as_str()),
                    outbox_jobs::attempts.eq(outbox_jobs::attempts + 1),
                    outbox_jobs::last_error.eq(Some(LEASE_EXPIRED)),
                    outbox_jobs::run_after.eq(now),
                    outbox_jobs::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                Ok(StaleJobs { requeued, failed })
            })
        })
        .await
    }
}
