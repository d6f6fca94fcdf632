use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::*;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{PlatformError, StoreError};
use crate::merge::LevelUpdate;
use crate::models::{Enqueued, NewOutboxJob, OutboxJob};
use crate::platform::PlatformApi;
use crate::store::{StaleJobs, SyncStore};

/// Entry point for anything that wants a write delivered to the platform.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn SyncStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Queue `command`. A job already holding `idempotency_key` wins and its
    /// id is returned instead.
    pub async fn enqueue(
        &self,
        command: &OutboxCommand,
        idempotency_key: Option<&str>,
    ) -> Result<Enqueued, StoreError> {
        let key = idempotency_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        let job = NewOutboxJob::new(command, key.clone())?;
        let enqueued = self.store.enqueue_job(job).await?;

        if enqueued.created {
            info!(job_id = %enqueued.job_id, job_type = command.job_type().as_str(), ?key, "outbox job queued");
        } else {
            info!(job_id = %enqueued.job_id, ?key, "idempotency key already queued, reusing job");
        }
        Ok(enqueued)
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<OutboxJob>, StoreError> {
        self.store.job(id).await
    }
}

/// `min(base * 2^(attempts-1), max)`.
pub fn backoff(attempts: i32, base: Duration, max: Duration) -> Duration {
    let exponent = (attempts.max(1) - 1).min(30) as u32;
    base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
}

#[derive(Debug, thiserror::Error)]
enum CallFailure {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("platform call timed out after {0:?}")]
    TimedOut(Duration),
}

impl CallFailure {
    fn is_transient(&self) -> bool {
        match self {
            CallFailure::Platform(e) => e.is_transient(),
            CallFailure::TimedOut(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Done,
    Retried {
        attempts: i32,
        run_after: DateTime<Utc>,
    },
    Failed {
        attempts: i32,
    },
}

pub struct Dispatcher {
    store: Arc<dyn SyncStore>,
    platform: Arc<dyn PlatformApi>,
    config: OutboxConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn SyncStore>, platform: Arc<dyn PlatformApi>, config: OutboxConfig) -> Self {
        Self {
            store,
            platform,
            config,
        }
    }

    /// Start `concurrency` workers plus the stale-lease sweeper and wait for
    /// all of them to stop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if self.config.lease <= self.config.call_timeout {
            warn!(
                lease = ?self.config.lease,
                call_timeout = ?self.config.call_timeout,
                "outbox lease is not longer than the call timeout; live jobs may be requeued"
            );
        }

        let mut workers = JoinSet::new();
        for worker in 0..self.config.concurrency {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { dispatcher.work(worker, shutdown).await });
        }
        {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { dispatcher.sweep(shutdown).await });
        }

        info!(concurrency = self.config.concurrency, "outbox dispatcher started");
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Outbox worker task failed: {}", e);
            }
        }
        info!("outbox dispatcher stopped");
    }

    async fn work(&self, worker: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.dispatch_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker, "Error dispatching outbox job: {}", e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn sweep(&self, shutdown: CancellationToken) {
        let mut interval = time::interval((self.config.lease / 2).max(self.config.poll_interval));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.requeue_stale().await {
                        error!("Error requeueing stale outbox jobs: {}", e);
                    }
                }
            }
        }
    }

    /// Return jobs whose worker has held them longer than the lease. Jobs
    /// that have no attempts left are failed instead.
    pub async fn requeue_stale(&self) -> Result<StaleJobs, StoreError> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let swept = self
            .store
            .requeue_stale_jobs(Utc::now() - lease, self.config.max_attempts)
            .await?;
        if swept.requeued > 0 {
            warn!(requeued = swept.requeued, "requeued outbox jobs with expired lease");
        }
        if swept.failed > 0 {
            error!(failed = swept.failed, "outbox jobs failed after their last lease expired");
        }
        Ok(swept)
    }

    /// Claim one due job and run it. `None` when nothing is due.
    pub async fn dispatch_next(&self) -> Result<Option<DispatchOutcome>, StoreError> {
        let Some(job) = self.store.claim_next_job().await? else {
            return Ok(None);
        };
        self.dispatch(job).await.map(Some)
    }

    async fn dispatch(&self, job: OutboxJob) -> Result<DispatchOutcome, StoreError> {
        debug!(job_id = %job.id, job_type = job.command.job_type().as_str(), attempts = job.attempts, "dispatching outbox job");

        let result = match time::timeout(self.config.call_timeout, self.execute(&job.command)).await {
            Ok(result) => result.map_err(CallFailure::from),
            Err(_) => Err(CallFailure::TimedOut(self.config.call_timeout)),
        };

        match result {
            Ok(level) => {
                if self.store.complete_job(job.id).await? {
                    info!(job_id = %job.id, job_type = job.command.job_type().as_str(), "outbox job done");
                } else {
                    warn!(job_id = %job.id, "outbox job finished after its lease was taken over; completion not recorded");
                }
                if let Some(level) = level {
                    self.record_local_level(job.id, level).await;
                }
                Ok(DispatchOutcome::Done)
            }
            Err(failure) => self.handle_failure(&job, failure).await,
        }
    }

    async fn execute(
        &self,
        command: &OutboxCommand,
    ) -> Result<Option<PlatformInventoryLevel>, PlatformError> {
        match command {
            OutboxCommand::AdjustInventory(p) => self
                .platform
                .adjust_inventory_level(p.inventory_item_id, p.location_id, p.available_adjustment)
                .await
                .map(Some),
            OutboxCommand::SetInventory(p) => self
                .platform
                .set_inventory_level(p.inventory_item_id, p.location_id, p.available)
                .await
                .map(Some),
            OutboxCommand::UpdateProduct(p) => self
                .platform
                .update_product(p.product_id, &p.product)
                .await
                .map(|_| None),
        }
    }

    async fn handle_failure(
        &self,
        job: &OutboxJob,
        failure: CallFailure,
    ) -> Result<DispatchOutcome, StoreError> {
        let attempts = job.attempts + 1;
        let transient = failure.is_transient();
        let limit = if transient {
            self.config.max_attempts
        } else {
            self.config.permanent_max_attempts
        };
        let message = failure.to_string();

        if attempts >= limit {
            self.store.fail_job(job.id, &message).await?;
            error!(job_id = %job.id, attempts, transient, "outbox job failed permanently: {}", message);
            return Ok(DispatchOutcome::Failed { attempts });
        }

        let delay = backoff(attempts, self.config.backoff_base, self.config.backoff_max);
        let run_after =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.retry_job(job.id, &message, run_after).await?;
        warn!(job_id = %job.id, attempts, transient, retry_in = ?delay, "outbox job will be retried: {}", message);
        Ok(DispatchOutcome::Retried { attempts, run_after })
    }

    /// Mirror the platform's post-write quantity locally. The job is already
    /// done at this point, so a failure here is only logged.
    async fn record_local_level(&self, job_id: Uuid, mut level: PlatformInventoryLevel) {
        level.updated_at = level.updated_at.or_else(|| Some(Utc::now()));
        let Some(update) = LevelUpdate::from_platform(&level, Source::Local) else {
            return;
        };
        match self.store.apply_inventory_levels(vec![update]).await {
            Ok(report) => debug!(%job_id, movements = report.movements, "local level updated"),
            Err(e) => error!(%job_id, "Error recording dispatched inventory level: {}", e),
        }
    }
}
