//! Pull-side reconciliation: platform state is fetched in bulk and merged
//! into the local store under the last-writer-wins rules in `merge`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use shared::{PlatformFulfillment, Source};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::merge::{self, LevelUpdate};
use crate::platform::{InventoryLevelQuery, PlatformApi};
use crate::store::SyncStore;

const RECENT_ORDERS_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ProductSyncReport {
    pub fetched: usize,
    pub upserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LocationSyncReport {
    pub fetched: usize,
    pub upserted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationFailure {
    pub location_id: i64,
    pub error: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct InventorySyncReport {
    pub locations: usize,
    pub fetched: usize,
    pub items: usize,
    pub applied: usize,
    pub stale: usize,
    pub movements: usize,
    pub without_quantity: usize,
    pub failed_locations: Vec<LocationFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct OrderSyncReport {
    pub orders_fetched: usize,
}

/// Outcome of one section of `sync_all`; a failed section never hides the others.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section<T> {
    Completed(T),
    Failed(String),
}

impl<T> Section<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Section::Completed(_))
    }
}

impl<T> From<Result<T, SyncError>> for Section<T> {
    fn from(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(report) => Section::Completed(report),
            Err(e) => Section::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncAllReport {
    pub products: Section<ProductSyncReport>,
    pub locations: Section<LocationSyncReport>,
    pub inventory_levels: Section<InventorySyncReport>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn SyncStore>,
    platform: Arc<dyn PlatformApi>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SyncStore>, platform: Arc<dyn PlatformApi>) -> Self {
        Self { store, platform }
    }

    pub async fn sync_locations(&self) -> Result<LocationSyncReport, SyncError> {
        let locations = self.platform.list_locations().await?;
        let upserted = self.store.upsert_locations(&locations).await?;
        info!(fetched = locations.len(), upserted, "locations synced");
        Ok(LocationSyncReport {
            fetched: locations.len(),
            upserted,
        })
    }

    /// Products are platform-owned; only a newer platform timestamp replaces a row.
    pub async fn sync_products(&self) -> Result<ProductSyncReport, SyncError> {
        let products = self.platform.list_products().await?;
        if products.is_empty() {
            return Ok(ProductSyncReport {
                note: Some("no products on the platform".to_string()),
                ..Default::default()
            });
        }

        let upserted = self.store.upsert_products(&products).await?;
        info!(fetched = products.len(), upserted, "products synced");
        Ok(ProductSyncReport {
            fetched: products.len(),
            upserted,
            note: None,
        })
    }

    async fn location_ids(&self) -> Result<Vec<i64>, SyncError> {
        match self.platform.list_locations().await {
            Ok(locations) => Ok(locations.into_iter().map(|l| l.id).collect()),
            Err(e) => {
                warn!("Could not list platform locations, using stored ones: {}", e);
                let stored = self.store.list_locations().await?;
                if stored.is_empty() {
                    return Err(e.into());
                }
                Ok(stored.into_iter().map(|l| l.id).collect())
            }
        }
    }

    /// One fetch per location; a failing location is reported and skipped.
    pub async fn sync_inventory_levels(&self) -> Result<InventorySyncReport, SyncError> {
        let location_ids = self.location_ids().await?;
        let mut report = InventorySyncReport {
            locations: location_ids.len(),
            ..Default::default()
        };
        if location_ids.is_empty() {
            report.note = Some("no locations on the platform".to_string());
            return Ok(report);
        }

        let mut levels = Vec::new();
        for location_id in location_ids {
            match self
                .platform
                .list_inventory_levels(&InventoryLevelQuery::location(location_id))
                .await
            {
                Ok(batch) => levels.extend(batch),
                Err(e) => {
                    warn!(location_id, "inventory level fetch failed, skipping location: {}", e);
                    report.failed_locations.push(LocationFailure {
                        location_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.fetched = levels.len();
        if levels.is_empty() {
            report.note = Some("no inventory levels fetched".to_string());
            return Ok(report);
        }

        let collapsed = merge::collapse_by_item(levels);
        report.items = collapsed.len();
        let updates: Vec<LevelUpdate> = collapsed
            .iter()
            .filter_map(|level| LevelUpdate::from_platform(level, Source::Platform))
            .collect();
        report.without_quantity = report.items - updates.len();

        let applied = self.store.apply_inventory_levels(updates).await?;
        report.applied = applied.applied;
        report.stale = applied.stale;
        report.movements = applied.movements;

        info!(
            locations = report.locations,
            fetched = report.fetched,
            applied = report.applied,
            stale = report.stale,
            failed_locations = report.failed_locations.len(),
            "inventory levels synced"
        );
        Ok(report)
    }

    /// Runs the three sections concurrently and reports each on its own.
    pub async fn sync_all(&self) -> SyncAllReport {
        let (products, locations, inventory_levels) = tokio::join!(
            self.sync_products(),
            self.sync_locations(),
            self.sync_inventory_levels(),
        );
        let report = SyncAllReport {
            products: products.into(),
            locations: locations.into(),
            inventory_levels: inventory_levels.into(),
        };
        if !(report.products.is_completed()
            && report.locations.is_completed()
            && report.inventory_levels.is_completed())
        {
            warn!(?report, "sync finished with failed sections");
        }
        report
    }

    /// Read-only look at orders touched in the last hour.
    pub async fn sync_recent_orders(&self) -> Result<OrderSyncReport, SyncError> {
        let since = Utc::now() - chrono::Duration::minutes(RECENT_ORDERS_WINDOW_MINUTES);
        let orders = self.platform.list_orders(since).await?;
        info!(orders_fetched = orders.len(), "recent orders fetched");
        Ok(OrderSyncReport {
            orders_fetched: orders.len(),
        })
    }

    /// Fulfillments the platform holds for one order, read through.
    pub async fn order_fulfillments(
        &self,
        order_id: i64,
    ) -> Result<Vec<PlatformFulfillment>, SyncError> {
        let fulfillments = self.platform.list_order_fulfillments(order_id).await?;
        info!(order_id, fulfillments = fulfillments.len(), "order fulfillments fetched");
        Ok(fulfillments)
    }
}
