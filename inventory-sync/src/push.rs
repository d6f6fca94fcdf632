use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use shared::Source;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::merge::LevelUpdate;
use crate::platform::{InventoryLevelQuery, PlatformApi};
use crate::store::SyncStore;

const ITEM_ID_FIELDS: [&str; 4] = [
    "inventory_item_id",
    "inventoryItemId",
    "shopify_inventory_item_id",
    "shopifyInventoryItemId",
];
const AVAILABLE_FIELDS: [&str; 4] = ["available", "stock", "quantity", "on_hand"];
const LOCATION_FIELDS: [&str; 4] = [
    "location_id",
    "locationId",
    "shopify_location_id",
    "shopifyLocationId",
];

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub attempted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub mismatches_corrected: usize,
}

/// What a local record says the platform should hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStock {
    pub inventory_item_id: i64,
    pub available: i32,
    pub location_id: Option<i64>,
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        }
        _ => None,
    }
}

/// First alias that holds a usable integer.
fn pick(record: &Value, fields: &[&str]) -> Option<i64> {
    fields
        .iter()
        .filter_map(|field| record.get(*field))
        .find_map(as_i64)
}

/// Resolve a legacy inventory record. `None` when the item id or the
/// quantity cannot be found under any known name.
pub fn resolve_record(record: &Value) -> Option<LocalStock> {
    let inventory_item_id = pick(record, &ITEM_ID_FIELDS).filter(|id| *id > 0)?;
    let available = pick(record, &AVAILABLE_FIELDS)?;
    let available = i32::try_from(available.max(0)).unwrap_or(i32::MAX);

    Some(LocalStock {
        inventory_item_id,
        available,
        location_id: pick(record, &LOCATION_FIELDS).filter(|id| *id > 0),
    })
}

pub struct InventoryPusher {
    store: Arc<dyn SyncStore>,
    platform: Arc<dyn PlatformApi>,
    default_location_id: Option<i64>,
}

impl InventoryPusher {
    pub fn new(
        store: Arc<dyn SyncStore>,
        platform: Arc<dyn PlatformApi>,
        default_location_id: Option<i64>,
    ) -> Self {
        Self {
            store,
            platform,
            default_location_id,
        }
    }

    /// Push every local quantity to the platform. Per-item failures are
    /// logged and counted; only an unreadable local store aborts.
    pub async fn push_all_local_inventory(&self) -> Result<PushSummary, StoreError> {
        let records = self.store.list_local_inventory().await?;
        let single_location = OnceCell::new();
        let mut summary = PushSummary::default();

        for record in &records {
            let Some(stock) = resolve_record(record) else {
                summary.skipped += 1;
                continue;
            };

            summary.attempted += 1;
            match self.push_one(&stock, &single_location).await {
                Ok(corrected) => {
                    summary.updated += 1;
                    if corrected {
                        summary.mismatches_corrected += 1;
                    }
                }
                Err(e) => warn!(
                    inventory_item_id = stock.inventory_item_id,
                    available = stock.available,
                    "Push inventory failed: {:#}",
                    e
                ),
            }
        }

        info!(
            attempted = summary.attempted,
            updated = summary.updated,
            skipped = summary.skipped,
            mismatches_corrected = summary.mismatches_corrected,
            "local inventory pushed"
        );
        Ok(summary)
    }

    /// Returns whether the platform held a different quantity before the write.
    async fn push_one(&self, stock: &LocalStock, single_location: &OnceCell<Option<i64>>) -> Result<bool> {
        let location_id = match stock.location_id.or(self.default_location_id) {
            Some(id) => id,
            None => match single_location
                .get_or_init(|| self.only_known_location())
                .await
            {
                Some(id) => *id,
                None => bail!("location_id is required when the store has several locations"),
            },
        };

        let before = match self
            .platform
            .list_inventory_levels(&InventoryLevelQuery::item_at(stock.inventory_item_id, location_id))
            .await
        {
            Ok(levels) => levels
                .into_iter()
                .find(|l| l.inventory_item_id == stock.inventory_item_id)
                .and_then(|l| l.available),
            Err(e) => {
                debug!(inventory_item_id = stock.inventory_item_id, "current level unavailable: {}", e);
                None
            }
        };

        let mut written = self
            .platform
            .set_inventory_level(stock.inventory_item_id, location_id, stock.available)
            .await?;

        written.updated_at = written.updated_at.or_else(|| Some(Utc::now()));
        if let Some(update) = LevelUpdate::from_platform(&written, Source::Local) {
            if let Err(e) = self.store.apply_inventory_levels(vec![update]).await {
                warn!(inventory_item_id = stock.inventory_item_id, "pushed level not recorded locally: {}", e);
            }
        }

        Ok(before.is_some_and(|previous| previous != stock.available))
    }

    async fn only_known_location(&self) -> Option<i64> {
        let ids: Vec<i64> = match self.platform.list_locations().await {
            Ok(locations) => locations.into_iter().map(|l| l.id).collect(),
            Err(e) => {
                debug!("platform locations unavailable, using stored ones: {}", e);
                match self.store.list_locations().await {
                    Ok(locations) => locations.into_iter().map(|l| l.id).collect(),
                    Err(e) => {
                        warn!("Could not read stored locations: {}", e);
                        Vec::new()
                    }
                }
            }
        };
        match ids.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}
