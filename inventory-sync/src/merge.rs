//! Last-writer-wins rules shared by every path that writes inventory levels
//! or products.
//!
//! Ordering is decided by the platform-reported `updated_at`, never by
//! arrival order. An incoming value without a timestamp can only create a
//! missing row; it never overwrites an existing one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{PlatformInventoryLevel, Source, SyncStatus};
use tracing::warn;

use crate::models::InventoryLevel;

/// Whether a record stamped `incoming` replaces one stamped `existing`.
pub fn supersedes(existing: Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) -> bool {
    match (existing, incoming) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(current), Some(candidate)) => candidate > current,
    }
}

/// An inventory quantity about to be merged into the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelUpdate {
    pub inventory_item_id: i64,
    pub location_id: i64,
    pub available: i32,
    pub updated_at: Option<DateTime<Utc>>,
    pub source: Source,
}

impl LevelUpdate {
    /// Returns `None` when the platform did not report a quantity.
    pub fn from_platform(level: &PlatformInventoryLevel, source: Source) -> Option<Self> {
        let available = level.available?;
        Some(Self {
            inventory_item_id: level.inventory_item_id,
            location_id: level.location_id,
            available: non_negative(level.inventory_item_id, available),
            updated_at: level.updated_at,
            source,
        })
    }

    pub fn into_row(self, synced_at: DateTime<Utc>) -> InventoryLevel {
        InventoryLevel {
            inventory_item_id: self.inventory_item_id,
            location_id: self.location_id,
            available: self.available,
            platform_updated_at: self.updated_at,
            last_synced_at: Some(synced_at),
            sync_status: SyncStatus::Synced.as_str().to_string(),
            source_of_truth: self.source.as_str().to_string(),
        }
    }
}

fn non_negative(inventory_item_id: i64, available: i32) -> i32 {
    if available < 0 {
        warn!(inventory_item_id, available, "negative quantity clamped to zero");
        0
    } else {
        available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Insert,
    Update,
    KeepExisting,
}

pub fn decide(existing: Option<&InventoryLevel>, update: &LevelUpdate) -> Decision {
    match existing {
        None => Decision::Insert,
        Some(row) if supersedes(row.platform_updated_at, update.updated_at) => Decision::Update,
        Some(_) => Decision::KeepExisting,
    }
}

/// Collapse per-location records to one per inventory item: the newest
/// platform timestamp wins, ties keep the first seen. Input order is
/// otherwise preserved.
pub fn collapse_by_item(levels: Vec<PlatformInventoryLevel>) -> Vec<PlatformInventoryLevel> {
    let mut order: Vec<i64> = Vec::new();
    let mut latest: HashMap<i64, PlatformInventoryLevel> = HashMap::new();

    for level in levels {
        match latest.get(&level.inventory_item_id) {
            None => {
                order.push(level.inventory_item_id);
                latest.insert(level.inventory_item_id, level);
            }
            Some(current) if supersedes(current.updated_at, level.updated_at) => {
                latest.insert(level.inventory_item_id, level);
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|item_id| latest.remove(&item_id))
        .collect()
}
