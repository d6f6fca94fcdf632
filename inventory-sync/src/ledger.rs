//! Append-only movement ledger. Rows are written by whatever changes an
//! inventory level and are never updated or deleted.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::Source;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{InventoryLevel, InventoryMovement};
use crate::schema::inventory_movements;

/// Quantity the canonical row holds for `location_id`. The row tracks one
/// location per item, so a row for another location says nothing here.
pub fn available_at(existing: Option<&InventoryLevel>, location_id: i64) -> Option<i32> {
    existing
        .filter(|row| row.location_id == location_id)
        .map(|row| row.available)
}

/// Quantity the ledger last recorded for the item at `location_id`.
pub async fn last_recorded(
    conn: &mut AsyncPgConnection,
    inventory_item_id: i64,
    location_id: i64,
) -> Result<Option<i32>, StoreError> {
    let available = inventory_movements::table
        .filter(inventory_movements::inventory_item_id.eq(inventory_item_id))
        .filter(inventory_movements::location_id.eq(location_id))
        .order(inventory_movements::occurred_at.desc())
        .select(inventory_movements::new_available)
        .first::<i32>(conn)
        .await
        .optional()?;
    Ok(available)
}

/// The movement taking the item at `next.location_id` from
/// `previous_available` to `next.available`, or `None` when nothing changed.
pub fn movement_for(
    previous_available: Option<i32>,
    next: &InventoryLevel,
    source: Source,
    occurred_at: DateTime<Utc>,
) -> Option<InventoryMovement> {
    if previous_available == Some(next.available) {
        return None;
    }

    Some(InventoryMovement {
        id: Uuid::new_v4(),
        inventory_item_id: next.inventory_item_id,
        location_id: Some(next.location_id),
        previous_available,
        new_available: next.available,
        delta: next.available - previous_available.unwrap_or(0),
        source: source.as_str().to_string(),
        occurred_at,
    })
}

pub async fn append(
    conn: &mut AsyncPgConnection,
    movement: &InventoryMovement,
) -> Result<(), StoreError> {
    diesel::insert_into(inventory_movements::table)
        .values(movement)
        .execute(conn)
        .await?;
    Ok(())
}
