use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformProduct {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformLocation {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub address2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

/// One (inventory item, location) quantity as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInventoryLevel {
    pub inventory_item_id: i64,
    pub location_id: i64,
    #[serde(default)]
    pub available: Option<i32>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformOrder {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub financial_status: Option<String>,
    #[serde(default)]
    pub fulfillment_status: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformFulfillment {
    pub id: i64,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformWebhook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub topic: String,
    pub address: String,
    #[serde(default = "default_webhook_format")]
    pub format: String,
}

fn default_webhook_format() -> String {
    "json".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxJobType {
    AdjustInventory,
    SetInventory,
    UpdateProduct,
}

impl OutboxJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxJobType::AdjustInventory => "adjust_inventory",
            OutboxJobType::SetInventory => "set_inventory",
            OutboxJobType::UpdateProduct => "update_product",
        }
    }
}

impl FromStr for OutboxJobType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adjust_inventory" => Ok(OutboxJobType::AdjustInventory),
            "set_inventory" => Ok(OutboxJobType::SetInventory),
            "update_product" => Ok(OutboxJobType::UpdateProduct),
            other => Err(ParseEnumError::new("job type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustInventoryPayload {
    pub inventory_item_id: i64,
    pub location_id: i64,
    pub available_adjustment: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetInventoryPayload {
    pub inventory_item_id: i64,
    pub location_id: i64,
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProductPayload {
    pub product_id: i64,
    pub product: serde_json::Value,
}

/// A platform write waiting in the outbox. Stored as `job_type` + `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "payload", rename_all = "snake_case")]
pub enum OutboxCommand {
    AdjustInventory(AdjustInventoryPayload),
    SetInventory(SetInventoryPayload),
    UpdateProduct(UpdateProductPayload),
}

impl OutboxCommand {
    pub fn job_type(&self) -> OutboxJobType {
        match self {
            OutboxCommand::AdjustInventory(_) => OutboxJobType::AdjustInventory,
            OutboxCommand::SetInventory(_) => OutboxJobType::SetInventory,
            OutboxCommand::UpdateProduct(_) => OutboxJobType::UpdateProduct,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            OutboxCommand::AdjustInventory(p) => serde_json::to_value(p),
            OutboxCommand::SetInventory(p) => serde_json::to_value(p),
            OutboxCommand::UpdateProduct(p) => serde_json::to_value(p),
        }
    }

    pub fn from_parts(
        job_type: OutboxJobType,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match job_type {
            OutboxJobType::AdjustInventory => {
                OutboxCommand::AdjustInventory(serde_json::from_value(payload)?)
            }
            OutboxJobType::SetInventory => {
                OutboxCommand::SetInventory(serde_json::from_value(payload)?)
            }
            OutboxJobType::UpdateProduct => {
                OutboxCommand::UpdateProduct(serde_json::from_value(payload)?)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseEnumError::new("job status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(ParseEnumError::new("sync status", other)),
        }
    }
}

/// Which side a value came from. Used both as source-of-truth flag and
/// as the movement ledger's source tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Platform,
    Local,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Platform => "platform",
            Source::Local => "local",
        }
    }
}

impl FromStr for Source {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(Source::Platform),
            "local" => Ok(Source::Local),
            other => Err(ParseEnumError::new("source", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WebhookTopic {
    OrdersCreate,
    OrdersUpdated,
    OrdersCancelled,
    OrdersFulfilled,
    InventoryLevelsUpdate,
    ProductsCreate,
    ProductsUpdate,
    ProductsDelete,
    FulfillmentsCreate,
    FulfillmentsUpdate,
    AppUninstalled,
    Other(String),
}

impl WebhookTopic {
    /// Topics that have a dedicated ingress endpoint.
    pub const ROUTED: [WebhookTopic; 8] = [
        WebhookTopic::OrdersCreate,
        WebhookTopic::OrdersUpdated,
        WebhookTopic::OrdersCancelled,
        WebhookTopic::InventoryLevelsUpdate,
        WebhookTopic::ProductsUpdate,
        WebhookTopic::FulfillmentsCreate,
        WebhookTopic::FulfillmentsUpdate,
        WebhookTopic::AppUninstalled,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            WebhookTopic::OrdersCreate => "orders/create",
            WebhookTopic::OrdersUpdated => "orders/updated",
            WebhookTopic::OrdersCancelled => "orders/cancelled",
            WebhookTopic::OrdersFulfilled => "orders/fulfilled",
            WebhookTopic::InventoryLevelsUpdate => "inventory_levels/update",
            WebhookTopic::ProductsCreate => "products/create",
            WebhookTopic::ProductsUpdate => "products/update",
            WebhookTopic::ProductsDelete => "products/delete",
            WebhookTopic::FulfillmentsCreate => "fulfillments/create",
            WebhookTopic::FulfillmentsUpdate => "fulfillments/update",
            WebhookTopic::AppUninstalled => "app/uninstalled",
            WebhookTopic::Other(topic) => topic,
        }
    }
}

impl From<&str> for WebhookTopic {
    fn from(value: &str) -> Self {
        match value {
            "orders/create" => WebhookTopic::OrdersCreate,
            "orders/updated" => WebhookTopic::OrdersUpdated,
            "orders/cancelled" => WebhookTopic::OrdersCancelled,
            "orders/fulfilled" => WebhookTopic::OrdersFulfilled,
            "inventory_levels/update" => WebhookTopic::InventoryLevelsUpdate,
            "products/create" => WebhookTopic::ProductsCreate,
            "products/update" => WebhookTopic::ProductsUpdate,
            "products/delete" => WebhookTopic::ProductsDelete,
            "fulfillments/create" => WebhookTopic::FulfillmentsCreate,
            "fulfillments/update" => WebhookTopic::FulfillmentsUpdate,
            "app/uninstalled" => WebhookTopic::AppUninstalled,
            other => WebhookTopic::Other(other.to_string()),
        }
    }
}

impl From<String> for WebhookTopic {
    fn from(value: String) -> Self {
        WebhookTopic::from(value.as_str())
    }
}

impl From<WebhookTopic> for String {
    fn from(topic: WebhookTopic) -> Self {
        topic.as_str().to_string()
    }
}

impl fmt::Display for WebhookTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the ingress hands to the task queue after the audit row is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event_id: Uuid,
    pub topic: WebhookTopic,
    pub shop_domain: Option<String>,
    pub webhook_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}
