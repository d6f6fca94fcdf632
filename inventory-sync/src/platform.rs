use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::*;
use tracing::debug;

use crate::config::PlatformConfig;
use crate::error::PlatformError;

const PAGE_LIMIT: &str = "250";
const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Filter for `inventory_levels.json`. The platform rejects unfiltered
/// listings, so at least one location id is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryLevelQuery {
    pub location_ids: Vec<i64>,
    pub inventory_item_ids: Vec<i64>,
}

impl InventoryLevelQuery {
    pub fn location(location_id: i64) -> Self {
        Self {
            location_ids: vec![location_id],
            inventory_item_ids: Vec::new(),
        }
    }

    pub fn item_at(inventory_item_id: i64, location_id: i64) -> Self {
        Self {
            location_ids: vec![location_id],
            inventory_item_ids: vec![inventory_item_id],
        }
    }
}

/// One call per platform resource. Implementations never retry; callers own
/// all resilience.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn list_products(&self) -> Result<Vec<PlatformProduct>, PlatformError>;

    async fn list_locations(&self) -> Result<Vec<PlatformLocation>, PlatformError>;

    async fn list_inventory_levels(
        &self,
        query: &InventoryLevelQuery,
    ) -> Result<Vec<PlatformInventoryLevel>, PlatformError>;

    async fn set_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError>;

    async fn adjust_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available_adjustment: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError>;

    async fn update_product(
        &self,
        product_id: i64,
        patch: &Value,
    ) -> Result<PlatformProduct, PlatformError>;

    async fn list_orders(
        &self,
        updated_at_min: DateTime<Utc>,
    ) -> Result<Vec<PlatformOrder>, PlatformError>;

    async fn list_order_fulfillments(
        &self,
        order_id: i64,
    ) -> Result<Vec<PlatformFulfillment>, PlatformError>;

    async fn list_webhooks(&self) -> Result<Vec<PlatformWebhook>, PlatformError>;

    async fn create_webhook(
        &self,
        webhook: &PlatformWebhook,
    ) -> Result<PlatformWebhook, PlatformError>;
}

/// REST Admin API client.
#[derive(Clone)]
pub struct PlatformClient {
    client: Client,
    config: PlatformConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// For testing: point the client at a mock server.
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, endpoint: &str) -> Result<String, PlatformError> {
        let base = self.config.base_url.trim_end_matches('/');
        let has_host = Url::parse(base)
            .ok()
            .and_then(|u| u.host_str().map(|h| !h.is_empty()))
            .unwrap_or(false);
        if !has_host {
            return Err(PlatformError::NotConfigured("store domain"));
        }
        if self.config.access_token.is_empty() {
            return Err(PlatformError::NotConfigured("access token"));
        }
        Ok(format!(
            "{}/admin/api/{}/{}",
            base, self.config.api_version, endpoint
        ))
    }

    async fn send(&self, request: RequestBuilder) -> Result<(Value, Option<String>), PlatformError> {
        let response = request
            .header(ACCESS_TOKEN_HEADER, &self.config.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Http { status, body });
        }

        let next = next_page_url(response.headers());
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((body, next))
    }

    /// GET every page of a list endpoint, following `Link: rel="next"`.
    async fn get_all<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        field: &str,
    ) -> Result<Vec<T>, PlatformError> {
        let first = self
            .client
            .get(self.url(endpoint)?)
            .query(query)
            .query(&[("limit", PAGE_LIMIT)]);

        let (body, mut next) = self.send(first).await?;
        let mut items: Vec<T> = take_field(body, field)?;

        while let Some(url) = next.take() {
            debug!(endpoint, %url, "following next page");
            let (body, following) = self.send(self.client.get(&url)).await?;
            items.extend(take_field::<Vec<T>>(body, field)?);
            next = following;
        }

        Ok(items)
    }

    async fn write<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        field: &str,
    ) -> Result<T, PlatformError> {
        let (body, _) = self.send(request).await?;
        take_field(body, field)
    }
}

fn take_field<T: DeserializeOwned>(mut body: Value, field: &str) -> Result<T, PlatformError> {
    let value = body.get_mut(field).map(Value::take).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == "rel=\"next\"")
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn list_products(&self) -> Result<Vec<PlatformProduct>, PlatformError> {
        self.get_all("products.json", &[], "products").await
    }

    async fn list_locations(&self) -> Result<Vec<PlatformLocation>, PlatformError> {
        self.get_all("locations.json", &[], "locations").await
    }

    async fn list_inventory_levels(
        &self,
        query: &InventoryLevelQuery,
    ) -> Result<Vec<PlatformInventoryLevel>, PlatformError> {
        if query.location_ids.is_empty() {
            return Err(PlatformError::MissingLocationFilter);
        }

        let mut params = vec![("location_ids", join_ids(&query.location_ids))];
        if !query.inventory_item_ids.is_empty() {
            params.push(("inventory_item_ids", join_ids(&query.inventory_item_ids)));
        }
        self.get_all("inventory_levels.json", &params, "inventory_levels")
            .await
    }

    async fn set_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError> {
        let request = self
            .client
            .post(self.url("inventory_levels/set.json")?)
            .json(&json!({
                "inventory_item_id": inventory_item_id,
                "location_id": location_id,
                "available": available,
            }));
        self.write(request, "inventory_level").await
    }

    async fn adjust_inventory_level(
        &self,
        inventory_item_id: i64,
        location_id: i64,
        available_adjustment: i32,
    ) -> Result<PlatformInventoryLevel, PlatformError> {
        let request = self
            .client
            .post(self.url("inventory_levels/adjust.json")?)
            .json(&json!({
                "inventory_item_id": inventory_item_id,
                "location_id": location_id,
                "available_adjustment": available_adjustment,
            }));
        self.write(request, "inventory_level").await
    }

    async fn update_product(
        &self,
        product_id: i64,
        patch: &Value,
    ) -> Result<PlatformProduct, PlatformError> {
        let request = self
            .client
            .put(self.url(&format!("products/{product_id}.json"))?)
            .json(&json!({ "product": patch }));
        self.write(request, "product").await
    }

    async fn list_orders(
        &self,
        updated_at_min: DateTime<Utc>,
    ) -> Result<Vec<PlatformOrder>, PlatformError> {
        let params = [
            ("status", "any".to_string()),
            ("order", "updated_at desc".to_string()),
            ("updated_at_min", updated_at_min.to_rfc3339()),
        ];
        self.get_all("orders.json", &params, "orders").await
    }

    async fn list_order_fulfillments(
        &self,
        order_id: i64,
    ) -> Result<Vec<PlatformFulfillment>, PlatformError> {
        self.get_all(
            &format!("orders/{order_id}/fulfillments.json"),
            &[],
            "fulfillments",
        )
        .await
    }

    async fn list_webhooks(&self) -> Result<Vec<PlatformWebhook>, PlatformError> {
        self.get_all("webhooks.json", &[], "webhooks").await
    }

    async fn create_webhook(
        &self,
        webhook: &PlatformWebhook,
    ) -> Result<PlatformWebhook, PlatformError> {
        let request = self
            .client
            .post(self.url("webhooks.json")?)
            .json(&json!({ "webhook": webhook }));
        self.write(request, "webhook").await
    }
}
