use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, MethodRouter},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::*;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{StoreError, SyncError};
use crate::models::{Enqueued, OutboxJob};
use crate::outbox::Outbox;
use crate::push::{InventoryPusher, PushSummary};
use crate::reconcile::{
    InventorySyncReport, LocationSyncReport, OrderSyncReport, ProductSyncReport, Reconciler,
    SyncAllReport,
};
use crate::webhook::WebhookIngress;

pub const GENERIC_WEBHOOK_PATH: &str = "/webhooks/shopify/webhooks";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Dedicated ingress path for a topic; everything else uses the generic one.
pub fn webhook_path(topic: &WebhookTopic) -> &'static str {
    match topic {
        WebhookTopic::OrdersCreate => "/api/orders",
        WebhookTopic::OrdersUpdated => "/api/orders/updated",
        WebhookTopic::OrdersCancelled => "/api/orders/cancelled",
        WebhookTopic::InventoryLevelsUpdate => "/api/inventory",
        WebhookTopic::ProductsUpdate => "/api/products",
        WebhookTopic::FulfillmentsCreate => "/api/fulfillments/create",
        WebhookTopic::FulfillmentsUpdate => "/api/fulfillments/update",
        WebhookTopic::AppUninstalled => "/api/app/uninstalled",
        _ => GENERIC_WEBHOOK_PATH,
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ingress: WebhookIngress,
    pub reconciler: Arc<Reconciler>,
    pub pusher: Arc<InventoryPusher>,
    pub outbox: Outbox,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    #[serde(flatten)]
    pub command: OutboxCommand,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        tracing::error!("Sync failed: {}", e);
        match e {
            SyncError::Platform(_) => api_error(StatusCode::BAD_GATEWAY, e),
            SyncError::Store(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }
}

fn store_error(e: StoreError) -> ApiError {
    tracing::error!("Store error: {}", e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
}

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(GENERIC_WEBHOOK_PATH, webhook_route(WebhookTopic::Other("unknown".to_string())));
    for topic in WebhookTopic::ROUTED {
        router = router.route(webhook_path(&topic), webhook_route(topic));
    }

    router
        .route("/sync/all", post(sync_all))
        .route("/sync/products", post(sync_products))
        .route("/sync/locations", post(sync_locations))
        .route("/sync/inventory-levels", post(sync_inventory_levels))
        .route("/sync/orders", post(sync_orders))
        .route("/orders/:id/fulfillments", get(order_fulfillments))
        .route("/inventory/push", post(push_inventory))
        .route("/outbox/jobs", post(enqueue_job))
        .route("/outbox/jobs/:id", get(get_job))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Raw-body handler so the signature is checked against the exact bytes.
fn webhook_route(fallback_topic: WebhookTopic) -> MethodRouter<AppState> {
    post(
        move |State(state): State<AppState>, headers: HeaderMap, body: Bytes| {
            let topic = fallback_topic.clone();
            async move { state.ingress.receive(&headers, &body, &topic).await }
        },
    )
}

pub async fn sync_all(State(state): State<AppState>) -> Json<SyncAllReport> {
    Json(state.reconciler.sync_all().await)
}

pub async fn sync_products(
    State(state): State<AppState>,
) -> Result<Json<ProductSyncReport>, ApiError> {
    Ok(Json(state.reconciler.sync_products().await?))
}

pub async fn sync_locations(
    State(state): State<AppState>,
) -> Result<Json<LocationSyncReport>, ApiError> {
    Ok(Json(state.reconciler.sync_locations().await?))
}

pub async fn sync_inventory_levels(
    State(state): State<AppState>,
) -> Result<Json<InventorySyncReport>, ApiError> {
    Ok(Json(state.reconciler.sync_inventory_levels().await?))
}

pub async fn sync_orders(
    State(state): State<AppState>,
) -> Result<Json<OrderSyncReport>, ApiError> {
    Ok(Json(state.reconciler.sync_recent_orders().await?))
}

pub async fn order_fulfillments(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<Vec<PlatformFulfillment>>, ApiError> {
    Ok(Json(state.reconciler.order_fulfillments(order_id).await?))
}

pub async fn push_inventory(State(state): State<AppState>) -> Result<Json<PushSummary>, ApiError> {
    state
        .pusher
        .push_all_local_inventory()
        .await
        .map(Json)
        .map_err(store_error)
}

/// The idempotency key may come in the body or the `Idempotency-Key` header;
/// the body wins.
pub async fn enqueue_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnqueueJobRequest>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let key = request.idempotency_key.or_else(|| {
        headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let enqueued = state
        .outbox
        .enqueue(&request.command, key.as_deref())
        .await
        .map_err(store_error)?;

    let status = if enqueued.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(enqueued)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OutboxJob>, ApiError> {
    match state.outbox.job(id).await.map_err(store_error)? {
        Some(job) => Ok(Json(job)),
        None => Err(api_error(StatusCode::NOT_FOUND, format!("job {} not found", id))),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
