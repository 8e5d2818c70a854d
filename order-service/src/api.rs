use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, rejection::QueryRejection, DefaultBodyLimit,
        Multipart, Query, State,
    },
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use shared::bus::{publish_json, EventPublisher};
use shared::BulkIngestionJob;
use std::sync::Arc;
use uuid::Uuid;
use crate::blob::BlobStore;
use crate::intake::{IntakeError, OrderIntake};
use crate::models::{Order, OrderRequest};
use crate::store::{OrderFilter, OrderStore};

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<OrderIntake>,
    pub store: Arc<dyn OrderStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub bulk_topic: String,
    /// Where `POST /orders/upload` stores files. Uploads fail while unset.
    pub upload_bucket: Option<String>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ListOrdersResponse {
    pub orders: Vec<Order>,
}

#[derive(Debug, Serialize)]
pub struct BulkAcceptedResponse {
    pub bucket: String,
    pub key: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

pub fn create_router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/bulk", post(submit_bulk))
        .route("/orders/upload", post(upload_orders).layer(upload_limit))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        let status = match &e {
            IntakeError::Invalid(_) => StatusCode::BAD_REQUEST,
            IntakeError::InsufficientInventory { .. } => StatusCode::CONFLICT,
            IntakeError::InventoryUnavailable(_) | IntakeError::InventoryUpdateFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IntakeError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, e)
    }
}

pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    match state.intake.create_order(request).await {
        Ok(order_id) => Ok((StatusCode::CREATED, Json(CreateOrderResponse { order_id }))),
        Err(e) => {
            if matches!(e, IntakeError::Persistence(_)) {
                tracing::error!("Failed to create order: {}", e);
            } else {
                tracing::info!("Order rejected: {}", e);
            }
            Err(e.into())
        }
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    filter: Result<Query<OrderFilter>, QueryRejection>,
) -> Result<Json<ListOrdersResponse>, ApiError> {
    let Query(filter) = filter.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let orders = state.store.list(&filter).await.map_err(|e| {
        tracing::error!("Failed to list orders: {:#}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list orders")
    })?;

    Ok(Json(ListOrdersResponse { orders }))
}

pub async fn submit_bulk(
    State(state): State<AppState>,
    payload: Result<Json<BulkIngestionJob>, JsonRejection>,
) -> Result<(StatusCode, Json<BulkAcceptedResponse>), ApiError> {
    let Json(job) = payload.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    if job.bucket.trim().is_empty() || job.key.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "bucket and key are required"));
    }
    if job.key.contains("..") {
        return Err(api_error(StatusCode::BAD_REQUEST, "key must not contain '..'"));
    }

    match state.blobs.exists(&job.bucket, &job.key).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("object {}/{} does not exist", job.bucket, job.key),
            ))
        }
        Err(e) => {
            tracing::error!("Failed to check uploaded object: {:#}", e);
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "Object storage unavailable"));
        }
    }

    queue_job(&state, job).await
}

/// Stores a multipart `file` under `uploads/` in the upload bucket, then
/// queues it exactly like `POST /orders/bulk`.
pub async fn upload_orders(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<BulkAcceptedResponse>), ApiError> {
    let mut multipart = multipart.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let Some(bucket) = state.upload_bucket.clone() else {
        tracing::error!("Upload bucket is not configured");
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Uploads are not configured"));
    };

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().and_then(upload_file_name);
        let body = field.bytes().await.map_err(|e| api_error(e.status(), e.body_text()))?;
        upload = Some((file_name, body));
        break;
    }

    let Some((file_name, body)) = upload else {
        return Err(api_error(StatusCode::BAD_REQUEST, "multipart field 'file' is required"));
    };
    let file_name = file_name.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "file needs a usable file name"))?;
    if body.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "uploaded file is empty"));
    }

    let key = format!(
        "uploads/{}-{}_{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        Uuid::new_v4(),
        file_name
    );
    state.blobs.put(&bucket, &key, body.to_vec()).await.map_err(|e| {
        tracing::error!("Failed to store upload: {:#}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload")
    })?;
    tracing::info!(bucket = %bucket, key = %key, size = body.len(), "Stored uploaded order file");

    queue_job(&state, BulkIngestionJob { bucket, key }).await
}

/// Last path segment of a client-supplied file name.
fn upload_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

async fn queue_job(
    state: &AppState,
    job: BulkIngestionJob,
) -> Result<(StatusCode, Json<BulkAcceptedResponse>), ApiError> {
    publish_json(state.publisher.as_ref(), &state.bulk_topic, &job.key, &job)
        .await
        .map_err(|e| {
            tracing::error!("Failed to queue bulk job: {:#}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue bulk job")
        })?;

    tracing::info!("Queued bulk ingestion of {}/{}", job.bucket, job.key);
    Ok((
        StatusCode::ACCEPTED,
        Json(BulkAcceptedResponse {
            bucket: job.bucket,
            key: job.key,
            status: "queued".to_string(),
        }),
    ))
}

pub async fn health_check() -> &'static str {
    "OK"
}
