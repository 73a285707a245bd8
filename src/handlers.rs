use crate::config::Config;
use crate::consistency::ConsistencyReport;
use crate::errors::AppError;
use crate::metrics::MetricType;
use crate::models::*;
use crate::period::MetricPeriod;
use crate::services::{MetricsService, RecalculationSummary};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the admin key on mutating endpoints.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Recalculation, read and consistency operations.
    pub service: MetricsService,
    /// Serialized snapshot responses.
    /// Key: "tenant:{tenant_id}:{period_key}", "type:{metric_type}:{period_key}"
    /// or "platform:{period_key}".
    pub metrics_cache: Cache<String, serde_json::Value>,
}

impl AppState {
    pub fn new(db: PgPool, config: Config, metrics_cache: Cache<String, serde_json::Value>) -> Self {
        Self {
            service: MetricsService::new(db.clone()),
            db,
            config,
            metrics_cache,
        }
    }
}

/// Routes under `/api/v1`, without rate limiting or state.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/conversations/messages", post(ingest_message))
        .route(
            "/api/v1/conversations/rebuild/:tenant_id",
            post(rebuild_conversations),
        )
        .route("/api/v1/metrics/recalculate", post(recalculate))
        .route("/api/v1/tenants/:tenant_id/metrics", get(tenant_metrics))
        .route("/api/v1/platform/metrics", get(platform_metrics))
        .route("/api/v1/metrics/:metric_type", get(metrics_by_type))
        .route("/api/v1/consistency", get(consistency))
}

/// Health check plus the API routes, bound to `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

/// Health check endpoint.
///
/// Returns the service status and version.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "tenant-metrics",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/conversations/messages
///
/// Stores one conversation message and attaches it to its conversation.
/// Replaying a message with the same id is a no-op and reports `duplicate`.
pub async fn ingest_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(message): Json<NewConversationMessage>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    require_admin(&state, &headers)?;

    if message.content.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Message content must not be empty".to_string(),
        ));
    }

    let response = state.service.storage().ingest_message(message).await?;
    let status = if response.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((status, Json(response)))
}

/// POST /api/v1/conversations/rebuild/:tenant_id
///
/// Regroups the tenant's whole message history into conversations.
pub async fn rebuild_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<RebuildResponse>, AppError> {
    require_admin(&state, &headers)?;

    if state.service.storage().find_tenant(tenant_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Tenant {} not found", tenant_id)));
    }

    let conversations = state.service.storage().rebuild_conversations(tenant_id).await?;
    tracing::info!(
        "Rebuilt {} conversations for tenant {}",
        conversations,
        tenant_id
    );

    Ok(Json(RebuildResponse {
        tenant_id,
        conversations,
    }))
}

/// POST /api/v1/metrics/recalculate
///
/// Body: `{ "period": "2025-08" }`; the current month when omitted.
pub async fn recalculate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<RecalculateRequest>>,
) -> Result<Json<RecalculationSummary>, AppError> {
    require_admin(&state, &headers)?;

    let request = body.map(|Json(b)| b).unwrap_or_default();
    let period = resolve_period(request.period.as_deref())?;

    let summary = state.service.recalculate(&period).await?;
    state.metrics_cache.invalidate_all();

    Ok(Json(summary))
}

/// GET /api/v1/tenants/:tenant_id/metrics?period=
pub async fn tenant_metrics(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let period = resolve_period(query.period.as_deref())?;
    let cache_key = format!("tenant:{}:{}", tenant_id, period.key());

    if let Some(cached) = state.metrics_cache.get(&cache_key).await {
        tracing::debug!("Metrics cache HIT: {}", cache_key);
        return Ok(Json(cached));
    }

    let response = state.service.tenant_snapshots(tenant_id, &period).await?;
    let value = serde_json::to_value(&response)?;
    state.metrics_cache.insert(cache_key, value.clone()).await;

    Ok(Json(value))
}

/// GET /api/v1/platform/metrics?period=
pub async fn platform_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let period = resolve_period(query.period.as_deref())?;
    let cache_key = format!("platform:{}", period.key());

    if let Some(cached) = state.metrics_cache.get(&cache_key).await {
        tracing::debug!("Metrics cache HIT: {}", cache_key);
        return Ok(Json(cached));
    }

    let snapshot = state.service.platform_snapshot(&period).await?;
    let value = serde_json::to_value(&snapshot)?;
    state.metrics_cache.insert(cache_key, value.clone()).await;

    Ok(Json(value))
}

/// GET /api/v1/metrics/:metric_type?period=
///
/// Every tenant's snapshot of one metric type (`appointments`, `revenue`,
/// `conversations` or `billing`).
pub async fn metrics_by_type(
    State(state): State<Arc<AppState>>,
    Path(metric_type): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let metric_type: MetricType = metric_type.parse().map_err(AppError::BadRequest)?;
    let period = resolve_period(query.period.as_deref())?;
    let cache_key = format!("type:{}:{}", metric_type, period.key());

    if let Some(cached) = state.metrics_cache.get(&cache_key).await {
        tracing::debug!("Metrics cache HIT: {}", cache_key);
        return Ok(Json(cached));
    }

    let snapshots = state
        .service
        .storage()
        .snapshots_of_type(&period, metric_type)
        .await?;
    let value = json!({
        "metric_type": metric_type,
        "period": period,
        "period_key": period.key(),
        "snapshots": snapshots,
    });
    state.metrics_cache.insert(cache_key, value.clone()).await;

    Ok(Json(value))
}

/// GET /api/v1/consistency?period=
///
/// 200 when every check passes, 409 with the full report otherwise.
pub async fn consistency(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> Result<(StatusCode, Json<ConsistencyReport>), AppError> {
    let period = resolve_period(query.period.as_deref())?;
    let report = state.service.check_consistency(&period).await?;

    let status = if report.is_consistent() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };

    Ok((status, Json(report)))
}

/// Parses an optional period parameter, defaulting to the current month.
fn resolve_period(raw: Option<&str>) -> Result<MetricPeriod, AppError> {
    let today = Utc::now().date_naive();
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => MetricPeriod::parse(raw, today),
        None => Ok(MetricPeriod::current_month(today)),
    }
}

/// Validate the admin key from the X-Api-Key header
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // No key configured: endpoints are open (warned at startup)
    let Some(ref expected_key) = state.config.admin_api_key else {
        return Ok(());
    };

    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Api-Key header".to_string()))?;

    if !constant_time_compare(provided, expected_key) {
        tracing::warn!("Invalid admin key received");
        return Err(AppError::Unauthorized("Invalid admin key".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
