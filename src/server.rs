//! HTTP surface: the Alertmanager webhook, the incident API, and health.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::alerts::{self, AlertmanagerPayload};
use crate::analysis::{self, AnalysisInputs};
use crate::dedup::IncidentProcessor;
use crate::error::AgentError;
use crate::store::{EventType, StoreError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PAGE_SIZE: i64 = 50;

/// API-facing error with an HTTP mapping.
pub enum ApiError {
    NotFound(&'static str),
    Backpressure,
    Internal(String),
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Store(StoreError::PoolSaturated) => Self::Backpressure,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PoolSaturated => Self::Backpressure,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            Self::Backpressure => (
                StatusCode::SERVICE_UNAVAILABLE,
                "database pool saturated; retry".to_string(),
            ),
            Self::Internal(message) => {
                error!(%message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

/// Build the service router.
pub fn build_router(processor: Arc<IncidentProcessor>) -> Router {
    Router::new()
        .route("/alertmanager", post(alertmanager_webhook))
        .route("/api/incidents", get(list_incidents))
        .route("/api/incidents/:id", get(get_incident))
        .route(
            "/api/incidents/:id/regenerate-analysis",
            post(regenerate_analysis),
        )
        .route("/healthz", get(healthz))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(processor)
}

/// `POST /alertmanager` — ingest a webhook batch. Each alert fans out into
/// its own task; the response reports how many were processed.
async fn alertmanager_webhook(
    State(processor): State<Arc<IncidentProcessor>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> Result<Json<Value>, ApiError> {
    info!(
        alerts = payload.alerts.len(),
        status = %payload.status,
        "webhook received"
    );

    // Backpressure check before any upsert: a saturated pool means 503 now
    // and a retry from the alert router later.
    processor.store.ping().await?;

    let alerts = alerts::normalize(&payload);
    if alerts.is_empty() {
        return Ok(Json(json!({"processed": 0})));
    }

    let processed = processor.process_batch(alerts).await?;
    Ok(Json(json!({"processed": processed})))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// `GET /api/incidents` — newest-first incident list with `node` enrichment
/// from each row's latest webhook labels.
async fn list_incidents(
    State(processor): State<Arc<IncidentProcessor>>,
    Query(page): Query<PageParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);

    let (incidents, total) = processor.store.list_incidents(limit, offset).await?;

    let mut rows = Vec::with_capacity(incidents.len());
    for incident in incidents {
        let node = processor
            .store
            .latest_event_of_type(incident.id, EventType::WebhookReceived)
            .await?
            .and_then(|e| {
                e.payload
                    .pointer("/labels/node")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });
        let mut row = serde_json::to_value(&incident).unwrap_or_default();
        row["node"] = node.map_or(Value::Null, Value::String);
        rows.push(row);
    }

    Ok(Json(json!({"incidents": rows, "total": total})))
}

/// `GET /api/incidents/{id}` — incident, full event log, latest analysis,
/// and related past incidents.
async fn get_incident(
    State(processor): State<Arc<IncidentProcessor>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let incident = processor
        .store
        .get_incident(id)
        .await?
        .ok_or(ApiError::NotFound("incident not found"))?;

    let events = processor.store.get_events(id).await?;
    let analysis_markdown = processor
        .store
        .latest_event_of_type(id, EventType::Analysis)
        .await?
        .and_then(|e| {
            e.payload
                .get("analysis_markdown")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_default();

    let node = processor
        .store
        .latest_event_of_type(id, EventType::WebhookReceived)
        .await?
        .and_then(|e| {
            e.payload
                .pointer("/labels/node")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        });
    let past_incidents = processor
        .store
        .query_similar(
            id,
            incident.alertname.as_deref(),
            incident.namespace.as_deref(),
            incident.pod.as_deref(),
            node.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "incident": incident,
        "events": events,
        "analysis_markdown": analysis_markdown,
        "past_incidents": past_incidents,
    })))
}

/// `POST /api/incidents/{id}/regenerate-analysis` — re-run the composer with
/// the current database state. The prior analysis event is left untouched.
async fn regenerate_analysis(
    State(processor): State<Arc<IncidentProcessor>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let incident = processor
        .store
        .get_incident(id)
        .await?
        .ok_or(ApiError::NotFound("incident not found"))?;

    // Reconstruct the run context from stored events.
    let final_event = processor
        .store
        .latest_event_of_type(id, EventType::Final)
        .await?;
    let final_state = final_event
        .as_ref()
        .and_then(|e| e.payload.get("state").cloned())
        .unwrap_or_default();
    let runbook_id = final_event
        .as_ref()
        .and_then(|e| e.payload.get("runbook_id").and_then(Value::as_str))
        .map(ToString::to_string)
        .or_else(|| incident.runbook_id.clone())
        .unwrap_or_else(|| "RB_UNKNOWN".to_string());

    let webhook_event = processor
        .store
        .latest_event_of_type(id, EventType::WebhookReceived)
        .await?;
    let alert_labels = webhook_event
        .as_ref()
        .and_then(|e| e.payload.get("labels").cloned())
        .unwrap_or_default();
    let alert_annotations = webhook_event
        .as_ref()
        .and_then(|e| e.payload.get("annotations").cloned())
        .unwrap_or_default();
    let cluster_name = webhook_event
        .as_ref()
        .and_then(|e| e.payload.get("cluster").and_then(Value::as_str))
        .map_or_else(
            || processor.config.cluster_name.clone(),
            ToString::to_string,
        );

    let (event_id, analysis_markdown) = analysis::compose_and_store(
        &processor.store,
        processor.llm.as_ref(),
        AnalysisInputs {
            incident: &incident,
            runbook_id: &runbook_id,
            cluster_name: &cluster_name,
            alert_labels,
            alert_annotations,
            final_state,
            regenerated: true,
        },
    )
    .await?;

    Ok(Json(json!({
        "event_id": event_id,
        "analysis_markdown": analysis_markdown,
    })))
}

/// `GET /healthz` — 200 when the database answers and runbooks are loaded.
async fn healthz(
    State(processor): State<Arc<IncidentProcessor>>,
) -> Result<Json<Value>, ApiError> {
    processor.store.ping().await?;
    if processor.runbooks.is_empty() {
        return Err(ApiError::Internal("no runbooks loaded".to_string()));
    }
    Ok(Json(json!({
        "status": "ok",
        "runbooks": processor.runbooks.len(),
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
