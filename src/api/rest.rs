//! REST API Handlers
//!
//! Implements the `POST /create` planning endpoint, the root health
//! endpoint and `/metrics` exposition.

use crate::error::Error;
use crate::matrix::StorageDecisionMatrix;
use crate::planner::{
    ProviderKind, StorageDistributionRequest, StorageManagerRegistry, StoragePoolSpec, StorageSpec,
};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Storage distribution request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStorageRequest {
    /// Provider to plan for; the server default when absent.
    #[serde(default)]
    pub provider: Option<String>,
    pub specs: Vec<StorageSpec>,
    pub instances_per_zone: u64,
    pub zone_count: u64,
    #[serde(default)]
    pub instance_type: String,
}

/// Storage distribution response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStorageResponse {
    pub provider: String,
    pub instance_storage: Vec<StoragePoolSpec>,
}

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// Metrics
// =============================================================================

pub struct ApiMetrics {
    registry: Registry,
    plans_total: IntCounterVec,
}

impl ApiMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let plans_total = IntCounterVec::new(
            Opts::new("cloud_drive_plans_total", "Distribution plans by outcome"),
            &["provider", "outcome"],
        )
        .expect("static metric definition");
        registry
            .register(Box::new(plans_total.clone()))
            .expect("fresh registry");
        Self {
            registry,
            plans_total,
        }
    }
}

// =============================================================================
// State & Router
// =============================================================================

/// Shared state behind the REST handlers.
pub struct ApiState {
    registry: Arc<StorageManagerRegistry>,
    matrix: StorageDecisionMatrix,
    default_provider: ProviderKind,
    metrics: ApiMetrics,
}

impl ApiState {
    pub fn new(
        registry: Arc<StorageManagerRegistry>,
        matrix: StorageDecisionMatrix,
        default_provider: ProviderKind,
    ) -> Self {
        Self {
            registry,
            matrix,
            default_provider,
            metrics: ApiMetrics::new(),
        }
    }
}

/// Build the REST router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/create", post(create))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        name: crate::NAME.into(),
        version: crate::VERSION.into(),
    })
}

async fn create(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateStorageRequest>,
) -> impl IntoResponse {
    let provider = match request.provider.as_deref() {
        Some(name) => match name.parse::<ProviderKind>() {
            Ok(kind) => kind,
            Err(e) => return error_response(&e),
        },
        None => state.default_provider,
    };

    debug!(%provider, specs = request.specs.len(), "planning storage distribution");

    let manager = match state.registry.manager_for(provider, state.matrix.clone()) {
        Ok(manager) => manager,
        Err(e) => return error_response(&e),
    };

    let planner_request = StorageDistributionRequest {
        specs: request.specs,
        instances_per_zone: request.instances_per_zone,
        zone_count: request.zone_count,
        instance_type: request.instance_type,
    };

    match manager.storage_distribution(&planner_request) {
        Ok(response) => {
            state
                .metrics
                .plans_total
                .with_label_values(&[&provider.to_string(), "ok"])
                .inc();
            info!(%provider, pools = response.instance_storage.len(), "distribution planned");
            (
                StatusCode::OK,
                Json(CreateStorageResponse {
                    provider: provider.to_string(),
                    instance_storage: response.instance_storage,
                }),
            )
                .into_response()
        }
        Err(e) => {
            state
                .metrics
                .plans_total
                .with_label_values(&[&provider.to_string(), "error"])
                .inc();
            error_response(&e)
        }
    }
}

async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        StatusCode::OK,
        [("Content-Type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

fn error_response(err: &Error) -> axum::response::Response {
    let status = if err.is_planner() || matches!(err, Error::Configuration(_)) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ApiErrorResponse {
            error: format!("{err:?}")
                .split(|c: char| c == '(' || c == '{' || c == ' ')
                .next()
                .unwrap_or("Error")
                .to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::tests::row;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<ApiState> {
        let matrix = StorageDecisionMatrix::new(vec![
            row("Premium_LRS", 1100, 256, 256, 8, 0),
            row("Premium_LRS", 5000, 1024, 1024, 8, 0),
        ])
        .unwrap();
        Arc::new(ApiState::new(
            Arc::new(StorageManagerRegistry::with_defaults()),
            matrix,
            ProviderKind::Azure,
        ))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_plans_distribution() {
        let request = serde_json::json!({
            "specs": [{"iops": 1000, "minCapacityGib": 1024, "maxCapacityGib": 100000}],
            "instancesPerZone": 3,
            "zoneCount": 2
        });
        let response = router(test_state())
            .oneshot(
                Request::post("/create")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["provider"], "azure");
        assert_eq!(json["instanceStorage"][0]["driveCapacityGib"], 256);
        assert_eq!(json["instanceStorage"][0]["instancesPerZone"], 2);
        assert_eq!(json["instanceStorage"][0]["iops"], 1100);
    }

    #[tokio::test]
    async fn test_create_no_candidate_is_bad_request() {
        let request = serde_json::json!({
            "specs": [{"iops": 90000, "minCapacityGib": 10, "maxCapacityGib": 10}],
            "instancesPerZone": 1,
            "zoneCount": 1
        });
        let response = router(test_state())
            .oneshot(
                Request::post("/create")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "NoCandidate");
    }

    #[tokio::test]
    async fn test_create_unknown_provider_is_bad_request() {
        let request = serde_json::json!({
            "provider": "ibm",
            "specs": [],
            "instancesPerZone": 1,
            "zoneCount": 1
        });
        let response = router(test_state())
            .oneshot(
                Request::post("/create")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = test_state();
        let app = router(state.clone());
        let request = serde_json::json!({
            "specs": [{"iops": 1000, "minCapacityGib": 1024, "maxCapacityGib": 100000}],
            "instancesPerZone": 3,
            "zoneCount": 2
        });
        app.clone()
            .oneshot(
                Request::post("/create")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("cloud_drive_plans_total"));
    }
}
