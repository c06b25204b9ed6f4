//! HTTP routes served next to the WebSocket channels.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use corelink_core::{GpuDevice, SystemStats};
use corelink_executor::PresetCatalog;
use corelink_host::{CollectorError, ContainerSummary, DockerCollector, GpuSampler, SystemSampler};
use corelink_session::ChannelRegistry;
use corelink_transport::create_ws_router;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<ChannelRegistry>,
    pub docker: DockerCollector,
    pub gpu: Arc<GpuSampler>,
    pub system: Arc<SystemSampler>,
    pub container_pattern: String,
}

/// API error response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        tracing::error!("Request failed: {self}");
        let body = ErrorResponse {
            error: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerQuery {
    #[serde(default)]
    pub filtered: bool,
}

#[derive(Debug, Serialize)]
pub struct GpuStatsResponse {
    pub enabled: bool,
    pub device_count: usize,
    pub devices: Vec<GpuDevice>,
}

#[derive(Debug, Serialize)]
pub struct ContainerCounts {
    pub total: usize,
    pub running: usize,
    pub list: Vec<ContainerSummary>,
}

#[derive(Debug, Serialize)]
pub struct GpuOverview {
    pub enabled: bool,
    pub count: usize,
    pub devices: Vec<GpuDevice>,
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub system: SystemStats,
    pub containers: ContainerCounts,
    pub gpu: GpuOverview,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub channels: usize,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
}

impl AppState {
    /// Container list; an unreachable daemon yields an empty list.
    async fn containers(&self, pattern: Option<&str>) -> Vec<ContainerSummary> {
        match self.docker.list_containers(pattern).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Container listing failed: {e}");
                Vec::new()
            }
        }
    }

    /// GPU readings; failures yield an empty list.
    async fn gpu_devices(&self) -> Vec<GpuDevice> {
        match self.gpu.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("GPU query failed: {e}");
                Vec::new()
            }
        }
    }
}

/// GET /api/commands/presets
pub async fn presets(State(state): State<AppState>) -> Json<PresetCatalog> {
    Json(state.registry.presets().clone())
}

/// GET /api/logs/containers
pub async fn containers(
    State(state): State<AppState>,
    Query(query): Query<ContainerQuery>,
) -> Json<Vec<ContainerSummary>> {
    let pattern = query.filtered.then_some(state.container_pattern.as_str());
    Json(state.containers(pattern).await)
}

/// GET /api/gpu/stats
pub async fn gpu_stats(State(state): State<AppState>) -> Json<GpuStatsResponse> {
    let devices = state.gpu_devices().await;
    Json(GpuStatsResponse {
        enabled: state.gpu.is_enabled(),
        device_count: devices.len(),
        devices,
    })
}

/// GET /api/system/stats
pub async fn system_stats(State(state): State<AppState>) -> Result<Json<SystemStats>, ApiError> {
    Ok(Json(state.system.stats().await?))
}

/// GET /api/overview/summary
pub async fn overview(State(state): State<AppState>) -> Result<Json<OverviewResponse>, ApiError> {
    let (system, list, devices) = tokio::join!(
        state.system.stats(),
        state.containers(None),
        state.gpu_devices()
    );

    let running = list.iter().filter(|c| c.is_running()).count();
    Ok(Json(OverviewResponse {
        system: system?,
        containers: ContainerCounts {
            total: list.len(),
            running,
            list,
        },
        gpu: GpuOverview {
            enabled: state.gpu.is_enabled(),
            count: devices.len(),
            devices,
        },
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        channels: state.registry.channel_count().await,
    })
}

/// GET /api/update/version
///
/// Polled by dashboards after a reconnect to spot a restarted server.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Full router: HTTP collaborators plus the WebSocket channels.
pub fn create_router(state: AppState) -> Router {
    let ws = create_ws_router(Arc::clone(&state.registry));

    Router::new()
        .route("/api/commands/presets", get(presets))
        .route("/api/logs/containers", get(containers))
        .route("/api/gpu/stats", get(gpu_stats))
        .route("/api/system/stats", get(system_stats))
        .route("/api/overview/summary", get(overview))
        .route("/api/update/version", get(version))
        .route("/health", get(health))
        .with_state(state)
        .merge(ws)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use corelink_executor::{CommandPolicy, ExecutionContext, HostSpawner};
    use corelink_session::{Collaborators, RegistryConfig, SampleHub};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        let docker = DockerCollector::unavailable();
        let registry = ChannelRegistry::new(
            Collaborators {
                spawner: Arc::new(HostSpawner::local()),
                log_source: Arc::new(docker.clone()),
                hub: Arc::new(SampleHub::new()),
                policy: CommandPolicy::default(),
                presets: PresetCatalog::builtin(),
            },
            RegistryConfig::default(),
        );
        AppState {
            registry: Arc::new(registry),
            docker,
            gpu: Arc::new(GpuSampler::new(false, ExecutionContext::Local)),
            system: Arc::new(SystemSampler::new()),
            container_pattern: "nosana".into(),
        }
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = create_router(test_state())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channels"], 0);
    }

    #[tokio::test]
    async fn test_version_matches_health() {
        let (status, body) = get_json("/api/update/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"version": env!("CARGO_PKG_VERSION")}));

        let (_, health) = get_json("/health").await;
        assert_eq!(health["version"], body["version"]);
    }

    #[tokio::test]
    async fn test_presets_keyed_by_name() {
        let (status, body) = get_json("/api/commands/presets").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disk_usage"]["category"], "system");
        assert!(body["system_uptime"]["command"].is_string());
    }

    #[tokio::test]
    async fn test_containers_without_docker_is_empty() {
        let (status, body) = get_json("/api/logs/containers?filtered=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_disabled_gpu_reports_no_devices() {
        let (status, body) = get_json("/api/gpu/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({"enabled": false, "device_count": 0, "devices": []})
        );
    }

    #[tokio::test]
    async fn test_overview_summary() {
        let (status, body) = get_json("/api/overview/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["containers"]["total"], 0);
        assert_eq!(body["containers"]["running"], 0);
        assert_eq!(body["gpu"]["enabled"], false);
        assert!(body["system"]["cpu"]["count_logical"].as_u64().unwrap() >= 1);
    }
}
