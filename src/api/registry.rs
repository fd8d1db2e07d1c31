//! 注册表、服务发现与健康数据接口

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};

use super::auth::require_api_key;
use super::{ApiError, AppState};
use crate::services::discovery::{DiscoveryQuery, OutcomeReport};
use crate::services::health::SystemHealthMetrics;
use crate::services::registry::{
    RegisterServiceDescriptor, RegistryHealthSummary, ServiceHealth, ServiceInstance,
    ServiceMetrics, ServiceStatus, ServiceType,
};

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/registry/register", post(register_service))
        .route("/registry/deregister/:service_id", delete(deregister_service))
        .route("/registry/heartbeat/:service_id", put(heartbeat))
        .route("/registry/services", get(list_services))
        .route("/registry/services/:service_id", get(get_service))
        .route("/registry/services/:service_id/health", get(get_service_health))
        .route(
            "/registry/services/:service_id/metrics",
            get(get_service_metrics).post(update_service_metrics),
        )
        .route("/registry/discovery/report", post(report_outcome))
        .route("/registry/discovery/:service_name", get(discover))
        .route("/registry/health", get(registry_health))
        .route("/registry/system/metrics", get(system_metrics))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}

async fn register_service(
    State(state): State<AppState>,
    payload: Result<Json<RegisterServiceDescriptor>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceInstance>), ApiError> {
    let Json(descriptor) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let instance = state.registry.register(descriptor)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn deregister_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.deregister(&service_id)? {
        return Err(ApiError::not_found("Service", &service_id));
    }
    Ok(Json(json!({ "success": true })))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.heartbeat(&service_id)? {
        return Err(ApiError::not_found("Service", &service_id));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
struct ServiceListParams {
    #[serde(rename = "type")]
    service_type: Option<ServiceType>,
    status: Option<ServiceStatus>,
    name: Option<String>,
}

async fn list_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceListParams>,
) -> Json<Vec<ServiceInstance>> {
    let services = match params.service_type {
        Some(service_type) => state.registry.get_services_by_type(service_type),
        None => state.registry.list_services(),
    };
    let services = services
        .into_iter()
        .filter(|s| params.status.is_none_or(|st| s.status == st))
        .filter(|s| params.name.as_deref().is_none_or(|n| s.name == n))
        .collect();
    Json(services)
}

async fn get_service(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<ServiceInstance>, ApiError> {
    state
        .registry
        .get_service(&service_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Service", &service_id))
}

async fn get_service_health(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<ServiceHealth>, ApiError> {
    state
        .registry
        .get_service_health(&service_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Service health", &service_id))
}

async fn get_service_metrics(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
) -> Result<Json<ServiceMetrics>, ApiError> {
    state
        .registry
        .get_service_metrics(&service_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Service metrics", &service_id))
}

async fn update_service_metrics(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    payload: Result<Json<ServiceMetrics>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(metrics) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    state.registry.update_service_metrics(&service_id, metrics)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverParams {
    #[serde(default)]
    load_balanced: bool,
    version: Option<String>,
    /// 逗号分隔
    tags: Option<String>,
}

impl DiscoverParams {
    fn query(&self) -> DiscoveryQuery {
        DiscoveryQuery {
            version: self.version.clone().filter(|v| !v.is_empty()),
            tags: self
                .tags
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            ..Default::default()
        }
    }
}

async fn discover(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<Value>, ApiError> {
    let query = params.query();

    if params.load_balanced {
        let instance = state
            .discovery
            .discover_one(&service_name, &query)
            .ok_or_else(|| ApiError::not_found("Healthy instance of service", &service_name))?;
        return Ok(Json(json!(instance)));
    }

    let instances = state.discovery.discover_all(&service_name, &query);
    if instances.is_empty() {
        return Err(ApiError::not_found("Healthy instance of service", &service_name));
    }
    Ok(Json(json!(instances)))
}

async fn report_outcome(
    State(state): State<AppState>,
    payload: Result<Json<OutcomeReport>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(report) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let tracked =
        state
            .discovery
            .report_outcome(&report.service_id, report.success, report.response_time);
    Ok(Json(json!({ "success": tracked })))
}

async fn registry_health(State(state): State<AppState>) -> Json<RegistryHealthSummary> {
    Json(state.registry.summary())
}

async fn system_metrics(
    State(state): State<AppState>,
) -> Result<Json<SystemHealthMetrics>, ApiError> {
    state
        .health
        .get_system_metrics()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("System metrics", "latest"))
}
