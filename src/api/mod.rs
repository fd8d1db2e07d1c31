//! HTTP 接口
//!
//! 注册表与服务发现挂在 `/registry` 下，事件总线挂在 `/events` 下，
//! 实时网关通过 `/ws` 升级为 WebSocket。

mod auth;
mod error;
mod events;
mod registry;

use std::sync::Arc;

use axum::{Json, Router};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::config::Config;
use crate::services::discovery::ServiceDiscovery;
use crate::services::event::{EventBus, EventProcessor};
use crate::services::gateway::{RealtimeHub, serve_socket};
use crate::services::health::HealthChecker;
use crate::services::registry::ServiceRegistry;

/// 各路由共享的组件句柄
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ServiceRegistry,
    pub discovery: ServiceDiscovery,
    pub events: EventBus,
    pub processor: EventProcessor,
    pub health: HealthChecker,
    pub hub: RealtimeHub,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .merge(registry::router(state.clone()))
        .merge(events::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "services": state.registry.summary().total,
        "clients": state.hub.client_count(),
        "eventBus": state.events.health().status,
    }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.hub))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::services::cache::CacheStore;

    pub fn test_state(config: Config) -> AppState {
        let cache = CacheStore::new();
        let events = EventBus::new(cache.clone(), config.events.clone());
        let registry = ServiceRegistry::new(cache.clone(), events.clone(), config.registry.clone());
        let discovery =
            ServiceDiscovery::new(registry.clone(), cache.clone(), config.discovery.clone());
        let processor = EventProcessor::new();
        processor.attach(&events);
        let health = HealthChecker::new(
            registry.clone(),
            events.clone(),
            cache,
            config.health.clone(),
        )
        .unwrap();
        let hub = RealtimeHub::new(registry.clone());

        AppState {
            config: Arc::new(config),
            registry,
            discovery,
            events,
            processor,
            health,
            hub,
        }
    }
}
