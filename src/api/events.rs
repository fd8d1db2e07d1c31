//! 事件总线接口

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::auth::require_api_key;
use super::{ApiError, AppState};
use crate::services::event::{
    EventBusHealth, EventFilter, EventPriority, EventStats, EventType, ProcessingStats,
    PublishEvent, SystemEvent,
};

const DEFAULT_HISTORY_LIMIT: usize = 100;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/events", post(publish_event))
        .route("/events/history", get(event_history))
        .route("/events/stats", get(event_stats))
        .route("/events/types/available", get(available_types))
        .route("/events/health", get(bus_health))
        .route("/events/replay/:event_id", post(replay_event))
        .route("/events/clear-history", post(clear_history))
        .route("/events/:event_id", get(get_event))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}

async fn publish_event(
    State(state): State<AppState>,
    payload: Result<Json<PublishEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(draft) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let event_id = state.events.publish(draft)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "eventId": event_id })),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    priority: Option<String>,
    source: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl HistoryParams {
    fn filter(&self) -> Result<EventFilter, ApiError> {
        Ok(EventFilter {
            event_type: self.event_type.as_deref().map(str::parse::<EventType>).transpose()?,
            priority: self.priority.as_deref().map(str::parse::<EventPriority>).transpose()?,
            source: self.source.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
        })
    }
}

#[derive(Debug, Serialize)]
struct HistoryPage {
    events: Vec<SystemEvent>,
    total: usize,
    offset: usize,
    limit: usize,
}

async fn event_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
    let filter = params.filter()?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let offset = params.offset.unwrap_or(0);

    Ok(Json(HistoryPage {
        events: state.events.history(limit, offset, &filter),
        total: state.events.count(&filter),
        offset,
        limit,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentActivity {
    last_hour: usize,
    last_24_hours: usize,
    last_7_days: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventStatsResponse {
    total_events: usize,
    events_by_type: BTreeMap<EventType, usize>,
    events_by_priority: BTreeMap<String, usize>,
    events_by_source: BTreeMap<String, usize>,
    recent_activity: RecentActivity,
    bus: EventStats,
    processing: ProcessingStats,
}

async fn event_stats(State(state): State<AppState>) -> Json<EventStatsResponse> {
    let bus = &state.events;
    let now = Utc::now();
    let since = |window: Duration| bus.count(&EventFilter::since(now - window));

    Json(EventStatsResponse {
        total_events: bus.count(&EventFilter::default()),
        events_by_type: bus.count_by_type(),
        events_by_priority: bus
            .count_by_priority()
            .into_iter()
            .map(|(p, n)| (p.as_str().to_uppercase(), n))
            .collect(),
        events_by_source: bus.count_by_source().into_iter().collect(),
        recent_activity: RecentActivity {
            last_hour: since(Duration::hours(1)),
            last_24_hours: since(Duration::hours(24)),
            last_7_days: since(Duration::days(7)),
        },
        bus: bus.get_stats(),
        processing: state.processor.stats(),
    })
}

async fn available_types() -> Json<Value> {
    Json(json!({
        "eventTypes": EventType::ALL,
        "priorities": EventPriority::ALL,
    }))
}

async fn bus_health(State(state): State<AppState>) -> Json<EventBusHealth> {
    Json(state.events.health())
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<SystemEvent>, ApiError> {
    state
        .events
        .get_event(&event_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Event", &event_id))
}

async fn replay_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let new_id = state.events.replay(&event_id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "eventId": new_id, "originalEventId": event_id })),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearParams {
    older_than: Option<DateTime<Utc>>,
}

async fn clear_history(
    State(state): State<AppState>,
    Query(params): Query<ClearParams>,
) -> Result<StatusCode, ApiError> {
    state.events.clear_history(params.older_than)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::api::router;
    use crate::api::test_support::test_state;
    use crate::config::Config;

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let app = router(test_state(Config::default()));

        let response = app
            .clone()
            .oneshot(post_json(
                "/events",
                json!({ "type": "PRICE_UPDATED", "source": "pricing", "data": { "product": "lpg" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        let id = body["eventId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/events/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let event = body_json(response).await;
        assert_eq!(event["type"], "PRICE_UPDATED");
        assert_eq!(event["priority"], "normal");

        let response = app.oneshot(request("GET", "/events/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_type() {
        let app = router(test_state(Config::default()));
        let response = app
            .oneshot(post_json(
                "/events",
                json!({ "type": "COFFEE_BREWED", "source": "kitchen" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_pagination_and_filters() {
        let state = test_state(Config::default());
        for source in ["pricing", "pricing", "inventory"] {
            state
                .events
                .publish(PublishEvent::new(EventType::PriceUpdated, source, json!({})))
                .unwrap();
        }
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/events/history?source=pricing&limit=1"))
            .await
            .unwrap();
        let page = body_json(response).await;
        assert_eq!(page["total"], 2);
        assert_eq!(page["limit"], 1);
        assert_eq!(page["offset"], 0);
        assert_eq!(page["events"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(request("GET", "/events/history?priority=urgent"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request("GET", "/events/history?type=price_updated"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total"], 3);
    }

    #[tokio::test]
    async fn test_stats_count_critical_events() {
        let app = router(test_state(Config::default()));

        let stats = body_json(app.clone().oneshot(request("GET", "/events/stats")).await.unwrap()).await;
        let critical_before = stats["eventsByPriority"]["CRITICAL"].as_u64().unwrap();
        let hour_before = stats["recentActivity"]["lastHour"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/events",
                json!({ "type": "SYSTEM_ALERT", "priority": "CRITICAL", "source": "health-check", "data": { "message": "disk" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let stats = body_json(app.oneshot(request("GET", "/events/stats")).await.unwrap()).await;
        assert_eq!(
            stats["eventsByPriority"]["CRITICAL"].as_u64().unwrap(),
            critical_before + 1
        );
        assert_eq!(
            stats["recentActivity"]["lastHour"].as_u64().unwrap(),
            hour_before + 1
        );
        assert_eq!(stats["eventsByType"]["SYSTEM_ALERT"], 1);
        assert!(stats["processing"]["totalProcessed"].is_u64());
    }

    #[tokio::test]
    async fn test_replay_and_clear() {
        let state = test_state(Config::default());
        let id = state
            .events
            .publish(PublishEvent::new(EventType::DealerSettlement, "dealers", json!({ "amount": 5 })))
            .unwrap();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/events/replay/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let replayed = state
            .events
            .get_event(body["eventId"].as_str().unwrap())
            .unwrap();
        assert_eq!(replayed.data["originalEventId"], id.as_str());

        let response = app
            .clone()
            .oneshot(request("POST", "/events/replay/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("POST", "/events/clear-history"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.events.count(&EventFilter::default()), 0);
    }

    #[tokio::test]
    async fn test_writes_require_api_key() {
        let mut config = Config::default();
        config.security.tokens = vec!["secret".to_string()];
        let state = test_state(config);
        let id = state
            .events
            .publish(PublishEvent::new(EventType::PriceUpdated, "pricing", json!({})))
            .unwrap();
        let app = router(state.clone());
        let draft = json!({ "type": "PRICE_UPDATED", "source": "pricing" });

        for unauthorized in [
            post_json("/events", draft.clone()),
            request("POST", "/events/clear-history"),
            request("POST", &format!("/events/replay/{id}")),
        ] {
            let response = app.clone().oneshot(unauthorized).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(state.events.count(&EventFilter::default()), 1);

        let mut authorized = post_json("/events", draft);
        authorized
            .headers_mut()
            .insert("x-api-key", "secret".parse().unwrap());
        let response = app.clone().oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // 读操作不需要 key
        let response = app
            .oneshot(request("GET", "/events/history"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_available_types_and_health() {
        let app = router(test_state(Config::default()));

        let body = body_json(
            app.clone()
                .oneshot(request("GET", "/events/types/available"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["eventTypes"].as_array().unwrap().len(), 12);
        assert_eq!(body["priorities"][3], "critical");

        let health = body_json(app.oneshot(request("GET", "/events/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");
    }
}
