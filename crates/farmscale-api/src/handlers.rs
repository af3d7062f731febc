//! HTTP handlers.
//!
//! JSON responses use the `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use farmscale_state::{FarmStore, QueueDepth, StateError};
use serde::Deserialize;
use tracing::debug;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: StateError) -> axum::response::Response {
    match e {
        StateError::NotFound(what) => {
            error_response(&format!("not found: {what}"), StatusCode::NOT_FOUND).into_response()
        }
        e => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

fn farm_store(state: &ApiState) -> Result<&FarmStore, axum::response::Response> {
    state.farm.as_ref().ok_or_else(|| {
        error_response(
            "farm endpoints require the standalone backend",
            StatusCode::NOT_IMPLEMENTED,
        )
        .into_response()
    })
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /readyz
pub async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    let readiness = state.reconciler.readiness();
    let now = state.reconciler.now();
    if readiness.is_ready(now) {
        (StatusCode::OK, "ready").into_response()
    } else {
        debug!(last_tick = ?readiness.last_tick_at(), now, "not ready");
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

// ── Queues ─────────────────────────────────────────────────────

/// GET /api/v1/queues
pub async fn list_queues(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.reconciler.tracker().views().await)
}

/// GET /api/v1/queues/{name}
pub async fn get_queue(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    let views = state.reconciler.tracker().views().await;
    match views.into_iter().find(|v| v.queue == name) {
        Some(view) => ApiResponse::ok(view).into_response(),
        None => error_response("queue not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// Depth report body.
#[derive(Debug, Deserialize)]
pub struct DepthReport {
    pub pending: u64,
    #[serde(default)]
    pub in_progress: u64,
}

/// PUT /api/v1/queues/{name}/depth
pub async fn report_depth(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(report): Json<DepthReport>,
) -> impl IntoResponse {
    let store = match farm_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let depth = QueueDepth::new(report.pending, report.in_progress);
    match store.set_queue_depth(&name, depth, state.reconciler.now()) {
        Ok(()) => ApiResponse::ok(depth).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Workers ────────────────────────────────────────────────────

/// Heartbeat body. `in_progress` is the number of actions the worker holds.
#[derive(Debug, Default, Deserialize)]
pub struct Heartbeat {
    pub in_progress: Option<u64>,
}

/// POST /api/v1/workers/{id}/heartbeat
pub async fn worker_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(beat): Json<Heartbeat>,
) -> impl IntoResponse {
    let store = match farm_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let worker = match store.record_heartbeat(&id, state.reconciler.now()) {
        Ok(worker) => worker,
        Err(e) => return state_error(e),
    };
    if let Some(load) = beat.in_progress
        && let Err(e) = store.set_worker_load(&id, load)
    {
        return state_error(e);
    }
    ApiResponse::ok(worker).into_response()
}

// ── Events ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/events
pub async fn list_events(State(state): State<ApiState>, Query(query): Query<EventQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100);
    ApiResponse::ok(state.reconciler.events().recent(limit).await)
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let views = state.reconciler.tracker().views().await;
    let events = state.reconciler.events().counts().await;
    let mut failures = Vec::with_capacity(views.len());
    for view in &views {
        let count = state.reconciler.probe().consecutive_failures(&view.queue).await;
        failures.push((view.queue.clone(), count));
    }

    let body = crate::prometheus::render_prometheus(&views, &events, &failures);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use farmscale_backplane::StoreBackplane;
    use farmscale_core::{FarmscaleConfig, ManualClock};
    use farmscale_fleet::{FleetActuator, LocalFleet};
    use farmscale_autoscale::Reconciler;

    fn test_state(standalone: bool) -> (ApiState, Arc<LocalFleet>) {
        let config = FarmscaleConfig::from_toml_str("[[queues]]\nname = \"cpu\"\n").unwrap();
        let store = FarmStore::open_in_memory().unwrap();
        store.ensure_queue("cpu", &[], 1000).unwrap();
        let clock = Arc::new(ManualClock::new(1000));
        let fleet = Arc::new(LocalFleet::new(store.clone(), clock.clone()));
        let reconciler = Reconciler::new(
            &config,
            Arc::new(StoreBackplane::new(store.clone())),
            fleet.clone(),
            fleet.clone(),
            clock,
        );
        let state = ApiState {
            reconciler,
            farm: standalone.then_some(store),
        };
        (state, fleet)
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let resp = healthz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_follows_ticks() {
        let (state, _) = test_state(true);
        let resp = readyz(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.reconciler.tick().await;
        let resp = readyz(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_queue() {
        let (state, _) = test_state(true);
        let resp = get_queue(State(state.clone()), Path("gpu".to_string())).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = get_queue(State(state), Path("cpu".to_string())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn depth_report_updates_store() {
        let (state, _) = test_state(true);
        let report = DepthReport { pending: 12, in_progress: 3 };
        let resp = report_depth(State(state.clone()), Path("cpu".to_string()), Json(report))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let record = state.farm.as_ref().unwrap().get_queue("cpu").unwrap().unwrap();
        assert_eq!(record.depth, QueueDepth::new(12, 3));
    }

    #[tokio::test]
    async fn depth_report_for_unknown_queue() {
        let (state, _) = test_state(true);
        let report = DepthReport { pending: 1, in_progress: 0 };
        let resp = report_depth(State(state), Path("gpu".to_string()), Json(report))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn farm_routes_need_standalone_backend() {
        let (state, _) = test_state(false);
        let report = DepthReport { pending: 1, in_progress: 0 };
        let resp = report_depth(State(state), Path("cpu".to_string()), Json(report))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn heartbeat_marks_worker_ready_and_records_load() {
        let (state, fleet) = test_state(true);
        fleet.provision("cpu", 1).await.unwrap();

        let beat = Heartbeat { in_progress: Some(2) };
        let resp = worker_heartbeat(State(state.clone()), Path("cpu-worker-1".to_string()), Json(beat))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let store = state.farm.as_ref().unwrap();
        let worker = store.get_worker("cpu-worker-1").unwrap().unwrap();
        assert_eq!(worker.state, farmscale_state::WorkerState::Ready);
        assert_eq!(store.worker_load("cpu-worker-1").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_worker() {
        let (state, _) = test_state(true);
        let resp = worker_heartbeat(State(state), Path("ghost".to_string()), Json(Heartbeat::default()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let (state, _) = test_state(true);
        state.reconciler.tick().await;
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
