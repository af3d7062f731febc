//! farmscale-api: the controller's HTTP surface.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/readyz` | 200 once a tick completed within three tick intervals |
//! | GET | `/api/v1/queues` | Phase, outstanding intent and last snapshot per queue |
//! | GET | `/api/v1/queues/{name}` | One queue |
//! | GET | `/api/v1/events` | Recent audit events (`?limit=N`) |
//! | PUT | `/api/v1/queues/{name}/depth` | Report queue depth (standalone farm) |
//! | POST | `/api/v1/workers/{id}/heartbeat` | Worker heartbeat and load (standalone farm) |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! The two write routes feed the local farm store and answer 501 when the
//! controller runs against another backend.

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::{get, post, put};
use farmscale_autoscale::Reconciler;
use farmscale_state::FarmStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Reconciler,
    /// The local farm store; `None` unless the standalone backend runs.
    pub farm: Option<FarmStore>,
}

/// Build the complete router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/queues", get(handlers::list_queues))
        .route("/queues/{name}", get(handlers::get_queue))
        .route("/queues/{name}/depth", put(handlers::report_depth))
        .route("/workers/{id}/heartbeat", post(handlers::worker_heartbeat))
        .route("/events", get(handlers::list_events))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
        .nest("/api/v1", api_routes)
}
