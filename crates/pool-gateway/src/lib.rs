#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! HTTP gateway for the OCR pool: the narrow, stable surface clients drive
//! the pool through. Handlers only enqueue and await; heavy work always
//! happens on the pool's workers.

mod routes;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use hony_pool_engine::PoolHandle;

/// Shared state handed to every handler.
#[derive(Clone)]
pub(crate) struct GatewayState {
    pub(crate) pool: PoolHandle,
}

/// Build the gateway router over a running pool.
pub fn router(pool: PoolHandle) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/ocr", post(routes::ocr))
        .route("/instances", get(routes::list_instances).post(routes::create_instance))
        .route(
            "/instances/:id",
            get(routes::instance_detail).delete(routes::delete_instance),
        )
        .route("/instances/:id/logs", get(routes::instance_logs))
        .route("/instances/:id/start", post(routes::start_instance))
        .route("/instances/:id/stop", post(routes::stop_instance))
        .route("/instances/:id/restart", post(routes::restart_instance))
        .with_state(GatewayState { pool })
        .layer(TraceLayer::new_for_http())
}
