//! Route handlers: request parsing, pool calls and the taxonomy-to-status
//! translation. Every response carries `{"status": "success"|"error"}`.

use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use hony_pool_engine::{
    ImagePayload, PoolError, RecognizeOptions, TaskError, TaskPriority, TaskSpec,
};

use crate::GatewayState;

const SERVICE_NAME: &str = "ocr-pool";

fn success(data: impl serde::Serialize) -> Response {
    (StatusCode::OK, Json(json!({ "status": "success", "data": data }))).into_response()
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "error": message.into() })),
    )
        .into_response()
}

fn task_error(err: TaskError) -> Response {
    let status = match err {
        TaskError::BadImage(_) => StatusCode::BAD_REQUEST,
        TaskError::QueueFull => StatusCode::CONFLICT,
        TaskError::Recognition(_)
        | TaskError::FatalInstance(_)
        | TaskError::Cancelled
        | TaskError::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}

fn pool_error(err: PoolError) -> Response {
    let status = match err {
        PoolError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        PoolError::AtMaxInstances(_)
        | PoolError::NoPortAvailable
        | PoolError::InvalidState { .. }
        | PoolError::ShuttingDown => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}

pub(crate) async fn health() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": SERVICE_NAME,
        })),
    )
        .into_response()
}

pub(crate) async fn status(State(state): State<GatewayState>) -> Response {
    success(state.pool.statistics())
}

#[derive(Deserialize)]
struct OcrRequest {
    image: Option<String>,
    request_type: Option<String>,
    keywords: Option<Vec<String>>,
    priority: Option<TaskPriority>,
    options: Option<RecognizeOptions>,
}

pub(crate) async fn ocr(State(state): State<GatewayState>, body: Bytes) -> Response {
    let request: OcrRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")),
    };

    let Some(image) = request.image else {
        return error(StatusCode::BAD_REQUEST, "missing image parameter");
    };
    if image.is_empty() {
        return error(StatusCode::BAD_REQUEST, "empty image parameter");
    }

    let mut options = request.options.unwrap_or_default();
    match request.request_type.as_deref() {
        None | Some("recognize") => {}
        Some("detect") => options.detail = 0,
        Some(other) => {
            return error(
                StatusCode::BAD_REQUEST,
                format!("unknown request_type: {other}"),
            );
        }
    }

    let mut spec = TaskSpec::new(ImagePayload::Base64(image));
    spec.keywords = request.keywords.unwrap_or_default();
    spec.priority = request.priority.unwrap_or(TaskPriority::Normal);
    spec.options = options;

    let started = Instant::now();
    match state.pool.process_sync(spec, None).await {
        Ok(result) => {
            let processing_time = started.elapsed().as_secs_f64();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "data": result,
                    "processing_time": processing_time,
                })),
            )
                .into_response()
        }
        Err(err) => {
            tracing::debug!(error = %err, "ocr request failed");
            task_error(err)
        }
    }
}

pub(crate) async fn list_instances(State(state): State<GatewayState>) -> Response {
    success(state.pool.instance_summaries())
}

pub(crate) async fn instance_detail(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.instance_detail(&id) {
        Ok(detail) => success(detail),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn instance_logs(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.instance_logs(&id) {
        Ok(logs) => success(logs),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn create_instance(State(state): State<GatewayState>) -> Response {
    match state.pool.add_instance() {
        Ok(instance_id) => success(json!({ "instance_id": instance_id })),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn delete_instance(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.remove_instance(&id).await {
        Ok(()) => success(json!({ "message": format!("instance {id} removed") })),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn start_instance(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.start_instance(&id).await {
        Ok(()) => success(json!({ "message": format!("instance {id} started") })),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn stop_instance(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.stop_instance(&id).await {
        Ok(()) => success(json!({ "message": format!("instance {id} stopped") })),
        Err(err) => pool_error(err),
    }
}

pub(crate) async fn restart_instance(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.pool.restart_instance(&id).await {
        Ok(()) => success(json!({ "message": format!("instance {id} restarted") })),
        Err(err) => pool_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_errors_map_to_the_documented_codes() {
        assert_eq!(
            task_error(TaskError::BadImage("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(task_error(TaskError::QueueFull).status(), StatusCode::CONFLICT);
        assert_eq!(
            task_error(TaskError::Timeout).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn pool_errors_map_to_the_documented_codes() {
        assert_eq!(
            pool_error(PoolError::UnknownInstance("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            pool_error(PoolError::AtMaxInstances(4)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
