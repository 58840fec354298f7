use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use scanbroker_core::api::{RequestScanTasksArgs, RequestScanTasksReply, SubmitScanResultArgs};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span};
use uuid::Uuid;

use crate::error::ApiError;
use crate::service::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/agent/tasks", post(request_tasks))
        .route("/v1/agent/results", post(submit_result))
        .route("/v1/health", get(health))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<axum::body::Body>| {
            info_span!(
                "request",
                request_id = %Uuid::new_v4(),
                method = %req.method(),
                path = %req.uri().path(),
            )
        }))
        .with_state(state)
}

async fn request_tasks(
    State(state): State<AppState>,
    Json(args): Json<RequestScanTasksArgs>,
) -> Result<Json<RequestScanTasksReply>, ApiError> {
    let reply = state.broker.request_tasks(args).await?;
    Ok(Json(reply))
}

async fn submit_result(
    State(state): State<AppState>,
    payload: Result<Json<SubmitScanResultArgs>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(args)) => {
            state.broker.submit_result(args);
            StatusCode::ACCEPTED.into_response()
        }
        // Well-formed JSON with an unknown module label or payload shape.
        Err(JsonRejection::JsonDataError(e)) => {
            error!(error = %e.body_text(), "dropping undecodable scan result");
            StatusCode::ACCEPTED.into_response()
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
