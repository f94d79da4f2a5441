//! HTTP surface: `POST /evaluate` streams snapshots as NDJSON.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use engine::{EvaluationRequest, Evaluator};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub fn router(evaluator: Evaluator) -> Router {
    Router::new()
        .route("/evaluate", post(evaluate))
        .route("/health", get(health))
        .with_state(evaluator)
}

async fn health() -> &'static str {
    "ok"
}

async fn evaluate(
    State(evaluator): State<Evaluator>,
    Json(request): Json<EvaluationRequest>,
) -> Response {
    if request.fen.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "fen must not be empty").into_response();
    }
    if request.fen.contains(['\n', '\r']) {
        return (StatusCode::BAD_REQUEST, "fen must be a single line").into_response();
    }

    tracing::info!(
        fen = %request.fen,
        depth = ?request.depth,
        time_limit = ?request.time_limit,
        "POST /evaluate"
    );

    let mut snapshots = evaluator.evaluate(request);
    let body = async_stream::stream! {
        while let Some(snapshot) = snapshots.next_snapshot().await {
            match snapshot.to_ndjson() {
                Ok(line) => yield Ok::<_, Infallible>(line),
                Err(e) => tracing::error!("Failed to encode snapshot: {}", e),
            }
        }
    };

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response()
}
