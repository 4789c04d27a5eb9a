//! `foreman serve`: HTTP intake + read-only status.
//!
//! - `POST /ingest`  Authorization: Bearer <token>, body `{type, chunk, price_table_id?}`
//!   401 / 400 / 502 only; a body axum cannot decode is a 400 like any other bad request
//! - `GET  /status`  status counts
//! - `GET  /healthz`

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use foreman_core::app::{App, IngestRequest, http_status};
use foreman_core::domain::QueueError;

pub async fn run(app: Arc<App>, addr: &str) -> Result<()> {
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/ingest", post(ingest))
        .with_state(app);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server")
}

async fn status(State(app): State<Arc<App>>) -> Response {
    match app.status.counts().await {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn ingest(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let bearer = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let request = body
        .map(|Json(request)| request)
        .map_err(|rejection| QueueError::InvalidArgument(rejection.body_text()));
    match app.ingest.handle_decoded(bearer, request).await {
        Ok(result) => (StatusCode::OK, Json(json!({"ok": true, "result": result}))).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &QueueError) -> Response {
    let code = StatusCode::from_u16(http_status(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(json!({"ok": false, "error": err.to_string()}))).into_response()
}
