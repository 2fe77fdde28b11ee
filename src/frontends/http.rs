//! HTTP frontend.
//!
//! - `POST /add/:key` ingests an sMAP JSON payload
//! - `POST /api/query` runs the query in the request body
//! - `GET /health` reports liveness and counters

use super::{error_json, ingest_payload, wait_for_shutdown, ShutdownSignal};
use crate::archiver::{Archiver, ArchiverStats};
use crate::core::EphemeralKey;
use crate::error::{GilesError, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub streams: usize,
    pub stats: ArchiverStats,
}

#[derive(Debug, Serialize)]
pub struct AddResponse {
    pub accepted: usize,
}

pub enum ApiError {
    Giles(GilesError),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Giles(err) => {
                let status = match &err {
                    e if e.is_client_error() => StatusCode::BAD_REQUEST,
                    GilesError::Resolve(_) => StatusCode::BAD_REQUEST,
                    GilesError::TransientEngine(_) | GilesError::PoolExhaustion(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(error_json(&err))).into_response()
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}

impl From<GilesError> for ApiError {
    fn from(err: GilesError) -> Self {
        ApiError::Giles(err)
    }
}

pub fn create_server(archiver: Arc<Archiver>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/add/:key", post(add_readings))
        .route("/api/query", post(run_query))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(archiver)
}

async fn health_check(State(archiver): State<Arc<Archiver>>) -> std::result::Result<Json<HealthResponse>, ApiError> {
    let streams = archiver.metadata().document_count().await?;
    Ok(Json(HealthResponse { status: "ok".to_string(), streams, stats: archiver.stats() }))
}

/// POST /add/:key
async fn add_readings(
    State(archiver): State<Arc<Archiver>>,
    Path(key): Path<String>,
    Json(payload): Json<Value>,
) -> std::result::Result<Json<AddResponse>, ApiError> {
    let key = EphemeralKey::from_hex(&key)
        .ok_or_else(|| ApiError::BadRequest(format!("'{}' is not a 64 character hex key", key)))?;
    let accepted = ingest_payload(&archiver, &payload, Some(&key)).await?;
    Ok(Json(AddResponse { accepted }))
}

/// POST /api/query
async fn run_query(State(archiver): State<Arc<Archiver>>, body: String) -> std::result::Result<Json<Value>, ApiError> {
    let response = archiver.handle_query(body.trim()).await?;
    Ok(Json(response.to_json()))
}

/// Serves the HTTP frontend on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, archiver: Arc<Archiver>, shutdown: ShutdownSignal) -> Result<()> {
    let app = create_server(archiver);
    axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(shutdown)).await?;
    Ok(())
}

pub async fn start_server(addr: &str, archiver: Arc<Archiver>, shutdown: ShutdownSignal) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GilesError::FatalStartup(format!("cannot bind http frontend to {}: {}", addr, e)))?;
    info!(target: "giles::http", %addr, "HTTP frontend listening");
    serve(listener, archiver, shutdown).await
}
