//! HTTP ingress: upload a sheet, get the batch report back.
//!
//! * `GET /` serves the upload form.
//! * `POST /upload` takes a multipart form with a `file` field, runs the
//!   batch and answers with JSON:
//!   - 400 `{success: false, error}` when the upload itself is unusable
//!   - 500 `{success: false, error}` when the batch could not run
//!   - 200 `{success: true, report}` otherwise, even if records failed

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::orchestrator::run_upload;
use crate::report::BatchReport;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default maximum request body size: 16 MiB.
pub const DEFAULT_UPLOAD_LIMIT: usize = 16 * 1024 * 1024;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    config: Arc<BatchConfig>,
}

impl AppState {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

/// JSON body of every `/upload` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<BatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResponse {
    fn completed(report: BatchReport) -> Self {
        Self {
            success: true,
            report: Some(report),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            report: None,
            error: Some(error),
        }
    }
}

/// Why an upload request was refused.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No file part in the request")]
    MissingFile,

    #[error("No file selected")]
    EmptyFilename,

    #[error("Uploaded file is empty")]
    EmptyBody,

    #[error("Invalid multipart data: {0}")]
    Multipart(String),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::Batch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Batch failed: {}", self);
        } else {
            warn!("Upload rejected: {}", self);
        }
        (status, Json(UploadResponse::failed(self.to_string()))).into_response()
    }
}

/// Build the router with the default upload limit.
pub fn router(config: BatchConfig) -> Router {
    router_with_limit(config, DEFAULT_UPLOAD_LIMIT)
}

/// Build the router with an explicit request body limit in bytes.
pub fn router_with_limit(config: BatchConfig, upload_limit: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(AppState::new(config))
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    config: BatchConfig,
    upload_limit: usize,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router_with_limit(config, upload_limit))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, UploadError> {
    let multipart = multipart.map_err(|rej| UploadError::Multipart(rej.body_text()))?;
    let (filename, bytes) = read_file_field(multipart).await?;
    info!("Received upload '{}' ({} bytes)", filename, bytes.len());

    // The batch runs on its own task so a client disconnect, which drops
    // this handler future, never cuts off records that have started.
    let config = Arc::clone(&state.config);
    let batch = tokio::spawn(async move { run_upload(&bytes, &config).await });
    let report = batch
        .await
        .map_err(|e| BatchError::Internal(format!("batch task failed: {e}")))??;
    Ok(Json(UploadResponse::completed(report)))
}

/// Pull the `file` field out of the form. Other fields are ignored.
async fn read_file_field(mut multipart: Multipart) -> Result<(String, Vec<u8>), UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().trim().to_string();
        if filename.is_empty() {
            return Err(UploadError::EmptyFilename);
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| UploadError::Multipart(e.to_string()))?;
        if bytes.is_empty() {
            return Err(UploadError::EmptyBody);
        }
        return Ok((filename, bytes.to_vec()));
    }

    Err(UploadError::MissingFile)
}
