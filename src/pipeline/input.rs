//! Input resolution: turn a user-supplied path or URL into batch bytes.
//!
//! The HTTP endpoint receives the batch as an upload; the CLI receives a
//! path or an HTTP(S) URL. Both end up as an in-memory byte buffer handed to
//! the extractor, so the rest of the pipeline never cares where the sheet
//! came from.

use crate::error::BatchError;
use std::path::PathBuf;
use tracing::{debug, info};

/// A batch file loaded into memory.
#[derive(Debug)]
pub struct ResolvedInput {
    /// File name from the path or URL, used for logging.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to the batch file's bytes.
///
/// If the input is a URL, download it. If it is a local file, read it.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, BatchError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

/// Read a local file, mapping the common I/O failures to friendly errors.
async fn read_local(path_str: &str) -> Result<ResolvedInput, BatchError> {
    let path = PathBuf::from(path_str);

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(BatchError::PermissionDenied { path });
        }
        Err(_) => return Err(BatchError::FileNotFound { path }),
    };

    debug!("Read {} bytes from {}", bytes.len(), path.display());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());

    Ok(ResolvedInput { name, bytes })
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, BatchError> {
    info!("Downloading batch file from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| BatchError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            BatchError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            BatchError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(BatchError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| BatchError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());

    Ok(ResolvedInput {
        name: extract_filename(url),
        bytes: bytes.to_vec(),
    })
}

/// Extract a reasonable filename from the URL path.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "batch.csv".to_string()
}
