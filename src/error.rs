//! Error types for the certmail library.
//!
//! Two layers of error reflect two distinct failure modes:
//!
//! * [`BatchError`]: **fatal**, the batch cannot run at all (unreadable
//!   upload, working storage unavailable, mail transport not configured).
//!   Returned as `Err(BatchError)` from the top-level `run_*` functions.
//!
//! * [`RenderError`], [`ConversionError`], [`DeliveryError`]: **non-fatal**,
//!   one record failed at one stage. The orchestrator wraps them in
//!   [`RecordError`] and downgrades them to a
//!   [`crate::report::RecordOutcome`]; they never abort the other records.
//!
//! Per-record messages never embed working-storage paths, so two runs of the
//! same batch produce identical reports.

use crate::report::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the certmail library.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Batch file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The upload could not be parsed as tabular data.
    #[error("Malformed batch input: {detail}")]
    MalformedInput { detail: String },

    // ── Run errors ────────────────────────────────────────────────────────
    /// The scoped working-storage area could not be created.
    #[error("Working storage unavailable under '{root}': {source}")]
    WorkspaceUnavailable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No mail transport could be built (missing SMTP settings etc.).
    #[error("Mail delivery is not configured.\n{hint}")]
    DeliveryNotConfigured { hint: String },

    /// Some records were delivered but at least one failed.
    ///
    /// Returned by [`crate::report::BatchReport::into_result`] when the
    /// caller wants to treat any record failure as an error.
    #[error("{failed}/{total} records failed ({cancelled} cancelled)")]
    PartialFailure {
        delivered: usize,
        failed: usize,
        cancelled: usize,
        total: usize,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the JSON report file.
    #[error("Failed to write report file '{path}': {source}")]
    ReportWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a record could not be rendered.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The identifying column is absent or empty for this row.
    #[error("Row has no value for identifying field '{field}'")]
    MissingId { field: String },

    /// The identifying value cannot be turned into an artifact name.
    #[error("Identifier '{id}' cannot be used as an artifact name")]
    InvalidId { id: String },

    /// Another row already claimed the same artifact name.
    #[error("Identifier '{id}' collides with row {first_row}; artifact names must be unique")]
    DuplicateId { id: String, first_row: usize },

    /// The template references fields this row does not provide.
    #[error("Missing template field(s): {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },

    /// The template file could not be read.
    #[error("Template '{path}' could not be loaded: {reason}")]
    TemplateUnavailable { path: PathBuf, reason: String },

    /// Writing the rendered document failed.
    #[error("Failed to write rendered document '{name}': {source}")]
    WriteFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The per-record working directory could not be prepared.
    #[error("Working storage error: {0}")]
    Workspace(#[source] std::io::Error),
}

/// Why a rendered document could not be converted.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The source artifact is missing, empty, or not a rendered document.
    #[error("Malformed source document '{name}': {detail}")]
    MalformedSource { name: String, detail: String },

    /// The converter process could not be started.
    #[error("Failed to start converter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The converter process exited unsuccessfully.
    #[error("Converter '{program}' failed ({status}): {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The converter exited cleanly but produced nothing.
    #[error("Converter produced no output for '{name}'")]
    MissingOutput { name: String },

    /// The converter returned something that does not belong to the source.
    #[error("Converter returned an invalid artifact for '{name}': {detail}")]
    MalformedOutput { name: String, detail: String },

    /// The conversion call exceeded its time limit.
    #[error("Conversion of '{name}' timed out after {elapsed_ms}ms")]
    Timeout { name: String, elapsed_ms: u64 },
}

/// Why a converted document could not be delivered.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination column is absent or empty for this row.
    #[error("Row has no value for destination field '{field}'")]
    MissingAddress { field: String },

    /// The destination is not a valid mailbox.
    #[error("Invalid destination address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The attachment could not be read or encoded.
    #[error("Failed to attach '{name}': {reason}")]
    Attachment { name: String, reason: String },

    /// The message could not be assembled.
    #[error("Failed to build message for '{address}': {reason}")]
    Message { address: String, reason: String },

    /// The server permanently rejected the message (auth, recipient, policy).
    #[error("Server rejected delivery to '{address}': {detail}")]
    Rejected { address: String, detail: String },

    /// Connection-level failure (refused, TLS, transient server error).
    #[error("Transport failure delivering to '{address}': {detail}")]
    Transport { address: String, detail: String },

    /// The delivery call exceeded its time limit.
    #[error("Delivery to '{address}' timed out after {elapsed_ms}ms")]
    Timeout { address: String, elapsed_ms: u64 },
}

/// A non-fatal error for a single record, tagged with the stage it hit.
///
/// Stored (as its display string) in [`crate::report::RecordOutcome`].
/// The batch continues regardless.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// A collaborator panicked; the panic was contained at the record boundary.
    #[error("Stage {stage} panicked: {detail}")]
    Panicked { stage: Stage, detail: String },
}

impl RecordError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            RecordError::Render(_) => Stage::Render,
            RecordError::Conversion(_) => Stage::Convert,
            RecordError::Delivery(_) => Stage::Deliver,
            RecordError::Panicked { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = BatchError::PartialFailure {
            delivered: 9,
            failed: 1,
            cancelled: 0,
            total: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("1/10"), "got: {msg}");
    }

    #[test]
    fn missing_fields_lists_every_field() {
        let e = RenderError::MissingFields {
            fields: vec!["course".into(), "grade".into()],
        };
        assert_eq!(e.to_string(), "Missing template field(s): course, grade");
    }

    #[test]
    fn duplicate_id_mentions_first_row() {
        let e = RenderError::DuplicateId {
            id: "Ada".into(),
            first_row: 2,
        };
        assert!(e.to_string().contains("row 2"));
        assert!(e.to_string().contains("Ada"));
    }

    #[test]
    fn timeout_display() {
        let e = ConversionError::Timeout {
            name: "Ada.html".into(),
            elapsed_ms: 5000,
        };
        assert!(e.to_string().contains("5000ms"));

        let e = DeliveryError::Timeout {
            address: "ada@example.com".into(),
            elapsed_ms: 250,
        };
        assert!(e.to_string().contains("ada@example.com"));
    }

    #[test]
    fn record_error_reports_its_stage() {
        let render: RecordError = RenderError::MissingId {
            field: "Name".into(),
        }
        .into();
        assert_eq!(render.stage(), Stage::Render);

        let convert: RecordError = ConversionError::MissingOutput {
            name: "Ada.html".into(),
        }
        .into();
        assert_eq!(convert.stage(), Stage::Convert);

        let deliver: RecordError = DeliveryError::MissingAddress {
            field: "email".into(),
        }
        .into();
        assert_eq!(deliver.stage(), Stage::Deliver);

        let panicked = RecordError::Panicked {
            stage: Stage::Convert,
            detail: "boom".into(),
        };
        assert_eq!(panicked.stage(), Stage::Convert);
        assert!(panicked.to_string().contains("boom"));
    }

    #[test]
    fn record_error_is_transparent() {
        let e: RecordError = DeliveryError::InvalidAddress {
            address: "nope".into(),
            reason: "missing @".into(),
        }
        .into();
        assert_eq!(
            e.to_string(),
            "Invalid destination address 'nope': missing @"
        );
    }
}
