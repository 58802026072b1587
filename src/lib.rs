//! # certmail
//!
//! Batch mail-merge: turn every row of a spreadsheet into a personalised
//! document, convert it (typically to PDF) and e-mail it to the row's
//! address.
//!
//! ## Pipeline Overview
//!
//! ```text
//! CSV / XLSX upload
//!  │
//!  ├─ 1. Extract  rows → ordered Records (header row = field names)
//!  ├─ 2. Render   fill {{ field }} placeholders in the template
//!  ├─ 3. Convert  external engine (soffice), serialised by the conversion gate
//!  ├─ 4. Deliver  SMTP message with the converted document attached
//!  └─ 5. Report   one RecordOutcome per row, in input order
//! ```
//!
//! A failure in one record is recorded in the report and never stops the
//! others. All intermediate files live in a per-batch temporary directory
//! that is removed on every exit path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use certmail::{run_input, BatchConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // SMTP settings are read from SMTP_SERVER / SMTP_PORT / SMTP_USERNAME / SMTP_PASSWORD
//!     let config = BatchConfig::builder()
//!         .template_path("certificate.html")
//!         .build()?;
//!     let report = run_input("students.xlsx", &config).await?;
//!     for outcome in report.failures() {
//!         eprintln!("{}: {:?}", outcome.record_id, outcome.error_detail);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `certmail` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `server` | on      | Enables the axum upload endpoint in [`server`] |
//!
//! Disable both when using only the library:
//! ```toml
//! certmail = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod config;
pub mod error;
pub mod gate;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod report;
#[cfg(feature = "server")]
pub mod server;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifact::{Artifact, ArtifactStage};
pub use config::{BatchConfig, BatchConfigBuilder, ConverterCommand, SmtpConfig};
pub use error::{BatchError, ConversionError, DeliveryError, RecordError, RenderError};
pub use gate::{conversion_engine, ExclusiveResource};
pub use message::MessageTemplate;
pub use orchestrator::{run_batch, run_input, run_input_sync, run_to_report_file, run_upload, write_report};
pub use pipeline::convert::{CommandConverter, Converter};
pub use pipeline::deliver::{Deliverer, SmtpDeliverer};
pub use pipeline::render::{Renderer, TemplateRenderer};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use record::{BatchJob, Record};
pub use report::{BatchReport, BatchStats, RecordOutcome, Stage};
