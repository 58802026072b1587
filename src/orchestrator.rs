//! Batch entry points and the per-record state machine.
//!
//! Every record walks `render → convert → deliver` and stops at the first
//! failing stage. Failures are recorded in the [`BatchReport`]; only problems
//! that prevent the batch from running at all surface as [`BatchError`].
//!
//! Records run through a bounded `buffer_unordered` pool and the report is
//! put back into input order afterwards, so the caller never observes the
//! completion order.

use crate::artifact::{Artifact, ArtifactSlot, ArtifactStage};
use crate::config::{BatchConfig, SmtpConfig};
use crate::error::{BatchError, ConversionError, DeliveryError, RecordError, RenderError};
use crate::gate::{conversion_engine, ExclusiveResource};
use crate::pipeline::convert::{verify_output, CommandConverter, Converter};
use crate::pipeline::deliver::{parse_destination, Deliverer, SmtpDeliverer};
use crate::pipeline::render::{claim_all, Renderer, TemplateRenderer};
use crate::pipeline::{extract, input};
use crate::record::{BatchJob, Record};
use crate::report::{BatchReport, RecordOutcome, Stage};
use crate::workspace::Workspace;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Run a batch file given as a local path or HTTP(S) URL.
///
/// # Errors
/// Returns `Err(BatchError)` only for fatal errors: unreadable input,
/// malformed sheet, unavailable working storage, or missing mail settings.
/// Per-record failures are reported in the returned [`BatchReport`].
pub async fn run_input(input_str: impl AsRef<str>, config: &BatchConfig) -> Result<BatchReport, BatchError> {
    let input_str = input_str.as_ref();
    info!("Starting batch: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    debug!("Loaded {} ({} bytes)", resolved.name, resolved.bytes.len());
    run_upload(&resolved.bytes, config).await
}

/// Run a batch from uploaded bytes (CSV or XLSX).
///
/// This is the entry point used by the HTTP server.
pub async fn run_upload(bytes: &[u8], config: &BatchConfig) -> Result<BatchReport, BatchError> {
    let pipeline = resolve_pipeline(config)?;
    let workspace = Workspace::acquire(config.work_root.as_deref())?;

    // `workspace` is dropped (and the directory removed) if extraction fails
    let records = extract::extract(bytes, &config.extract_options())?;
    info!("Extracted {} records", records.len());

    let job = BatchJob::new(records, &config.template_path);
    let report = execute(&job, config, &pipeline, &workspace).await;
    workspace.close();
    Ok(report)
}

/// Run an already-extracted batch.
pub async fn run_batch(job: &BatchJob, config: &BatchConfig) -> Result<BatchReport, BatchError> {
    let pipeline = resolve_pipeline(config)?;
    let workspace = Workspace::acquire(config.work_root.as_deref())?;
    let report = execute(job, config, &pipeline, &workspace).await;
    workspace.close();
    Ok(report)
}

/// Synchronous wrapper around [`run_input`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_input_sync(input_str: impl AsRef<str>, config: &BatchConfig) -> Result<BatchReport, BatchError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| BatchError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run_input(input_str, config))
}

/// Run a batch and write its report as JSON.
///
/// Uses atomic write (temp file + rename) so a reader never sees a partial
/// report.
pub async fn run_to_report_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &BatchConfig,
) -> Result<BatchReport, BatchError> {
    let report = run_input(input_str, config).await?;
    write_report(&report, output_path.as_ref()).await?;
    Ok(report)
}

/// Write `report` to `path` as pretty-printed JSON.
pub async fn write_report(report: &BatchReport, path: &Path) -> Result<(), BatchError> {
    let write_err = |source| BatchError::ReportWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| BatchError::Internal(format!("report serialisation: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Collaborators for one run.
struct Pipeline {
    renderer: Arc<dyn Renderer>,
    converter: Arc<dyn Converter>,
    deliverer: Arc<dyn Deliverer>,
    /// `None` when the converter is reentrant.
    gate: Option<Arc<ExclusiveResource>>,
}

/// Resolve collaborators, from most-specific to least-specific.
///
/// 1. **Injected instance** (`config.renderer` / `converter` / `deliverer`),
///    used as-is.
/// 2. **Built-in implementation** configured from `config`. For delivery this
///    means `config.smtp`, falling back to the `SMTP_*` environment
///    variables; missing settings are fatal before any record starts.
fn resolve_pipeline(config: &BatchConfig) -> Result<Pipeline, BatchError> {
    let renderer: Arc<dyn Renderer> = match config.renderer {
        Some(ref r) => Arc::clone(r),
        None => Arc::new(TemplateRenderer::new()),
    };

    let converter: Arc<dyn Converter> = match config.converter {
        Some(ref c) => Arc::clone(c),
        None => Arc::new(CommandConverter::new(config.converter_command.clone())),
    };

    let deliverer: Arc<dyn Deliverer> = match config.deliverer {
        Some(ref d) => Arc::clone(d),
        None => {
            let smtp = match config.smtp {
                Some(ref s) => s.clone(),
                None => SmtpConfig::from_env()?,
            };
            Arc::new(SmtpDeliverer::new(
                &smtp,
                config.message.clone(),
                Duration::from_millis(config.deliver_timeout_ms),
            )?)
        }
    };

    let gate = if converter.is_reentrant() {
        None
    } else {
        Some(config.conversion_gate.clone().unwrap_or_else(conversion_engine))
    };

    Ok(Pipeline {
        renderer,
        converter,
        deliverer,
        gate,
    })
}

/// Everything a record worker needs, borrowed for the duration of a run.
struct RunContext<'a> {
    job: &'a BatchJob,
    config: &'a BatchConfig,
    pipeline: &'a Pipeline,
    workspace: &'a Workspace,
    total: usize,
}

async fn execute(job: &BatchJob, config: &BatchConfig, pipeline: &Pipeline, workspace: &Workspace) -> BatchReport {
    let start = Instant::now();
    let total = job.len();

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    // Names are claimed before any worker starts, so a duplicate always
    // fails on the later row regardless of completion order.
    let claims = claim_all(job.records(), &config.id_field);

    let ctx = RunContext {
        job,
        config,
        pipeline,
        workspace,
        total,
    };
    let ctx = &ctx;

    // Collected up front: a lazy `map` closure over `ctx` makes the whole
    // future fail the higher-ranked `Send` check required by `tokio::spawn`.
    let workers: Vec<_> = job
        .records()
        .iter()
        .zip(claims)
        .enumerate()
        .map(|(index, (record, claim))| run_record(ctx, index, record, claim))
        .collect();

    let outcomes: Vec<RecordOutcome> = stream::iter(workers)
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    let report = BatchReport::new(outcomes, start.elapsed().as_millis() as u64);

    info!(
        total = report.stats.total_records,
        delivered = report.stats.delivered,
        failed = report.stats.failed,
        cancelled = report.stats.cancelled,
        "Batch complete in {}ms",
        report.stats.total_duration_ms
    );

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_complete(total, report.stats.delivered);
    }

    report
}

/// Drive one record to a terminal outcome. Never fails and never panics.
async fn run_record(
    ctx: &RunContext<'_>,
    index: usize,
    record: &Record,
    claim: Result<String, RenderError>,
) -> RecordOutcome {
    let record_id = record.display_id(&ctx.config.id_field);
    let cb = ctx.config.progress_callback.as_ref();

    if ctx.config.is_cancelled() {
        debug!(index, record_id = %record_id, "Skipped: batch cancelled");
        if let Some(cb) = cb {
            cb.on_record_cancelled(index, ctx.total, &record_id);
        }
        return RecordOutcome::cancelled(index, record_id);
    }

    if let Some(cb) = cb {
        cb.on_record_start(index, ctx.total, &record_id);
    }

    let cursor = StageCursor::new();
    let result = AssertUnwindSafe(drive_record(ctx, index, record, &record_id, claim, &cursor))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(RecordError::Panicked {
                stage: cursor.current(),
                detail: panic_message(payload.as_ref()),
            })
        });

    match result {
        Ok(()) => {
            info!(index, record_id = %record_id, "Record delivered");
            if let Some(cb) = cb {
                cb.on_record_complete(index, ctx.total, &record_id);
            }
            RecordOutcome::delivered(index, record_id)
        }
        Err(err) => {
            warn!(index, record_id = %record_id, stage = %err.stage(), "Record failed: {}", err);
            if let Some(cb) = cb {
                cb.on_record_error(index, ctx.total, &record_id, err.stage(), &err.to_string());
            }
            RecordOutcome::failed(index, record_id, &err)
        }
    }
}

/// The render → convert → deliver state machine for one record.
///
/// The record's scope directory is removed when this returns, on success,
/// on error, and while unwinding from a collaborator panic.
async fn drive_record(
    ctx: &RunContext<'_>,
    index: usize,
    record: &Record,
    record_id: &str,
    claim: Result<String, RenderError>,
    cursor: &StageCursor,
) -> Result<(), RecordError> {
    let pipeline = ctx.pipeline;

    // ── Render ───────────────────────────────────────────────────────────
    cursor.enter(Stage::Render);
    let stem = claim?;
    let scope = ctx
        .workspace
        .record_scope(index)
        .await
        .map_err(RenderError::Workspace)?;
    let rendered = pipeline
        .renderer
        .render(record, ctx.job.template(), &scope.slot(ArtifactStage::Rendered, record_id, &stem))
        .await?;

    // ── Convert ──────────────────────────────────────────────────────────
    cursor.enter(Stage::Convert);
    let converted = convert_one(
        ctx,
        &rendered,
        &scope.slot(ArtifactStage::Converted, record_id, &stem),
    )
    .await?;
    rendered.release();

    // ── Deliver ──────────────────────────────────────────────────────────
    cursor.enter(Stage::Deliver);
    let to = parse_destination(record, &ctx.config.address_field)?;
    let limit = Duration::from_millis(ctx.config.deliver_timeout_ms);
    match tokio::time::timeout(limit, pipeline.deliverer.deliver(&converted, &to)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(DeliveryError::Timeout {
                address: to.email.to_string(),
                elapsed_ms: limit.as_millis() as u64,
            }
            .into())
        }
    }
    converted.release();
    Ok(())
}

/// Convert under the gate (if any) and the configured time limit.
async fn convert_one(
    ctx: &RunContext<'_>,
    source: &Artifact,
    slot: &ArtifactSlot<'_>,
) -> Result<Artifact, ConversionError> {
    let _guard = match ctx.pipeline.gate {
        Some(ref gate) => Some(gate.acquire().await),
        None => None,
    };

    let limit = Duration::from_millis(ctx.config.convert_timeout_ms);
    let converted = match tokio::time::timeout(limit, ctx.pipeline.converter.convert(source, slot)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ConversionError::Timeout {
                name: source.name(),
                elapsed_ms: limit.as_millis() as u64,
            })
        }
    };

    verify_output(source, &converted)?;
    Ok(converted)
}

/// The stage a record is currently in, readable after a panic.
struct StageCursor(AtomicU8);

impl StageCursor {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::NotStarted as u8))
    }

    fn enter(&self, stage: Stage) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }

    fn current(&self) -> Stage {
        match self.0.load(Ordering::Relaxed) {
            x if x == Stage::Convert as u8 => Stage::Convert,
            x if x == Stage::Deliver as u8 => Stage::Deliver,
            _ => Stage::Render,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
