//! CLI binary for certmail.
//!
//! A thin shim over the library crate that maps CLI flags to `BatchConfig`
//! and either runs one batch (`run`) or starts the upload server (`serve`).

use anyhow::{Context, Result};
use certmail::server::{self, DEFAULT_UPLOAD_LIMIT};
use certmail::{
    run_input, write_report, BatchConfig, BatchProgressCallback, BatchReport, ConverterCommand,
    MessageTemplate, ProgressCallback, SmtpDeliverer, Stage,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live progress bar plus one log line per
/// record. Records may finish out of order when `--concurrency > 1`.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-record wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_batch_start` tells us how many records there are.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading batch…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} records  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Sending");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total} records…"))
        ));
    }

    fn on_record_start(&self, index: usize, _total: usize, record_id: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(record_id.to_string());
    }

    fn on_record_complete(&self, index: usize, total: usize, record_id: &str) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} {:>4}/{:<4} {}  {}",
            green("✓"),
            index + 1,
            total,
            record_id,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_record_error(&self, index: usize, total: usize, record_id: &str, stage: Stage, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let first_line = error.lines().next().unwrap_or_default();
        let msg: String = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };

        self.bar.println(format!(
            "  {} {:>4}/{:<4} {}  {} {}  {}",
            red("✗"),
            index + 1,
            total,
            record_id,
            dim(&format!("[{stage}]")),
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_record_cancelled(&self, index: usize, total: usize, record_id: &str) {
        self.bar.println(format!(
            "  {} {:>4}/{:<4} {}",
            dim("–"),
            index + 1,
            total,
            dim(&format!("{record_id} (cancelled)")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, delivered: usize) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);

        if delivered == total {
            eprintln!("{} {} records delivered", green("✔"), bold(&delivered.to_string()));
        } else {
            eprintln!(
                "{} {}/{} records delivered  ({} failed)",
                if delivered == 0 { red("✘") } else { cyan("⚠") },
                bold(&delivered.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Send one document per row of a workbook
  certmail run students.xlsx --template certificate.html

  # CSV input, sequential, keep the report
  certmail run students.csv --concurrency 1 -o report.json

  # Machine-readable report on stdout
  certmail run https://example.com/export/students.csv --json

  # Custom converter (any command that writes {outdir}/{stem}.pdf)
  certmail run students.csv --converter "wkhtmltopdf {input} {outdir}/{stem}.pdf"

  # Start the upload service
  certmail serve --bind 0.0.0.0:5000

TEMPLATES:
  Placeholders are written {{ field }} and filled from the matching column.
  A row missing any referenced field fails at the render stage.

ENVIRONMENT VARIABLES:
  SMTP_SERVER     SMTP relay host (STARTTLS)
  SMTP_PORT       SMTP relay port, e.g. 587
  SMTP_USERNAME   Login name, also the default sender
  SMTP_PASSWORD   Login password
  SMTP_FROM       Optional sender address, e.g. "Certificates <certs@example.com>"
  RUST_LOG        Override log filter (e.g. certmail=debug)

  A .env file in the working directory is loaded at startup.

EXIT STATUS:
  0  every record delivered
  1  fatal error, or at least one record failed or was cancelled
"#;

/// Render, convert and e-mail one document per spreadsheet row.
#[derive(Parser, Debug)]
#[command(
    name = "certmail",
    version,
    about = "Render, convert and e-mail one document per spreadsheet row",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CERTMAIL_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "CERTMAIL_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one batch file (local path or HTTP/HTTPS URL).
    Run {
        /// CSV or XLSX file path, or URL.
        input: String,

        /// Also write the JSON report to this file.
        #[arg(short, long, env = "CERTMAIL_REPORT")]
        output: Option<PathBuf>,

        /// Print the JSON report on stdout instead of a summary.
        #[arg(long)]
        json: bool,

        /// Disable progress bar.
        #[arg(long, env = "CERTMAIL_NO_PROGRESS")]
        no_progress: bool,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Serve the upload form and `POST /upload` endpoint.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "CERTMAIL_BIND", default_value = "127.0.0.1:5000")]
        bind: SocketAddr,

        /// Maximum upload size in bytes.
        #[arg(long, env = "CERTMAIL_UPLOAD_LIMIT", default_value_t = DEFAULT_UPLOAD_LIMIT)]
        upload_limit: usize,

        #[command(flatten)]
        batch: BatchArgs,
    },
}

/// Flags shared by `run` and `serve`.
#[derive(Args, Debug)]
struct BatchArgs {
    /// Template filled for every record.
    #[arg(short, long, env = "CERTMAIL_TEMPLATE", default_value = "template.html")]
    template: PathBuf,

    /// Column holding the unique record identifier (names the documents).
    #[arg(long, env = "CERTMAIL_ID_FIELD", default_value = "Name")]
    id_field: String,

    /// Column holding the destination e-mail address.
    #[arg(long, env = "CERTMAIL_ADDRESS_FIELD", default_value = "email")]
    address_field: String,

    /// Worksheet to read from XLSX files (default: first sheet).
    #[arg(long, env = "CERTMAIL_SHEET")]
    sheet: Option<String>,

    /// Number of records processed at once.
    #[arg(short, long, env = "CERTMAIL_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Per-document conversion timeout in seconds.
    #[arg(long, env = "CERTMAIL_CONVERT_TIMEOUT", default_value_t = 120)]
    convert_timeout: u64,

    /// Per-message delivery timeout in seconds.
    #[arg(long, env = "CERTMAIL_DELIVER_TIMEOUT", default_value_t = 30)]
    deliver_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "CERTMAIL_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Converter command line with {input}, {outdir} and {stem} placeholders.
    #[arg(long, env = "CERTMAIL_CONVERTER")]
    converter: Option<String>,

    /// File extension the converter produces.
    #[arg(long, env = "CERTMAIL_CONVERTER_EXT", default_value = "pdf")]
    converter_ext: String,

    /// Directory for temporary working storage (default: system temp dir).
    #[arg(long, env = "CERTMAIL_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// E-mail subject.
    #[arg(long, env = "CERTMAIL_SUBJECT", default_value = certmail::message::DEFAULT_SUBJECT)]
    subject: String,

    /// E-mail body (plain text).
    #[arg(long, env = "CERTMAIL_BODY", default_value = certmail::message::DEFAULT_BODY)]
    body: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Loaded before parsing so `.env` values feed the `env =` fallbacks.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for `run`; `serve` logs at INFO.
    let show_progress = match cli.command {
        Command::Run { json, no_progress, .. } => !cli.quiet && !no_progress && !json,
        Command::Serve { .. } => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Ctrl-C cancels records that have not started yet ─────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", cyan("Interrupted: finishing in-flight records…"));
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Run {
            ref input,
            ref output,
            json,
            batch: ref args,
            ..
        } => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new_dynamic() as Arc<dyn BatchProgressCallback>)
            } else {
                None
            };

            let config = build_config(args, progress, cancel)?;
            let report = run_input(input, &config).await.context("Batch failed")?;

            if let Some(ref path) = output {
                write_report(&report, path).await.context("Failed to write report")?;
            }

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else if !cli.quiet {
                print_summary(&report, show_progress, output.as_ref());
            }

            if !report.all_delivered() {
                std::process::exit(1);
            }
        }

        Command::Serve {
            bind,
            upload_limit,
            batch: ref args,
        } => {
            let mut config = build_config(args, None, cancel.clone())?;

            // One pooled transport shared by every upload.
            let deliverer = SmtpDeliverer::from_env(
                config.message.clone(),
                Duration::from_millis(config.deliver_timeout_ms),
            )
            .context("SMTP is not configured")?;
            config.deliverer = Some(Arc::new(deliverer));

            if !cli.quiet {
                eprintln!("{} {}", cyan("◆"), bold(&format!("Serving on http://{bind}")));
            }
            server::serve(bind, config, upload_limit, cancel)
                .await
                .with_context(|| format!("Server on {bind} failed"))?;
        }
    }

    Ok(())
}

/// Map CLI args to `BatchConfig`.
fn build_config(
    args: &BatchArgs,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .template_path(&args.template)
        .id_field(&args.id_field)
        .address_field(&args.address_field)
        .concurrency(args.concurrency)
        .convert_timeout_ms(args.convert_timeout.saturating_mul(1000))
        .deliver_timeout_ms(args.deliver_timeout.saturating_mul(1000))
        .download_timeout_secs(args.download_timeout)
        .message(MessageTemplate::new(&args.subject, &args.body))
        .cancel_token(cancel);

    if let Some(ref sheet) = args.sheet {
        builder = builder.sheet(sheet);
    }
    if let Some(ref dir) = args.work_dir {
        builder = builder.work_root(dir);
    }
    if let Some(ref line) = args.converter {
        let command = ConverterCommand::parse(line, &args.converter_ext).context("Invalid --converter")?;
        builder = builder.converter_command(command);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Per-record summary on stderr.
fn print_summary(report: &BatchReport, progress_shown: bool, output: Option<&PathBuf>) {
    let stats = &report.stats;

    // The progress callback already printed one line per record.
    if !progress_shown {
        for o in &report.outcomes {
            if o.success {
                eprintln!("  {} {}", green("✓"), o.record_id);
            } else if o.cancelled {
                eprintln!("  {} {}", dim("–"), dim(&format!("{} (cancelled)", o.record_id)));
            } else {
                eprintln!(
                    "  {} {}  {} {}",
                    red("✗"),
                    o.record_id,
                    dim(&format!("[{}]", o.stage_reached)),
                    o.error_detail.as_deref().unwrap_or_default(),
                );
            }
        }
    }

    eprintln!(
        "{}  {}/{} delivered  {} failed  {} cancelled  {}ms",
        if report.all_delivered() { green("✔") } else { cyan("⚠") },
        stats.delivered,
        stats.total_records,
        stats.failed,
        stats.cancelled,
        stats.total_duration_ms,
    );
    if stats.failed > 0 {
        eprintln!(
            "   {} render  /  {} convert  /  {} deliver",
            dim(&stats.render_failures.to_string()),
            dim(&stats.convert_failures.to_string()),
            dim(&stats.deliver_failures.to_string()),
        );
    }
    if let Some(path) = output {
        eprintln!("   report  →  {}", bold(&path.display().to_string()));
    }
}
