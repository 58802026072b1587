//! Configuration types for batch runs.
//!
//! All batch behaviour is controlled through [`BatchConfig`], built via its
//! [`BatchConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share a config between the HTTP server's requests, log it, and diff two
//! runs to understand why their reports differ.
//!
//! Collaborators (renderer, converter, deliverer) can be injected as trait
//! objects; anything left unset falls back to the built-in implementation
//! when the batch starts.

use crate::error::BatchError;
use crate::gate::ExclusiveResource;
use crate::message::MessageTemplate;
use crate::pipeline::convert::Converter;
use crate::pipeline::deliver::Deliverer;
use crate::pipeline::extract::ExtractOptions;
use crate::pipeline::render::Renderer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for a batch run.
///
/// Built via [`BatchConfig::builder()`] or using [`BatchConfig::default()`].
///
/// # Example
/// ```rust
/// use certmail::BatchConfig;
///
/// let config = BatchConfig::builder()
///     .template_path("templates/certificate.html")
///     .concurrency(8)
///     .id_field("Name")
///     .address_field("email")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// Template every record is rendered from. Default: `template.html`.
    pub template_path: PathBuf,

    /// Column holding the unique record identifier. Default: `Name`.
    ///
    /// Its value names the record's artifacts, so two rows with the same
    /// value collide and the second fails at the render stage.
    pub id_field: String,

    /// Column holding the destination e-mail address. Default: `email`.
    pub address_field: String,

    /// Worksheet to read from XLSX uploads. Default: the first sheet.
    pub sheet: Option<String>,

    /// Number of records in flight at once. Default: 4. `1` is strictly
    /// sequential.
    ///
    /// Records are independent, so rendering and delivery overlap freely.
    /// Conversion through a non-reentrant engine is still serialised by the
    /// conversion gate regardless of this value.
    pub concurrency: usize,

    /// Per-conversion time limit in milliseconds. Default: 120 000.
    pub convert_timeout_ms: u64,

    /// Per-delivery time limit in milliseconds. Default: 30 000.
    pub deliver_timeout_ms: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Directory under which batch working storage is created.
    /// Default: the system temp dir.
    pub work_root: Option<PathBuf>,

    /// External command used by the built-in converter.
    pub converter_command: ConverterCommand,

    /// Subject and body of outgoing mail.
    pub message: MessageTemplate,

    /// SMTP settings. If None, read from the environment when needed.
    pub smtp: Option<SmtpConfig>,

    /// Pre-constructed renderer. Default: [`crate::TemplateRenderer`].
    pub renderer: Option<Arc<dyn Renderer>>,

    /// Pre-constructed converter. Default: [`crate::CommandConverter`].
    pub converter: Option<Arc<dyn Converter>>,

    /// Pre-constructed deliverer. Default: [`crate::SmtpDeliverer`].
    pub deliverer: Option<Arc<dyn Deliverer>>,

    /// Gate for non-reentrant converters. Default: the process-wide
    /// [`crate::gate::conversion_engine`].
    pub conversion_gate: Option<Arc<ExclusiveResource>>,

    /// Observer for per-record progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Batch-level cancellation, checked before each record starts.
    pub cancel_token: Option<CancellationToken>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from("template.html"),
            id_field: "Name".to_string(),
            address_field: "email".to_string(),
            sheet: None,
            concurrency: 4,
            convert_timeout_ms: 120_000,
            deliver_timeout_ms: 30_000,
            download_timeout_secs: 120,
            work_root: None,
            converter_command: ConverterCommand::default(),
            message: MessageTemplate::default(),
            smtp: None,
            renderer: None,
            converter: None,
            deliverer: None,
            conversion_gate: None,
            progress_callback: None,
            cancel_token: None,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("template_path", &self.template_path)
            .field("id_field", &self.id_field)
            .field("address_field", &self.address_field)
            .field("sheet", &self.sheet)
            .field("concurrency", &self.concurrency)
            .field("convert_timeout_ms", &self.convert_timeout_ms)
            .field("deliver_timeout_ms", &self.deliver_timeout_ms)
            .field("work_root", &self.work_root)
            .field("converter_command", &self.converter_command)
            .field("message", &self.message)
            .field("smtp", &self.smtp)
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn Renderer>"))
            .field("converter", &self.converter.as_ref().map(|_| "<dyn Converter>"))
            .field("deliverer", &self.deliverer.as_ref().map(|_| "<dyn Deliverer>"))
            .field("cancellable", &self.cancel_token.is_some())
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            sheet: self.sheet.clone(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.template_path = path.into();
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.config.id_field = field.into();
        self
    }

    pub fn address_field(mut self, field: impl Into<String>) -> Self {
        self.config.address_field = field.into();
        self
    }

    pub fn sheet(mut self, sheet: impl Into<String>) -> Self {
        self.config.sheet = Some(sheet.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn convert_timeout_ms(mut self, ms: u64) -> Self {
        self.config.convert_timeout_ms = ms;
        self
    }

    pub fn deliver_timeout_ms(mut self, ms: u64) -> Self {
        self.config.deliver_timeout_ms = ms;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_root = Some(dir.into());
        self
    }

    pub fn converter_command(mut self, command: ConverterCommand) -> Self {
        self.config.converter_command = command;
        self
    }

    pub fn message(mut self, message: MessageTemplate) -> Self {
        self.config.message = message;
        self
    }

    pub fn smtp(mut self, smtp: SmtpConfig) -> Self {
        self.config.smtp = Some(smtp);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.config.converter = Some(converter);
        self
    }

    pub fn deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.config.deliverer = Some(deliverer);
        self
    }

    pub fn conversion_gate(mut self, gate: Arc<ExclusiveResource>) -> Self {
        self.config.conversion_gate = Some(gate);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.config.cancel_token = Some(token);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, BatchError> {
        let c = &self.config;
        if c.id_field.trim().is_empty() {
            return Err(BatchError::InvalidConfig(
                "Identifying field name must not be empty".into(),
            ));
        }
        if c.address_field.trim().is_empty() {
            return Err(BatchError::InvalidConfig(
                "Address field name must not be empty".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(BatchError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.convert_timeout_ms == 0 || c.deliver_timeout_ms == 0 {
            return Err(BatchError::InvalidConfig(
                "Stage timeouts must be greater than zero".into(),
            ));
        }
        if c.converter_command.program.trim().is_empty() {
            return Err(BatchError::InvalidConfig(
                "Converter program must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Converter command ────────────────────────────────────────────────────

/// External command run once per rendered document.
///
/// Arguments may contain the placeholders `{input}` (rendered file),
/// `{outdir}` (directory the output must land in) and `{stem}` (artifact
/// name without extension). After a successful exit the converter expects
/// `{outdir}/{stem}.{output_extension}` to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_extension: String,
}

impl Default for ConverterCommand {
    fn default() -> Self {
        Self {
            program: "soffice".to_string(),
            args: ["--headless", "--convert-to", "pdf", "--outdir", "{outdir}", "{input}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output_extension: "pdf".to_string(),
        }
    }
}

impl ConverterCommand {
    /// Parse a whitespace-separated command line, e.g.
    /// `"soffice --headless --convert-to pdf --outdir {outdir} {input}"`.
    pub fn parse(command_line: &str, output_extension: impl Into<String>) -> Result<Self, BatchError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| BatchError::InvalidConfig("Converter command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            output_extension: output_extension.into(),
        })
    }

    /// Substitute placeholders in the argument list.
    pub fn expand_args(&self, input: &str, outdir: &str, stem: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", input)
                    .replace("{outdir}", outdir)
                    .replace("{stem}", stem)
            })
            .collect()
    }
}

// ── SMTP ─────────────────────────────────────────────────────────────────

/// SMTP relay settings.
///
/// Read from `SMTP_SERVER`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`
/// and optionally `SMTP_FROM` (defaults to the username).
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: Option<String>,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from", &self.from)
            .finish()
    }
}

impl SmtpConfig {
    /// Load settings from process environment variables.
    pub fn from_env() -> Result<Self, BatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BatchError> {
        let required = |key: &str| -> Result<String, BatchError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BatchError::DeliveryNotConfigured {
                    hint: format!("Set {key} (SMTP_SERVER, SMTP_PORT, SMTP_USERNAME and SMTP_PASSWORD are required)."),
                })
        };

        let host = required("SMTP_SERVER")?;
        let port_str = required("SMTP_PORT")?;
        let port = port_str
            .trim()
            .parse::<u16>()
            .map_err(|_| BatchError::DeliveryNotConfigured {
                hint: format!("SMTP_PORT must be a port number, got '{port_str}'"),
            })?;
        let username = required("SMTP_USERNAME")?;
        let password = required("SMTP_PASSWORD")?;
        let from = lookup("SMTP_FROM").filter(|v| !v.trim().is_empty());

        Ok(Self {
            host,
            port,
            username,
            password,
            from,
        })
    }

    /// Sender address: `from` if set, otherwise the login name.
    pub fn sender(&self) -> &str {
        self.from.as_deref().unwrap_or(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let c = BatchConfig::default();
        assert_eq!(c.id_field, "Name");
        assert_eq!(c.address_field, "email");
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.convert_timeout_ms, 120_000);
        assert_eq!(c.deliver_timeout_ms, 30_000);
        assert_eq!(c.converter_command.program, "soffice");
        assert!(!c.is_cancelled());
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = BatchConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn builder_rejects_empty_fields() {
        assert!(matches!(
            BatchConfig::builder().id_field(" ").build(),
            Err(BatchError::InvalidConfig(_))
        ));
        assert!(matches!(
            BatchConfig::builder().address_field("").build(),
            Err(BatchError::InvalidConfig(_))
        ));
        assert!(matches!(
            BatchConfig::builder().deliver_timeout_ms(0).build(),
            Err(BatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancel_token_is_observed() {
        let token = CancellationToken::new();
        let c = BatchConfig::builder().cancel_token(token.clone()).build().unwrap();
        assert!(!c.is_cancelled());
        token.cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn converter_command_parse_and_expand() {
        let cmd = ConverterCommand::parse("cp {input} {outdir}/{stem}.pdf", "pdf").unwrap();
        assert_eq!(cmd.program, "cp");
        assert_eq!(
            cmd.expand_args("/w/r/Ada.html", "/w/c", "Ada"),
            vec!["/w/r/Ada.html".to_string(), "/w/c/Ada.pdf".to_string()]
        );
        assert!(ConverterCommand::parse("   ", "pdf").is_err());
    }

    #[test]
    fn default_converter_uses_soffice_placeholders() {
        let cmd = ConverterCommand::default();
        let args = cmd.expand_args("in.html", "out", "in");
        assert_eq!(args.last().map(String::as_str), Some("in.html"));
        assert!(args.contains(&"out".to_string()));
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn smtp_from_lookup() {
        let smtp = SmtpConfig::from_lookup(lookup(&[
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_PORT", "587"),
            ("SMTP_USERNAME", "certs@example.com"),
            ("SMTP_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.sender(), "certs@example.com");
        assert!(!format!("{smtp:?}").contains("hunter2"));
    }

    #[test]
    fn smtp_missing_or_bad_values() {
        let err = SmtpConfig::from_lookup(lookup(&[("SMTP_SERVER", "smtp.example.com")])).unwrap_err();
        assert!(err.to_string().contains("SMTP_PORT"), "got: {err}");

        let err = SmtpConfig::from_lookup(lookup(&[
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_PORT", "smtp"),
            ("SMTP_USERNAME", "u"),
            ("SMTP_PASSWORD", "p"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BatchError::DeliveryNotConfigured { .. }));
    }

    #[test]
    fn smtp_from_overrides_sender() {
        let smtp = SmtpConfig::from_lookup(lookup(&[
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_PORT", "25"),
            ("SMTP_USERNAME", "login"),
            ("SMTP_PASSWORD", "p"),
            ("SMTP_FROM", "Certificates <certs@example.com>"),
        ]))
        .unwrap();
        assert_eq!(smtp.sender(), "Certificates <certs@example.com>");
    }
}
