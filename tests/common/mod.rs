//! Shared fixtures and collaborator mocks for the integration tests.
//!
//! The mocks count their calls so tests can assert which stages a record
//! reached. The converter copies the rendered bytes into the converted
//! artifact, so whatever the deliverer receives is exactly what the
//! template produced for that record.

#![allow(dead_code)]

use async_trait::async_trait;
use certmail::artifact::ArtifactSlot;
use certmail::{
    Artifact, ArtifactStage, BatchConfig, BatchConfigBuilder, ConversionError, Converter,
    DeliveryError, Deliverer, ExclusiveResource, Record, RenderError, Renderer, TemplateRenderer,
};
use lettre::message::Mailbox;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TEMPLATE: &str = "<p>{{ Name }} passed {{ course }}</p>";

// ── Fixture ──────────────────────────────────────────────────────────────────

/// A template file plus an empty working-storage root, both in a temp dir.
pub struct Fixture {
    _dir: TempDir,
    pub template: PathBuf,
    pub work_root: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_template(TEMPLATE)
    }

    pub fn with_template(template: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("certificate.html");
        std::fs::write(&template_path, template).unwrap();
        let work_root = dir.path().join("work");
        std::fs::create_dir(&work_root).unwrap();
        Self {
            _dir: dir,
            template: template_path,
            work_root,
        }
    }

    /// Builder wired to the mocks, this fixture's paths and a private gate.
    pub fn builder(&self, converter: Arc<MockConverter>, deliverer: Arc<MockDeliverer>) -> BatchConfigBuilder {
        BatchConfig::builder()
            .template_path(&self.template)
            .work_root(&self.work_root)
            .converter(converter)
            .deliverer(deliverer)
            .conversion_gate(Arc::new(ExclusiveResource::new("test-engine")))
    }

    /// Number of entries left under the working-storage root.
    pub fn residue(&self) -> usize {
        std::fs::read_dir(&self.work_root).unwrap().count()
    }

    /// Write `contents` next to the template and return its path.
    pub fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.template.with_file_name(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

// ── Renderer ─────────────────────────────────────────────────────────────────

/// The real template renderer, counted.
#[derive(Default)]
pub struct CountingRenderer {
    pub calls: AtomicUsize,
    inner: TemplateRenderer,
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render(&self, record: &Record, template: &Path, slot: &ArtifactSlot<'_>) -> Result<Artifact, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.render(record, template, slot).await
    }
}

// ── Converter ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockConverter {
    pub calls: AtomicUsize,
    pub inside: AtomicUsize,
    pub peak: AtomicUsize,
    pub reentrant: bool,
    pub delay: Option<Duration>,
    /// Per-record delays, keyed by record id.
    pub delays: HashMap<String, Duration>,
    pub panic_on: Option<String>,
    /// Return an artifact attributed to another record.
    pub misattribute: bool,
}

impl MockConverter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(&self, source: &Artifact, slot: &ArtifactSlot<'_>) -> Result<Artifact, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(source.record_id()).copied().or(self.delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.inside.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on.as_deref() == Some(source.record_id()) {
            panic!("converter exploded on {}", source.record_id());
        }

        let bytes = source.read().await.unwrap();
        let path = slot.path_with_extension("pdf");
        tokio::fs::write(&path, bytes).await.unwrap();

        if self.misattribute {
            return Ok(Artifact::new("someone-else", ArtifactStage::Converted, path));
        }
        Ok(slot.artifact(ArtifactStage::Converted, path))
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

// ── Deliverer ────────────────────────────────────────────────────────────────

/// One captured delivery.
#[derive(Debug, Clone)]
pub struct Sent {
    pub record_id: String,
    pub to: String,
    pub attachment: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct MockDeliverer {
    pub calls: AtomicUsize,
    pub sent: Mutex<Vec<Sent>>,
    pub delay: Option<Duration>,
    /// Cancelled right after the first successful delivery.
    pub cancel_after_first: Option<CancellationToken>,
    /// Addresses the "server" rejects.
    pub reject: Vec<String>,
}

impl MockDeliverer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deliverer for MockDeliverer {
    async fn deliver(&self, artifact: &Artifact, to: &Mailbox) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }

        let address = to.email.to_string();
        if self.reject.contains(&address) {
            return Err(DeliveryError::Rejected {
                address,
                detail: "550 mailbox unavailable".into(),
            });
        }

        let body = artifact.read().await.unwrap();
        self.sent.lock().unwrap().push(Sent {
            record_id: artifact.record_id().to_string(),
            to: address,
            attachment: artifact.name(),
            body,
        });

        if let Some(ref token) = self.cancel_after_first {
            token.cancel();
        }
        Ok(())
    }
}

// ── Inputs ───────────────────────────────────────────────────────────────────

/// A CSV sheet with `Name,email,course` columns.
pub fn csv(rows: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut out = String::from("Name,email,course\n");
    for (name, email, course) in rows {
        out.push_str(&format!("{name},{email},{course}\n"));
    }
    out.into_bytes()
}

pub fn three_students() -> Vec<u8> {
    csv(&[
        ("Ada", "ada@example.com", "Maths"),
        ("Alan", "alan@example.com", "Logic"),
        ("Grace", "grace@example.com", "Compilers"),
    ])
}
