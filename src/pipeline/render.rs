//! Render stage: one record + template → rendered document.
//!
//! The built-in [`TemplateRenderer`] fills `{{ field }}` placeholders in a
//! text template in any format the converter accepts, or in the document
//! parts of a Word `.docx` template (see [`super::docx`]). Every placeholder
//! must be satisfied by the record. The error lists all missing fields at
//! once.
//!
//! Artifact names come from the identifying field. [`ArtifactNames`] claims
//! them in input order before any record runs, so with concurrent workers the
//! *second* row with a given name is still the one that fails.

use crate::artifact::{Artifact, ArtifactSlot, ArtifactStage};
use crate::error::RenderError;
use crate::pipeline::docx;
use crate::record::Record;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

/// Longest artifact stem, in characters.
const MAX_STEM_CHARS: usize = 120;

/// Turns a record into a rendered document in working storage.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `record` with the template at `template`, writing the result
    /// into `slot.dir` and returning it as a [`ArtifactStage::Rendered`]
    /// artifact.
    async fn render(
        &self,
        record: &Record,
        template: &Path,
        slot: &ArtifactSlot<'_>,
    ) -> Result<Artifact, RenderError>;
}

/// `{{ field }}` substitution over a text template.
#[derive(Debug, Default, Clone)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render(
        &self,
        record: &Record,
        template: &Path,
        slot: &ArtifactSlot<'_>,
    ) -> Result<Artifact, RenderError> {
        let unavailable = |reason: String| RenderError::TemplateUnavailable {
            path: template.to_path_buf(),
            reason,
        };

        let source = tokio::fs::read(template)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let rendered = match TemplateKind::of(template) {
            TemplateKind::Docx => {
                let record = record.clone();
                let path = template.to_path_buf();
                let task = tokio::task::spawn_blocking(move || docx::fill_docx(&path, &source, &record));
                match task.await {
                    Ok(result) => result?,
                    Err(e) => match e.try_into_panic() {
                        Ok(payload) => std::panic::resume_unwind(payload),
                        Err(e) => return Err(unavailable(format!("render task failed: {e}"))),
                    },
                }
            }
            kind => {
                let text = String::from_utf8(source).map_err(|e| unavailable(e.to_string()))?;
                fill_placeholders(&text, record, kind == TemplateKind::Html)?.into_bytes()
            }
        };

        let ext = template
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt");
        let path = slot.path_with_extension(ext);
        let artifact = slot.artifact(ArtifactStage::Rendered, &path);

        tokio::fs::write(&path, &rendered)
            .await
            .map_err(|source| RenderError::WriteFailed {
                name: artifact.name(),
                source,
            })?;

        debug!("Rendered {} ({} bytes)", artifact.name(), rendered.len());
        Ok(artifact)
    }
}

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

/// Replace every `{{ field }}` with the record's value.
///
/// Fails with [`RenderError::MissingFields`] listing every field the record
/// lacks (sorted, deduplicated).
pub fn fill_placeholders(template: &str, record: &Record, escape: bool) -> Result<String, RenderError> {
    let mut missing = BTreeSet::new();
    let out = fill_collecting(template, record, escape, &mut missing);
    missing_fields(missing).map(|()| out)
}

/// Fill placeholders, adding absent fields to `missing` instead of failing.
pub(crate) fn fill_collecting(template: &str, record: &Record, escape: bool, missing: &mut BTreeSet<String>) -> String {
    RE_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let field = &caps[1];
            match record.get(field) {
                Some(v) if escape => escape_markup(v),
                Some(v) => v.to_string(),
                None => {
                    missing.insert(field.to_string());
                    String::new()
                }
            }
        })
        .into_owned()
}

pub(crate) fn missing_fields(missing: BTreeSet<String>) -> Result<(), RenderError> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RenderError::MissingFields {
            fields: missing.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateKind {
    Html,
    Docx,
    Text,
}

impl TemplateKind {
    fn of(template: &Path) -> Self {
        let ext = template
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("html" | "htm") => Self::Html,
            Some("docx") => Self::Docx,
            _ => Self::Text,
        }
    }
}

/// Escape `& < > " '` for HTML and XML text.
pub(crate) fn escape_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ── Artifact naming ──────────────────────────────────────────────────────

/// Derive a filesystem-safe artifact stem from an identifier.
///
/// Letters, digits, space, `-`, `_` and `.` are kept; everything else
/// becomes `_`. Leading dots are stripped so a name can never be hidden or
/// refer to a parent directory. Returns `None` when nothing usable remains.
pub fn artifact_stem(id: &str) -> Option<String> {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    let cleaned = cleaned.trim_start_matches('.').trim().to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        None
    } else {
        Some(cleaned)
    }
}

/// Claims artifact names for a batch in input order.
#[derive(Debug, Default)]
pub struct ArtifactNames {
    /// Lower-cased stem → row of the first record that claimed it.
    claimed: HashMap<String, usize>,
}

impl ArtifactNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the artifact stem for `record`.
    ///
    /// Comparison is case-insensitive.
    pub fn claim(&mut self, record: &Record, id_field: &str) -> Result<String, RenderError> {
        let id = record.get(id_field).ok_or_else(|| RenderError::MissingId {
            field: id_field.to_string(),
        })?;
        let stem = artifact_stem(id).ok_or_else(|| RenderError::InvalidId { id: id.to_string() })?;

        let key = stem.to_lowercase();
        if let Some(&first_row) = self.claimed.get(&key) {
            return Err(RenderError::DuplicateId {
                id: id.to_string(),
                first_row,
            });
        }
        self.claimed.insert(key, record.row());
        Ok(stem)
    }
}

/// Claim stems for every record, returning one result per record.
pub fn claim_all(records: &[Record], id_field: &str) -> Vec<Result<String, RenderError>> {
    let mut names = ArtifactNames::new();
    records.iter().map(|r| names.claim(r, id_field)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> Record {
        Record::new(1, [("Name", "Ada"), ("course", "Maths & <Logic>")])
    }

    #[test]
    fn fills_placeholders_with_flexible_spacing() {
        let out = fill_placeholders("Dear {{Name}}, you passed {{ course }}.", &ada(), false).unwrap();
        assert_eq!(out, "Dear Ada, you passed Maths & <Logic>.");
    }

    #[test]
    fn escapes_for_html() {
        let out = fill_placeholders("<p>{{ course }}</p>", &ada(), true).unwrap();
        assert_eq!(out, "<p>Maths &amp; &lt;Logic&gt;</p>");
    }

    #[test]
    fn reports_every_missing_field() {
        let err = fill_placeholders("{{ grade }} {{ Name }} {{ date }} {{grade}}", &ada(), false).unwrap_err();
        match err {
            RenderError::MissingFields { fields } => assert_eq!(fields, vec!["date", "grade"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn template_kind_follows_extension() {
        assert_eq!(TemplateKind::of(Path::new("a.HTML")), TemplateKind::Html);
        assert_eq!(TemplateKind::of(Path::new("student.docx")), TemplateKind::Docx);
        assert_eq!(TemplateKind::of(Path::new("notes.txt")), TemplateKind::Text);
        assert_eq!(TemplateKind::of(Path::new("noext")), TemplateKind::Text);
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let out = fill_placeholders("no fields { here }", &ada(), false).unwrap();
        assert_eq!(out, "no fields { here }");
    }

    #[test]
    fn stems_are_filesystem_safe() {
        assert_eq!(artifact_stem("Ada Lovelace").as_deref(), Some("Ada Lovelace"));
        assert_eq!(artifact_stem("a/b\\c:d").as_deref(), Some("a_b_c_d"));
        assert_eq!(artifact_stem("../etc/passwd").as_deref(), Some("_etc_passwd"));
        assert_eq!(artifact_stem("José").as_deref(), Some("José"));
        assert_eq!(artifact_stem("   "), None);
        assert_eq!(artifact_stem("///"), None);
    }

    #[test]
    fn second_claim_of_a_name_fails() {
        let records = vec![
            Record::new(1, [("Name", "Ada")]),
            Record::new(2, [("Name", "Alan")]),
            Record::new(3, [("Name", "ada")]),
            Record::new(4, [("email", "x@example.com")]),
        ];
        let claims = claim_all(&records, "Name");
        assert_eq!(claims[0].as_deref().ok(), Some("Ada"));
        assert_eq!(claims[1].as_deref().ok(), Some("Alan"));
        assert!(matches!(
            claims[2],
            Err(RenderError::DuplicateId { first_row: 1, .. })
        ));
        assert!(matches!(claims[3], Err(RenderError::MissingId { .. })));
    }

    #[tokio::test]
    async fn template_renderer_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("certificate.html");
        std::fs::write(&template, "<h1>{{ Name }}</h1>").unwrap();
        let out_dir = dir.path().join("rendered");
        std::fs::create_dir(&out_dir).unwrap();

        let slot = ArtifactSlot {
            record_id: "Ada",
            dir: &out_dir,
            stem: "Ada",
        };
        let artifact = TemplateRenderer::new().render(&ada(), &template, &slot).await.unwrap();

        assert_eq!(artifact.stage(), ArtifactStage::Rendered);
        assert_eq!(artifact.name(), "Ada.html");
        assert_eq!(std::fs::read_to_string(artifact.path()).unwrap(), "<h1>Ada</h1>");
    }

    #[tokio::test]
    async fn docx_template_keeps_its_format() {
        use std::io::{Read, Write};

        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("student.docx");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&template).unwrap());
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<w:document><w:t>{{ Name }} / {{ course }}</w:t></w:document>")
            .unwrap();
        zip.finish().unwrap();

        let slot = ArtifactSlot {
            record_id: "Ada",
            dir: dir.path(),
            stem: "Ada",
        };
        let artifact = TemplateRenderer::new().render(&ada(), &template, &slot).await.unwrap();
        assert_eq!(artifact.name(), "Ada.docx");

        let mut archive = zip::ZipArchive::new(std::fs::File::open(artifact.path()).unwrap()).unwrap();
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .unwrap()
            .read_to_string(&mut xml)
            .unwrap();
        assert_eq!(xml, "<w:document><w:t>Ada / Maths &amp; &lt;Logic&gt;</w:t></w:document>");
    }

    #[tokio::test]
    async fn missing_template_is_a_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let slot = ArtifactSlot {
            record_id: "Ada",
            dir: dir.path(),
            stem: "Ada",
        };
        let err = TemplateRenderer::new()
            .render(&ada(), Path::new("/definitely/not/template.html"), &slot)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::TemplateUnavailable { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
