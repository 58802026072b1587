//! Word (`.docx`) templates.
//!
//! A `.docx` file is a ZIP archive of XML parts. Placeholders are filled in
//! the main document body, headers and footers; every other entry is copied
//! through untouched so the converter sees the original styles, fonts and
//! images.
//!
//! Word often splits typed text into several runs, so `{{ Name }}` can be
//! stored as `{{</w:t></w:r><w:r><w:t>Name }}`. Markup inside a placeholder
//! is dropped before filling, which joins the pieces back into one run.

use crate::error::RenderError;
use crate::pipeline::render::{fill_collecting, missing_fields};
use crate::record::Record;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

static RE_SPLIT_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(?:[^{}<]|<[^>]*>)*?\}\}").unwrap());

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Whether an archive entry holds fillable document text.
fn is_text_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

/// Join placeholders that Word split across runs.
pub fn merge_split_placeholders(xml: &str) -> String {
    RE_SPLIT_PLACEHOLDER
        .replace_all(xml, |caps: &Captures<'_>| RE_TAG.replace_all(&caps[0], "").into_owned())
        .into_owned()
}

/// Fill the `.docx` template read from `path` for one record, returning the
/// new archive.
///
/// Blocking; run it on the blocking pool.
pub fn fill_docx(path: &Path, template: &[u8], record: &Record) -> Result<Vec<u8>, RenderError> {
    let invalid = |e: &dyn std::fmt::Display| RenderError::TemplateUnavailable {
        path: path.to_path_buf(),
        reason: format!("not a readable .docx archive: {e}"),
    };

    let mut archive = ZipArchive::new(Cursor::new(template)).map_err(|e| invalid(&e))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(template.len())));
    let mut missing = BTreeSet::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| invalid(&e))?;
        let name = entry.name().to_string();

        if !is_text_part(&name) {
            writer.raw_copy_file(entry).map_err(|e| invalid(&e))?;
            continue;
        }

        let mut xml = String::new();
        entry.read_to_string(&mut xml).map_err(|e| invalid(&e))?;
        let options = SimpleFileOptions::default().compression_method(entry.compression());
        let filled = fill_collecting(&merge_split_placeholders(&xml), record, true, &mut missing);

        writer.start_file(name, options).map_err(|e| invalid(&e))?;
        writer.write_all(filled.as_bytes()).map_err(|e| invalid(&e))?;
    }

    missing_fields(missing)?;

    let out = writer.finish().map_err(|e| invalid(&e))?;
    Ok(out.into_inner())
}
