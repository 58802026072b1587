//! Records and batch jobs.
//!
//! A [`Record`] is one data row of the uploaded sheet: a read-only mapping
//! from column name to cell text. Empty cells are dropped at construction, so
//! "field absent" and "field blank" look the same to the render stage.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One row of the input batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    row: usize,
    fields: BTreeMap<String, String>,
}

impl Record {
    /// Build a record for 1-based data row `row`.
    ///
    /// Keys and values are trimmed; pairs with an empty key or value are
    /// skipped.
    pub fn new<K, V>(row: usize, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let fields = fields
            .into_iter()
            .filter_map(|(k, v)| {
                let k = k.as_ref().trim();
                let v = v.as_ref().trim();
                if k.is_empty() || v.is_empty() {
                    None
                } else {
                    Some((k.to_string(), v.to_string()))
                }
            })
            .collect();
        Self { row, fields }
    }

    /// 1-based data row number (the header is row 0).
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Identifier used in reports: the id field, or `row N` when absent.
    pub fn display_id(&self, id_field: &str) -> String {
        self.get(id_field)
            .map(str::to_string)
            .unwrap_or_else(|| format!("row {}", self.row))
    }
}

/// The unit of work for one upload: records plus the template they fill.
#[derive(Debug, Clone)]
pub struct BatchJob {
    records: Vec<Record>,
    template: PathBuf,
}

impl BatchJob {
    pub fn new(records: Vec<Record>, template: impl Into<PathBuf>) -> Self {
        Self {
            records,
            template: template.into(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn template(&self) -> &Path {
        &self.template
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
