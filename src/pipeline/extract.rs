//! Record extraction: uploaded bytes → ordered `Vec<Record>`.
//!
//! Two formats are accepted. Bytes starting with the ZIP local-file magic
//! are read as an XLSX workbook via `calamine`; everything else is read as
//! UTF-8 CSV. In both cases the first row is the header and every later
//! non-blank row becomes one [`Record`]. Short rows leave their trailing
//! fields absent; cells past the last header are dropped.
//!
//! Extraction never inspects cell values: a row without the id or address
//! column is still a record, and fails later at the stage that needs it.

use crate::error::BatchError;
use crate::record::Record;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use std::collections::HashSet;
use std::io::Cursor;
use tracing::debug;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Options controlling how uploads are read.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Worksheet name for workbooks. Default: the first sheet.
    pub sheet: Option<String>,
}

/// Parse an uploaded batch into records, in row order.
pub fn extract(bytes: &[u8], options: &ExtractOptions) -> Result<Vec<Record>, BatchError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(malformed("input is empty"));
    }

    let records = if is_workbook(bytes) {
        extract_workbook(bytes, options.sheet.as_deref())?
    } else {
        extract_csv(bytes)?
    };

    debug!("Extracted {} records", records.len());
    Ok(records)
}

/// Check for the ZIP container used by XLSX files.
pub fn is_workbook(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[..4] == ZIP_MAGIC
}

fn extract_csv(bytes: &[u8]) -> Result<Vec<Record>, BatchError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(format!("unreadable header row: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| malformed(format!("unreadable CSV row: {e}")))?;
        rows.push(row.iter().map(str::to_string).collect::<Vec<_>>());
    }

    build_records(headers, rows)
}

fn extract_workbook(bytes: &[u8], sheet: Option<&str>) -> Result<Vec<Record>, BatchError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|e| malformed(format!("unreadable workbook: {e}")))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| malformed("workbook has no worksheets"))?,
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| malformed(format!("cannot read worksheet '{sheet_name}': {e}")))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .ok_or_else(|| malformed(format!("worksheet '{sheet_name}' has no header row")))?
        .iter()
        .map(cell_text)
        .collect();
    let body = rows.map(|r| r.iter().map(cell_text).collect()).collect();

    build_records(headers, body)
}

/// Render a worksheet cell the way a person reading the sheet would.
///
/// Whole-number floats drop their `.0` so an id typed as `42` stays `42`.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Pair each row with the header. Blank header cells drop their column;
/// fully blank rows are skipped; row numbers stay tied to the sheet.
fn build_records(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Vec<Record>, BatchError> {
    let headers: Vec<String> = headers.into_iter().map(|h| h.trim().to_string()).collect();
    if headers.iter().all(String::is_empty) {
        return Err(malformed("missing header row"));
    }

    let mut seen = HashSet::new();
    for h in headers.iter().filter(|h| !h.is_empty()) {
        if !seen.insert(h.as_str()) {
            return Err(malformed(format!("duplicate column '{h}' in header row")));
        }
    }

    let records = rows
        .into_iter()
        .enumerate()
        .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
        .map(|(i, cells)| Record::new(i + 1, headers.iter().zip(cells)))
        .collect();

    Ok(records)
}

fn malformed(detail: impl Into<String>) -> BatchError {
    BatchError::MalformedInput {
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ExtractOptions {
        ExtractOptions::default()
    }

    #[test]
    fn csv_rows_become_records_in_order() {
        let csv = b"Name,email,course\nAda,ada@example.com,Maths\nAlan,alan@example.com,Logic\n";
        let records = extract(csv, &opts()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Name"), Some("Ada"));
        assert_eq!(records[0].row(), 1);
        assert_eq!(records[1].get("course"), Some("Logic"));
        assert_eq!(records[1].row(), 2);
    }

    #[test]
    fn csv_values_are_not_validated() {
        let csv = b"Name,email\nAda,not-an-address\n,\nBob,\n";
        let records = extract(csv, &opts()).unwrap();
        // the blank row is skipped, Bob keeps his row number
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("email"), Some("not-an-address"));
        assert_eq!(records[1].get("email"), None);
        assert_eq!(records[1].row(), 3);
    }

    #[test]
    fn header_only_is_an_empty_batch() {
        let records = extract(b"Name,email\n", &opts()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn empty_input_is_malformed() {
        let err = extract(b"  \n", &opts()).unwrap_err();
        assert!(matches!(err, BatchError::MalformedInput { .. }));
    }

    #[test]
    fn blank_header_is_malformed() {
        let err = extract(b",,\nAda,ada@example.com,x\n", &opts()).unwrap_err();
        assert!(err.to_string().contains("header"), "got: {err}");
    }

    #[test]
    fn short_rows_keep_their_neighbours() {
        let csv = b"Name,email\nAda,ada@example.com\nBob\nCy,cy@example.com,extra\n";
        let records = extract(csv, &opts()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("email"), Some("ada@example.com"));
        assert_eq!(records[1].get("Name"), Some("Bob"));
        assert_eq!(records[1].get("email"), None);
        assert_eq!(records[2].get("email"), Some("cy@example.com"));
    }

    #[test]
    fn duplicate_columns_are_malformed() {
        let err = extract(b"Name,Name\nA,B\n", &opts()).unwrap_err();
        assert!(err.to_string().contains("duplicate column"), "got: {err}");
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let err = extract(b"Name,email\n\xff\xfe,x\n", &opts()).unwrap_err();
        assert!(matches!(err, BatchError::MalformedInput { .. }));
    }

    #[test]
    fn zip_magic_routes_to_workbook_reader() {
        assert!(is_workbook(b"PK\x03\x04rest"));
        assert!(!is_workbook(b"Name,email"));
        let err = extract(b"PK\x03\x04 not really a workbook", &opts()).unwrap_err();
        assert!(err.to_string().contains("workbook"), "got: {err}");
    }

    #[test]
    fn whole_floats_lose_their_fraction() {
        assert_eq!(cell_text(&Data::Float(42.0)), "42");
        assert_eq!(cell_text(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_text(&Data::String("x".into())), "x");
        assert_eq!(cell_text(&Data::Empty), "");
    }
}
