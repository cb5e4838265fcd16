//! Tabular input for bulk imports: CSV, XLSX and XLS.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to read spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("file has no header row")]
    Empty,
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// One data row, keyed by lower-cased header.
#[derive(Debug, Clone)]
pub struct Record {
    /// Position in the file counting the header as 1.
    pub line: usize,
    values: HashMap<String, String>,
}

impl Record {
    pub fn get(&self, column: &str) -> &str {
        self.values.get(column).map(|s| s.trim()).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn from_rows(mut rows: Vec<Vec<String>>) -> Result<Self, ImportError> {
        rows.retain(|r| r.iter().any(|c| !c.trim().is_empty()));
        if rows.is_empty() {
            return Err(ImportError::Empty);
        }
        let headers = rows
            .remove(0)
            .into_iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_lowercase())
            .collect();
        Ok(Self { headers, rows })
    }

    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.headers.iter().any(|h| h == *c))
            .map(|c| c.to_string())
            .collect()
    }

    pub fn require(&self, required: &[&str]) -> Result<(), ImportError> {
        let missing = self.missing_columns(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ImportError::MissingColumns(missing))
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| Record {
                line: idx + 2,
                values: self
                    .headers
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned().chain(std::iter::repeat(String::new())))
                    .collect(),
            })
            .collect()
    }
}

pub fn read_table(path: &Path) -> Result<Table, ImportError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => {
            let bytes = std::fs::read(path)?;
            Table::from_rows(parse_csv(&decode_text(&bytes)))
        }
        "xlsx" | "xls" => Table::from_rows(read_spreadsheet(path)?),
        _ => Err(ImportError::UnsupportedFormat(if ext.is_empty() {
            "(none)".to_string()
        } else {
            ext
        })),
    }
}

/// UTF-8 when valid, otherwise Latin-1 (every byte maps to one char).
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// RFC 4180-ish: quoted fields may hold commas, newlines and `""`.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if !in_quotes && ch == ',' {
            row.push(std::mem::take(&mut buf));
            i += 1;
            continue;
        }
        if !in_quotes && (ch == '\n' || ch == '\r') {
            if ch == '\r' && i + 1 < chars.len() && chars[i + 1] == '\n' {
                i += 1;
            }
            row.push(std::mem::take(&mut buf));
            rows.push(std::mem::take(&mut row));
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    if !buf.is_empty() || !row.is_empty() {
        row.push(buf);
        rows.push(row);
    }
    rows
}

fn read_spreadsheet(path: &Path) -> Result<Vec<Vec<String>>, ImportError> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook =
        open_workbook_auto(path).map_err(|e| ImportError::Spreadsheet(e.to_string()))?;
    let Some(first) = workbook.sheet_names().first().cloned() else {
        return Err(ImportError::Empty);
    };
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| ImportError::Spreadsheet(e.to_string()))?;
    // Float cells display without a trailing ".0", so 2024 stays "2024".
    Ok(range
        .rows()
        .map(|row| row.iter().map(|c| c.to_string().trim().to_string()).collect())
        .collect())
}
