//! Turns a delimited text export of the inventory spreadsheet into header and
//! row tokens for the reconciliation engine

use anyhow::{Context, Result};
use std::path::Path;
use stockroom_common::import::{hash_bytes, ImportSource};

/// Read and tokenize a snapshot file. The content hash covers the raw bytes.
pub fn read_source(path: &Path, delimiter: u8) -> Result<ImportSource> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    parse_source(&file_name, hash_bytes(&bytes), &bytes, delimiter)
}

pub fn parse_source(file_name: &str, content_hash: String, bytes: &[u8], delimiter: u8) -> Result<ImportSource> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read header row")?
        .iter()
        .enumerate()
        .map(|(i, h)| if i == 0 { h.trim_start_matches('\u{feff}') } else { h }.to_string())
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.context("Malformed CSV record")?;

        // The reader drops blank lines; pad them back so row numbers match the file
        if let Some(line) = record.position().map(|p| p.line() as usize) {
            while rows.len() + 2 < line {
                rows.push(Vec::new());
            }
        }

        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(ImportSource::new(file_name, content_hash, headers, rows))
}
