//! Row normalizer: one raw row + column map -> canonical item record
//!
//! Never fails for a single bad row. The caller receives either a record, a
//! structured [`RowIssue`] to log, or a blank-row marker.

use super::profile::{ColumnMap, LogicalField};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SKUs are exactly eight alphanumeric characters
static SKU_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z]{8}$").expect("SKU pattern compiles"));

/// Canonical record for one snapshot row.
///
/// `None` in an optional field means the file did not carry a value, and the
/// catalog keeps whatever it already has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    /// Spreadsheet row number (header row is 1)
    pub row_number: usize,
    pub sku: String,
    pub dept_code: String,
    pub dept_name: Option<String>,
    pub group_name: Option<String>,
    pub name: String,
    pub unit: Option<String>,
    pub mt_months: f64,
    pub qty: f64,
    pub sum: f64,
    pub reserve: f64,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidSku,
    MalformedCell,
    DuplicateSku,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::InvalidSku => "invalid_sku",
            IssueKind::MalformedCell => "malformed_cell",
            IssueKind::DuplicateSku => "duplicate_sku",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-level anomaly. Logged against the run; never aborts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowIssue {
    pub row_number: usize,
    pub raw_sku: Option<String>,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(NormalizedRow),
    Issue(RowIssue),
    /// Every cell empty; skipped without a log entry
    Blank,
}

/// Normalize one data row.
///
/// `row_number` is the spreadsheet row the cells came from.
pub fn normalize_row(map: &ColumnMap, row_number: usize, cells: &[String]) -> RowOutcome {
    if cells.iter().all(|c| c.trim().is_empty()) {
        return RowOutcome::Blank;
    }

    let cell = |field: LogicalField| -> Option<&str> {
        map.position(field)
            .and_then(|i| cells.get(i))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    };

    let (split_sku, split_name) = cell(LogicalField::SkuName)
        .map(split_sku_name)
        .unwrap_or((None, None));

    let raw_sku = cell(LogicalField::Sku).map(str::to_string).or(split_sku);
    let issue = |kind: IssueKind, message: String| {
        RowOutcome::Issue(RowIssue {
            row_number,
            raw_sku: raw_sku.clone(),
            kind,
            message,
        })
    };

    let sku = match raw_sku.as_deref().map(clean_sku) {
        Some(sku) if SKU_PATTERN.is_match(&sku) => sku,
        Some(sku) => return issue(IssueKind::InvalidSku, format!("SKU '{}' is not 8 alphanumeric characters", sku)),
        None => return issue(IssueKind::InvalidSku, "SKU cell is empty".to_string()),
    };

    let name = match cell(LogicalField::Name).map(str::to_string).or(split_name) {
        Some(name) => name,
        None => return issue(IssueKind::MalformedCell, "name cell is empty".to_string()),
    };

    let mut numbers = [0.0_f64; 4];
    let numeric_fields = [
        LogicalField::MtMonths,
        LogicalField::Qty,
        LogicalField::Sum,
        LogicalField::Reserve,
    ];
    for (slot, field) in numbers.iter_mut().zip(numeric_fields) {
        if let Some(raw) = cell(field) {
            match parse_number(raw) {
                Some(value) => *slot = value,
                None => {
                    return issue(
                        IssueKind::MalformedCell,
                        format!("{} value '{}' is not a number", field, raw),
                    )
                }
            }
        }
    }
    let [mt_months, qty, sum, reserve] = numbers;

    let price = match cell(LogicalField::Price) {
        Some(raw) => match parse_number(raw) {
            Some(value) => Some(value),
            None => return issue(IssueKind::MalformedCell, format!("price value '{}' is not a number", raw)),
        },
        None if qty > 0.0 && cell(LogicalField::Sum).is_some() => Some(sum / qty),
        None => None,
    };

    RowOutcome::Record(NormalizedRow {
        row_number,
        sku,
        dept_code: cell(LogicalField::DeptCode).map(clean_code).unwrap_or_default(),
        dept_name: cell(LogicalField::DeptName).map(str::to_string),
        group_name: cell(LogicalField::GroupName).map(str::to_string),
        name,
        unit: cell(LogicalField::Unit).map(str::to_string),
        mt_months,
        qty,
        sum,
        reserve,
        price,
    })
}

/// Parse a number written with either decimal separator.
///
/// Spaces (including non-breaking ones used as thousands separators) are
/// dropped; a lone comma is read as the decimal point. When both `,` and `.`
/// appear, the last one is the decimal point and the other groups thousands.
pub fn parse_number(raw: &str) -> Option<f64> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .collect();
    if compact.is_empty() {
        return None;
    }

    let normalized = match (compact.rfind(','), compact.rfind('.')) {
        // "1.234,56"
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        // "1,234.56"
        (Some(_), Some(_)) => compact.replace(',', ""),
        _ => compact.replace(',', "."),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Strip the float suffix spreadsheets add to numeric SKU cells ("12345678.0")
pub fn clean_sku(raw: &str) -> String {
    clean_code(raw)
}

fn clean_code(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_suffix(".0") {
        Some(head) if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) => head.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Split a combined "70239082 - Milk 2.5%" cell into SKU and name.
///
/// Only splits when the leading token is eight characters long.
pub fn split_sku_name(raw: &str) -> (Option<String>, Option<String>) {
    let Some((left, right)) = raw.split_once('-') else {
        return (None, None);
    };

    let sku = match left.split_whitespace().next() {
        Some(token) if token.chars().count() == 8 => token.to_string(),
        _ => return (None, None),
    };

    let name = right.trim();
    (Some(sku), (!name.is_empty()).then(|| name.to_string()))
}
