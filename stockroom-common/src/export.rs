//! Export of finalized lists
//!
//! A saved list produces two row sets: main lines (status `done`, `qty > 0`)
//! and surplus lines (`surplus_qty > 0`). Rows come from the line snapshots,
//! so an export always shows what the user saw when picking.

use crate::lists::{manager::get_list, LineStatus, ListItem, ListStatus};
use crate::users::get_user;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

/// Prefix of the surplus file stem
pub const SURPLUS_PREFIX: &str = "surplus";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub sku: String,
    pub name: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub sum: Option<f64>,
}

impl ExportRow {
    fn from_line(line: &ListItem, qty: f64) -> Self {
        Self {
            sku: line.sku_snapshot.clone(),
            name: line.name_snapshot.clone(),
            qty,
            price: line.price_snapshot,
            sum: line.price_snapshot.map(|p| (p * qty * 100.0).round() / 100.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListExport {
    pub list_id: i64,
    pub file_stem: String,
    pub main: Vec<ExportRow>,
    pub surplus: Vec<ExportRow>,
}

impl ListExport {
    pub fn surplus_stem(&self) -> String {
        format!("{}_{}", SURPLUS_PREFIX, self.file_stem)
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.surplus.is_empty()
    }
}

/// Split lines into main and surplus rows
pub fn split_lines(lines: &[ListItem]) -> (Vec<ExportRow>, Vec<ExportRow>) {
    let main = lines
        .iter()
        .filter(|l| l.status == LineStatus::Done && l.qty > 0.0)
        .map(|l| ExportRow::from_line(l, l.qty))
        .collect();
    let surplus = lines
        .iter()
        .filter(|l| l.surplus_qty > 0.0)
        .map(|l| ExportRow::from_line(l, l.surplus_qty))
        .collect();
    (main, surplus)
}

/// `<dept>_<user>_<YYYYMMDD_HHMM>`, with the user label reduced to
/// alphanumerics, `-` and `_`
pub fn file_stem(dept_code: &str, user_label: &str, at: DateTime<Utc>) -> String {
    let user: String = user_label
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let dept = if dept_code.trim().is_empty() { "000" } else { dept_code.trim() };
    format!("{}_{}_{}", dept, user, at.format("%Y%m%d_%H%M"))
}

/// Build the export of a saved (or archived) list
pub async fn export_list(pool: &SqlitePool, list_id: i64) -> Result<ListExport> {
    let list = get_list(pool, list_id).await?;
    if !matches!(list.status, ListStatus::Saved | ListStatus::Archived) || list.saved_at.is_none() {
        return Err(Error::InvalidInput(format!(
            "list {} is {} and cannot be exported",
            list_id, list.status
        )));
    }

    let user = get_user(pool, list.user_id).await?;
    let label = user
        .display_name
        .clone()
        .or(user.username.clone())
        .unwrap_or_else(|| format!("user{}", user.id));

    let lines = crate::lists::list_lines(pool, list_id).await?;
    let (main, surplus) = split_lines(&lines);
    let at = list.saved_at.unwrap_or(list.updated_at);

    let export = ListExport {
        list_id,
        file_stem: file_stem(&list.dept_code, &label, at),
        main,
        surplus,
    };

    info!(
        list_id,
        main = export.main.len(),
        surplus = export.surplus.len(),
        stem = %export.file_stem,
        "List exported"
    );
    Ok(export)
}

/// Render rows as CSV with a header line
pub fn to_csv(rows: &[ExportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| Error::Internal(format!("Failed to write CSV row: {}", e)))?;
    }
    // A header line is still wanted for an empty set
    if rows.is_empty() {
        writer
            .write_record(["sku", "name", "qty", "price", "sum"])
            .map_err(|e| Error::Internal(format!("Failed to write CSV header: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to flush CSV: {}", e)))
}
