//! Procurement lists
//!
//! A list belongs to one user and one department. It moves through
//!
//! ```text
//! active ──save──> saved ──archive──> archived
//!   │                │
//!   └──cancel──> cancelled ──archive──> archived
//!
//! saved ──reopen──> active
//! ```
//!
//! Each line carries a value snapshot of the catalog item taken when it was
//! added, its own status automaton, and cached attachment flags.

pub mod carousel;
pub mod items;
pub mod manager;

pub use carousel::CarouselSelector;
pub use items::{add_item, get_line, list_lines, set_qty, set_status, set_surplus};
pub use manager::{
    active_lists, archive_list, cancel_list, create_list, delete_list, get_list, recent_lists, reopen_list,
    save_list,
};

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    Manual,
    /// Populated from the stagnation carousel
    CarouselMt,
}

impl ListMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListMode::Manual => "manual",
            ListMode::CarouselMt => "carousel_mt",
        }
    }
}

impl FromStr for ListMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(ListMode::Manual),
            "carousel_mt" => Ok(ListMode::CarouselMt),
            other => Err(Error::InvalidInput(format!("Unknown list mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStatus {
    Active,
    Saved,
    Cancelled,
    Archived,
}

impl ListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListStatus::Active => "active",
            ListStatus::Saved => "saved",
            ListStatus::Cancelled => "cancelled",
            ListStatus::Archived => "archived",
        }
    }

    /// Whether the list automaton allows `self -> next`
    pub fn can_transition(&self, next: ListStatus) -> bool {
        use ListStatus::*;
        matches!(
            (*self, next),
            (Active, Saved) | (Active, Cancelled) | (Saved, Archived) | (Cancelled, Archived) | (Saved, Active)
        )
    }

    pub fn check_transition(&self, next: ListStatus) -> Result<()> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ListStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ListStatus::Active),
            "saved" => Ok(ListStatus::Saved),
            "cancelled" => Ok(ListStatus::Cancelled),
            "archived" => Ok(ListStatus::Archived),
            other => Err(Error::InvalidInput(format!("Unknown list status '{}'", other))),
        }
    }
}

/// Stagnation threshold for carousel selection.
///
/// `2`, `3` and `5` select whole-month buckets (`n <= mt_months < n + 1`);
/// `6+` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagnationFilter {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6+")]
    SixPlus,
}

impl StagnationFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagnationFilter::Two => "2",
            StagnationFilter::Three => "3",
            StagnationFilter::Five => "5",
            StagnationFilter::SixPlus => "6+",
        }
    }

    /// Inclusive lower and exclusive upper bound on `mt_months`
    pub fn bounds(&self) -> (f64, Option<f64>) {
        match self {
            StagnationFilter::Two => (2.0, Some(3.0)),
            StagnationFilter::Three => (3.0, Some(4.0)),
            StagnationFilter::Five => (5.0, Some(6.0)),
            StagnationFilter::SixPlus => (6.0, None),
        }
    }

    pub fn matches(&self, mt_months: f64) -> bool {
        let (low, high) = self.bounds();
        mt_months >= low && high.map_or(true, |h| mt_months < h)
    }
}

impl fmt::Display for StagnationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StagnationFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "2" => Ok(StagnationFilter::Two),
            "3" => Ok(StagnationFilter::Three),
            "5" => Ok(StagnationFilter::Five),
            "6+" => Ok(StagnationFilter::SixPlus),
            other => Err(Error::InvalidInput(format!(
                "Unknown stagnation filter '{}' (expected 2, 3, 5 or 6+)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserList {
    pub id: i64,
    pub user_id: i64,
    pub dept_code: String,
    pub mode: ListMode,
    pub mt_filter: Option<StagnationFilter>,
    pub status: ListStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub saved_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl UserList {
    /// Fails with `ListNotEditable` unless the list is active
    pub fn ensure_editable(&self) -> Result<()> {
        if self.status == ListStatus::Active {
            Ok(())
        } else {
            Err(Error::ListNotEditable(self.id))
        }
    }
}

fn decode<T: FromStr<Err = Error>>(raw: &str) -> sqlx::Result<T> {
    raw.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

impl FromRow<'_, SqliteRow> for UserList {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let mode: String = row.try_get("mode")?;
        let status: String = row.try_get("status")?;
        let mt_filter: Option<String> = row.try_get("mt_filter")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            dept_code: row.try_get("dept_code")?,
            mode: decode(&mode)?,
            mt_filter: mt_filter.as_deref().map(decode::<StagnationFilter>).transpose()?,
            status: decode(&status)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            saved_at: row.try_get("saved_at")?,
            archived_at: row.try_get("archived_at")?,
        })
    }
}

/// Per-line status automaton
///
/// ```text
/// new ──> done
///  └───> skipped ──> skipped_final
///           └──────> done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    New,
    Done,
    Skipped,
    SkippedFinal,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::New => "new",
            LineStatus::Done => "done",
            LineStatus::Skipped => "skipped",
            LineStatus::SkippedFinal => "skipped_final",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LineStatus::Done | LineStatus::SkippedFinal)
    }

    pub fn can_transition(&self, next: LineStatus) -> bool {
        use LineStatus::*;
        matches!(
            (*self, next),
            (New, Done) | (New, Skipped) | (Skipped, SkippedFinal) | (Skipped, Done)
        )
    }

    pub fn check_transition(&self, next: LineStatus) -> Result<()> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(LineStatus::New),
            "done" => Ok(LineStatus::Done),
            "skipped" => Ok(LineStatus::Skipped),
            "skipped_final" => Ok(LineStatus::SkippedFinal),
            other => Err(Error::InvalidInput(format!("Unknown line status '{}'", other))),
        }
    }
}

/// One line of a list. The `*_snapshot` fields are copied from the catalog
/// when the line is added and never change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListItem {
    pub id: i64,
    pub list_id: i64,
    pub item_id: i64,
    pub sku_snapshot: String,
    pub name_snapshot: String,
    pub dept_snapshot: Option<String>,
    pub price_snapshot: Option<f64>,
    pub mt_months_snapshot: Option<f64>,
    pub qty: f64,
    pub surplus_qty: f64,
    pub status: LineStatus,
    pub has_photo: bool,
    pub has_comment: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for ListItem {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            list_id: row.try_get("list_id")?,
            item_id: row.try_get("item_id")?,
            sku_snapshot: row.try_get("sku_snapshot")?,
            name_snapshot: row.try_get("name_snapshot")?,
            dept_snapshot: row.try_get("dept_snapshot")?,
            price_snapshot: row.try_get("price_snapshot")?,
            mt_months_snapshot: row.try_get("mt_months_snapshot")?,
            qty: row.try_get("qty")?,
            surplus_qty: row.try_get("surplus_qty")?,
            status: decode(&status)?,
            has_photo: row.try_get("has_photo")?,
            has_comment: row.try_get("has_comment")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
