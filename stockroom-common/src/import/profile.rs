//! Import profiles: named header-to-field mappings
//!
//! A profile binds raw header strings to logical fields. It is resolved once
//! per run into a [`ColumnMap`] (logical field -> column position) and the
//! normalizer only ever consults that map.
//!
//! Profiles may carry a file mask (`*`, `?` wildcards, case-insensitive). When
//! a run does not name a profile, the mask that matches the file name with the
//! most literal characters wins; equal scores fall back to the most recently
//! updated profile, and a tie there is ambiguous.

use crate::users::User;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Name of the profile seeded at database initialisation
pub const BUILTIN_PROFILE: &str = "standard";

/// Logical fields of the canonical item record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    Sku,
    /// Combined "SKU - name" cell
    SkuName,
    DeptCode,
    DeptName,
    GroupName,
    Name,
    Unit,
    MtMonths,
    Qty,
    Sum,
    Reserve,
    Price,
}

impl LogicalField {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalField::Sku => "sku",
            LogicalField::SkuName => "sku_name",
            LogicalField::DeptCode => "dept_code",
            LogicalField::DeptName => "dept_name",
            LogicalField::GroupName => "group_name",
            LogicalField::Name => "name",
            LogicalField::Unit => "unit",
            LogicalField::MtMonths => "mt_months",
            LogicalField::Qty => "qty",
            LogicalField::Sum => "sum",
            LogicalField::Reserve => "reserve",
            LogicalField::Price => "price",
        }
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "sku" => LogicalField::Sku,
            "sku_name" => LogicalField::SkuName,
            "dept_code" => LogicalField::DeptCode,
            "dept_name" => LogicalField::DeptName,
            "group_name" => LogicalField::GroupName,
            "name" => LogicalField::Name,
            "unit" => LogicalField::Unit,
            "mt_months" => LogicalField::MtMonths,
            "qty" => LogicalField::Qty,
            "sum" => LogicalField::Sum,
            "reserve" => LogicalField::Reserve,
            "price" => LogicalField::Price,
            other => return Err(Error::InvalidInput(format!("Unknown logical field '{}'", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportColumn {
    pub header: String,
    pub field: LogicalField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProfile {
    pub id: i64,
    pub name: String,
    pub file_mask: Option<String>,
    pub columns: Vec<ImportColumn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column positions resolved for one file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMap {
    pub profile_id: i64,
    pub profile_name: String,
    pub positions: BTreeMap<LogicalField, usize>,
}

impl ColumnMap {
    /// Resolve a profile against the file's header row.
    ///
    /// Headers compare case-insensitively with whitespace collapsed. When two
    /// headers bind the same field the leftmost one is used.
    pub fn from_profile(profile: &ImportProfile, headers: &[String]) -> Result<Self> {
        let bindings: BTreeMap<String, LogicalField> = profile
            .columns
            .iter()
            .map(|c| (normalize_header(&c.header), c.field))
            .collect();

        let mut positions = BTreeMap::new();
        for (index, header) in headers.iter().enumerate() {
            if let Some(field) = bindings.get(&normalize_header(header)) {
                positions.entry(*field).or_insert(index);
            }
        }

        if !positions.contains_key(&LogicalField::Sku) && !positions.contains_key(&LogicalField::SkuName) {
            return Err(Error::MissingColumn(LogicalField::Sku.to_string()));
        }

        debug!(profile = %profile.name, ?positions, "Resolved column map");

        Ok(Self {
            profile_id: profile.id,
            profile_name: profile.name.clone(),
            positions,
        })
    }

    pub fn position(&self, field: LogicalField) -> Option<usize> {
        self.positions.get(&field).copied()
    }
}

fn normalize_header(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case-insensitive wildcard match of a file mask against a file name
pub fn mask_matches(mask: &str, file_name: &str) -> bool {
    let mut pattern = String::from("(?i)^");
    for c in mask.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern)
        .map(|re| re.is_match(file_name))
        .unwrap_or(false)
}

/// Literal (non-wildcard) characters in a mask; higher means more specific
fn mask_specificity(mask: &str) -> usize {
    mask.chars().filter(|c| *c != '*' && *c != '?').count()
}

/// Pick the profile whose file mask best matches `file_name`
pub fn select_profile<'p>(profiles: &'p [ImportProfile], file_name: &str) -> Result<&'p ImportProfile> {
    let matching: Vec<(&ImportProfile, usize)> = profiles
        .iter()
        .filter_map(|p| {
            let mask = p.file_mask.as_deref()?;
            mask_matches(mask, file_name).then(|| (p, mask_specificity(mask)))
        })
        .collect();

    let best_score = matching
        .iter()
        .map(|(_, score)| *score)
        .max()
        .ok_or_else(|| Error::ProfileNotFound(file_name.to_string()))?;

    let mut best: Vec<&ImportProfile> = matching
        .into_iter()
        .filter(|(_, score)| *score == best_score)
        .map(|(p, _)| p)
        .collect();

    if best.len() == 1 {
        return Ok(best[0]);
    }

    best.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    let newest = best[0].updated_at;
    let tied: Vec<String> = best
        .iter()
        .filter(|p| p.updated_at == newest)
        .map(|p| p.name.clone())
        .collect();

    if tied.len() == 1 {
        Ok(best[0])
    } else {
        Err(Error::AmbiguousProfile {
            file_name: file_name.to_string(),
            candidates: tied,
        })
    }
}

/// Resolve the column map for one run.
///
/// An explicit profile id wins; otherwise the file name selects the profile.
pub async fn resolve(
    pool: &SqlitePool,
    headers: &[String],
    profile_id: Option<i64>,
    file_name: &str,
) -> Result<ColumnMap> {
    let profile = match profile_id {
        Some(id) => match get_profile(pool, id).await {
            Ok(profile) => profile,
            Err(Error::NotFound(_)) => return Err(Error::ProfileNotFound(format!("profile id {}", id))),
            Err(e) => return Err(e),
        },
        None => {
            let profiles = list_profiles(pool).await?;
            select_profile(&profiles, file_name)?.clone()
        }
    };

    ColumnMap::from_profile(&profile, headers)
}

struct ProfileRow {
    id: i64,
    name: String,
    file_mask: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for ProfileRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            file_mask: row.try_get("file_mask")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

async fn load_columns(pool: &SqlitePool, profile_id: i64) -> Result<Vec<ImportColumn>> {
    let rows = sqlx::query("SELECT header, field FROM import_columns WHERE profile_id = ? ORDER BY id")
        .bind(profile_id)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            let field: String = row.get("field");
            Ok(ImportColumn {
                header: row.get("header"),
                field: field.parse()?,
            })
        })
        .collect()
}

async fn with_columns(pool: &SqlitePool, row: ProfileRow) -> Result<ImportProfile> {
    let columns = load_columns(pool, row.id).await?;
    Ok(ImportProfile {
        id: row.id,
        name: row.name,
        file_mask: row.file_mask,
        columns,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

pub async fn get_profile(pool: &SqlitePool, profile_id: i64) -> Result<ImportProfile> {
    let row = sqlx::query_as::<_, ProfileRow>("SELECT * FROM import_profiles WHERE id = ?")
        .bind(profile_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("import profile {}", profile_id)))?;
    with_columns(pool, row).await
}

pub async fn list_profiles(pool: &SqlitePool) -> Result<Vec<ImportProfile>> {
    let rows = sqlx::query_as::<_, ProfileRow>("SELECT * FROM import_profiles ORDER BY name")
        .fetch_all(pool)
        .await?;

    let mut profiles = Vec::with_capacity(rows.len());
    for row in rows {
        profiles.push(with_columns(pool, row).await?);
    }
    Ok(profiles)
}

/// Create a named profile with its column bindings
pub async fn create_profile(
    pool: &SqlitePool,
    actor: &User,
    name: &str,
    file_mask: Option<&str>,
    columns: &[ImportColumn],
) -> Result<ImportProfile> {
    actor.require_admin("creating import profiles")?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("profile name is empty".to_string()));
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let profile_id: i64 = sqlx::query_scalar(
        "INSERT INTO import_profiles (name, file_mask, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(file_mask)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    insert_columns(&mut tx, profile_id, columns).await?;
    tx.commit().await?;

    info!(profile_id, name, "Import profile created");
    get_profile(pool, profile_id).await
}

/// Replace every column binding of a profile and stamp `updated_at`
pub async fn replace_columns(
    pool: &SqlitePool,
    actor: &User,
    profile_id: i64,
    columns: &[ImportColumn],
) -> Result<ImportProfile> {
    actor.require_admin("editing import profiles")?;

    let mut tx = pool.begin().await?;
    let affected = sqlx::query("UPDATE import_profiles SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(profile_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(Error::NotFound(format!("import profile {}", profile_id)));
    }

    sqlx::query("DELETE FROM import_columns WHERE profile_id = ?")
        .bind(profile_id)
        .execute(&mut *tx)
        .await?;
    insert_columns(&mut tx, profile_id, columns).await?;
    tx.commit().await?;

    info!(profile_id, columns = columns.len(), "Import profile columns replaced");
    get_profile(pool, profile_id).await
}

async fn insert_columns(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    profile_id: i64,
    columns: &[ImportColumn],
) -> Result<()> {
    for column in columns {
        sqlx::query("INSERT INTO import_columns (profile_id, header, field) VALUES (?, ?, ?)")
            .bind(profile_id)
            .bind(column.header.trim())
            .bind(column.field.as_str())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Header spellings understood by the built-in profile
fn builtin_columns() -> Vec<ImportColumn> {
    use LogicalField::*;

    let bindings: &[(LogicalField, &[&str])] = &[
        (Sku, &["sku", "артикул", "код товара", "item code", "а"]),
        (SkuName, &["articul_name", "articul name"]),
        (DeptCode, &["dept", "dept_code", "відділ", "отдел", "в"]),
        (DeptName, &["dept_name", "department"]),
        (GroupName, &["group", "fg1_name", "група", "группа", "category", "г"]),
        (Name, &["name", "назва", "наименование", "товар", "н"]),
        (Unit, &["unit", "од.", "ед."]),
        (Qty, &["qty", "quantity", "залишок, к-ть", "остаток, к-во", "кол-во", "к"]),
        (Sum, &["sum", "amount", "залишок, сума", "сумма", "с"]),
        (MtMonths, &["mt_months", "months_no_sale", "міс", "месяц", "м"]),
        (Reserve, &["reserve", "резерв", "в резерві", "в резерве"]),
        (Price, &["price", "unit price", "ціна", "цена"]),
    ];

    bindings
        .iter()
        .flat_map(|(field, headers)| {
            headers.iter().map(move |header| ImportColumn {
                header: header.to_string(),
                field: *field,
            })
        })
        .collect()
}

/// Seed the built-in profile on first start. It has no file mask, so it is
/// only used when a run names it explicitly.
pub async fn ensure_builtin_profile(pool: &SqlitePool) -> Result<()> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM import_profiles WHERE name = ?)")
            .bind(BUILTIN_PROFILE)
            .fetch_one(pool)
            .await?;
    if exists {
        return Ok(());
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let profile_id: i64 = sqlx::query_scalar(
        "INSERT INTO import_profiles (name, file_mask, created_at, updated_at) VALUES (?, NULL, ?, ?) RETURNING id",
    )
    .bind(BUILTIN_PROFILE)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    insert_columns(&mut tx, profile_id, &builtin_columns()).await?;
    tx.commit().await?;

    info!(profile_id, "Seeded built-in import profile");
    Ok(())
}
