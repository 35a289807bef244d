//! Catalog store: items keyed by SKU
//!
//! Rows are written only by the reconciliation engine. Everything here is a
//! read path except [`purge_item`], the explicit hard delete that cascades to
//! list lines and attachments.

use crate::users::User;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// Unit of measure used when the snapshot does not carry one
pub const DEFAULT_UNIT: &str = "pcs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub sku: String,
    pub dept_code: String,
    pub dept_name: Option<String>,
    pub group_name: Option<String>,
    pub name: String,
    pub unit: String,
    /// Months without stock movement
    pub mt_months: f64,
    pub base_qty: f64,
    pub base_sum: f64,
    pub price: Option<f64>,
    pub base_reserve: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Item {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            sku: row.try_get("sku")?,
            dept_code: row.try_get("dept_code")?,
            dept_name: row.try_get("dept_name")?,
            group_name: row.try_get("group_name")?,
            name: row.try_get("name")?,
            unit: row.try_get("unit")?,
            mt_months: row.try_get("mt_months")?,
            base_qty: row.try_get("base_qty")?,
            base_sum: row.try_get("base_sum")?,
            price: row.try_get("price")?,
            base_reserve: row.try_get("base_reserve")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A department as shown in the department picker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub code: String,
    pub name: String,
    pub items_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total: i64,
    pub active: i64,
    pub departments: i64,
}

pub async fn get_item(pool: &SqlitePool, item_id: i64) -> Result<Item> {
    sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("item {}", item_id)))
}

/// Look up an item by exact SKU, active or not
pub async fn get_by_sku(pool: &SqlitePool, sku: &str) -> Result<Option<Item>> {
    let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE sku = ?")
        .bind(sku.trim())
        .fetch_optional(pool)
        .await?;
    Ok(item)
}

/// Active items of one department, sorted by name
pub async fn items_by_department(pool: &SqlitePool, dept_code: &str) -> Result<Vec<Item>> {
    let items = sqlx::query_as::<_, Item>(
        "SELECT * FROM items WHERE dept_code = ? AND is_active = 1 ORDER BY name, sku",
    )
    .bind(dept_code)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

/// Case-insensitive substring search over name and SKU among active items
pub async fn search(
    pool: &SqlitePool,
    dept_code: Option<&str>,
    needle: &str,
    limit: i64,
) -> Result<Vec<Item>> {
    let pattern = format!("%{}%", needle.trim().to_lowercase());
    let items = sqlx::query_as::<_, Item>(
        r#"
        SELECT * FROM items
        WHERE is_active = 1
          AND (?1 IS NULL OR dept_code = ?1)
          AND (lower(name) LIKE ?2 OR sku LIKE ?2)
        ORDER BY name, sku
        LIMIT ?3
        "#,
    )
    .bind(dept_code)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

/// Load the whole catalog keyed by SKU, inactive items included
pub async fn load_all(conn: &mut SqliteConnection) -> Result<HashMap<String, Item>> {
    let items = sqlx::query_as::<_, Item>("SELECT * FROM items")
        .fetch_all(&mut *conn)
        .await?;
    Ok(items.into_iter().map(|item| (item.sku.clone(), item)).collect())
}

/// Departments that have active items.
///
/// The display name comes from the catalog when an import supplied one, else
/// from the configured fallback map, else stays empty.
pub async fn departments(
    pool: &SqlitePool,
    fallback_names: &BTreeMap<String, String>,
) -> Result<Vec<Department>> {
    let rows = sqlx::query(
        r#"
        SELECT dept_code,
               MAX(COALESCE(dept_name, '')) AS dept_name,
               COUNT(*) AS items_count
        FROM items
        WHERE is_active = 1 AND TRIM(dept_code) <> ''
        GROUP BY dept_code
        ORDER BY dept_code
        "#,
    )
    .fetch_all(pool)
    .await?;

    let departments = rows
        .into_iter()
        .map(|row| {
            let code: String = row.get("dept_code");
            let db_name: String = row.get("dept_name");
            let name = if db_name.trim().is_empty() {
                fallback_names.get(&code).cloned().unwrap_or_default()
            } else {
                db_name.trim().to_string()
            };
            Department {
                code,
                name,
                items_count: row.get("items_count"),
            }
        })
        .collect();

    Ok(departments)
}

pub async fn stats(pool: &SqlitePool) -> Result<CatalogStats> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total,
               COALESCE(SUM(is_active), 0) AS active,
               COUNT(DISTINCT CASE WHEN is_active = 1 THEN dept_code END) AS departments
        FROM items
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(CatalogStats {
        total: row.get("total"),
        active: row.get("active"),
        departments: row.get("departments"),
    })
}

/// Hard-delete an item. List lines and attachments referencing it cascade away.
pub async fn purge_item(pool: &SqlitePool, actor: &User, sku: &str) -> Result<()> {
    actor.require_admin("purging catalog items")?;

    let affected = sqlx::query("DELETE FROM items WHERE sku = ?")
        .bind(sku)
        .execute(pool)
        .await?
        .rows_affected();

    if affected == 0 {
        return Err(Error::NotFound(format!("item {}", sku)));
    }

    info!(sku, actor = actor.id, "Catalog item purged");
    Ok(())
}
