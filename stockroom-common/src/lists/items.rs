//! List lines: snapshot-on-add, quantities, status automaton
//!
//! Every mutation requires the containing list to be active and stamps the
//! line's `updated_at`; concurrent edits of one line are last-write-wins.
//! Attachment flags are never written here except when the line is created.

use super::manager::fetch_list;
use super::{LineStatus, ListItem};
use crate::catalog;
use crate::{Error, Result};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

fn check_quantity(field: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::InvalidInput(format!("{} must be a finite number", field)));
    }
    if value < 0.0 {
        return Err(Error::NegativeQuantity { field, value });
    }
    Ok(())
}

async fn fetch_line(conn: &mut SqliteConnection, line_id: i64) -> Result<ListItem> {
    sqlx::query_as::<_, ListItem>("SELECT * FROM list_items WHERE id = ?")
        .bind(line_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("list line {}", line_id)))
}

/// Add a catalog item to an active list, copying its current fields.
///
/// Inactive items cannot be added, and an item appears at most once per list.
pub async fn add_item(pool: &SqlitePool, list_id: i64, item_id: i64, qty: f64) -> Result<ListItem> {
    check_quantity("qty", qty)?;

    let mut tx = pool.begin().await?;
    fetch_list(&mut *tx, list_id).await?.ensure_editable()?;

    let item = sqlx::query_as::<_, catalog::Item>("SELECT * FROM items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("item {}", item_id)))?;
    if !item.is_active {
        return Err(Error::InvalidInput(format!("item {} is not active", item.sku)));
    }

    let already: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM list_items WHERE list_id = ? AND item_id = ?)",
    )
    .bind(list_id)
    .bind(item_id)
    .fetch_one(&mut *tx)
    .await?;
    if already {
        return Err(Error::InvalidInput(format!("item {} is already on list {}", item.sku, list_id)));
    }

    let now = Utc::now();
    let line = sqlx::query_as::<_, ListItem>(
        r#"
        INSERT INTO list_items (
            list_id, item_id, sku_snapshot, name_snapshot, dept_snapshot,
            price_snapshot, mt_months_snapshot, qty, surplus_qty, status,
            has_photo, has_comment, created_at, updated_at
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?, ?, 0, 'new',
            EXISTS(SELECT 1 FROM item_photos WHERE item_id = ? AND status != 'rejected'),
            EXISTS(SELECT 1 FROM item_comments WHERE item_id = ? AND is_active = 1),
            ?, ?
        )
        RETURNING *
        "#,
    )
    .bind(list_id)
    .bind(item_id)
    .bind(&item.sku)
    .bind(&item.name)
    .bind(&item.dept_code)
    .bind(item.price)
    .bind(item.mt_months)
    .bind(qty)
    .bind(item_id)
    .bind(item_id)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(list_id, line_id = line.id, sku = %line.sku_snapshot, "Line added");
    Ok(line)
}

/// Load a line for mutation, refusing if its list is not active
async fn editable_line(conn: &mut SqliteConnection, line_id: i64) -> Result<ListItem> {
    let line = fetch_line(&mut *conn, line_id).await?;
    fetch_list(&mut *conn, line.list_id).await?.ensure_editable()?;
    Ok(line)
}

/// Set the requested quantity. Leaves `surplus_qty` and status alone.
pub async fn set_qty(pool: &SqlitePool, line_id: i64, qty: f64) -> Result<ListItem> {
    check_quantity("qty", qty)?;

    let mut tx = pool.begin().await?;
    editable_line(&mut *tx, line_id).await?;

    let line = sqlx::query_as::<_, ListItem>(
        "UPDATE list_items SET qty = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(qty)
    .bind(Utc::now())
    .bind(line_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(line)
}

/// Set the surplus quantity. Leaves `qty` and status alone.
pub async fn set_surplus(pool: &SqlitePool, line_id: i64, surplus_qty: f64) -> Result<ListItem> {
    check_quantity("surplus_qty", surplus_qty)?;

    let mut tx = pool.begin().await?;
    editable_line(&mut *tx, line_id).await?;

    let line = sqlx::query_as::<_, ListItem>(
        "UPDATE list_items SET surplus_qty = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(surplus_qty)
    .bind(Utc::now())
    .bind(line_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(line)
}

/// Move a line along the status automaton
pub async fn set_status(pool: &SqlitePool, line_id: i64, next: LineStatus) -> Result<ListItem> {
    let mut tx = pool.begin().await?;
    let current = editable_line(&mut *tx, line_id).await?;
    current.status.check_transition(next)?;

    let line = sqlx::query_as::<_, ListItem>(
        "UPDATE list_items SET status = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(next.as_str())
    .bind(Utc::now())
    .bind(line_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(line_id, list_id = line.list_id, from = %current.status, to = %next, "Line status changed");
    Ok(line)
}

pub async fn get_line(pool: &SqlitePool, line_id: i64) -> Result<ListItem> {
    let mut conn = pool.acquire().await?;
    fetch_line(&mut *conn, line_id).await
}

/// Lines of a list in the order they were added
pub async fn list_lines(pool: &SqlitePool, list_id: i64) -> Result<Vec<ListItem>> {
    let lines = sqlx::query_as::<_, ListItem>("SELECT * FROM list_items WHERE list_id = ? ORDER BY id")
        .bind(list_id)
        .fetch_all(pool)
        .await?;
    Ok(lines)
}
