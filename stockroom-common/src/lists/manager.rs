//! List lifecycle
//!
//! This module is the single authority for the "one active list per user and
//! department" rule. The partial unique index on `user_lists` backs it up
//! under concurrent writers; a violation comes back as `DuplicateActiveList`.

use super::{ListMode, ListStatus, StagnationFilter, UserList};
use crate::db::settings::{get_setting, CAROUSEL_DEFAULT_FILTER, RECENT_LISTS_LIMIT};
use crate::users::User;
use crate::{Error, Result};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

/// Fallback when the `recent_lists_limit` setting is missing
const DEFAULT_RECENT_LIMIT: i64 = 10;

pub(crate) async fn fetch_list(conn: &mut SqliteConnection, list_id: i64) -> Result<UserList> {
    sqlx::query_as::<_, UserList>("SELECT * FROM user_lists WHERE id = ?")
        .bind(list_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("list {}", list_id)))
}

async fn active_list_id(conn: &mut SqliteConnection, user_id: i64, dept_code: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        "SELECT id FROM user_lists WHERE user_id = ? AND dept_code = ? AND status = 'active'",
    )
    .bind(user_id)
    .bind(dept_code)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Turn a unique-index violation on the active-list index into
/// `DuplicateActiveList`; any other error passes through.
async fn active_conflict(pool: &SqlitePool, err: sqlx::Error, user_id: i64, dept_code: &str) -> Error {
    let is_unique = matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
    if !is_unique {
        return err.into();
    }

    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(_) => return err.into(),
    };
    match active_list_id(&mut *conn, user_id, dept_code).await {
        Ok(Some(list_id)) => Error::DuplicateActiveList {
            user_id,
            dept_code: dept_code.to_string(),
            list_id,
        },
        _ => err.into(),
    }
}

/// Create an active list for `user` in `dept_code`.
///
/// If the pair already has an active list this fails with
/// `DuplicateActiveList`, unless `supersede` is set, in which case the old
/// list is cancelled first. Carousel lists without a filter get the
/// configured default.
pub async fn create_list(
    pool: &SqlitePool,
    user: &User,
    dept_code: &str,
    mode: ListMode,
    mt_filter: Option<StagnationFilter>,
    supersede: bool,
) -> Result<UserList> {
    let dept_code = dept_code.trim();
    if dept_code.is_empty() {
        return Err(Error::InvalidInput("department code is empty".to_string()));
    }

    let mt_filter = match (mode, mt_filter) {
        (ListMode::CarouselMt, None) => Some(
            get_setting::<StagnationFilter>(pool, CAROUSEL_DEFAULT_FILTER)
                .await?
                .unwrap_or(StagnationFilter::Three),
        ),
        (_, filter) => filter,
    };

    // No read precedes the first write; a racing creator trips the unique index
    let mut tx = pool.begin().await?;

    if supersede {
        let superseded: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE user_lists SET status = 'cancelled', updated_at = ?
            WHERE user_id = ? AND dept_code = ? AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(user.id)
        .bind(dept_code)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = superseded {
            info!(list_id = existing, user_id = user.id, dept = dept_code, "Active list superseded");
        }
    }

    let now = Utc::now();
    let inserted = sqlx::query_as::<_, UserList>(
        r#"
        INSERT INTO user_lists (user_id, dept_code, mode, mt_filter, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'active', ?, ?)
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(dept_code)
    .bind(mode.as_str())
    .bind(mt_filter.map(|f| f.as_str()))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let list = match inserted {
        Ok(list) => list,
        Err(e) => {
            drop(tx);
            return Err(active_conflict(pool, e, user.id, dept_code).await);
        }
    };

    tx.commit().await?;

    info!(list_id = list.id, user_id = user.id, dept = dept_code, mode = mode.as_str(), "List created");
    Ok(list)
}

/// Move a list along its automaton, stamping the matching timestamp
async fn transition(pool: &SqlitePool, list_id: i64, next: ListStatus) -> Result<UserList> {
    let mut tx = pool.begin().await?;
    let list = fetch_list(&mut *tx, list_id).await?;
    list.status.check_transition(next)?;

    if next == ListStatus::Active {
        if let Some(other) = active_list_id(&mut *tx, list.user_id, &list.dept_code).await? {
            return Err(Error::DuplicateActiveList {
                user_id: list.user_id,
                dept_code: list.dept_code,
                list_id: other,
            });
        }
    }

    let now = Utc::now();
    let updated = sqlx::query_as::<_, UserList>(
        r#"
        UPDATE user_lists SET
            status = ?1,
            updated_at = ?2,
            saved_at = CASE ?1 WHEN 'saved' THEN ?2 WHEN 'active' THEN NULL ELSE saved_at END,
            archived_at = CASE ?1 WHEN 'archived' THEN ?2 ELSE archived_at END
        WHERE id = ?3
        RETURNING *
        "#,
    )
    .bind(next.as_str())
    .bind(now)
    .bind(list_id)
    .fetch_one(&mut *tx)
    .await;

    let updated = match updated {
        Ok(updated) => updated,
        Err(e) => {
            drop(tx);
            return Err(active_conflict(pool, e, list.user_id, &list.dept_code).await);
        }
    };

    tx.commit().await?;

    info!(list_id, from = %list.status, to = %next, "List status changed");
    Ok(updated)
}

/// Finalize an active list. Its lines are frozen from here on.
pub async fn save_list(pool: &SqlitePool, list_id: i64) -> Result<UserList> {
    transition(pool, list_id, ListStatus::Saved).await
}

pub async fn cancel_list(pool: &SqlitePool, list_id: i64) -> Result<UserList> {
    transition(pool, list_id, ListStatus::Cancelled).await
}

/// Retire a saved or cancelled list from the active views
pub async fn archive_list(pool: &SqlitePool, list_id: i64) -> Result<UserList> {
    transition(pool, list_id, ListStatus::Archived).await
}

/// Make a saved list editable again. Refused while the same user already
/// has another active list for the department.
pub async fn reopen_list(pool: &SqlitePool, list_id: i64) -> Result<UserList> {
    transition(pool, list_id, ListStatus::Active).await
}

pub async fn get_list(pool: &SqlitePool, list_id: i64) -> Result<UserList> {
    let mut conn = pool.acquire().await?;
    fetch_list(&mut *conn, list_id).await
}

/// The user's most recent lists, newest first
pub async fn recent_lists(pool: &SqlitePool, user_id: i64) -> Result<Vec<UserList>> {
    let limit = get_setting::<i64>(pool, RECENT_LISTS_LIMIT)
        .await?
        .unwrap_or(DEFAULT_RECENT_LIMIT);

    let lists = sqlx::query_as::<_, UserList>(
        "SELECT * FROM user_lists WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(lists)
}

/// Active lists of one user across departments
pub async fn active_lists(pool: &SqlitePool, user_id: i64) -> Result<Vec<UserList>> {
    let lists = sqlx::query_as::<_, UserList>(
        "SELECT * FROM user_lists WHERE user_id = ? AND status = 'active' ORDER BY dept_code",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(lists)
}

/// Delete a list and, by cascade, its lines. Owners may delete their own
/// lists; anyone else needs the admin role.
pub async fn delete_list(pool: &SqlitePool, actor: &User, list_id: i64) -> Result<()> {
    let list = get_list(pool, list_id).await?;
    if list.user_id != actor.id {
        actor.require_admin("deleting another user's list")?;
    }

    sqlx::query("DELETE FROM user_lists WHERE id = ?")
        .bind(list_id)
        .execute(pool)
        .await?;

    info!(list_id, actor = actor.id, "List deleted");
    Ok(())
}
