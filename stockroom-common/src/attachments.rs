//! Photos and comments attached to catalog items
//!
//! Attachments belong to the item, not to a list. Every mutation recomputes
//! `has_photo` and `has_comment` on all list lines referencing the item, in
//! the same transaction, so the cached flags always equal "at least one
//! active attachment exists". A photo is active unless rejected; a comment
//! is active until deactivated.

use crate::users::User;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Comment length cap, counted in characters
pub const COMMENT_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Pending,
    Approved,
    Rejected,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Approved => "approved",
            PhotoStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PhotoStatus::Pending),
            "approved" => Ok(PhotoStatus::Approved),
            "rejected" => Ok(PhotoStatus::Rejected),
            other => Err(Error::InvalidInput(format!("Unknown photo status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPhoto {
    pub id: i64,
    pub item_id: i64,
    /// Opaque reference to the stored file
    pub file_ref: String,
    /// Cleared when the uploader is deleted
    pub uploaded_by: Option<i64>,
    pub status: PhotoStatus,
    pub moderated_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub moderated_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for ItemPhoto {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            file_ref: row.try_get("file_ref")?,
            uploaded_by: row.try_get("uploaded_by")?,
            status: status.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            moderated_by: row.try_get("moderated_by")?,
            created_at: row.try_get("created_at")?,
            moderated_at: row.try_get("moderated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ItemComment {
    pub id: i64,
    pub item_id: i64,
    pub user_id: Option<i64>,
    pub text: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recompute the cached attachment flags on every line referencing `item_id`
async fn refresh_flags(conn: &mut SqliteConnection, item_id: i64) -> Result<u64> {
    let touched = sqlx::query(
        r#"
        UPDATE list_items SET
            has_photo = EXISTS(
                SELECT 1 FROM item_photos WHERE item_id = ?1 AND status != 'rejected'
            ),
            has_comment = EXISTS(
                SELECT 1 FROM item_comments WHERE item_id = ?1 AND is_active = 1
            )
        WHERE item_id = ?1
        "#,
    )
    .bind(item_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    debug!(item_id, lines = touched, "Attachment flags refreshed");
    Ok(touched)
}

async fn ensure_item(conn: &mut SqliteConnection, item_id: i64) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM items WHERE id = ?)")
        .bind(item_id)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(Error::NotFound(format!("item {}", item_id)))
    }
}

/// Attach a photo to an item, pending moderation
pub async fn add_photo(pool: &SqlitePool, item_id: i64, file_ref: &str, uploader: &User) -> Result<ItemPhoto> {
    let file_ref = file_ref.trim();
    if file_ref.is_empty() {
        return Err(Error::InvalidInput("photo file reference is empty".to_string()));
    }

    let mut tx = pool.begin().await?;
    ensure_item(&mut *tx, item_id).await?;

    let duplicate: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM item_photos WHERE item_id = ? AND file_ref = ?)",
    )
    .bind(item_id)
    .bind(file_ref)
    .fetch_one(&mut *tx)
    .await?;
    if duplicate {
        return Err(Error::InvalidInput(format!("photo '{}' is already attached to item {}", file_ref, item_id)));
    }

    let photo = sqlx::query_as::<_, ItemPhoto>(
        r#"
        INSERT INTO item_photos (item_id, file_ref, uploaded_by, status, created_at)
        VALUES (?, ?, ?, 'pending', ?)
        RETURNING *
        "#,
    )
    .bind(item_id)
    .bind(file_ref)
    .bind(uploader.id)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;

    refresh_flags(&mut *tx, item_id).await?;
    tx.commit().await?;

    info!(photo_id = photo.id, item_id, uploader = uploader.id, "Photo added");
    Ok(photo)
}

/// Approve or reject a photo. Admin only.
pub async fn moderate(pool: &SqlitePool, actor: &User, photo_id: i64, decision: PhotoStatus) -> Result<ItemPhoto> {
    actor.require_admin("moderating photos")?;
    if decision == PhotoStatus::Pending {
        return Err(Error::InvalidInput("moderation decision must be approved or rejected".to_string()));
    }

    let mut tx = pool.begin().await?;
    let photo = sqlx::query_as::<_, ItemPhoto>(
        r#"
        UPDATE item_photos SET status = ?, moderated_by = ?, moderated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(decision.as_str())
    .bind(actor.id)
    .bind(Utc::now())
    .bind(photo_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::NotFound(format!("photo {}", photo_id)))?;

    refresh_flags(&mut *tx, photo.item_id).await?;
    tx.commit().await?;

    info!(photo_id, item_id = photo.item_id, decision = %decision, actor = actor.id, "Photo moderated");
    Ok(photo)
}

/// Attach a comment of at most [`COMMENT_MAX_CHARS`] characters
pub async fn add_comment(pool: &SqlitePool, item_id: i64, author: &User, text: &str) -> Result<ItemComment> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput("comment is empty".to_string()));
    }
    let len = text.chars().count();
    if len > COMMENT_MAX_CHARS {
        return Err(Error::CommentTooLong {
            len,
            max: COMMENT_MAX_CHARS,
        });
    }

    let mut tx = pool.begin().await?;
    ensure_item(&mut *tx, item_id).await?;

    let now = Utc::now();
    let comment = sqlx::query_as::<_, ItemComment>(
        r#"
        INSERT INTO item_comments (item_id, user_id, text, is_active, created_at, updated_at)
        VALUES (?, ?, ?, 1, ?, ?)
        RETURNING *
        "#,
    )
    .bind(item_id)
    .bind(author.id)
    .bind(text)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    refresh_flags(&mut *tx, item_id).await?;
    tx.commit().await?;

    info!(comment_id = comment.id, item_id, author = author.id, "Comment added");
    Ok(comment)
}

/// Hide a comment without deleting it. The author or an admin may do this.
pub async fn deactivate_comment(pool: &SqlitePool, actor: &User, comment_id: i64) -> Result<ItemComment> {
    let mut tx = pool.begin().await?;

    let author: Option<Option<i64>> = sqlx::query_scalar("SELECT user_id FROM item_comments WHERE id = ?")
        .bind(comment_id)
        .fetch_optional(&mut *tx)
        .await?;
    let author = author.ok_or_else(|| Error::NotFound(format!("comment {}", comment_id)))?;
    if author != Some(actor.id) {
        actor.require_admin("hiding another user's comment")?;
    }

    let comment = sqlx::query_as::<_, ItemComment>(
        "UPDATE item_comments SET is_active = 0, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(Utc::now())
    .bind(comment_id)
    .fetch_one(&mut *tx)
    .await?;

    refresh_flags(&mut *tx, comment.item_id).await?;
    tx.commit().await?;

    info!(comment_id, item_id = comment.item_id, actor = actor.id, "Comment deactivated");
    Ok(comment)
}

/// Photos of an item, newest first. Rejected photos are included only when asked.
pub async fn photos_for_item(pool: &SqlitePool, item_id: i64, include_rejected: bool) -> Result<Vec<ItemPhoto>> {
    let photos = sqlx::query_as::<_, ItemPhoto>(
        r#"
        SELECT * FROM item_photos
        WHERE item_id = ? AND (? OR status != 'rejected')
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(item_id)
    .bind(include_rejected)
    .fetch_all(pool)
    .await?;
    Ok(photos)
}

/// Photos awaiting moderation, oldest first
pub async fn pending_photos(pool: &SqlitePool) -> Result<Vec<ItemPhoto>> {
    let photos = sqlx::query_as::<_, ItemPhoto>(
        "SELECT * FROM item_photos WHERE status = 'pending' ORDER BY created_at, id",
    )
    .fetch_all(pool)
    .await?;
    Ok(photos)
}

/// Active comments of an item, newest first
pub async fn comments_for_item(pool: &SqlitePool, item_id: i64) -> Result<Vec<ItemComment>> {
    let comments = sqlx::query_as::<_, ItemComment>(
        "SELECT * FROM item_comments WHERE item_id = ? AND is_active = 1 ORDER BY created_at DESC, id DESC",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await?;
    Ok(comments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_status_parsing() {
        assert_eq!("approved".parse::<PhotoStatus>().unwrap(), PhotoStatus::Approved);
        assert!("hidden".parse::<PhotoStatus>().is_err());
    }
}
