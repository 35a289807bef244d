//! Staff accounts tied to external messaging identities
//!
//! Users are created on first contact with role `user`. Authentication lives
//! outside this crate; callers hand in an already-resolved identity and the
//! role stored here decides which operations are allowed.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            other => Err(Error::InvalidInput(format!("Unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Account id on the messaging platform
    pub external_id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Fails with `PermissionDenied` unless the user is an admin or superadmin
    pub fn require_admin(&self, operation: &str) -> Result<()> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} requires admin role (user {} is {})",
                operation, self.id, self.role
            )))
        }
    }
}

impl FromRow<'_, SqliteRow> for User {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            username: row.try_get("username")?,
            display_name: row.try_get("display_name")?,
            role: role.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Create the user on first contact, or refresh their names on later contacts
pub async fn register_user(
    pool: &SqlitePool,
    external_id: i64,
    username: Option<&str>,
    display_name: Option<&str>,
) -> Result<User> {
    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (external_id, username, display_name, role, created_at, updated_at)
        VALUES (?, ?, ?, 'user', ?, ?)
        ON CONFLICT(external_id) DO UPDATE SET
            username = excluded.username,
            display_name = excluded.display_name,
            updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(external_id)
    .bind(username)
    .bind(display_name)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    if user.created_at == now {
        info!(user_id = user.id, external_id, "Registered new user");
    }

    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, user_id: i64) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))
}

pub async fn find_by_external_id(pool: &SqlitePool, external_id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Change a user's role. Only a superadmin may do this.
pub async fn set_role(pool: &SqlitePool, actor: &User, user_id: i64, role: Role) -> Result<User> {
    if actor.role != Role::Superadmin {
        return Err(Error::PermissionDenied(format!(
            "changing roles requires superadmin (user {} is {})",
            actor.id, actor.role
        )));
    }

    let user = sqlx::query_as::<_, User>(
        "UPDATE users SET role = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(role.as_str())
    .bind(Utc::now())
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

    info!(user_id, role = %role, actor = actor.id, "User role changed");
    Ok(user)
}

/// Give the first superadmin role to `external_id`.
///
/// Only succeeds while no superadmin exists; afterwards roles change through
/// [`set_role`].
pub async fn bootstrap_superadmin(pool: &SqlitePool, external_id: i64) -> Result<User> {
    let mut tx = pool.begin().await?;

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE role = 'superadmin' LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    if let Some(id) = existing {
        return Err(Error::PermissionDenied(format!("superadmin already exists (user {})", id)));
    }

    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (external_id, role, created_at, updated_at)
        VALUES (?, 'superadmin', ?, ?)
        ON CONFLICT(external_id) DO UPDATE SET role = 'superadmin', updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(external_id)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(user_id = user.id, external_id, "Superadmin bootstrapped");
    Ok(user)
}

/// Remove a user. Their lists go with them; photos and comments they
/// uploaded survive with the author cleared.
pub async fn delete_user(pool: &SqlitePool, actor: &User, user_id: i64) -> Result<()> {
    actor.require_admin("deleting users")?;

    let affected = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();

    if affected == 0 {
        return Err(Error::NotFound(format!("user {}", user_id)));
    }

    info!(user_id, actor = actor.id, "User deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    #[tokio::test]
    async fn test_register_is_idempotent_and_refreshes_names() {
        let pool = init_memory_database().await.unwrap();

        let first = register_user(&pool, 1001, Some("olena"), Some("Olena")).await.unwrap();
        assert_eq!(first.role, Role::User);

        let second = register_user(&pool, 1001, Some("olena_k"), Some("Olena K")).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.display_name.as_deref(), Some("Olena K"));
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_only_superadmin_changes_roles() {
        let pool = init_memory_database().await.unwrap();
        let boss = register_user(&pool, 1, None, Some("Boss")).await.unwrap();
        let clerk = register_user(&pool, 2, None, Some("Clerk")).await.unwrap();

        let denied = set_role(&pool, &clerk, boss.id, Role::Admin).await;
        assert!(matches!(denied, Err(Error::PermissionDenied(_))));

        sqlx::query("UPDATE users SET role = 'superadmin' WHERE id = ?")
            .bind(boss.id)
            .execute(&pool)
            .await
            .unwrap();
        let boss = get_user(&pool, boss.id).await.unwrap();

        let promoted = set_role(&pool, &boss, clerk.id, Role::Admin).await.unwrap();
        assert_eq!(promoted.role, Role::Admin);
        assert!(promoted.require_admin("import").is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_superadmin_only_once() {
        let pool = init_memory_database().await.unwrap();
        let existing = register_user(&pool, 5, Some("olena"), None).await.unwrap();

        let boss = bootstrap_superadmin(&pool, 5).await.unwrap();
        assert_eq!(boss.id, existing.id);
        assert_eq!(boss.role, Role::Superadmin);
        assert_eq!(boss.username.as_deref(), Some("olena"));

        assert!(matches!(
            bootstrap_superadmin(&pool, 6).await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("superadmin".parse::<Role>().unwrap(), Role::Superadmin);
        assert!("owner".parse::<Role>().is_err());
        assert!(!Role::User.is_admin());
    }
}
