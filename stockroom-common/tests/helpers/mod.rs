//! Shared fixtures for the integration tests

#![allow(dead_code)]

use sqlx::SqlitePool;
use stockroom_common::db::init_database;
use std::time::Duration;
use stockroom_common::catalog::{self, Item};
use stockroom_common::import::{hash_bytes, ImportRequest, ImportSource, ReconciliationEngine, RunMode};
use stockroom_common::users::{register_user, Role, User};
use tempfile::TempDir;

/// Headers understood by the built-in profile
pub const HEADERS: [&str; 7] = ["sku", "dept", "name", "qty", "sum", "mt_months", "price"];

/// Create a file-backed database with the full schema.
///
/// The TempDir must outlive the pool.
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("stockroom.db")).await.unwrap();
    (temp_dir, pool)
}

/// Register a user and give them `role`
pub async fn user_with_role(pool: &SqlitePool, external_id: i64, role: Role) -> User {
    let user = register_user(pool, external_id, None, Some(&format!("User {}", external_id)))
        .await
        .unwrap();
    sqlx::query("UPDATE users SET role = ? WHERE id = ?")
        .bind(role.as_str())
        .bind(user.id)
        .execute(pool)
        .await
        .unwrap();
    stockroom_common::users::get_user(pool, user.id).await.unwrap()
}

pub async fn admin(pool: &SqlitePool) -> User {
    user_with_role(pool, 9000, Role::Admin).await
}

/// One data row in `HEADERS` order
pub fn row(sku: &str, dept: &str, name: &str, qty: &str, mt_months: &str, price: &str) -> Vec<String> {
    [sku, dept, name, qty, "", mt_months, price]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Build a request against the built-in profile. The content hash is
/// derived from the rows so identical inputs hash identically.
pub fn request(file_name: &str, rows: Vec<Vec<String>>, mode: RunMode, profile_id: i64) -> ImportRequest {
    let headers: Vec<String> = HEADERS.iter().map(|s| s.to_string()).collect();
    let flattened: String = rows.iter().map(|r| r.join(";")).collect::<Vec<_>>().join("\n");
    ImportRequest {
        source: ImportSource::new(file_name, hash_bytes(flattened.as_bytes()), headers, rows),
        mode,
        profile_id: Some(profile_id),
    }
}

/// Id of the seeded built-in profile
pub async fn builtin_profile_id(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT id FROM import_profiles WHERE name = 'standard'")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Load `rows` into the catalog through an apply run. Items come back in row order.
pub async fn seed_catalog(pool: &SqlitePool, rows: Vec<Vec<String>>) -> Vec<Item> {
    let admin = admin(pool).await;
    let profile = builtin_profile_id(pool).await;
    let skus: Vec<String> = rows.iter().map(|r| r[0].clone()).collect();

    ReconciliationEngine::new(pool.clone(), Duration::from_secs(30))
        .run(&admin, request("seed.csv", rows, RunMode::Apply, profile))
        .await
        .unwrap();

    let mut items = Vec::new();
    for sku in skus {
        items.push(catalog::get_by_sku(pool, &sku).await.unwrap().unwrap());
    }
    items
}
