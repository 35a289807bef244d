//! Import run records and their anomaly logs
//!
//! One `imports` row per reconciliation run; `import_logs` holds one entry per
//! row-level anomaly plus a final entry when the run fails.

use super::normalize::RowIssue;
use super::profile::ColumnMap;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Log kind written when a run aborts
pub const RUN_FAILED: &str = "run_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Apply,
    DryRun,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Apply => "apply",
            RunMode::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apply" => Ok(RunMode::Apply),
            "dry_run" => Ok(RunMode::DryRun),
            other => Err(Error::InvalidInput(format!("Unknown run type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown run status '{}'", other))),
        }
    }
}

/// Aggregate counters stamped on the run record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub rows_total: i64,
    pub items_added: i64,
    pub items_updated: i64,
    pub items_deactivated: i64,
    pub error_count: i64,
}

impl RunCounters {
    /// True when the run changed (or would change) nothing in the catalog
    pub fn is_noop(&self) -> bool {
        self.items_added == 0 && self.items_updated == 0 && self.items_deactivated == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRun {
    pub id: i64,
    pub mode: RunMode,
    pub status: RunStatus,
    pub user_id: Option<i64>,
    pub file_name: String,
    pub file_hash: String,
    pub profile_id: Option<i64>,
    /// Resolved column positions, JSON-encoded
    pub column_map: Option<String>,
    /// Earlier completed run with the same content hash
    pub duplicate_of: Option<i64>,
    pub counters: RunCounters,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for ImportRun {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let mode: String = row.try_get("run_type")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            mode: mode.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            status: status.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            user_id: row.try_get("user_id")?,
            file_name: row.try_get("file_name")?,
            file_hash: row.try_get("file_hash")?,
            profile_id: row.try_get("profile_id")?,
            column_map: row.try_get("column_map")?,
            duplicate_of: row.try_get("duplicate_of")?,
            counters: RunCounters {
                rows_total: row.try_get("rows_total")?,
                items_added: row.try_get("items_added")?,
                items_updated: row.try_get("items_updated")?,
                items_deactivated: row.try_get("items_deactivated")?,
                error_count: row.try_get("error_count")?,
            },
            failure: row.try_get("failure")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogEntry {
    pub id: i64,
    pub import_id: i64,
    pub row_number: Option<i64>,
    pub raw_sku: Option<String>,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Insert the `running` record for a new run
pub async fn start_run(
    pool: &SqlitePool,
    mode: RunMode,
    user_id: i64,
    file_name: &str,
    file_hash: &str,
    duplicate_of: Option<i64>,
) -> Result<i64> {
    let import_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO imports (run_type, status, user_id, file_name, file_hash, duplicate_of, started_at)
        VALUES (?, 'running', ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(mode.as_str())
    .bind(user_id)
    .bind(file_name)
    .bind(file_hash)
    .bind(duplicate_of)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(import_id)
}

async fn insert_logs(conn: &mut SqliteConnection, import_id: i64, issues: &[RowIssue]) -> Result<()> {
    for issue in issues {
        sqlx::query(
            "INSERT INTO import_logs (import_id, row_number, raw_sku, kind, message) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(import_id)
        .bind(issue.row_number as i64)
        .bind(&issue.raw_sku)
        .bind(issue.kind.as_str())
        .bind(&issue.message)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Mark a run completed with its final counters and anomaly log.
///
/// Takes a connection so apply runs can stamp the record inside the same
/// transaction as their catalog mutations.
pub async fn complete_run(
    conn: &mut SqliteConnection,
    import_id: i64,
    column_map: &ColumnMap,
    counters: &RunCounters,
    issues: &[RowIssue],
) -> Result<()> {
    let column_json = serde_json::to_string(column_map)
        .map_err(|e| Error::Internal(format!("Failed to serialize column map: {}", e)))?;

    insert_logs(conn, import_id, issues).await?;

    sqlx::query(
        r#"
        UPDATE imports SET
            status = 'completed',
            profile_id = ?,
            column_map = ?,
            rows_total = ?,
            items_added = ?,
            items_updated = ?,
            items_deactivated = ?,
            error_count = ?,
            finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(column_map.profile_id)
    .bind(column_json)
    .bind(counters.rows_total)
    .bind(counters.items_added)
    .bind(counters.items_updated)
    .bind(counters.items_deactivated)
    .bind(counters.error_count)
    .bind(Utc::now())
    .bind(import_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Mark a run failed. Row issues collected so far are kept for diagnosis;
/// the failure itself is logged as one more entry and counted as an error.
pub async fn fail_run(pool: &SqlitePool, import_id: i64, issues: &[RowIssue], failure: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_logs(&mut *tx, import_id, issues).await?;

    sqlx::query("INSERT INTO import_logs (import_id, kind, message) VALUES (?, ?, ?)")
        .bind(import_id)
        .bind(RUN_FAILED)
        .bind(failure)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE imports SET
            status = 'failed',
            failure = ?,
            items_added = 0,
            items_updated = 0,
            items_deactivated = 0,
            error_count = ?,
            finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(failure)
    .bind(issues.len() as i64 + 1)
    .bind(Utc::now())
    .bind(import_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Most recent completed apply run whose source had the same content hash.
///
/// Dry runs never changed the catalog, so they do not count.
pub async fn find_completed_by_hash(pool: &SqlitePool, file_hash: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        r#"
        SELECT id FROM imports
        WHERE file_hash = ? AND status = 'completed' AND run_type = 'apply'
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(file_hash)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// A run still marked `running`, if any
pub async fn running_run(pool: &SqlitePool) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM imports WHERE status = 'running' ORDER BY id LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Fail runs left `running` by a process that died mid-run.
///
/// A live run never outlasts the engine timeout, so only runs started more
/// than `max_age` ago are failed. Runs still executing in another process
/// are left alone.
pub async fn fail_stale_runs(pool: &SqlitePool, max_age: Duration) -> Result<u64> {
    let max_age = chrono::Duration::from_std(max_age)
        .map_err(|e| Error::Internal(format!("Stale run age out of range: {}", e)))?;
    let cutoff = Utc::now() - max_age;

    let running: Vec<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT id, started_at FROM imports WHERE status = 'running'")
            .fetch_all(pool)
            .await?;

    let mut failed = 0;
    for (import_id, started_at) in running {
        if started_at >= cutoff {
            continue;
        }
        warn!(import_id, %started_at, "Import run was interrupted; marking failed");
        fail_run(pool, import_id, &[], "interrupted before completion").await?;
        failed += 1;
    }

    Ok(failed)
}

pub async fn get_run(pool: &SqlitePool, import_id: i64) -> Result<ImportRun> {
    sqlx::query_as::<_, ImportRun>("SELECT * FROM imports WHERE id = ?")
        .bind(import_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("import run {}", import_id)))
}

/// Newest runs first
pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<ImportRun>> {
    let runs = sqlx::query_as::<_, ImportRun>("SELECT * FROM imports ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(runs)
}

/// Log entries of one run in source-row order; the failure entry sorts last
pub async fn run_log(pool: &SqlitePool, import_id: i64) -> Result<Vec<LogEntry>> {
    let entries = sqlx::query_as::<_, LogEntry>(
        "SELECT * FROM import_logs WHERE import_id = ? ORDER BY row_number IS NULL, row_number, id",
    )
    .bind(import_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;
    use crate::import::normalize::IssueKind;
    use crate::users::register_user;

    fn issue(row_number: usize) -> RowIssue {
        RowIssue {
            row_number,
            raw_sku: Some("bad".to_string()),
            kind: IssueKind::InvalidSku,
            message: "SKU 'bad' is not 8 alphanumeric characters".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failed_run_keeps_partial_log() {
        let pool = init_memory_database().await.unwrap();
        let user = register_user(&pool, 1, None, None).await.unwrap();
        let id = start_run(&pool, RunMode::Apply, user.id, "stock.csv", "abc", None).await.unwrap();

        fail_run(&pool, id, &[issue(3), issue(2)], "boom").await.unwrap();

        let run = get_run(&pool, id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.counters.error_count, 3);
        assert!(run.finished_at.is_some());

        let log = run_log(&pool, id).await.unwrap();
        let rows: Vec<Option<i64>> = log.iter().map(|e| e.row_number).collect();
        assert_eq!(rows, vec![Some(2), Some(3), None]);
        assert_eq!(log[2].kind, RUN_FAILED);
    }

    #[tokio::test]
    async fn test_only_old_running_runs_are_failed() {
        let pool = init_memory_database().await.unwrap();
        let user = register_user(&pool, 1, None, None).await.unwrap();
        let id = start_run(&pool, RunMode::DryRun, user.id, "stock.csv", "abc", None).await.unwrap();
        let max_age = Duration::from_secs(60);

        assert_eq!(fail_stale_runs(&pool, max_age).await.unwrap(), 0);
        assert_eq!(running_run(&pool).await.unwrap(), Some(id));

        sqlx::query("UPDATE imports SET started_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(5))
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(fail_stale_runs(&pool, max_age).await.unwrap(), 1);
        assert_eq!(running_run(&pool).await.unwrap(), None);
        assert_eq!(get_run(&pool, id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_only_completed_runs_count_as_duplicates() {
        let pool = init_memory_database().await.unwrap();
        let user = register_user(&pool, 1, None, None).await.unwrap();
        let failed = start_run(&pool, RunMode::Apply, user.id, "a.csv", "h1", None).await.unwrap();
        fail_run(&pool, failed, &[], "boom").await.unwrap();

        assert_eq!(find_completed_by_hash(&pool, "h1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dry_runs_do_not_count_as_duplicates() {
        let pool = init_memory_database().await.unwrap();
        let user = register_user(&pool, 1, None, None).await.unwrap();
        let profile_id: i64 = sqlx::query_scalar("SELECT id FROM import_profiles WHERE name = ?")
            .bind(crate::import::profile::BUILTIN_PROFILE)
            .fetch_one(&pool)
            .await
            .unwrap();
        let map = ColumnMap {
            profile_id,
            profile_name: crate::import::profile::BUILTIN_PROFILE.to_string(),
            positions: Default::default(),
        };

        let dry = start_run(&pool, RunMode::DryRun, user.id, "a.csv", "h1", None).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        complete_run(&mut *conn, dry, &map, &RunCounters::default(), &[]).await.unwrap();
        drop(conn);
        assert_eq!(find_completed_by_hash(&pool, "h1").await.unwrap(), None);

        let apply = start_run(&pool, RunMode::Apply, user.id, "a.csv", "h1", None).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        complete_run(&mut *conn, apply, &map, &RunCounters::default(), &[]).await.unwrap();
        drop(conn);
        assert_eq!(find_completed_by_hash(&pool, "h1").await.unwrap(), Some(apply));
    }

    #[test]
    fn test_run_mode_round_trip() {
        assert_eq!("dry_run".parse::<RunMode>().unwrap(), RunMode::DryRun);
        assert_eq!(RunMode::Apply.to_string(), "apply");
        assert!("partial".parse::<RunMode>().is_err());
    }
}
