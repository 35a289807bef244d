//! End-to-end reconciliation runs against a file-backed database

mod helpers;

use helpers::{admin, builtin_profile_id, create_test_db, request, row, user_with_role};
use chrono::Utc;
use std::time::Duration;
use stockroom_common::catalog::{self, Item};
use stockroom_common::import::profile::{create_profile, ImportColumn, LogicalField};
use stockroom_common::import::runs::{self, RunStatus};
use stockroom_common::import::{
    hash_bytes, ImportRequest, ImportSource, IssueKind, ReconciliationEngine, RunMode,
};
use stockroom_common::users::Role;
use stockroom_common::Error;

const TIMEOUT: Duration = Duration::from_secs(30);

async fn items_count(pool: &sqlx::SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM items").fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn test_first_import_adds_and_second_is_noop() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let rows = vec![row("12345678", "610", "Milk", "10", "0", "25.5")];

    let first = engine
        .run(&admin, request("stock.csv", rows.clone(), RunMode::Apply, profile))
        .await
        .unwrap();
    assert_eq!(first.counters.items_added, 1);
    assert_eq!(first.counters.items_updated, 0);
    assert_eq!(first.counters.items_deactivated, 0);
    assert_eq!(first.duplicate_of, None);

    let item = catalog::get_by_sku(&pool, "12345678").await.unwrap().unwrap();
    assert_eq!(item.dept_code, "610");
    assert_eq!(item.price, Some(25.5));
    assert_eq!(item.base_qty, 10.0);
    assert_eq!(item.unit, "pcs");
    assert!(item.is_active);

    let second = engine
        .run(&admin, request("stock.csv", rows, RunMode::Apply, profile))
        .await
        .unwrap();
    assert!(second.counters.is_noop());
    assert_eq!(second.duplicate_of, Some(first.import_id));

    let run = runs::get_run(&pool, second.import_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
    assert_eq!(run.duplicate_of, Some(first.import_id));
}

#[tokio::test]
async fn test_dry_run_matches_apply_without_mutating() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let rows = vec![
        row("12345678", "610", "Milk", "10", "1", "25.5"),
        row("bad", "610", "Broken", "1", "0", ""),
        row("87654321", "610", "Kefir", "4", "7", "31"),
    ];

    let dry = engine
        .run(&admin, request("stock.csv", rows.clone(), RunMode::DryRun, profile))
        .await
        .unwrap();
    assert_eq!(items_count(&pool).await, 0);

    let applied = engine
        .run(&admin, request("stock.csv", rows, RunMode::Apply, profile))
        .await
        .unwrap();
    assert_eq!(items_count(&pool).await, 2);

    assert_eq!(dry.counters, applied.counters);
    assert_eq!(dry.issues, applied.issues);
    assert_eq!(dry.actions, applied.actions);

    let dry_log = runs::run_log(&pool, dry.import_id).await.unwrap();
    let applied_log = runs::run_log(&pool, applied.import_id).await.unwrap();
    let strip = |log: Vec<runs::LogEntry>| -> Vec<(Option<i64>, Option<String>, String)> {
        log.into_iter().map(|e| (e.row_number, e.raw_sku, e.kind)).collect()
    };
    assert_eq!(strip(dry_log), strip(applied_log));

    let dry_run = runs::get_run(&pool, dry.import_id).await.unwrap();
    assert_eq!(dry_run.mode, RunMode::DryRun);
    assert_eq!(dry_run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_absent_items_only_lose_active_flag() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    engine
        .run(
            &admin,
            request(
                "a.csv",
                vec![
                    row("12345678", "610", "Milk", "10", "1", "25.5"),
                    row("87654321", "610", "Kefir", "4", "7", "31"),
                ],
                RunMode::Apply,
                profile,
            ),
        )
        .await
        .unwrap();
    let before = catalog::get_by_sku(&pool, "87654321").await.unwrap().unwrap();

    let summary = engine
        .run(
            &admin,
            request("b.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await
        .unwrap();
    assert_eq!(summary.counters.items_deactivated, 1);
    assert_eq!(summary.counters.items_updated, 0);

    let after = catalog::get_by_sku(&pool, "87654321").await.unwrap().unwrap();
    assert!(!after.is_active);
    assert_eq!(
        Item { is_active: true, ..after.clone() },
        before,
        "deactivation must not touch any other field"
    );
}

#[tokio::test]
async fn test_price_change_refreshes_updated_at_only() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    engine
        .run(
            &admin,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await
        .unwrap();
    let before = catalog::get_by_sku(&pool, "12345678").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = engine
        .run(
            &admin,
            request("b.csv", vec![row("12345678", "610", "Milk", "10", "1", "27.9")], RunMode::Apply, profile),
        )
        .await
        .unwrap();
    assert_eq!(summary.counters.items_updated, 1);

    let after = catalog::get_by_sku(&pool, "12345678").await.unwrap().unwrap();
    assert_eq!(after.price, Some(27.9));
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.name, before.name);
    assert_eq!(after.base_qty, before.base_qty);
}

#[tokio::test]
async fn test_blank_price_keeps_catalog_price() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    engine
        .run(
            &admin,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await
        .unwrap();
    let summary = engine
        .run(
            &admin,
            request("b.csv", vec![row("12345678", "610", "Milk", "10", "1", "")], RunMode::Apply, profile),
        )
        .await
        .unwrap();

    assert!(summary.counters.is_noop());
    let item = catalog::get_by_sku(&pool, "12345678").await.unwrap().unwrap();
    assert_eq!(item.price, Some(25.5));
}

#[tokio::test]
async fn test_row_anomalies_are_logged_not_fatal() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let summary = engine
        .run(
            &admin,
            request(
                "a.csv",
                vec![
                    row("12345678", "610", "Milk", "10", "1", "25.5"),
                    row("1234", "610", "Short sku", "1", "0", ""),
                    row("12345678", "610", "Milk twice", "3", "1", ""),
                    row("ABCDEFGH", "610", "Cheese", "many", "0", ""),
                ],
                RunMode::Apply,
                profile,
            ),
        )
        .await
        .unwrap();

    assert_eq!(summary.counters.items_added, 1);
    assert_eq!(summary.counters.error_count, 3);
    assert_eq!(summary.counters.rows_total, 4);

    let log = runs::run_log(&pool, summary.import_id).await.unwrap();
    let kinds: Vec<(Option<i64>, &str)> = log.iter().map(|e| (e.row_number, e.kind.as_str())).collect();
    assert_eq!(
        kinds,
        vec![
            (Some(3), IssueKind::InvalidSku.as_str()),
            (Some(4), IssueKind::DuplicateSku.as_str()),
            (Some(5), IssueKind::MalformedCell.as_str()),
        ]
    );
    assert_eq!(log[0].raw_sku.as_deref(), Some("1234"));
}

#[tokio::test]
async fn test_bad_cell_keeps_existing_item_active() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let milk = row("12345678", "610", "Milk", "10", "1", "25.5");
    engine
        .run(
            &admin,
            request("a.csv", vec![milk.clone(), row("87654321", "610", "Kefir", "4", "7", "31")], RunMode::Apply, profile),
        )
        .await
        .unwrap();

    let summary = engine
        .run(
            &admin,
            request("b.csv", vec![milk, row("87654321", "610", "Kefir", "5 pcs", "7", "31")], RunMode::Apply, profile),
        )
        .await
        .unwrap();

    assert_eq!(summary.counters.items_deactivated, 0);
    assert!(summary.counters.is_noop());
    assert_eq!(summary.counters.error_count, 1);

    let kefir = catalog::get_by_sku(&pool, "87654321").await.unwrap().unwrap();
    assert!(kefir.is_active);
    assert_eq!(kefir.base_qty, 4.0);

    let log = runs::run_log(&pool, summary.import_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, IssueKind::MalformedCell.as_str());
    assert_eq!(log[0].row_number, Some(3));
}

#[tokio::test]
async fn test_dry_run_then_apply_is_not_a_duplicate() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let rows = vec![row("12345678", "610", "Milk", "10", "1", "25.5")];
    engine
        .run(&admin, request("stock.csv", rows.clone(), RunMode::DryRun, profile))
        .await
        .unwrap();
    let applied = engine
        .run(&admin, request("stock.csv", rows, RunMode::Apply, profile))
        .await
        .unwrap();

    assert_eq!(applied.duplicate_of, None);
    assert_eq!(applied.counters.items_added, 1);
}

#[tokio::test]
async fn test_reappearing_sku_is_reactivated() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let milk = row("12345678", "610", "Milk", "10", "1", "25.5");
    let kefir = row("87654321", "610", "Kefir", "4", "7", "31");

    engine
        .run(&admin, request("a.csv", vec![milk.clone(), kefir.clone()], RunMode::Apply, profile))
        .await
        .unwrap();
    engine
        .run(&admin, request("b.csv", vec![milk.clone()], RunMode::Apply, profile))
        .await
        .unwrap();
    let back = engine
        .run(&admin, request("c.csv", vec![milk, kefir], RunMode::Apply, profile))
        .await
        .unwrap();

    assert_eq!(back.counters.items_updated, 1);
    assert_eq!(back.counters.items_added, 0);
    assert!(catalog::get_by_sku(&pool, "87654321").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_empty_snapshot_fails_run_and_keeps_catalog() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    engine
        .run(
            &admin,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await
        .unwrap();

    let result = engine
        .run(&admin, request("b.csv", vec![row("bad", "610", "x", "1", "0", "")], RunMode::Apply, profile))
        .await;
    assert!(matches!(result, Err(Error::EmptySnapshot(1))));

    assert!(catalog::get_by_sku(&pool, "12345678").await.unwrap().unwrap().is_active);

    let last = &runs::recent_runs(&pool, 1).await.unwrap()[0];
    assert_eq!(last.status, RunStatus::Failed);
    assert_eq!(last.counters.error_count, 2);
    let log = runs::run_log(&pool, last.id).await.unwrap();
    assert_eq!(log.len(), 2, "row issue retained plus failure entry");
    assert_eq!(log[1].kind, runs::RUN_FAILED);
}

#[tokio::test]
async fn test_timeout_rolls_back_and_marks_failed() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), Duration::ZERO);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    // Enough rows that the run cannot finish before the first timer tick
    let rows: Vec<Vec<String>> = (0..2000)
        .map(|i| row(&format!("{:08}", i), "610", "Bulk item", "1", "0", "1"))
        .collect();

    let result = engine.run(&admin, request("bulk.csv", rows, RunMode::Apply, profile)).await;
    let import_id = match result {
        Err(Error::RunTimedOut(id)) => id,
        other => panic!("expected RunTimedOut, got {:?}", other.map(|s| s.counters)),
    };

    assert_eq!(items_count(&pool).await, 0);
    assert_eq!(runs::get_run(&pool, import_id).await.unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_non_admin_cannot_run() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let clerk = user_with_role(&pool, 5, Role::User).await;
    let profile = builtin_profile_id(&pool).await;

    let result = engine
        .run(
            &clerk,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert!(runs::recent_runs(&pool, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_in_progress_elsewhere_is_rejected() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let other = runs::start_run(&pool, RunMode::Apply, admin.id, "other.csv", "h", None)
        .await
        .unwrap();

    let result = engine
        .run(
            &admin,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await;
    assert!(matches!(result, Err(Error::RunInProgress(id)) if id == other));
}

#[tokio::test]
async fn test_abandoned_run_is_failed_before_next_run() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    // A process that died mid-run long ago
    let abandoned = runs::start_run(&pool, RunMode::Apply, admin.id, "old.csv", "h", None)
        .await
        .unwrap();
    sqlx::query("UPDATE imports SET started_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::hours(1))
        .bind(abandoned)
        .execute(&pool)
        .await
        .unwrap();

    let summary = engine
        .run(
            &admin,
            request("a.csv", vec![row("12345678", "610", "Milk", "10", "1", "25.5")], RunMode::Apply, profile),
        )
        .await
        .unwrap();
    assert_eq!(summary.counters.items_added, 1);

    let old = runs::get_run(&pool, abandoned).await.unwrap();
    assert_eq!(old.status, RunStatus::Failed);
    let log = runs::run_log(&pool, abandoned).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, runs::RUN_FAILED);
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;
    let profile = builtin_profile_id(&pool).await;

    let rows = vec![row("12345678", "610", "Milk", "10", "1", "25.5")];
    let (a, b) = tokio::join!(
        engine.run(&admin, request("a.csv", rows.clone(), RunMode::Apply, profile)),
        engine.run(&admin, request("b.csv", rows, RunMode::Apply, profile)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.counters.items_added + b.counters.items_added, 1);
    assert_eq!(items_count(&pool).await, 1);
}

#[tokio::test]
async fn test_profile_selected_by_file_mask() {
    let (_dir, pool) = create_test_db().await;
    let engine = ReconciliationEngine::new(pool.clone(), TIMEOUT);
    let admin = admin(&pool).await;

    create_profile(
        &pool,
        &admin,
        "warehouse",
        Some("warehouse_*.csv"),
        &[
            ImportColumn { header: "Code".to_string(), field: LogicalField::Sku },
            ImportColumn { header: "Title".to_string(), field: LogicalField::Name },
            ImportColumn { header: "Section".to_string(), field: LogicalField::DeptCode },
            ImportColumn { header: "Stock".to_string(), field: LogicalField::Qty },
            ImportColumn { header: "Value".to_string(), field: LogicalField::Sum },
        ],
    )
    .await
    .unwrap();

    let headers = ["Code", "Title", "Section", "Stock", "Value"].map(String::from).to_vec();
    let rows = vec![["11112222", "Flour", "620", "4", "10"].map(String::from).to_vec()];
    let summary = engine
        .run(
            &admin,
            ImportRequest {
                source: ImportSource::new("WAREHOUSE_may.csv", hash_bytes(b"warehouse"), headers, rows),
                mode: RunMode::Apply,
                profile_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.profile_name, "warehouse");
    let item = catalog::get_by_sku(&pool, "11112222").await.unwrap().unwrap();
    assert_eq!(item.price, Some(2.5), "price derived from sum / qty");

    let unmatched = engine
        .run(
            &admin,
            ImportRequest {
                source: ImportSource::new("prices.csv", hash_bytes(b"p"), vec!["sku".to_string()], vec![]),
                mode: RunMode::DryRun,
                profile_id: None,
            },
        )
        .await;
    assert!(matches!(unmatched, Err(Error::ProfileNotFound(_))));
}
