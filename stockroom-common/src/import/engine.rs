//! Catalog reconciliation engine
//!
//! A run takes the header and data rows of one inventory snapshot, resolves
//! the column map, normalizes every row, diffs the result against the catalog
//! and either applies the planned actions or (dry run) only reports them.
//!
//! The diff is computed by [`plan_reconciliation`], a pure function shared by
//! both modes, so a dry run reports exactly what an apply run would do. All
//! catalog writes plus the completed run record go through one transaction:
//! a run either commits everything or leaves the catalog untouched.
//!
//! Runs are serialized. Inside one process an async mutex queues callers;
//! a run left `running` by another process is reported as `RunInProgress`
//! until it is older than the timeout allows, after which it is failed as
//! interrupted.

use super::normalize::{clean_sku, normalize_row, IssueKind, NormalizedRow, RowIssue, RowOutcome};
use super::profile::{self, ColumnMap};
use super::runs::{self, RunCounters, RunMode};
use crate::catalog::{self, Item, DEFAULT_UNIT};
use crate::users::User;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Numeric fields closer than this are considered unchanged
const FLOAT_EPSILON: f64 = 1e-9;

/// Slack on top of the run timeout before a `running` record counts as abandoned
const STALE_RUN_GRACE: Duration = Duration::from_secs(60);

/// One tokenized snapshot handed in by the file-parsing layer
#[derive(Debug, Clone)]
pub struct ImportSource {
    pub file_name: String,
    /// Hex SHA-256 of the original file bytes
    pub content_hash: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ImportSource {
    pub fn new(
        file_name: impl Into<String>,
        content_hash: impl Into<String>,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_hash: content_hash.into(),
            headers,
            rows,
        }
    }
}

/// Hex-encoded SHA-256 used as the file content identity
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub source: ImportSource,
    pub mode: RunMode,
    /// Explicit profile; when absent the file name selects one
    pub profile_id: Option<i64>,
}

/// A single tracked-field change on an existing item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldChange {
    DeptCode(String),
    DeptName(String),
    GroupName(String),
    Name(String),
    Unit(String),
    MtMonths(f64),
    BaseQty(f64),
    BaseSum(f64),
    Price(f64),
    BaseReserve(f64),
    /// SKU reappeared after being deactivated
    Reactivate,
}

impl FieldChange {
    pub fn column(&self) -> &'static str {
        match self {
            FieldChange::DeptCode(_) => "dept_code",
            FieldChange::DeptName(_) => "dept_name",
            FieldChange::GroupName(_) => "group_name",
            FieldChange::Name(_) => "name",
            FieldChange::Unit(_) => "unit",
            FieldChange::MtMonths(_) => "mt_months",
            FieldChange::BaseQty(_) => "base_qty",
            FieldChange::BaseSum(_) => "base_sum",
            FieldChange::Price(_) => "price",
            FieldChange::BaseReserve(_) => "base_reserve",
            FieldChange::Reactivate => "is_active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Add(NormalizedRow),
    Update {
        item_id: i64,
        sku: String,
        changes: Vec<FieldChange>,
    },
    Deactivate {
        item_id: i64,
        sku: String,
    },
}

/// Result handed back to the caller for display or notification
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub import_id: i64,
    pub mode: RunMode,
    pub profile_name: String,
    pub counters: RunCounters,
    pub issues: Vec<RowIssue>,
    pub actions: Vec<PlannedAction>,
    /// Set when an earlier completed run had the same file content
    pub duplicate_of: Option<i64>,
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > FLOAT_EPSILON
}

fn text_change(new: Option<&str>, current: Option<&str>) -> Option<String> {
    match new {
        Some(value) if Some(value) != current => Some(value.to_string()),
        _ => None,
    }
}

/// Tracked fields of `item` that differ from `row`.
///
/// Optional values the file did not carry leave the catalog value alone.
fn diff_item(item: &Item, row: &NormalizedRow) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if !row.dept_code.is_empty() && row.dept_code != item.dept_code {
        changes.push(FieldChange::DeptCode(row.dept_code.clone()));
    }
    if let Some(v) = text_change(row.dept_name.as_deref(), item.dept_name.as_deref()) {
        changes.push(FieldChange::DeptName(v));
    }
    if let Some(v) = text_change(row.group_name.as_deref(), item.group_name.as_deref()) {
        changes.push(FieldChange::GroupName(v));
    }
    if row.name != item.name {
        changes.push(FieldChange::Name(row.name.clone()));
    }
    if let Some(v) = text_change(row.unit.as_deref(), Some(item.unit.as_str())) {
        changes.push(FieldChange::Unit(v));
    }
    if differs(row.mt_months, item.mt_months) {
        changes.push(FieldChange::MtMonths(row.mt_months));
    }
    if differs(row.qty, item.base_qty) {
        changes.push(FieldChange::BaseQty(row.qty));
    }
    if differs(row.sum, item.base_sum) {
        changes.push(FieldChange::BaseSum(row.sum));
    }
    if let Some(price) = row.price {
        if item.price.map_or(true, |current| differs(price, current)) {
            changes.push(FieldChange::Price(price));
        }
    }
    if differs(row.reserve, item.base_reserve) {
        changes.push(FieldChange::BaseReserve(row.reserve));
    }
    if !item.is_active {
        changes.push(FieldChange::Reactivate);
    }

    changes
}

/// Compute the minimal action set turning `catalog` into `rows`.
///
/// Adds and updates follow row order; deactivations are sorted by SKU. Only
/// the first row of a repeated SKU is considered. `skipped` holds SKUs that
/// appear in the snapshot on rows that were logged and skipped; those items
/// are left untouched rather than deactivated.
pub fn plan_reconciliation(
    catalog: &HashMap<String, Item>,
    rows: &[NormalizedRow],
    skipped: &HashSet<String>,
) -> Vec<PlannedAction> {
    let mut seen = HashSet::new();
    let mut actions = Vec::new();

    for row in rows {
        if !seen.insert(row.sku.as_str()) {
            continue;
        }
        match catalog.get(&row.sku) {
            None => actions.push(PlannedAction::Add(row.clone())),
            Some(item) => {
                let changes = diff_item(item, row);
                if !changes.is_empty() {
                    actions.push(PlannedAction::Update {
                        item_id: item.id,
                        sku: item.sku.clone(),
                        changes,
                    });
                }
            }
        }
    }

    let mut missing: Vec<&Item> = catalog
        .values()
        .filter(|item| item.is_active && !seen.contains(item.sku.as_str()) && !skipped.contains(&item.sku))
        .collect();
    missing.sort_by(|a, b| a.sku.cmp(&b.sku));
    actions.extend(missing.into_iter().map(|item| PlannedAction::Deactivate {
        item_id: item.id,
        sku: item.sku.clone(),
    }));

    actions
}

fn count_actions(actions: &[PlannedAction], counters: &mut RunCounters) {
    for action in actions {
        match action {
            PlannedAction::Add(_) => counters.items_added += 1,
            PlannedAction::Update { .. } => counters.items_updated += 1,
            PlannedAction::Deactivate { .. } => counters.items_deactivated += 1,
        }
    }
}

/// Rows of one snapshot after normalization
struct NormalizedSnapshot {
    records: Vec<NormalizedRow>,
    /// Valid SKUs whose row was skipped for a bad cell
    skipped: HashSet<String>,
    rows_total: i64,
}

/// Normalize every data row, dropping in-file SKU repeats after the first
fn normalize_rows(map: &ColumnMap, rows: &[Vec<String>], issues: &mut Vec<RowIssue>) -> NormalizedSnapshot {
    let mut records = Vec::new();
    let mut skipped = HashSet::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut rows_total = 0;

    for (index, cells) in rows.iter().enumerate() {
        // Header occupies row 1
        let row_number = index + 2;
        match normalize_row(map, row_number, cells) {
            RowOutcome::Blank => continue,
            RowOutcome::Issue(issue) => {
                rows_total += 1;
                debug!(row = row_number, kind = %issue.kind, "{}", issue.message);
                // The SKU itself passed validation; only another cell was bad
                if issue.kind == IssueKind::MalformedCell {
                    if let Some(raw) = issue.raw_sku.as_deref() {
                        skipped.insert(clean_sku(raw));
                    }
                }
                issues.push(issue);
            }
            RowOutcome::Record(record) => {
                rows_total += 1;
                if let Some(first) = first_seen.get(&record.sku) {
                    debug!(row = row_number, sku = %record.sku, "Duplicate SKU in file");
                    issues.push(RowIssue {
                        row_number,
                        raw_sku: Some(record.sku.clone()),
                        kind: IssueKind::DuplicateSku,
                        message: format!("SKU {} already appeared on row {}", record.sku, first),
                    });
                    continue;
                }
                first_seen.insert(record.sku.clone(), row_number);
                records.push(record);
            }
        }
    }

    NormalizedSnapshot {
        records,
        skipped,
        rows_total,
    }
}

async fn insert_item(conn: &mut SqliteConnection, row: &NormalizedRow) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO items (
            sku, dept_code, dept_name, group_name, name, unit,
            mt_months, base_qty, base_sum, price, base_reserve,
            is_active, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&row.sku)
    .bind(&row.dept_code)
    .bind(&row.dept_name)
    .bind(&row.group_name)
    .bind(&row.name)
    .bind(row.unit.as_deref().unwrap_or(DEFAULT_UNIT))
    .bind(row.mt_months)
    .bind(row.qty)
    .bind(row.sum)
    .bind(row.price)
    .bind(row.reserve)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Write only the changed columns and stamp `updated_at`
async fn update_item(conn: &mut SqliteConnection, item_id: i64, changes: &[FieldChange]) -> Result<()> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE items SET ");
    for change in changes {
        query.push(format!("{} = ", change.column()));
        match change {
            FieldChange::DeptCode(v)
            | FieldChange::DeptName(v)
            | FieldChange::GroupName(v)
            | FieldChange::Name(v)
            | FieldChange::Unit(v) => query.push_bind(v.clone()),
            FieldChange::MtMonths(v)
            | FieldChange::BaseQty(v)
            | FieldChange::BaseSum(v)
            | FieldChange::Price(v)
            | FieldChange::BaseReserve(v) => query.push_bind(*v),
            FieldChange::Reactivate => query.push_bind(true),
        };
        query.push(", ");
    }
    query.push("updated_at = ");
    query.push_bind(Utc::now());

    query.push(" WHERE id = ");
    query.push_bind(item_id);
    query.build().execute(&mut *conn).await?;
    Ok(())
}

async fn apply_actions(conn: &mut SqliteConnection, actions: &[PlannedAction]) -> Result<()> {
    for action in actions {
        match action {
            PlannedAction::Add(row) => insert_item(conn, row).await?,
            PlannedAction::Update { item_id, changes, .. } => update_item(conn, *item_id, changes).await?,
            PlannedAction::Deactivate { item_id, .. } => {
                sqlx::query("UPDATE items SET is_active = 0 WHERE id = ?")
                    .bind(item_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Runs reconciliation, one at a time
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: SqlitePool,
    run_lock: Arc<Mutex<()>>,
    timeout: Duration,
}

impl ReconciliationEngine {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self {
            pool,
            run_lock: Arc::new(Mutex::new(())),
            timeout,
        }
    }

    /// Execute one run. Row anomalies land in the summary; run-level
    /// failures mark the run failed and come back as errors.
    pub async fn run(&self, user: &User, request: ImportRequest) -> Result<RunSummary> {
        user.require_admin("running catalog reconciliation")?;

        let _guard = self.run_lock.lock().await;

        let stale = runs::fail_stale_runs(&self.pool, self.timeout + STALE_RUN_GRACE).await?;
        if stale > 0 {
            info!(stale, "Marked interrupted import run(s) as failed");
        }

        if let Some(running) = runs::running_run(&self.pool).await? {
            return Err(Error::RunInProgress(running));
        }

        let source = &request.source;
        let duplicate_of = runs::find_completed_by_hash(&self.pool, &source.content_hash).await?;
        if let Some(previous) = duplicate_of {
            warn!(
                file = %source.file_name,
                previous_import = previous,
                "File content matches an earlier completed run"
            );
        }

        let import_id = runs::start_run(
            &self.pool,
            request.mode,
            user.id,
            &source.file_name,
            &source.content_hash,
            duplicate_of,
        )
        .await?;

        info!(
            import_id,
            mode = %request.mode,
            file = %source.file_name,
            rows = source.rows.len(),
            "Reconciliation run started"
        );

        let mut issues = Vec::new();
        let outcome = tokio::time::timeout(self.timeout, self.execute(import_id, &request, &mut issues)).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::RunTimedOut(import_id)),
        };

        match result {
            Ok((profile_name, counters, actions)) => {
                info!(
                    import_id,
                    added = counters.items_added,
                    updated = counters.items_updated,
                    deactivated = counters.items_deactivated,
                    errors = counters.error_count,
                    "Reconciliation run completed"
                );
                if counters.error_count > 0 {
                    warn!(import_id, errors = counters.error_count, "Rows skipped during reconciliation");
                }
                Ok(RunSummary {
                    import_id,
                    mode: request.mode,
                    profile_name,
                    counters,
                    issues,
                    actions,
                    duplicate_of,
                })
            }
            Err(e) => {
                error!(import_id, "Reconciliation run failed: {}", e);
                runs::fail_run(&self.pool, import_id, &issues, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        import_id: i64,
        request: &ImportRequest,
        issues: &mut Vec<RowIssue>,
    ) -> Result<(String, RunCounters, Vec<PlannedAction>)> {
        let source = &request.source;
        let map = profile::resolve(&self.pool, &source.headers, request.profile_id, &source.file_name).await?;

        let snapshot = normalize_rows(&map, &source.rows, issues);
        if snapshot.records.is_empty() {
            return Err(Error::EmptySnapshot(issues.len()));
        }

        let mut tx = self.pool.begin().await?;
        let current = catalog::load_all(&mut *tx).await?;
        let actions = plan_reconciliation(&current, &snapshot.records, &snapshot.skipped);

        let mut counters = RunCounters {
            rows_total: snapshot.rows_total,
            error_count: issues.len() as i64,
            ..RunCounters::default()
        };
        count_actions(&actions, &mut counters);

        if request.mode == RunMode::Apply {
            apply_actions(&mut *tx, &actions).await?;
        }

        runs::complete_run(&mut *tx, import_id, &map, &counters, issues).await?;
        tx.commit().await?;

        Ok((map.profile_name, counters, actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::profile::LogicalField;

    fn item(id: i64, sku: &str, price: Option<f64>, active: bool) -> Item {
        let now = Utc::now();
        Item {
            id,
            sku: sku.to_string(),
            dept_code: "610".to_string(),
            dept_name: None,
            group_name: None,
            name: format!("Item {}", sku),
            unit: DEFAULT_UNIT.to_string(),
            mt_months: 0.0,
            base_qty: 10.0,
            base_sum: 0.0,
            price,
            base_reserve: 0.0,
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    fn row(sku: &str, price: Option<f64>) -> NormalizedRow {
        NormalizedRow {
            row_number: 2,
            sku: sku.to_string(),
            dept_code: "610".to_string(),
            dept_name: None,
            group_name: None,
            name: format!("Item {}", sku),
            unit: None,
            mt_months: 0.0,
            qty: 10.0,
            sum: 0.0,
            reserve: 0.0,
            price,
        }
    }

    fn catalog_of(items: Vec<Item>) -> HashMap<String, Item> {
        items.into_iter().map(|i| (i.sku.clone(), i)).collect()
    }

    #[test]
    fn test_new_sku_is_added() {
        let actions = plan_reconciliation(&HashMap::new(), &[row("12345678", Some(25.5))], &HashSet::new());
        assert!(matches!(actions.as_slice(), [PlannedAction::Add(r)] if r.sku == "12345678"));
    }

    #[test]
    fn test_unchanged_item_produces_nothing() {
        let catalog = catalog_of(vec![item(1, "12345678", Some(25.5), true)]);
        assert!(plan_reconciliation(&catalog, &[row("12345678", Some(25.5))], &HashSet::new()).is_empty());
    }

    #[test]
    fn test_only_changed_fields_are_updated() {
        let catalog = catalog_of(vec![item(1, "12345678", Some(25.5), true)]);
        let actions = plan_reconciliation(&catalog, &[row("12345678", Some(27.0))], &HashSet::new());
        assert_eq!(
            actions,
            vec![PlannedAction::Update {
                item_id: 1,
                sku: "12345678".to_string(),
                changes: vec![FieldChange::Price(27.0)],
            }]
        );
    }

    #[test]
    fn test_missing_price_never_clears_existing() {
        let catalog = catalog_of(vec![item(1, "12345678", Some(25.5), true)]);
        assert!(plan_reconciliation(&catalog, &[row("12345678", None)], &HashSet::new()).is_empty());
    }

    #[test]
    fn test_absent_active_items_are_deactivated_in_sku_order() {
        let catalog = catalog_of(vec![
            item(1, "BBBBBBBB", None, true),
            item(2, "AAAAAAAA", None, true),
            item(3, "CCCCCCCC", None, false),
            item(4, "12345678", None, true),
        ]);
        let actions = plan_reconciliation(&catalog, &[row("12345678", None)], &HashSet::new());
        let deactivated: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                PlannedAction::Deactivate { sku, .. } => Some(sku.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deactivated, vec!["AAAAAAAA", "BBBBBBBB"]);
    }

    #[test]
    fn test_skipped_row_keeps_item_active() {
        let catalog = catalog_of(vec![item(1, "12345678", None, true), item(2, "87654321", None, true)]);
        let skipped: HashSet<String> = ["87654321".to_string()].into_iter().collect();
        let actions = plan_reconciliation(&catalog, &[row("12345678", None)], &skipped);
        assert!(actions.is_empty(), "unexpected actions: {:?}", actions);
    }

    #[test]
    fn test_malformed_cell_records_its_sku() {
        let map = ColumnMap {
            profile_id: 1,
            profile_name: "t".to_string(),
            positions: [(LogicalField::Sku, 0), (LogicalField::Name, 1), (LogicalField::Qty, 2)]
                .into_iter()
                .collect(),
        };
        let rows = vec![
            vec!["12345678".to_string(), "Milk".to_string(), "10".to_string()],
            vec!["87654321.0".to_string(), "Kefir".to_string(), "5 pcs".to_string()],
            vec!["bad".to_string(), "Bread".to_string(), "1".to_string()],
        ];
        let mut issues = Vec::new();
        let snapshot = normalize_rows(&map, &rows, &mut issues);

        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(issues.len(), 2);
        assert_eq!(snapshot.skipped, ["87654321".to_string()].into_iter().collect());
    }

    #[test]
    fn test_reappearing_sku_is_reactivated() {
        let catalog = catalog_of(vec![item(1, "12345678", None, false)]);
        let actions = plan_reconciliation(&catalog, &[row("12345678", None)], &HashSet::new());
        assert!(matches!(
            actions.as_slice(),
            [PlannedAction::Update { changes, .. }] if changes == &vec![FieldChange::Reactivate]
        ));
    }

    #[test]
    fn test_plan_is_order_independent() {
        let catalog = catalog_of(vec![item(1, "AAAAAAAA", Some(1.0), true), item(2, "ZZZZZZZZ", None, true)]);
        let rows = vec![row("AAAAAAAA", Some(2.0)), row("11111111", None), row("22222222", None)];
        let mut reversed = rows.clone();
        reversed.reverse();

        let mut counters_a = RunCounters::default();
        let mut counters_b = RunCounters::default();
        count_actions(&plan_reconciliation(&catalog, &rows, &HashSet::new()), &mut counters_a);
        count_actions(&plan_reconciliation(&catalog, &reversed, &HashSet::new()), &mut counters_b);
        assert_eq!(counters_a, counters_b);
        assert_eq!(counters_a.items_added, 2);
        assert_eq!(counters_a.items_updated, 1);
        assert_eq!(counters_a.items_deactivated, 1);
    }

    #[test]
    fn test_duplicate_rows_are_logged_once_per_repeat() {
        let map = ColumnMap {
            profile_id: 1,
            profile_name: "t".to_string(),
            positions: [
                (LogicalField::Sku, 0),
                (LogicalField::Name, 1),
            ]
            .into_iter()
            .collect(),
        };
        let rows = vec![
            vec!["12345678".to_string(), "Milk".to_string()],
            vec!["".to_string(), "".to_string()],
            vec!["12345678".to_string(), "Milk again".to_string()],
        ];
        let mut issues = Vec::new();
        let snapshot = normalize_rows(&map, &rows, &mut issues);

        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].name, "Milk");
        assert_eq!(snapshot.rows_total, 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::DuplicateSku);
        assert_eq!(issues[0].row_number, 4);
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        assert_eq!(
            hash_bytes(b"test content"),
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }
}
