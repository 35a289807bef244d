//! Snapshot import: profile resolution, row normalization, reconciliation

pub mod engine;
pub mod normalize;
pub mod profile;
pub mod runs;

pub use engine::{
    hash_bytes, plan_reconciliation, FieldChange, ImportRequest, ImportSource, PlannedAction,
    ReconciliationEngine, RunSummary,
};
pub use normalize::{normalize_row, IssueKind, NormalizedRow, RowIssue, RowOutcome};
pub use profile::{ColumnMap, ImportColumn, ImportProfile, LogicalField};
pub use runs::{ImportRun, LogEntry, RunCounters, RunMode, RunStatus};
