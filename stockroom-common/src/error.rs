//! Common error types for the stockroom core
//!
//! Row-level anomalies found during reconciliation are not errors; they are
//! recorded as [`crate::import::RowIssue`] entries in the run log. Everything
//! here is either a run-level failure or a workflow rejection returned
//! synchronously to the caller.

use thiserror::Error;

/// Common result type for stockroom operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the stockroom crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// No import profile matched the file and none was given explicitly
    #[error("No import profile matches '{0}'")]
    ProfileNotFound(String),

    /// Several profiles match the file name equally well
    #[error("Ambiguous import profile for '{file_name}': {candidates:?}")]
    AmbiguousProfile {
        file_name: String,
        candidates: Vec<String>,
    },

    /// The resolved profile does not locate a required logical field in the headers
    #[error("Required column for '{0}' not found in file headers")]
    MissingColumn(String),

    /// The snapshot contains no valid rows at all
    #[error("Snapshot has no valid rows ({0} rows rejected)")]
    EmptySnapshot(usize),

    /// Another process has a reconciliation run in flight
    #[error("Reconciliation run {0} is still in progress")]
    RunInProgress(i64),

    /// Reconciliation run exceeded its time bound and was rolled back
    #[error("Reconciliation run {0} timed out")]
    RunTimedOut(i64),

    /// An active list already exists for this user and department
    #[error("User {user_id} already has active list {list_id} for department {dept_code}")]
    DuplicateActiveList {
        user_id: i64,
        dept_code: String,
        list_id: i64,
    },

    /// State transition not permitted by the list or line automaton
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// List is not active, so its lines cannot change
    #[error("List {0} is not editable")]
    ListNotEditable(i64),

    /// Comment text exceeds the character cap
    #[error("Comment too long: {len} characters (max {max})")]
    CommentTooLong { len: usize, max: usize },

    /// Quantity fields never go below zero
    #[error("Negative quantity for {field}: {value}")]
    NegativeQuantity { field: &'static str, value: f64 },

    /// Caller's role does not allow the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl Error {
    /// True for errors caused by caller input rather than storage or runtime failure
    pub fn is_workflow(&self) -> bool {
        matches!(
            self,
            Error::DuplicateActiveList { .. }
                | Error::InvalidTransition { .. }
                | Error::ListNotEditable(_)
                | Error::CommentTooLong { .. }
                | Error::NegativeQuantity { .. }
                | Error::PermissionDenied(_)
                | Error::InvalidInput(_)
        )
    }
}
