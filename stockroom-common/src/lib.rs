//! # Stockroom Core Library
//!
//! Catalog and procurement-list core shared by the stockroom front ends:
//! - Catalog store and queries
//! - Snapshot import: profiles, row normalization, reconciliation runs
//! - Per-user, per-department procurement lists and the stagnation carousel
//! - Photo and comment attachments
//! - Database initialization, migrations and settings
//! - Configuration loading

pub mod attachments;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod lists;
pub mod users;

pub use error::{Error, Result};
