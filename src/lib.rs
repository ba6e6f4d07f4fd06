//! Contact identity resolution and engagement scoring.
//!
//! - `matching` finds duplicate contact groups inside an organization
//! - `merge` folds a duplicate group into one primary contact
//! - `scoring` computes engagement scores and recomputes them in batches
//! - `store` is the async persistence boundary, backed by `db`

pub mod config;
pub mod db;
pub mod error;
pub mod matching;
pub mod merge;
mod migrations;
pub mod scoring;
pub mod store;
pub mod types;

pub use error::{CoreError, ErrorReport, StoreError};
pub use store::{ContactStore, SettingsStore, SqliteStore};
