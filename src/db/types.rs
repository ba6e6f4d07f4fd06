//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Failed to encode column value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Row not found: {0}")]
    NotFound(String),

    /// A write would leave dependent rows pointing at a deleted record.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// A row changed underneath an optimistic write.
    #[error("Version conflict: {0}")]
    Conflict(String),
}

/// A row from the `event_participants` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbEventParticipant {
    pub event_id: String,
    pub contact_id: String,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}

/// A row from the `assignments` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAssignment {
    pub id: String,
    pub contact_id: String,
    pub assignee_id: String,
    pub pathway_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

/// A row from `organization_settings`. `value` is an opaque JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSetting {
    pub organization_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Number of dependent rows that still point at a contact id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceCounts {
    pub interactions: i64,
    pub campaign_activities: i64,
    pub event_participants: i64,
    pub assignments: i64,
}

impl ReferenceCounts {
    pub fn total(&self) -> i64 {
        self.interactions + self.campaign_activities + self.event_participants + self.assignments
    }
}
