//! Async store boundary used by the engines.
//!
//! `ContactStore` and `SettingsStore` are the seams the engines depend on;
//! `SqliteStore` implements both over a single `ContactDb` connection.
//! Blocking SQLite work runs on the blocking pool and every read is bounded
//! by a timeout so a stuck query can never hang a recompute run.
//!
//! All calls share one connection behind a mutex, so store work is
//! serialized even when callers fan out. The per-call timeout includes the
//! time spent waiting for that mutex; `store_timeout_secs` must cover a full
//! batch's worth of queued calls, which the defaults (10s per call, 50
//! contacts per batch) do for local SQLite.
//!
//! Merge commits are the exception to the timeout: the transaction keeps
//! running on the blocking pool after a timeout fires, so `commit_merge`
//! always waits for the real outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::db::{ContactDb, DbSetting, ReferenceCounts};
use crate::error::StoreError;
use crate::merge::MergePlan;
use crate::scoring::ContactScore;
use crate::types::{ActivitySnapshot, Contact};

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Every contact in the organization, creation order.
    async fn list_contacts(&self, organization_id: &str) -> Result<Vec<Contact>, StoreError>;

    async fn get_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Contact>, StoreError>;

    /// One page of contacts, same order as `list_contacts`.
    async fn contacts_page(
        &self,
        organization_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError>;

    /// Interactions and campaign activity at or after `since`.
    async fn activity_since(
        &self,
        organization_id: &str,
        contact_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ActivitySnapshot, StoreError>;

    async fn save_score(
        &self,
        organization_id: &str,
        score: &ContactScore,
    ) -> Result<(), StoreError>;

    /// Apply a merge plan atomically and report its real outcome. Failures
    /// name the step that failed. Implementations must not give up on a
    /// commit that may still land.
    async fn commit_merge(&self, plan: &MergePlan) -> Result<(), StoreError>;

    async fn count_references(&self, contact_id: &str) -> Result<ReferenceCounts, StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_setting(
        &self,
        organization_id: &str,
        key: &str,
    ) -> Result<Option<DbSetting>, StoreError>;

    /// Optimistic write; see `ContactDb::put_setting` for version semantics.
    async fn save_setting(
        &self,
        organization_id: &str,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError>;
}

/// SQLite-backed implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<ContactDb>>,
    timeout: Duration,
}

impl SqliteStore {
    pub fn new(db: ContactDb, timeout: Duration) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            timeout,
        }
    }

    /// Run synchronous work against the connection (used by intake paths and tests).
    pub fn with_db<T>(&self, f: impl FnOnce(&ContactDb) -> T) -> T {
        let guard = self.db.lock();
        f(&guard)
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&ContactDb) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let task = tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            f(&guard)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Task(format!("{op}: {join_err}"))),
            Err(_) => {
                log::warn!("Store: {} timed out after {:?}", op, self.timeout);
                Err(StoreError::Timeout {
                    op,
                    after: self.timeout,
                })
            }
        }
    }

    /// Like `run`, but never abandons the blocking work. Past the timeout it
    /// logs and keeps waiting, so the result always reflects what was written.
    async fn run_to_completion<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&ContactDb) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            f(&guard)
        });

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!(
                    "Store: {} still running after {:?}, waiting for it to finish",
                    op,
                    self.timeout
                );
                task.await
            }
        };
        joined.unwrap_or_else(|join_err| Err(StoreError::Task(format!("{op}: {join_err}"))))
    }
}

#[async_trait]
impl ContactStore for SqliteStore {
    async fn list_contacts(&self, organization_id: &str) -> Result<Vec<Contact>, StoreError> {
        let org = organization_id.to_string();
        self.run("list_contacts", move |db| Ok(db.list_contacts(&org)?))
            .await
    }

    async fn get_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let org = organization_id.to_string();
        let id = contact_id.to_string();
        self.run("get_contact", move |db| Ok(db.get_contact(&org, &id)?))
            .await
    }

    async fn contacts_page(
        &self,
        organization_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Contact>, StoreError> {
        let org = organization_id.to_string();
        self.run("contacts_page", move |db| {
            Ok(db.contacts_page(&org, offset, limit)?)
        })
        .await
    }

    async fn activity_since(
        &self,
        organization_id: &str,
        contact_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ActivitySnapshot, StoreError> {
        let org = organization_id.to_string();
        let id = contact_id.to_string();
        self.run("activity_since", move |db| {
            Ok(db.activity_since(&org, &id, &since)?)
        })
        .await
    }

    async fn save_score(
        &self,
        organization_id: &str,
        score: &ContactScore,
    ) -> Result<(), StoreError> {
        let org = organization_id.to_string();
        let score = score.clone();
        self.run("save_score", move |db| {
            Ok(db.save_contact_score(&org, &score)?)
        })
        .await
    }

    async fn commit_merge(&self, plan: &MergePlan) -> Result<(), StoreError> {
        let plan = plan.clone();
        self.run_to_completion("commit_merge", move |db| {
            db.commit_merge(&plan).map_err(|e| StoreError::MergeStep {
                step: e.step,
                source: e.error,
            })
        })
        .await
    }

    async fn count_references(&self, contact_id: &str) -> Result<ReferenceCounts, StoreError> {
        let id = contact_id.to_string();
        self.run("count_references", move |db| Ok(db.count_references(&id)?))
            .await
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn load_setting(
        &self,
        organization_id: &str,
        key: &str,
    ) -> Result<Option<DbSetting>, StoreError> {
        let org = organization_id.to_string();
        let key = key.to_string();
        self.run("load_setting", move |db| Ok(db.get_setting(&org, &key)?))
            .await
    }

    async fn save_setting(
        &self,
        organization_id: &str,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError> {
        let org = organization_id.to_string();
        let key = key.to_string();
        self.run("save_setting", move |db| {
            Ok(db.put_setting(&org, &key, &value, expected_version)?)
        })
        .await
    }
}
