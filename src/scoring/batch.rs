//! Organization-wide score recompute.
//!
//! Contacts are read one page at a time. Each page is scored concurrently in
//! a `JoinSet` (the page size bounds parallelism) and pages run one after
//! another. A contact that errors, panics or exceeds its timeout is counted
//! as a failure and the run moves on. Cancellation is checked between pages,
//! so an in-flight page always finishes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::rules::ScoringRuleSet;
use super::score_and_save;
use crate::config::{Config, MAX_BATCH_SIZE};
use crate::error::CoreError;
use crate::store::ContactStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeOptions {
    pub batch_size: usize,
    pub contact_timeout: Duration,
}

impl Default for RecomputeOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RecomputeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            contact_timeout: config.contact_timeout(),
        }
    }
}

/// Aggregate outcome of one recompute run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    /// Correlates the run's log lines.
    pub run_id: String,
    pub organization_id: String,
    /// Settings version of the rule set the run scored against.
    pub rules_version: i64,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_contact_ids: Vec<String>,
    pub batch_sizes: Vec<usize>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RecomputeSummary {
    /// Turn a degraded run into `PartialFailure` for callers that want an error.
    pub fn ensure_complete(&self) -> Result<(), CoreError> {
        if self.failed > 0 {
            return Err(CoreError::PartialFailure {
                failed: self.failed,
                total: self.total,
            });
        }
        Ok(())
    }
}

/// Recompute every contact's score in `organization_id` against one rule
/// set snapshot.
///
/// Only a failure to read a page aborts the run; per-contact failures are
/// reported in the summary.
pub async fn run_batch_recompute(
    store: Arc<dyn ContactStore>,
    organization_id: &str,
    rules: Arc<ScoringRuleSet>,
    as_of: DateTime<Utc>,
    options: RecomputeOptions,
    cancel: &CancellationToken,
) -> Result<RecomputeSummary, CoreError> {
    if options.batch_size == 0 || options.batch_size > MAX_BATCH_SIZE {
        return Err(CoreError::Validation(format!(
            "batch size must be between 1 and {MAX_BATCH_SIZE}, got {}",
            options.batch_size
        )));
    }

    let started = Instant::now();
    let mut summary = RecomputeSummary {
        run_id: Uuid::new_v4().to_string(),
        organization_id: organization_id.to_string(),
        rules_version: rules.version,
        ..Default::default()
    };
    let mut offset = 0usize;

    log::info!(
        "Recompute: run {} starting for {} (batch size {}, rules v{})",
        summary.run_id,
        organization_id,
        options.batch_size,
        rules.version
    );

    loop {
        if cancel.is_cancelled() {
            log::info!(
                "Recompute: cancelled for {} after {} contacts",
                organization_id,
                summary.total
            );
            summary.cancelled = true;
            break;
        }

        let page = store
            .contacts_page(organization_id, offset, options.batch_size)
            .await?;
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        let batch_number = summary.batch_sizes.len() + 1;

        let mut pending: BTreeSet<String> = page.iter().map(|c| c.id.clone()).collect();
        let mut tasks = JoinSet::new();
        for contact in page {
            let store = Arc::clone(&store);
            let rules = Arc::clone(&rules);
            let org = organization_id.to_string();
            let timeout = options.contact_timeout;
            tasks.spawn(async move {
                let outcome = tokio::time::timeout(
                    timeout,
                    score_and_save(store.as_ref(), &org, &contact, &rules, as_of),
                )
                .await;
                (contact.id, outcome)
            });
        }

        let mut batch_failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((contact_id, Ok(Ok(_)))) => {
                    pending.remove(&contact_id);
                    summary.succeeded += 1;
                }
                Ok((contact_id, Ok(Err(e)))) => {
                    log::warn!("Recompute: contact {} failed: {}", contact_id, e);
                    pending.remove(&contact_id);
                    summary.failed_contact_ids.push(contact_id);
                    batch_failed += 1;
                }
                Ok((contact_id, Err(_))) => {
                    log::warn!(
                        "Recompute: contact {} timed out after {:?}",
                        contact_id,
                        options.contact_timeout
                    );
                    pending.remove(&contact_id);
                    summary.failed_contact_ids.push(contact_id);
                    batch_failed += 1;
                }
                Err(join_err) => {
                    // The id is recovered from `pending` once the set drains.
                    log::warn!("Recompute: scoring task aborted: {}", join_err);
                }
            }
        }
        // Anything still pending panicked or was aborted.
        batch_failed += pending.len();
        summary.failed_contact_ids.extend(pending);

        summary.failed += batch_failed;
        summary.total += page_len;
        summary.batch_sizes.push(page_len);
        log::info!(
            "Recompute: batch {} done ({} contacts, {} failed)",
            batch_number,
            page_len,
            batch_failed
        );

        if page_len < options.batch_size {
            break;
        }
        offset += page_len;
    }

    summary.failed_contact_ids.sort();
    summary.duration_ms = started.elapsed().as_millis() as u64;
    log::info!(
        "Recompute: run {} finished for {}: {} scored, {} failed in {}ms",
        summary.run_id,
        organization_id,
        summary.succeeded,
        summary.failed,
        summary.duration_ms
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::db::{test_utils::test_db, ReferenceCounts};
    use crate::error::StoreError;
    use crate::merge::MergePlan;
    use crate::scoring::ContactScore;
    use crate::store::SqliteStore;
    use crate::types::{ActivitySnapshot, Contact, Interaction};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn contact_id(n: usize) -> String {
        format!("c{n:03}")
    }

    /// `count` contacts created a minute apart. Even ones carry the donor
    /// tag, every third one has an answered call.
    fn seeded_store(count: usize) -> SqliteStore {
        let store = SqliteStore::new(test_db(), Duration::from_secs(5));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .with_db(|db| {
                for n in 0..count {
                    let created = base + chrono::Duration::minutes(n as i64);
                    let mut c = Contact::new(contact_id(n), "org-1", format!("Person {n}"), created);
                    if n % 2 == 0 {
                        c.tags.insert("donor".to_string());
                    }
                    db.insert_contact(&c)?;
                    if n % 3 == 0 {
                        db.insert_interaction(&Interaction {
                            id: format!("i{n}"),
                            contact_id: contact_id(n),
                            interaction_type: "call".to_string(),
                            status: Some("answered".to_string()),
                            direction: None,
                            occurred_at: as_of() - chrono::Duration::days(3),
                        })?;
                    }
                }
                Ok::<(), crate::db::DbError>(())
            })
            .expect("seed");
        store
    }

    enum Fault {
        SaveError,
        Panic,
        Hang,
    }

    /// Delegating store that misbehaves for one contact id.
    struct FaultyStore {
        inner: SqliteStore,
        target: String,
        fault: Fault,
        cancel_on_page: Option<CancellationToken>,
    }

    impl FaultyStore {
        fn new(inner: SqliteStore, target: &str, fault: Fault) -> Self {
            Self {
                inner,
                target: target.to_string(),
                fault,
                cancel_on_page: None,
            }
        }
    }

    #[async_trait]
    impl ContactStore for FaultyStore {
        async fn list_contacts(&self, org: &str) -> Result<Vec<Contact>, StoreError> {
            self.inner.list_contacts(org).await
        }

        async fn get_contact(&self, org: &str, id: &str) -> Result<Option<Contact>, StoreError> {
            self.inner.get_contact(org, id).await
        }

        async fn contacts_page(
            &self,
            org: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Contact>, StoreError> {
            if let Some(token) = &self.cancel_on_page {
                token.cancel();
            }
            self.inner.contacts_page(org, offset, limit).await
        }

        async fn activity_since(
            &self,
            org: &str,
            id: &str,
            since: DateTime<Utc>,
        ) -> Result<ActivitySnapshot, StoreError> {
            if id == self.target {
                match self.fault {
                    Fault::Panic => panic!("injected panic for {id}"),
                    Fault::Hang => tokio::time::sleep(Duration::from_secs(60)).await,
                    Fault::SaveError => {}
                }
            }
            self.inner.activity_since(org, id, since).await
        }

        async fn save_score(&self, org: &str, score: &ContactScore) -> Result<(), StoreError> {
            if score.contact_id == self.target && matches!(self.fault, Fault::SaveError) {
                return Err(StoreError::Task("injected write failure".to_string()));
            }
            self.inner.save_score(org, score).await
        }

        async fn commit_merge(&self, plan: &MergePlan) -> Result<(), StoreError> {
            self.inner.commit_merge(plan).await
        }

        async fn count_references(&self, id: &str) -> Result<ReferenceCounts, StoreError> {
            self.inner.count_references(id).await
        }
    }

    async fn run(store: Arc<dyn ContactStore>, options: RecomputeOptions) -> RecomputeSummary {
        run_batch_recompute(
            store,
            "org-1",
            Arc::new(ScoringRuleSet::default()),
            as_of(),
            options,
            &CancellationToken::new(),
        )
        .await
        .expect("run")
    }

    #[tokio::test]
    async fn test_failure_in_second_batch_does_not_stop_third() {
        let inner = seeded_store(120);
        let failing = contact_id(60);
        let store = Arc::new(FaultyStore::new(inner.clone(), &failing, Fault::SaveError));

        let summary = run(store, RecomputeOptions::default()).await;
        assert_eq!(summary.batch_sizes, vec![50, 50, 20]);
        assert_eq!(summary.total, 120);
        assert_eq!(summary.succeeded, 119);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_contact_ids, vec![failing]);
        assert!(matches!(
            summary.ensure_complete(),
            Err(CoreError::PartialFailure { failed: 1, total: 120 })
        ));

        let last = inner
            .get_contact("org-1", &contact_id(119))
            .await
            .expect("get")
            .expect("exists");
        assert!(last.score.is_some(), "batch 3 was scored");
    }

    #[tokio::test]
    async fn test_rerun_reproduces_identical_scores() {
        let store = seeded_store(30);
        let shared: Arc<dyn ContactStore> = Arc::new(store.clone());

        let first = run(Arc::clone(&shared), RecomputeOptions::default()).await;
        first.ensure_complete().expect("clean run");
        let before: Vec<_> = store
            .list_contacts("org-1")
            .await
            .expect("list")
            .into_iter()
            .map(|c| c.score)
            .collect();

        run(shared, RecomputeOptions::default()).await;
        let after: Vec<_> = store
            .list_contacts("org-1")
            .await
            .expect("list")
            .into_iter()
            .map(|c| c.score)
            .collect();

        assert_eq!(before, after);
        assert!(before.iter().all(Option::is_some));
        // c000: donor tag plus one answered call
        assert_eq!(before[0].as_ref().map(|s| s.total_score), Some(35));
    }

    #[tokio::test]
    async fn test_panicking_contact_counts_as_failure() {
        let store = Arc::new(FaultyStore::new(seeded_store(10), &contact_id(4), Fault::Panic));
        let summary = run(store, RecomputeOptions::default()).await;
        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.failed_contact_ids, vec![contact_id(4)]);
    }

    #[tokio::test]
    async fn test_stuck_contact_times_out() {
        let store = Arc::new(FaultyStore::new(seeded_store(5), &contact_id(2), Fault::Hang));
        let options = RecomputeOptions {
            batch_size: 5,
            contact_timeout: Duration::from_millis(100),
        };
        let summary = run(store, options).await;
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_contact_ids, vec![contact_id(2)]);
    }

    #[tokio::test]
    async fn test_cancellation_lets_current_batch_finish() {
        let cancel = CancellationToken::new();
        let mut faulty = FaultyStore::new(seeded_store(25), "none", Fault::SaveError);
        faulty.cancel_on_page = Some(cancel.clone());
        let options = RecomputeOptions {
            batch_size: 10,
            contact_timeout: Duration::from_secs(5),
        };

        let summary = run_batch_recompute(
            Arc::new(faulty),
            "org-1",
            Arc::new(ScoringRuleSet::default()),
            as_of(),
            options,
            &cancel,
        )
        .await
        .expect("run");

        assert!(summary.cancelled);
        assert_eq!(summary.batch_sizes, vec![10]);
        assert_eq!(summary.succeeded, 10);
    }

    #[tokio::test]
    async fn test_invalid_batch_size_rejected() {
        let options = RecomputeOptions {
            batch_size: 0,
            contact_timeout: Duration::from_secs(1),
        };
        let err = run_batch_recompute(
            Arc::new(seeded_store(1)),
            "org-1",
            Arc::new(ScoringRuleSet::default()),
            as_of(),
            options,
            &CancellationToken::new(),
        )
        .await
        .expect_err("invalid");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_organization_is_a_clean_run() {
        let summary = run(Arc::new(seeded_store(0)), RecomputeOptions::default()).await;
        assert_eq!(summary.total, 0);
        assert!(summary.batch_sizes.is_empty());
        summary.ensure_complete().expect("nothing failed");
    }
}
