//! Contact engagement scoring.
//!
//! - `rules`: the per-organization rule set and its persistence
//! - `calculator`: pure score calculation for one contact
//! - `level`: total score to engagement level
//! - `batch`: paged, bounded-concurrency recompute for a whole organization

pub mod batch;
pub mod calculator;
pub mod level;
pub mod rules;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::store::ContactStore;
use crate::types::Contact;

pub use batch::{run_batch_recompute, RecomputeOptions, RecomputeSummary};
pub use calculator::{activity_window_start, calculate_score, ACTIVITY_WINDOW_DAYS};
pub use level::EngagementLevel;
pub use rules::{
    default_rules, load_rule_set, reset_rule_set, save_rule_set, RuleCondition, ScoringRule,
    ScoringRuleSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreCategory {
    Activity,
    Recency,
    Frequency,
    Tags,
    Events,
}

impl ScoreCategory {
    pub const ALL: [ScoreCategory; 5] = [
        ScoreCategory::Activity,
        ScoreCategory::Recency,
        ScoreCategory::Frequency,
        ScoreCategory::Tags,
        ScoreCategory::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreCategory::Activity => "activity",
            ScoreCategory::Recency => "recency",
            ScoreCategory::Frequency => "frequency",
            ScoreCategory::Tags => "tags",
            ScoreCategory::Events => "events",
        }
    }
}

impl std::fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed engagement score. `total_score` always equals the sum of
/// `category_scores`, which always holds all five categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactScore {
    pub contact_id: String,
    pub total_score: i64,
    pub category_scores: BTreeMap<ScoreCategory, i64>,
    pub level: EngagementLevel,
    pub last_calculated: DateTime<Utc>,
}

impl ContactScore {
    /// A zero score with every category present.
    pub fn empty(contact_id: impl Into<String>, last_calculated: DateTime<Utc>) -> Self {
        Self {
            contact_id: contact_id.into(),
            total_score: 0,
            category_scores: ScoreCategory::ALL.iter().map(|c| (*c, 0)).collect(),
            level: EngagementLevel::classify(0),
            last_calculated,
        }
    }

    /// Add points to one category, keeping the total and level in step.
    /// Sums saturate at the `i64` bounds.
    pub fn add(&mut self, category: ScoreCategory, points: i64) {
        let slot = self.category_scores.entry(category).or_insert(0);
        *slot = slot.saturating_add(points);
        self.total_score = self
            .category_scores
            .values()
            .fold(0i64, |acc, v| acc.saturating_add(*v));
        self.level = EngagementLevel::classify(self.total_score);
    }
}

/// Read a contact's activity window, score it and write the score back.
pub(crate) async fn score_and_save(
    store: &dyn ContactStore,
    organization_id: &str,
    contact: &Contact,
    rules: &ScoringRuleSet,
    as_of: DateTime<Utc>,
) -> Result<ContactScore, CoreError> {
    let snapshot = store
        .activity_since(organization_id, &contact.id, activity_window_start(as_of))
        .await?;
    let score = calculate_score(contact, rules, &snapshot, as_of);
    store.save_score(organization_id, &score).await?;
    Ok(score)
}

/// On-demand recompute for a single contact.
pub async fn recompute_contact(
    store: &dyn ContactStore,
    organization_id: &str,
    contact_id: &str,
    rules: &ScoringRuleSet,
    as_of: DateTime<Utc>,
) -> Result<ContactScore, CoreError> {
    let contact = store
        .get_contact(organization_id, contact_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("contact {contact_id}")))?;
    let score = score_and_save(store, organization_id, &contact, rules, as_of).await?;
    log::debug!(
        "Scoring: {} scored {} ({})",
        contact_id,
        score.total_score,
        score.level
    );
    Ok(score)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::store::SqliteStore;
    use crate::types::Interaction;

    #[test]
    fn test_empty_score_has_every_category() {
        let score = ContactScore::empty("c1", Utc::now());
        assert_eq!(score.category_scores.len(), 5);
        assert_eq!(score.total_score, 0);
        assert_eq!(score.level, EngagementLevel::Inactive);
    }

    #[test]
    fn test_add_keeps_total_and_level_in_step() {
        let mut score = ContactScore::empty("c1", Utc::now());
        score.add(ScoreCategory::Activity, 20);
        score.add(ScoreCategory::Tags, 30);
        assert_eq!(score.total_score, 50);
        assert_eq!(score.level, EngagementLevel::High);
    }

    #[test]
    fn test_add_saturates_instead_of_overflowing() {
        let mut score = ContactScore::empty("c1", Utc::now());
        score.add(ScoreCategory::Tags, i64::MAX);
        score.add(ScoreCategory::Tags, i64::MAX);
        score.add(ScoreCategory::Events, i64::MAX);
        assert_eq!(score.category_scores[&ScoreCategory::Tags], i64::MAX);
        assert_eq!(score.total_score, i64::MAX);
        assert_eq!(score.level, EngagementLevel::Champion);
    }

    #[test]
    fn test_score_payload_uses_category_names() {
        let score = ContactScore::empty("c1", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let json = serde_json::to_value(&score).expect("serialize");
        assert_eq!(json["categoryScores"]["frequency"], 0);
        assert_eq!(json["level"], "inactive");
        let back: ContactScore = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, score);
    }

    #[tokio::test]
    async fn test_recompute_contact_persists_score() {
        let store = SqliteStore::new(test_db(), Duration::from_secs(5));
        let as_of = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        store
            .with_db(|db| {
                let mut c = Contact::new("c1", "org-1", "Ann Lee", as_of - chrono::Duration::days(30));
                c.tags.insert("organizer".to_string());
                db.insert_contact(&c)?;
                db.insert_interaction(&Interaction {
                    id: "i1".to_string(),
                    contact_id: "c1".to_string(),
                    interaction_type: "call".to_string(),
                    status: Some("answered".to_string()),
                    direction: None,
                    occurred_at: as_of - chrono::Duration::days(2),
                })
            })
            .expect("seed");

        let rules = ScoringRuleSet::default();
        let score = recompute_contact(&store, "org-1", "c1", &rules, as_of)
            .await
            .expect("recompute");
        assert_eq!(score.total_score, 40);

        let stored = store
            .get_contact("org-1", "c1")
            .await
            .expect("get")
            .and_then(|c| c.score)
            .expect("score persisted");
        assert_eq!(stored, score);
    }

    #[tokio::test]
    async fn test_recompute_missing_contact_is_not_found() {
        let store = SqliteStore::new(test_db(), Duration::from_secs(5));
        let err = recompute_contact(&store, "org-1", "ghost", &ScoringRuleSet::default(), Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
