//! Scoring rules as data.
//!
//! A rule set is persisted per organization as one JSON blob in the
//! `organization_settings` table. The blob carries a row version; saves are
//! optimistic so two operators editing rules at once cannot silently
//! overwrite each other. A recompute run loads the set once and scores every
//! contact against that snapshot.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ScoreCategory;
use crate::error::CoreError;
use crate::store::SettingsStore;

/// Settings key the rule set is stored under.
pub const RULES_SETTING_KEY: &str = "scoring_rules";

/// Largest point value a single rule may carry.
pub const MAX_RULE_POINTS: i64 = 10_000;

fn check_points(rule_id: &str, points: i64) -> Result<(), CoreError> {
    if !(0..=MAX_RULE_POINTS).contains(&points) {
        return Err(CoreError::Validation(format!(
            "rule {rule_id}: points must be between 0 and {MAX_RULE_POINTS}, got {points}"
        )));
    }
    Ok(())
}

/// Category-specific predicate a rule tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuleCondition {
    /// Interaction of `interaction_type` that ended with `status`.
    InteractionStatus {
        interaction_type: String,
        status: String,
    },
    /// Interaction of `interaction_type` flowing in `direction`.
    InteractionDirection {
        interaction_type: String,
        direction: String,
    },
    CampaignActivity { activity_type: String },
    /// Last contact no more than this many days before scoring time.
    Recency { days_since_contact: i64 },
    /// Interactions plus campaign activities inside the activity window.
    Frequency { min_interactions_90days: i64 },
    Tag { tag: String },
    Events { min_events_attended: i64 },
}

impl RuleCondition {
    /// The only category this condition shape may be filed under.
    pub fn category(&self) -> ScoreCategory {
        match self {
            RuleCondition::InteractionStatus { .. }
            | RuleCondition::InteractionDirection { .. }
            | RuleCondition::CampaignActivity { .. } => ScoreCategory::Activity,
            RuleCondition::Recency { .. } => ScoreCategory::Recency,
            RuleCondition::Frequency { .. } => ScoreCategory::Frequency,
            RuleCondition::Tag { .. } => ScoreCategory::Tags,
            RuleCondition::Events { .. } => ScoreCategory::Events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: ScoreCategory,
    pub points: i64,
    pub conditions: RuleCondition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScoringRule {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        points: i64,
        conditions: RuleCondition,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            category: conditions.category(),
            points,
            conditions,
            enabled: true,
        }
    }
}

/// Ordered rules for one organization plus the settings row version they
/// were loaded at (0 when never persisted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRuleSet {
    #[serde(skip)]
    pub version: i64,
    pub rules: Vec<ScoringRule>,
}

impl Default for ScoringRuleSet {
    fn default() -> Self {
        Self {
            version: 0,
            rules: default_rules(),
        }
    }
}

impl ScoringRuleSet {
    pub fn new(rules: Vec<ScoringRule>) -> Self {
        Self { version: 0, rules }
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &ScoringRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Check ids are unique, points are within `0..=MAX_RULE_POINTS` and
    /// every rule's condition shape agrees with its category.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(CoreError::Validation("rule id must not be empty".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(CoreError::Validation(format!("duplicate rule id {}", rule.id)));
            }
            check_points(&rule.id, rule.points)?;
            let expected = rule.conditions.category();
            if rule.category != expected {
                return Err(CoreError::Validation(format!(
                    "rule {} is filed under {} but its condition is a {} condition",
                    rule.id, rule.category, expected
                )));
            }
        }
        Ok(())
    }

    pub fn rule(&self, rule_id: &str) -> Option<&ScoringRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    fn rule_mut(&mut self, rule_id: &str) -> Result<&mut ScoringRule, CoreError> {
        self.rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| CoreError::NotFound(format!("scoring rule {rule_id}")))
    }

    pub fn set_points(&mut self, rule_id: &str, points: i64) -> Result<(), CoreError> {
        check_points(rule_id, points)?;
        self.rule_mut(rule_id)?.points = points;
        Ok(())
    }

    pub fn set_enabled(&mut self, rule_id: &str, enabled: bool) -> Result<(), CoreError> {
        self.rule_mut(rule_id)?.enabled = enabled;
        Ok(())
    }
}

/// The seed rule set every organization starts with.
pub fn default_rules() -> Vec<ScoringRule> {
    use RuleCondition::*;

    vec![
        ScoringRule::new(
            "call-answered",
            "Answered call",
            "Each phone call the contact picked up",
            10,
            InteractionStatus {
                interaction_type: "call".into(),
                status: "answered".into(),
            },
        ),
        ScoringRule::new(
            "sms-reply",
            "Text reply",
            "Each inbound text message",
            5,
            InteractionDirection {
                interaction_type: "sms".into(),
                direction: "inbound".into(),
            },
        ),
        ScoringRule::new(
            "email-reply",
            "Email reply",
            "Each inbound email",
            5,
            InteractionDirection {
                interaction_type: "email".into(),
                direction: "inbound".into(),
            },
        ),
        ScoringRule::new(
            "donation",
            "Donation",
            "Each donation recorded against a campaign",
            25,
            CampaignActivity {
                activity_type: "donation".into(),
            },
        ),
        ScoringRule::new(
            "event-rsvp",
            "Event RSVP",
            "Each RSVP to a campaign event",
            10,
            CampaignActivity {
                activity_type: "event_rsvp".into(),
            },
        ),
        ScoringRule::new(
            "volunteer-shift",
            "Volunteer shift",
            "Each volunteer shift worked",
            15,
            CampaignActivity {
                activity_type: "volunteer_shift".into(),
            },
        ),
        ScoringRule::new(
            "contacted-this-week",
            "Contacted this week",
            "Last contact within 7 days",
            15,
            Recency {
                days_since_contact: 7,
            },
        ),
        ScoringRule::new(
            "contacted-this-month",
            "Contacted this month",
            "Last contact within 30 days",
            5,
            Recency {
                days_since_contact: 30,
            },
        ),
        ScoringRule::new(
            "regular-contact",
            "Regular contact",
            "At least 5 touches in the last 90 days",
            10,
            Frequency {
                min_interactions_90days: 5,
            },
        ),
        ScoringRule::new(
            "frequent-contact",
            "Frequent contact",
            "At least 15 touches in the last 90 days",
            20,
            Frequency {
                min_interactions_90days: 15,
            },
        ),
        ScoringRule::new(
            "organizer-tag",
            "Organizer",
            "Tagged as an organizer",
            30,
            Tag {
                tag: "organizer".into(),
            },
        ),
        ScoringRule::new(
            "donor-tag",
            "Donor",
            "Tagged as a donor",
            25,
            Tag {
                tag: "donor".into(),
            },
        ),
        ScoringRule::new(
            "event-goer",
            "Event goer",
            "Attended at least 3 events",
            20,
            Events {
                min_events_attended: 3,
            },
        ),
        ScoringRule::new(
            "event-regular",
            "Event regular",
            "Attended at least 10 events",
            30,
            Events {
                min_events_attended: 10,
            },
        ),
    ]
}

fn decode_rule_set(value: serde_json::Value, version: i64) -> Result<ScoringRuleSet, CoreError> {
    let mut set: ScoringRuleSet = serde_json::from_value(value)
        .map_err(|e| CoreError::Validation(format!("stored scoring rules are unreadable: {e}")))?;
    set.version = version;
    set.validate()?;
    Ok(set)
}

/// Load an organization's rule set, seeding the defaults on first use.
pub async fn load_rule_set(
    settings: &dyn SettingsStore,
    organization_id: &str,
) -> Result<ScoringRuleSet, CoreError> {
    if let Some(row) = settings
        .load_setting(organization_id, RULES_SETTING_KEY)
        .await?
    {
        return decode_rule_set(row.value, row.version);
    }

    let mut seeded = ScoringRuleSet::default();
    match save_rule_set(settings, organization_id, &mut seeded).await {
        Ok(()) => {
            log::info!(
                "Scoring: seeded {} default rules for {}",
                seeded.rules.len(),
                organization_id
            );
            Ok(seeded)
        }
        // Someone else seeded first; use theirs.
        Err(CoreError::Conflict(_)) => {
            let row = settings
                .load_setting(organization_id, RULES_SETTING_KEY)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("scoring rules for {organization_id}")))?;
            decode_rule_set(row.value, row.version)
        }
        Err(e) => Err(e),
    }
}

/// Persist the whole set atomically. Fails with `Conflict` if the stored
/// set changed since `set` was loaded; on success `set.version` is advanced.
pub async fn save_rule_set(
    settings: &dyn SettingsStore,
    organization_id: &str,
    set: &mut ScoringRuleSet,
) -> Result<(), CoreError> {
    set.validate()?;
    let value = serde_json::to_value(&*set)
        .map_err(|e| CoreError::Validation(format!("scoring rules do not serialize: {e}")))?;
    let expected = (set.version > 0).then_some(set.version);
    set.version = settings
        .save_setting(organization_id, RULES_SETTING_KEY, value, expected)
        .await?;
    Ok(())
}

/// Replace the stored set with the defaults, keeping the version chain.
pub async fn reset_rule_set(
    settings: &dyn SettingsStore,
    organization_id: &str,
) -> Result<ScoringRuleSet, CoreError> {
    let current = settings
        .load_setting(organization_id, RULES_SETTING_KEY)
        .await?;
    let mut set = ScoringRuleSet {
        version: current.map(|row| row.version).unwrap_or(0),
        rules: default_rules(),
    };
    save_rule_set(settings, organization_id, &mut set).await?;
    log::info!("Scoring: reset rules to defaults for {}", organization_id);
    Ok(set)
}
