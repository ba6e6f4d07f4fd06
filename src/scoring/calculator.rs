//! Pure engagement score calculation.
//!
//! Activity rules are multiplicative: every matching interaction or campaign
//! activity inside the window adds the rule's points again. Recency,
//! frequency, tag and event rules are binary and add their points at most
//! once. Nothing here reads a clock; `as_of` is the scoring instant.

use chrono::{DateTime, Duration, Utc};

use super::rules::{RuleCondition, ScoringRule, ScoringRuleSet};
use super::ContactScore;
use crate::types::{ActivitySnapshot, Contact};

/// Trailing window for activity and frequency rules.
pub const ACTIVITY_WINDOW_DAYS: i64 = 90;

/// Earliest timestamp that still counts toward a score taken at `as_of`.
pub fn activity_window_start(as_of: DateTime<Utc>) -> DateTime<Utc> {
    as_of - Duration::days(ACTIVITY_WINDOW_DAYS)
}

fn in_window(ts: &DateTime<Utc>, start: &DateTime<Utc>, as_of: &DateTime<Utc>) -> bool {
    ts >= start && ts <= as_of
}

fn field_matches(actual: Option<&str>, expected: &str) -> bool {
    actual.is_some_and(|a| a.eq_ignore_ascii_case(expected))
}

/// Score one contact against the enabled rules of `rules`.
pub fn calculate_score(
    contact: &Contact,
    rules: &ScoringRuleSet,
    snapshot: &ActivitySnapshot,
    as_of: DateTime<Utc>,
) -> ContactScore {
    let start = activity_window_start(as_of);
    let interactions: Vec<_> = snapshot
        .interactions
        .iter()
        .filter(|i| i.contact_id == contact.id && in_window(&i.occurred_at, &start, &as_of))
        .collect();
    let activities: Vec<_> = snapshot
        .activities
        .iter()
        .filter(|a| a.contact_id == contact.id && in_window(&a.occurred_at, &start, &as_of))
        .collect();
    let touches = (interactions.len() + activities.len()) as i64;

    let mut score = ContactScore::empty(contact.id.clone(), as_of);

    for rule in rules.enabled_rules() {
        let multiplier = match &rule.conditions {
            RuleCondition::InteractionStatus {
                interaction_type,
                status,
            } => interactions
                .iter()
                .filter(|i| {
                    i.interaction_type.eq_ignore_ascii_case(interaction_type)
                        && field_matches(i.status.as_deref(), status)
                })
                .count() as i64,
            RuleCondition::InteractionDirection {
                interaction_type,
                direction,
            } => interactions
                .iter()
                .filter(|i| {
                    i.interaction_type.eq_ignore_ascii_case(interaction_type)
                        && field_matches(i.direction.as_deref(), direction)
                })
                .count() as i64,
            RuleCondition::CampaignActivity { activity_type } => activities
                .iter()
                .filter(|a| a.activity_type.eq_ignore_ascii_case(activity_type))
                .count() as i64,
            other => i64::from(binary_condition_met(other, contact, touches, as_of)),
        };

        if multiplier > 0 {
            apply(&mut score, rule, multiplier);
        }
    }

    score
}

fn binary_condition_met(
    condition: &RuleCondition,
    contact: &Contact,
    touches: i64,
    as_of: DateTime<Utc>,
) -> bool {
    match condition {
        RuleCondition::Recency { days_since_contact } => contact
            .last_contact_date
            .is_some_and(|last| (as_of - last).num_days() <= *days_since_contact),
        RuleCondition::Frequency {
            min_interactions_90days,
        } => touches >= *min_interactions_90days,
        RuleCondition::Tag { tag } => contact.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
        RuleCondition::Events {
            min_events_attended,
        } => contact.total_events_attended >= *min_events_attended,
        RuleCondition::InteractionStatus { .. }
        | RuleCondition::InteractionDirection { .. }
        | RuleCondition::CampaignActivity { .. } => false,
    }
}

fn apply(score: &mut ContactScore, rule: &ScoringRule, multiplier: i64) {
    score.add(rule.category, rule.points.saturating_mul(multiplier));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::scoring::{EngagementLevel, ScoreCategory};
    use crate::types::{CampaignActivity, Interaction};

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn contact() -> Contact {
        Contact::new("c1", "org-1", "Dana Cruz", as_of() - Duration::days(400))
    }

    fn call(id: &str, status: &str, days_ago: i64) -> Interaction {
        Interaction {
            id: id.to_string(),
            contact_id: "c1".to_string(),
            interaction_type: "call".to_string(),
            status: Some(status.to_string()),
            direction: Some("outbound".to_string()),
            occurred_at: as_of() - Duration::days(days_ago),
        }
    }

    fn activity(id: &str, activity_type: &str, days_ago: i64) -> CampaignActivity {
        CampaignActivity {
            id: id.to_string(),
            contact_id: "c1".to_string(),
            campaign_id: Some("camp-1".to_string()),
            activity_type: activity_type.to_string(),
            occurred_at: as_of() - Duration::days(days_ago),
        }
    }

    #[test]
    fn test_three_calls_and_donor_tag_is_high() {
        let mut c = contact();
        c.tags.insert("donor".to_string());
        let snapshot = ActivitySnapshot {
            interactions: vec![
                call("i1", "answered", 1),
                call("i2", "answered", 10),
                call("i3", "answered", 40),
            ],
            activities: vec![],
        };

        let score = calculate_score(&c, &ScoringRuleSet::default(), &snapshot, as_of());
        assert_eq!(score.category_scores[&ScoreCategory::Activity], 30);
        assert_eq!(score.category_scores[&ScoreCategory::Tags], 25);
        assert_eq!(score.total_score, 55);
        assert_eq!(score.level, EngagementLevel::High);
    }

    #[test]
    fn test_disabled_rule_never_contributes() {
        let mut rules = ScoringRuleSet::default();
        rules.set_enabled("call-answered", false).expect("toggle");
        let snapshot = ActivitySnapshot {
            interactions: vec![call("i1", "answered", 1), call("i2", "answered", 2)],
            activities: vec![],
        };

        let score = calculate_score(&contact(), &rules, &snapshot, as_of());
        assert_eq!(score.category_scores[&ScoreCategory::Activity], 0);
        assert_eq!(score.total_score, 0);
        assert_eq!(score.level, EngagementLevel::Inactive);
    }

    #[test]
    fn test_records_outside_window_are_ignored() {
        let snapshot = ActivitySnapshot {
            interactions: vec![call("old", "answered", 91), call("new", "answered", 90)],
            activities: vec![activity("a-old", "donation", 200)],
        };
        let score = calculate_score(&contact(), &ScoringRuleSet::default(), &snapshot, as_of());
        assert_eq!(score.total_score, 10);
    }

    #[test]
    fn test_unanswered_calls_do_not_match() {
        let snapshot = ActivitySnapshot {
            interactions: vec![call("i1", "no_answer", 1), call("i2", "voicemail", 1)],
            activities: vec![],
        };
        let score = calculate_score(&contact(), &ScoringRuleSet::default(), &snapshot, as_of());
        assert_eq!(score.total_score, 0);
    }

    #[test]
    fn test_binary_rules_fire_once() {
        let mut c = contact();
        c.last_contact_date = Some(as_of() - Duration::days(3));
        c.total_events_attended = 4;
        c.tags.insert("Organizer".to_string());
        let snapshot = ActivitySnapshot {
            interactions: vec![],
            activities: (0..6)
                .map(|n| activity(&format!("a{n}"), "volunteer_shift", n))
                .collect(),
        };

        let score = calculate_score(&c, &ScoringRuleSet::default(), &snapshot, as_of());
        // 6 shifts x 15
        assert_eq!(score.category_scores[&ScoreCategory::Activity], 90);
        // within 7 days and within 30 days
        assert_eq!(score.category_scores[&ScoreCategory::Recency], 20);
        // 6 touches clears the 5 threshold only
        assert_eq!(score.category_scores[&ScoreCategory::Frequency], 10);
        assert_eq!(score.category_scores[&ScoreCategory::Tags], 30);
        assert_eq!(score.category_scores[&ScoreCategory::Events], 20);
        assert_eq!(score.total_score, 170);
        assert_eq!(score.level, EngagementLevel::Champion);
    }

    #[test]
    fn test_recency_requires_a_contact_date() {
        let mut c = contact();
        let rules = ScoringRuleSet::default();
        let empty = ActivitySnapshot::default();
        assert_eq!(calculate_score(&c, &rules, &empty, as_of()).total_score, 0);

        c.last_contact_date = Some(as_of() - Duration::days(20));
        let score = calculate_score(&c, &rules, &empty, as_of());
        assert_eq!(score.category_scores[&ScoreCategory::Recency], 5);
    }

    #[test]
    fn test_total_is_sum_of_categories() {
        let mut c = contact();
        c.tags.insert("donor".to_string());
        c.total_events_attended = 12;
        let snapshot = ActivitySnapshot {
            interactions: vec![call("i1", "answered", 5)],
            activities: vec![activity("a1", "donation", 5), activity("a2", "event_rsvp", 6)],
        };
        let score = calculate_score(&c, &ScoringRuleSet::default(), &snapshot, as_of());
        assert_eq!(score.category_scores.len(), 5);
        assert_eq!(score.total_score, score.category_scores.values().sum::<i64>());
    }

    #[test]
    fn test_oversized_tag_rules_saturate() {
        let mut rules = ScoringRuleSet::default();
        for rule in rules.rules.iter_mut() {
            if rule.id == "organizer-tag" || rule.id == "donor-tag" {
                rule.points = i64::MAX;
            }
        }
        let mut c = contact();
        c.tags.insert("organizer".to_string());
        c.tags.insert("donor".to_string());

        let score = calculate_score(&c, &rules, &ActivitySnapshot::default(), as_of());
        assert_eq!(score.category_scores[&ScoreCategory::Tags], i64::MAX);
        assert_eq!(score.total_score, i64::MAX);
        assert_eq!(score.level, EngagementLevel::Champion);
    }

    #[test]
    fn test_calculation_is_deterministic() {
        let mut c = contact();
        c.tags.insert("donor".to_string());
        let snapshot = ActivitySnapshot {
            interactions: vec![call("i1", "answered", 5)],
            activities: vec![activity("a1", "donation", 5)],
        };
        let rules = ScoringRuleSet::default();
        assert_eq!(
            calculate_score(&c, &rules, &snapshot, as_of()),
            calculate_score(&c, &rules, &snapshot, as_of())
        );
    }
}
