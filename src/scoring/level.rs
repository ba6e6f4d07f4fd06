//! Engagement level buckets over a total score.

use serde::{Deserialize, Serialize};

/// Ordinal engagement bucket. Ordering follows the thresholds, so
/// `Inactive < Low < Medium < High < Champion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementLevel {
    Inactive,
    Low,
    Medium,
    High,
    Champion,
}

impl EngagementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementLevel::Inactive => "inactive",
            EngagementLevel::Low => "low",
            EngagementLevel::Medium => "medium",
            EngagementLevel::High => "high",
            EngagementLevel::Champion => "champion",
        }
    }

    /// Bucket a total score. Anything at or below zero is inactive.
    pub fn classify(total: i64) -> Self {
        match total {
            i64::MIN..=0 => EngagementLevel::Inactive,
            1..=24 => EngagementLevel::Low,
            25..=49 => EngagementLevel::Medium,
            50..=99 => EngagementLevel::High,
            _ => EngagementLevel::Champion,
        }
    }
}

impl std::fmt::Display for EngagementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
