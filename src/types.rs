//! Core domain types shared by matching, merging and scoring.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::ContactScore;

/// A contact record owned by one organization.
///
/// `version` is bumped on every write that goes through the merge path and is
/// used for optimistic concurrency between overlapping merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub organization_id: String,
    pub full_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_events_attended: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ContactScore>,
}

impl Contact {
    /// Minimal contact with everything optional left empty. Handy for intake
    /// paths and fixtures.
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        full_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            full_name: full_name.into(),
            phone: String::new(),
            email: None,
            address: None,
            tags: BTreeSet::new(),
            custom_fields: BTreeMap::new(),
            last_contact_date: None,
            total_events_attended: 0,
            created_at,
            version: 0,
            score: None,
        }
    }
}

/// One logged interaction (call, text, email, door knock) with a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub contact_id: String,
    pub interaction_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// One campaign activity (donation, RSVP, volunteer shift) by a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignActivity {
    pub id: String,
    pub contact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    pub activity_type: String,
    pub occurred_at: DateTime<Utc>,
}

/// Activity history for one contact over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub interactions: Vec<Interaction>,
    pub activities: Vec<CampaignActivity>,
}
