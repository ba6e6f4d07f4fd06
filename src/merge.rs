//! Duplicate group consolidation.
//!
//! A merge folds every member of a `DuplicateGroup` into one surviving
//! primary contact:
//! 1. ComputeFields: merged tags, custom fields, dates, counters and contact
//!    details are computed in memory
//! 2. PersistPrimary: the merged fields are written to the primary row
//! 3. RepointReferences: interactions, campaign activity, event participation
//!    and assignments of absorbed members move to the primary
//! 4. DeleteMembers: absorbed contacts are deleted
//!
//! Steps 2–4 commit as one transaction. Each write carries the contact
//! version read in step 1, so two merges racing over the same contacts cannot
//! both succeed; the loser gets `CoreError::Conflict`. A failed merge is never
//! retried automatically.

use std::collections::btree_map::Entry;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::DbError;
use crate::error::{CoreError, StoreError};
use crate::matching::DuplicateGroup;
use crate::store::ContactStore;
use crate::types::Contact;

/// The ordered steps of a merge, used to report where a merge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStep {
    ComputeFields,
    PersistPrimary,
    RepointReferences,
    DeleteMembers,
    /// Opening or committing the surrounding transaction.
    Commit,
}

impl MergeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStep::ComputeFields => "compute_fields",
            MergeStep::PersistPrimary => "persist_primary",
            MergeStep::RepointReferences => "repoint_references",
            MergeStep::DeleteMembers => "delete_members",
            MergeStep::Commit => "commit",
        }
    }
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database failure tagged with the merge step it happened in.
#[derive(Debug)]
pub struct MergeStepError {
    pub step: MergeStep,
    pub error: DbError,
}

impl MergeStepError {
    pub fn new(step: MergeStep, error: DbError) -> Self {
        Self { step, error }
    }
}

impl From<DbError> for MergeStepError {
    fn from(error: DbError) -> Self {
        Self::new(MergeStep::Commit, error)
    }
}

impl fmt::Display for MergeStepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

impl std::error::Error for MergeStepError {}

/// An absorbed member and the version it had when the plan was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsorbedMember {
    pub contact_id: String,
    pub version: i64,
}

/// Everything the store needs to apply a merge.
///
/// `primary` already carries the merged fields; its `version` is the version
/// the row must still have at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub group_id: String,
    pub organization_id: String,
    pub primary: Contact,
    pub absorbed: Vec<AbsorbedMember>,
}

/// Result of a completed merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub group_id: String,
    pub primary: Contact,
    pub absorbed_ids: Vec<String>,
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Fold `others` into `primary` (pure).
///
/// - tags: union of every member's tags
/// - custom_fields: the primary's values win; later members only fill keys
///   that are missing or null
/// - last_contact_date: latest across members, ignoring members without one
/// - total_events_attended: summed
/// - phone, email, address: taken from the first member that has one, only
///   when the primary's own value is empty
pub fn merge_fields(primary: &Contact, others: &[Contact]) -> Contact {
    let mut merged = primary.clone();

    for other in others {
        merged.tags.extend(other.tags.iter().cloned());

        for (key, value) in &other.custom_fields {
            match merged.custom_fields.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().is_null() {
                        slot.insert(value.clone());
                    }
                }
            }
        }

        merged.last_contact_date = match (merged.last_contact_date, other.last_contact_date) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        merged.total_events_attended += other.total_events_attended;

        if merged.phone.trim().is_empty() && !other.phone.trim().is_empty() {
            merged.phone = other.phone.clone();
        }
        if is_blank(merged.email.as_deref()) && !is_blank(other.email.as_deref()) {
            merged.email = other.email.clone();
        }
        if is_blank(merged.address.as_deref()) && !is_blank(other.address.as_deref()) {
            merged.address = other.address.clone();
        }
    }

    merged
}

fn compute_failed(group_id: &str, err: impl fmt::Display) -> CoreError {
    CoreError::MergeFailed {
        group_id: group_id.to_string(),
        step: MergeStep::ComputeFields,
        reason: err.to_string(),
    }
}

/// Load the group's members and compute the merged primary without writing.
///
/// `primary_id` overrides the default primary (the earliest-created member).
pub async fn plan_merge(
    store: &dyn ContactStore,
    organization_id: &str,
    group: &DuplicateGroup,
    primary_id: Option<&str>,
) -> Result<MergePlan, CoreError> {
    if group.contact_ids.len() < 2 {
        return Err(CoreError::Validation(format!(
            "group {} has fewer than two members",
            group.id
        )));
    }
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = group.contact_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(CoreError::Validation(format!(
            "group {} lists contact {} twice",
            group.id, dup
        )));
    }
    if let Some(pid) = primary_id {
        if !group.contact_ids.iter().any(|id| id == pid) {
            return Err(CoreError::Validation(format!(
                "primary {} is not a member of group {}",
                pid, group.id
            )));
        }
    }

    let mut members = Vec::with_capacity(group.contact_ids.len());
    for id in &group.contact_ids {
        let contact = store
            .get_contact(organization_id, id)
            .await
            .map_err(|e| compute_failed(&group.id, e))?
            .ok_or_else(|| CoreError::NotFound(format!("contact {id}")))?;
        members.push(contact);
    }

    let primary_id = match primary_id {
        Some(pid) => pid.to_string(),
        None => members
            .iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|c| c.id.clone())
            .ok_or_else(|| compute_failed(&group.id, "group has no members"))?,
    };

    let (primaries, others): (Vec<Contact>, Vec<Contact>) =
        members.into_iter().partition(|c| c.id == primary_id);
    let primary = primaries
        .into_iter()
        .next()
        .ok_or_else(|| compute_failed(&group.id, "primary vanished while loading"))?;

    let merged = merge_fields(&primary, &others);
    let absorbed = others
        .iter()
        .map(|c| AbsorbedMember {
            contact_id: c.id.clone(),
            version: c.version,
        })
        .collect();

    Ok(MergePlan {
        group_id: group.id.clone(),
        organization_id: organization_id.to_string(),
        primary: merged,
        absorbed,
    })
}

/// What the primary would look like after merging, without touching the store.
pub async fn preview_merge(
    store: &dyn ContactStore,
    organization_id: &str,
    group: &DuplicateGroup,
    primary_id: Option<&str>,
) -> Result<Contact, CoreError> {
    Ok(plan_merge(store, organization_id, group, primary_id).await?.primary)
}

/// Commit a previously built plan and verify no references were left behind.
///
/// A lost version race is `Conflict`. Every other failure, a slow store
/// included, is `MergeFailed` naming the group and is not retryable.
pub async fn apply_merge_plan(
    store: &dyn ContactStore,
    plan: MergePlan,
) -> Result<MergeOutcome, CoreError> {
    if let Err(err) = store.commit_merge(&plan).await {
        if err.is_conflict() {
            log::warn!("Merge: group {} lost a version race: {}", plan.group_id, err);
            return Err(CoreError::Conflict(format!(
                "group {}: {}",
                plan.group_id, err
            )));
        }
        log::error!("Merge: group {} failed: {}", plan.group_id, err);
        let (step, reason) = match err {
            StoreError::MergeStep { step, source } => (step, source.to_string()),
            other => (MergeStep::Commit, other.to_string()),
        };
        return Err(CoreError::MergeFailed {
            group_id: plan.group_id.clone(),
            step,
            reason,
        });
    }

    for member in &plan.absorbed {
        match store.count_references(&member.contact_id).await {
            Ok(counts) if counts.total() > 0 => {
                return Err(CoreError::MergeFailed {
                    group_id: plan.group_id.clone(),
                    step: MergeStep::RepointReferences,
                    reason: format!(
                        "{} rows still reference absorbed contact {}",
                        counts.total(),
                        member.contact_id
                    ),
                });
            }
            Ok(_) => {}
            Err(e) => log::warn!(
                "Merge: could not verify references for {}: {}",
                member.contact_id,
                e
            ),
        }
    }

    let mut primary = plan.primary;
    primary.version += 1;
    let absorbed_ids: Vec<String> = plan.absorbed.into_iter().map(|m| m.contact_id).collect();

    log::info!(
        "Merge: group {} merged {} contacts into {}",
        plan.group_id,
        absorbed_ids.len(),
        primary.id
    );

    Ok(MergeOutcome {
        group_id: plan.group_id,
        primary,
        absorbed_ids,
    })
}

/// Merge a duplicate group into one contact.
pub async fn merge_group(
    store: &dyn ContactStore,
    organization_id: &str,
    group: &DuplicateGroup,
    primary_id: Option<&str>,
) -> Result<MergeOutcome, CoreError> {
    let plan = plan_merge(store, organization_id, group, primary_id).await?;
    apply_merge_plan(store, plan).await
}
