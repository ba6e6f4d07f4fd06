//! Duplicate contact detection.
//!
//! Three passes run over whatever the previous passes left unmatched, so a
//! contact lands in at most one group and phone beats email beats name:
//! 1. phone, digits only, exact grouping
//! 2. email, trimmed and lowercased, exact grouping
//! 3. name, lowercased alphanumerics, single-linkage clustering
//!
//! The name pass compares each contact only against the key of each cluster's
//! first member and joins the first cluster that matches. Cluster membership
//! therefore depends on scan order; contacts are scanned by creation time
//! (then id) so a given population always produces the same groups.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::store::ContactStore;
use crate::types::Contact;

/// Names shorter than this never match on prefix alone.
const NAME_PREFIX_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    Exact,
    Similar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchField {
    Phone,
    Email,
    Name,
}

impl MatchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::Phone => "phone",
            MatchField::Email => "email",
            MatchField::Name => "name",
        }
    }
}

/// Contacts believed to be the same person. Members are in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub id: String,
    pub match_type: MatchType,
    pub match_field: MatchField,
    /// Normalized key shared by the group (the first member's key for name clusters).
    pub match_key: String,
    pub contact_ids: Vec<String>,
}

impl DuplicateGroup {
    fn new(field: MatchField, match_type: MatchType, key: String, ids: Vec<String>) -> Self {
        Self {
            id: format!("{}-{}", field.as_str(), ids[0]),
            match_type,
            match_field: field,
            match_key: key,
            contact_ids: ids,
        }
    }
}

pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Similarity test for normalized names: equal, one contains the other, or
/// both at least five characters with the same first five.
pub fn names_similar(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b || a.contains(b) || b.contains(a) {
        return true;
    }
    let prefix = |s: &str| s.chars().take(NAME_PREFIX_LEN).collect::<String>();
    a.chars().count() >= NAME_PREFIX_LEN
        && b.chars().count() >= NAME_PREFIX_LEN
        && prefix(a) == prefix(b)
}

/// Exact-key pass: group the unmatched contacts by `key`, keeping first-seen
/// order for both groups and members.
fn exact_pass<'a>(
    contacts: &[&'a Contact],
    matched: &mut HashSet<&'a str>,
    field: MatchField,
    key: impl Fn(&Contact) -> String,
) -> Vec<DuplicateGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<&'a Contact>> = HashMap::new();

    for &contact in contacts {
        if matched.contains(contact.id.as_str()) {
            continue;
        }
        let k = key(contact);
        if k.is_empty() {
            continue;
        }
        let bucket = buckets.entry(k.clone()).or_default();
        if bucket.is_empty() {
            order.push(k);
        }
        bucket.push(contact);
    }

    let mut groups = Vec::new();
    for k in order {
        let members = match buckets.remove(&k) {
            Some(m) if m.len() > 1 => m,
            _ => continue,
        };
        for &m in &members {
            matched.insert(m.id.as_str());
        }
        let ids = members.iter().map(|c| c.id.clone()).collect();
        groups.push(DuplicateGroup::new(field, MatchType::Exact, k, ids));
    }
    groups
}

/// Single-linkage name clustering over the unmatched remainder.
fn name_pass<'a>(contacts: &[&'a Contact], matched: &mut HashSet<&'a str>) -> Vec<DuplicateGroup> {
    // (representative key, member keys, members)
    let mut clusters: Vec<(String, Vec<String>, Vec<&'a Contact>)> = Vec::new();

    for &contact in contacts {
        if matched.contains(contact.id.as_str()) {
            continue;
        }
        let key = normalize_name(&contact.full_name);
        if key.is_empty() {
            continue;
        }
        match clusters
            .iter()
            .position(|(rep, _, _)| names_similar(rep, &key))
        {
            Some(idx) => {
                let (_, keys, members) = &mut clusters[idx];
                keys.push(key);
                members.push(contact);
            }
            None => clusters.push((key.clone(), vec![key], vec![contact])),
        }
    }

    let mut groups = Vec::new();
    for (rep, keys, members) in clusters {
        if members.len() < 2 {
            continue;
        }
        for &m in &members {
            matched.insert(m.id.as_str());
        }
        let match_type = if keys.iter().all(|k| *k == rep) {
            MatchType::Exact
        } else {
            MatchType::Similar
        };
        let ids = members.iter().map(|c| c.id.clone()).collect();
        groups.push(DuplicateGroup::new(MatchField::Name, match_type, rep, ids));
    }
    groups
}

/// Partition an organization's contacts into duplicate groups (pure).
///
/// Input order does not matter: contacts are scanned by creation time, then id.
pub fn find_duplicate_groups(contacts: &[Contact]) -> Vec<DuplicateGroup> {
    let mut ordered: Vec<&Contact> = contacts.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut matched: HashSet<&str> = HashSet::new();
    let mut groups = exact_pass(&ordered, &mut matched, MatchField::Phone, |c| {
        normalize_phone(&c.phone)
    });
    groups.extend(exact_pass(&ordered, &mut matched, MatchField::Email, |c| {
        c.email.as_deref().map(normalize_email).unwrap_or_default()
    }));
    groups.extend(name_pass(&ordered, &mut matched));
    groups
}

/// Run duplicate detection for an organization.
pub async fn detect_duplicates(
    store: &dyn ContactStore,
    organization_id: &str,
) -> Result<Vec<DuplicateGroup>, CoreError> {
    let contacts = store.list_contacts(organization_id).await?;
    let groups = find_duplicate_groups(&contacts);
    log::info!(
        "MatchEngine: {} contacts scanned for {}, {} duplicate groups",
        contacts.len(),
        organization_id,
        groups.len()
    );
    Ok(groups)
}

/// The duplicate group containing one contact, if any.
pub async fn duplicates_for_contact(
    store: &dyn ContactStore,
    organization_id: &str,
    contact_id: &str,
) -> Result<Option<DuplicateGroup>, CoreError> {
    if store.get_contact(organization_id, contact_id).await?.is_none() {
        return Err(CoreError::NotFound(format!("contact {contact_id}")));
    }
    let groups = detect_duplicates(store, organization_id).await?;
    Ok(groups
        .into_iter()
        .find(|g| g.contact_ids.iter().any(|id| id == contact_id)))
}
