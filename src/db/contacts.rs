use rusqlite::params;

use super::*;
use crate::merge::{MergePlan, MergeStep, MergeStepError};
use crate::scoring::ContactScore;
use crate::types::Contact;

const CONTACT_COLUMNS: &str = "id, organization_id, full_name, phone, email, address, tags,
    custom_fields, last_contact_date, total_events_attended, created_at, version, score_payload";

impl ContactDb {
    // =========================================================================
    // Contacts
    // =========================================================================

    /// Insert a new contact. Fails if the id is already taken.
    pub fn insert_contact(&self, contact: &Contact) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO contacts (
                id, organization_id, full_name, phone, email, address, tags,
                custom_fields, last_contact_date, total_events_attended, created_at, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                contact.id,
                contact.organization_id,
                contact.full_name,
                contact.phone,
                contact.email,
                contact.address,
                serde_json::to_string(&contact.tags)?,
                serde_json::to_string(&contact.custom_fields)?,
                contact.last_contact_date.as_ref().map(encode_ts),
                contact.total_events_attended,
                encode_ts(&contact.created_at),
                contact.version,
            ],
        )?;
        Ok(())
    }

    /// Fetch one contact, scoped to its organization.
    pub fn get_contact(
        &self,
        organization_id: &str,
        contact_id: &str,
    ) -> Result<Option<Contact>, DbError> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE organization_id = ?1 AND id = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![organization_id, contact_id], Self::map_contact_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All contacts for an organization in creation order (ties broken by id).
    pub fn list_contacts(&self, organization_id: &str) -> Result<Vec<Contact>, DbError> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE organization_id = ?1
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![organization_id], Self::map_contact_row)?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// One page of contacts in the same stable order as `list_contacts`.
    pub fn contacts_page(
        &self,
        organization_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Contact>, DbError> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE organization_id = ?1
             ORDER BY created_at, id
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![organization_id, limit as i64, offset as i64],
            Self::map_contact_row,
        )?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    /// Write a freshly computed score onto its contact.
    ///
    /// Score columns are independent of the merge `version`, so a recompute
    /// never invalidates a pending merge plan.
    pub fn save_contact_score(
        &self,
        organization_id: &str,
        score: &ContactScore,
    ) -> Result<(), DbError> {
        let payload = serde_json::to_string(score)?;
        let changed = self.conn.execute(
            "UPDATE contacts SET
                score_total = ?1,
                score_level = ?2,
                score_payload = ?3,
                score_calculated_at = ?4
             WHERE organization_id = ?5 AND id = ?6",
            params![
                score.total_score,
                score.level.as_str(),
                payload,
                encode_ts(&score.last_calculated),
                organization_id,
                score.contact_id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("contact {}", score.contact_id)));
        }
        Ok(())
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Apply a merge plan in one transaction: persist the merged primary,
    /// repoint every dependent row of each absorbed member, then delete the
    /// absorbed members. Any failure rolls the whole plan back.
    ///
    /// Every write is guarded by the version captured when the plan was
    /// built; a mismatch surfaces as `DbError::Conflict` on the failing step.
    pub fn commit_merge(&self, plan: &MergePlan) -> Result<(), MergeStepError> {
        self.with_transaction(|tx| {
            tx.persist_merged_primary(plan)
                .map_err(|e| MergeStepError::new(MergeStep::PersistPrimary, e))?;

            for member in &plan.absorbed {
                tx.repoint_references(&member.contact_id, &plan.primary.id)
                    .map_err(|e| MergeStepError::new(MergeStep::RepointReferences, e))?;
            }

            tx.delete_absorbed(plan)
                .map_err(|e| MergeStepError::new(MergeStep::DeleteMembers, e))?;

            Ok(())
        })
    }

    fn persist_merged_primary(&self, plan: &MergePlan) -> Result<(), DbError> {
        let primary = &plan.primary;
        let changed = self.conn.execute(
            "UPDATE contacts SET
                phone = ?1,
                email = ?2,
                address = ?3,
                tags = ?4,
                custom_fields = ?5,
                last_contact_date = ?6,
                total_events_attended = ?7,
                version = version + 1
             WHERE organization_id = ?8 AND id = ?9 AND version = ?10",
            params![
                primary.phone,
                primary.email,
                primary.address,
                serde_json::to_string(&primary.tags)?,
                serde_json::to_string(&primary.custom_fields)?,
                primary.last_contact_date.as_ref().map(encode_ts),
                primary.total_events_attended,
                plan.organization_id,
                primary.id,
                primary.version,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::Conflict(format!(
                "primary {} changed since the merge was planned",
                primary.id
            )));
        }
        Ok(())
    }

    /// Move every dependent row from `from_id` to `to_id`.
    ///
    /// Event participation is keyed by (event, contact); rows the primary
    /// already has are dropped rather than duplicated.
    fn repoint_references(&self, from_id: &str, to_id: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE interactions SET contact_id = ?1 WHERE contact_id = ?2",
            params![to_id, from_id],
        )?;
        self.conn.execute(
            "UPDATE campaign_activities SET contact_id = ?1 WHERE contact_id = ?2",
            params![to_id, from_id],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO event_participants (event_id, contact_id, status, recorded_at)
             SELECT event_id, ?1, status, recorded_at FROM event_participants WHERE contact_id = ?2",
            params![to_id, from_id],
        )?;
        self.conn.execute(
            "DELETE FROM event_participants WHERE contact_id = ?1",
            params![from_id],
        )?;
        self.conn.execute(
            "UPDATE assignments SET contact_id = ?1 WHERE contact_id = ?2",
            params![to_id, from_id],
        )?;
        Ok(())
    }

    fn delete_absorbed(&self, plan: &MergePlan) -> Result<(), DbError> {
        for member in &plan.absorbed {
            let remaining = self.count_references(&member.contact_id)?;
            if remaining.total() > 0 {
                return Err(DbError::Integrity(format!(
                    "contact {} still has {} dependent rows",
                    member.contact_id,
                    remaining.total()
                )));
            }
            let deleted = self.conn.execute(
                "DELETE FROM contacts WHERE organization_id = ?1 AND id = ?2 AND version = ?3",
                params![plan.organization_id, member.contact_id, member.version],
            )?;
            if deleted == 0 {
                return Err(DbError::Conflict(format!(
                    "contact {} changed or vanished since the merge was planned",
                    member.contact_id
                )));
            }
        }
        Ok(())
    }

    fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
        let tags: String = row.get(6)?;
        let custom_fields: String = row.get(7)?;
        let last_contact_date: Option<String> = row.get(8)?;
        let created_at: String = row.get(10)?;
        let score_payload: Option<String> = row.get(12)?;

        Ok(Contact {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            full_name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            address: row.get(5)?,
            tags: decode_json(6, &tags)?,
            custom_fields: decode_json(7, &custom_fields)?,
            last_contact_date: last_contact_date
                .as_deref()
                .map(|raw| decode_ts(8, raw))
                .transpose()?,
            total_events_attended: row.get(9)?,
            created_at: decode_ts(10, &created_at)?,
            version: row.get(11)?,
            score: score_payload
                .as_deref()
                .map(|raw| decode_json(12, raw))
                .transpose()?,
        })
    }
}
