use chrono::{DateTime, Utc};
use rusqlite::params;

use super::*;
use crate::types::{ActivitySnapshot, CampaignActivity, Interaction};

impl ContactDb {
    // =========================================================================
    // Dependent collections (written by intake paths, read by scoring)
    // =========================================================================

    pub fn insert_interaction(&self, interaction: &Interaction) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO interactions (id, contact_id, interaction_type, status, direction, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                interaction.id,
                interaction.contact_id,
                interaction.interaction_type,
                interaction.status,
                interaction.direction,
                encode_ts(&interaction.occurred_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_campaign_activity(&self, activity: &CampaignActivity) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO campaign_activities (id, contact_id, campaign_id, activity_type, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                activity.id,
                activity.contact_id,
                activity.campaign_id,
                activity.activity_type,
                encode_ts(&activity.occurred_at),
            ],
        )?;
        Ok(())
    }

    /// Record event participation (INSERT OR IGNORE — one row per event and contact).
    pub fn record_event_participation(&self, row: &DbEventParticipant) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO event_participants (event_id, contact_id, status, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.event_id,
                row.contact_id,
                row.status,
                encode_ts(&row.recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_assignment(&self, row: &DbAssignment) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO assignments (id, contact_id, assignee_id, pathway_id, assigned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.contact_id,
                row.assignee_id,
                row.pathway_id,
                encode_ts(&row.assigned_at),
            ],
        )?;
        Ok(())
    }

    /// Interactions and campaign activity for one contact at or after `since`.
    ///
    /// The join on `contacts` keeps the read inside the organization.
    pub fn activity_since(
        &self,
        organization_id: &str,
        contact_id: &str,
        since: &DateTime<Utc>,
    ) -> Result<ActivitySnapshot, DbError> {
        let since = encode_ts(since);

        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.contact_id, i.interaction_type, i.status, i.direction, i.occurred_at
             FROM interactions i
             JOIN contacts c ON c.id = i.contact_id
             WHERE c.organization_id = ?1 AND i.contact_id = ?2 AND i.occurred_at >= ?3
             ORDER BY i.occurred_at, i.id",
        )?;
        let rows = stmt.query_map(params![organization_id, contact_id, since], |row| {
            let occurred_at: String = row.get(5)?;
            Ok(Interaction {
                id: row.get(0)?,
                contact_id: row.get(1)?,
                interaction_type: row.get(2)?,
                status: row.get(3)?,
                direction: row.get(4)?,
                occurred_at: decode_ts(5, &occurred_at)?,
            })
        })?;
        let mut interactions = Vec::new();
        for row in rows {
            interactions.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.contact_id, a.campaign_id, a.activity_type, a.occurred_at
             FROM campaign_activities a
             JOIN contacts c ON c.id = a.contact_id
             WHERE c.organization_id = ?1 AND a.contact_id = ?2 AND a.occurred_at >= ?3
             ORDER BY a.occurred_at, a.id",
        )?;
        let rows = stmt.query_map(params![organization_id, contact_id, since], |row| {
            let occurred_at: String = row.get(4)?;
            Ok(CampaignActivity {
                id: row.get(0)?,
                contact_id: row.get(1)?,
                campaign_id: row.get(2)?,
                activity_type: row.get(3)?,
                occurred_at: decode_ts(4, &occurred_at)?,
            })
        })?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row?);
        }

        Ok(ActivitySnapshot {
            interactions,
            activities,
        })
    }

    /// Count dependent rows still referencing `contact_id`, across every
    /// collection a merge repoints.
    pub fn count_references(&self, contact_id: &str) -> Result<ReferenceCounts, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self
                .conn
                .query_row(sql, params![contact_id], |row| row.get(0))?)
        };
        Ok(ReferenceCounts {
            interactions: count("SELECT COUNT(*) FROM interactions WHERE contact_id = ?1")?,
            campaign_activities: count(
                "SELECT COUNT(*) FROM campaign_activities WHERE contact_id = ?1",
            )?,
            event_participants: count(
                "SELECT COUNT(*) FROM event_participants WHERE contact_id = ?1",
            )?,
            assignments: count("SELECT COUNT(*) FROM assignments WHERE contact_id = ?1")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::super::test_utils::test_db;
    use super::*;
    use crate::types::Contact;

    fn seed(db: &ContactDb, id: &str, org: &str) {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        db.insert_contact(&Contact::new(id, org, id, created))
            .expect("insert contact");
    }

    fn interaction(id: &str, contact_id: &str, at: DateTime<Utc>) -> Interaction {
        Interaction {
            id: id.to_string(),
            contact_id: contact_id.to_string(),
            interaction_type: "call".to_string(),
            status: Some("answered".to_string()),
            direction: Some("outbound".to_string()),
            occurred_at: at,
        }
    }

    #[test]
    fn test_activity_since_filters_window() {
        let db = test_db();
        seed(&db, "c1", "org-1");
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        db.insert_interaction(&interaction("i-old", "c1", now - Duration::days(120)))
            .expect("old");
        db.insert_interaction(&interaction("i-new", "c1", now - Duration::days(3)))
            .expect("new");
        db.insert_campaign_activity(&CampaignActivity {
            id: "a1".into(),
            contact_id: "c1".into(),
            campaign_id: Some("spring".into()),
            activity_type: "donation".into(),
            occurred_at: now - Duration::days(10),
        })
        .expect("activity");

        let snapshot = db
            .activity_since("org-1", "c1", &(now - Duration::days(90)))
            .expect("snapshot");
        let ids: Vec<&str> = snapshot.interactions.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-new"]);
        assert_eq!(snapshot.activities.len(), 1);
        assert_eq!(snapshot.activities[0].activity_type, "donation");
    }

    #[test]
    fn test_activity_since_is_org_scoped() {
        let db = test_db();
        seed(&db, "c1", "org-1");
        let now = Utc::now();
        db.insert_interaction(&interaction("i1", "c1", now)).expect("insert");

        let snapshot = db
            .activity_since("org-2", "c1", &(now - Duration::days(1)))
            .expect("snapshot");
        assert!(snapshot.interactions.is_empty());
    }

    #[test]
    fn test_count_references_covers_all_collections() {
        let db = test_db();
        seed(&db, "c1", "org-1");
        let now = Utc::now();
        db.insert_interaction(&interaction("i1", "c1", now)).expect("interaction");
        db.record_event_participation(&DbEventParticipant {
            event_id: "e1".into(),
            contact_id: "c1".into(),
            status: "attended".into(),
            recorded_at: now,
        })
        .expect("event");
        db.insert_assignment(&DbAssignment {
            id: "as1".into(),
            contact_id: "c1".into(),
            assignee_id: "organizer-9".into(),
            pathway_id: None,
            assigned_at: now,
        })
        .expect("assignment");

        let counts = db.count_references("c1").expect("counts");
        assert_eq!(counts.interactions, 1);
        assert_eq!(counts.campaign_activities, 0);
        assert_eq!(counts.event_participants, 1);
        assert_eq!(counts.assignments, 1);
        assert_eq!(counts.total(), 3);
    }
}
