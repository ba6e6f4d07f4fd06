use chrono::Utc;
use rusqlite::params;

use super::*;

impl ContactDb {
    // =========================================================================
    // Organization settings
    // =========================================================================

    pub fn get_setting(
        &self,
        organization_id: &str,
        key: &str,
    ) -> Result<Option<DbSetting>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT organization_id, key, value, version, updated_at
             FROM organization_settings
             WHERE organization_id = ?1 AND key = ?2",
        )?;
        let mut rows = stmt.query_map(params![organization_id, key], |row| {
            let value: String = row.get(2)?;
            let updated_at: String = row.get(4)?;
            Ok(DbSetting {
                organization_id: row.get(0)?,
                key: row.get(1)?,
                value: decode_json(2, &value)?,
                version: row.get(3)?,
                updated_at: decode_ts(4, &updated_at)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Write a settings blob with an optimistic version check.
    ///
    /// `expected_version = None` creates the row and fails if it already
    /// exists; `Some(v)` replaces it only while the stored version is still
    /// `v`. Returns the new version.
    pub fn put_setting(
        &self,
        organization_id: &str,
        key: &str,
        value: &serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<i64, DbError> {
        let encoded = serde_json::to_string(value)?;
        let now = encode_ts(&Utc::now());

        match expected_version {
            None => {
                let inserted = self.conn.execute(
                    "INSERT OR IGNORE INTO organization_settings
                        (organization_id, key, value, version, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![organization_id, key, encoded, now],
                )?;
                if inserted == 0 {
                    return Err(DbError::Conflict(format!(
                        "setting {key} for {organization_id} already exists"
                    )));
                }
                Ok(1)
            }
            Some(version) => {
                let updated = self.conn.execute(
                    "UPDATE organization_settings
                     SET value = ?1, version = version + 1, updated_at = ?2
                     WHERE organization_id = ?3 AND key = ?4 AND version = ?5",
                    params![encoded, now, organization_id, key, version],
                )?;
                if updated == 0 {
                    return Err(DbError::Conflict(format!(
                        "setting {key} for {organization_id} is no longer at version {version}"
                    )));
                }
                Ok(version + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_put_then_get_setting() {
        let db = test_db();
        let value = serde_json::json!({ "rules": [] });
        let version = db.put_setting("org-1", "scoring_rules", &value, None).expect("put");
        assert_eq!(version, 1);

        let stored = db
            .get_setting("org-1", "scoring_rules")
            .expect("get")
            .expect("exists");
        assert_eq!(stored.value, value);
        assert_eq!(stored.version, 1);
        assert!(db.get_setting("org-2", "scoring_rules").expect("get").is_none());
    }

    #[test]
    fn test_put_setting_detects_version_conflict() {
        let db = test_db();
        let v1 = serde_json::json!(1);
        db.put_setting("org-1", "k", &v1, None).expect("create");

        // Creating twice is a conflict
        let err = db.put_setting("org-1", "k", &v1, None).expect_err("exists");
        assert!(matches!(err, DbError::Conflict(_)));

        let v2 = db.put_setting("org-1", "k", &serde_json::json!(2), Some(1)).expect("update");
        assert_eq!(v2, 2);

        // A writer still holding version 1 loses
        let err = db
            .put_setting("org-1", "k", &serde_json::json!(3), Some(1))
            .expect_err("stale");
        assert!(matches!(err, DbError::Conflict(_)));
        let stored = db.get_setting("org-1", "k").expect("get").expect("exists");
        assert_eq!(stored.value, serde_json::json!(2));
    }
}
