//! Form catalog: forms and their numbered versions.

use formgen_ids::{FormId, FormVersionId};
use sqlx::Row;
use tracing::{debug, info};

use crate::attempts::TABLE_CREATED;
use crate::error::{sqlx_unique_violation, DbError, Result};
use crate::types::*;
use crate::{parse_id, sql_guard, to_version, DbConn, DbRow, FormDb};

const FORM_COLUMNS: &str =
    "id, form_key, name, description, status, current_version, created_by, created_at, updated_at";
const VERSION_COLUMNS: &str =
    "id, form_id, version, display_name, description, validation_preset, fields_json, created_at";

impl FormDb {
    // ========================================================================
    // Forms
    // ========================================================================

    /// Create a form in `DRAFT` status. Keys are globally unique.
    pub async fn create_form(&self, new: NewForm) -> Result<Form> {
        sql_guard::validate_form_key(&new.key).map_err(|e| DbError::invalid_input(e.to_string()))?;
        if new.name.trim().is_empty() {
            return Err(DbError::invalid_input("form name is empty"));
        }

        let id = FormId::new();
        let now = Self::now_text();
        let result = sqlx::query(
            r#"
            INSERT INTO forms (id, form_key, name, description, status, current_version,
                               created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'DRAFT', 0, $5, $6, $6)
            "#,
        )
        .bind(id.as_str())
        .bind(&new.key)
        .bind(&new.name)
        .bind(new.description.as_deref())
        .bind(new.created_by.as_deref())
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(err) if sqlx_unique_violation(&err) => {
                return Err(DbError::constraint(format!(
                    "form key '{}' already exists",
                    new.key
                )));
            }
            Err(err) => return Err(err.into()),
        }

        info!(form_id = %id, key = %new.key, "Form created");
        self.get_form(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("form {}", id)))
    }

    pub async fn get_form(&self, id: &FormId) -> Result<Option<Form>> {
        let sql = format!("SELECT {FORM_COLUMNS} FROM forms WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_form).transpose()
    }

    pub async fn get_form_by_key(&self, key: &str) -> Result<Option<Form>> {
        let sql = format!("SELECT {FORM_COLUMNS} FROM forms WHERE form_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_form).transpose()
    }

    /// Load a form that must exist.
    pub async fn require_form(&self, id: &FormId) -> Result<Form> {
        self.get_form(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("form {}", id)))
    }

    /// All forms, archived included, ordered by key.
    pub async fn list_forms(&self) -> Result<Vec<Form>> {
        let sql = format!("SELECT {FORM_COLUMNS} FROM forms ORDER BY form_key");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_form).collect()
    }

    /// Update display metadata. The key never changes.
    pub async fn update_form_details(
        &self,
        id: &FormId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Form> {
        if name.trim().is_empty() {
            return Err(DbError::invalid_input("form name is empty"));
        }
        let result = sqlx::query(
            "UPDATE forms SET name = $1, description = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(name)
        .bind(description)
        .bind(Self::now_text())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("form {}", id)));
        }
        self.require_form(id).await
    }

    /// Mark a form `ARCHIVED`. Its tables, alias and registry entries stay.
    pub async fn archive_form(&self, id: &FormId) -> Result<Form> {
        let result = sqlx::query(
            "UPDATE forms SET status = 'ARCHIVED', updated_at = $1 WHERE id = $2",
        )
        .bind(Self::now_text())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("form {}", id)));
        }
        info!(form_id = %id, "Form archived");
        self.require_form(id).await
    }

    // ========================================================================
    // Versions
    // ========================================================================

    /// Append the next version (highest + 1). Refused while an unpublished
    /// draft exists or when the form is archived.
    pub async fn create_version(&self, form_id: &FormId, new: NewFormVersion) -> Result<FormVersion> {
        let form = self.require_form(form_id).await?;
        if form.status == FormStatus::Archived {
            return Err(DbError::invalid_state(format!(
                "form '{}' is archived",
                form.key
            )));
        }
        let fields_json = serde_json::to_string(&new.fields)?;

        let mut tx = self.pool.begin().await?;

        let latest = sqlx::query(
            r#"
            SELECT v.version,
                   (SELECT COUNT(*) FROM form_schema_registry r
                     WHERE r.form_id = v.form_id AND r.version = v.version) AS registered
            FROM form_versions v
            WHERE v.form_id = $1
            ORDER BY v.version DESC
            LIMIT 1
            "#,
        )
        .bind(form_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let next = match latest {
            Some(row) => {
                let version = to_version(row.try_get::<i64, _>("version")?)?;
                let registered: i64 = row.try_get("registered")?;
                if registered == 0 {
                    tx.rollback().await?;
                    return Err(DbError::constraint(format!(
                        "form '{}' already has an unpublished draft (version {})",
                        form.key, version
                    )));
                }
                version + 1
            }
            None => 1,
        };

        let id = FormVersionId::new();
        let display_name = new.display_name.clone().unwrap_or_else(|| form.name.clone());
        let result = sqlx::query(
            r#"
            INSERT INTO form_versions (id, form_id, version, display_name, description,
                                       validation_preset, fields_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id.as_str())
        .bind(form_id.as_str())
        .bind(next as i64)
        .bind(&display_name)
        .bind(new.description.as_deref())
        .bind(new.validation_preset.as_deref())
        .bind(&fields_json)
        .bind(Self::now_text())
        .execute(&mut *tx)
        .await;

        if let Err(err) = result {
            if sqlx_unique_violation(&err) {
                return Err(DbError::constraint(format!(
                    "version {} of form '{}' was created concurrently",
                    next, form.key
                )));
            }
            return Err(err.into());
        }
        touch_form(&mut *tx, form_id).await?;
        tx.commit().await?;

        info!(form_id = %form_id, version = next, fields = new.fields.len(), "Form version created");
        self.get_version(form_id, next)
            .await?
            .ok_or_else(|| DbError::not_found(format!("form {} version {}", form_id, next)))
    }

    pub async fn get_version(&self, form_id: &FormId, version: u32) -> Result<Option<FormVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM form_versions WHERE form_id = $1 AND version = $2");
        let row = sqlx::query(&sql)
            .bind(form_id.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    /// Highest-numbered version, published or not.
    pub async fn latest_version(&self, form_id: &FormId) -> Result<Option<FormVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM form_versions WHERE form_id = $1 \
             ORDER BY version DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(form_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    /// All versions in ascending order.
    pub async fn list_versions(&self, form_id: &FormId) -> Result<Vec<FormVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM form_versions WHERE form_id = $1 ORDER BY version"
        );
        let rows = sqlx::query(&sql)
            .bind(form_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_version).collect()
    }

    /// A version's fields are frozen once a table was created for it, even
    /// if the publish stopped before registering it: the next publish
    /// resumes with that table.
    async fn ensure_unfrozen(&self, form_id: &FormId, version: u32) -> Result<()> {
        if self.get_entry(form_id, version).await?.is_some() {
            return Err(DbError::constraint(format!(
                "version {} is published; its fields are frozen",
                version
            )));
        }
        let sql = format!(
            "SELECT COUNT(*) AS n FROM form_publish_attempts \
             WHERE form_id = $1 AND version = $2 AND {TABLE_CREATED}"
        );
        let row = sqlx::query(&sql)
            .bind(form_id.as_str())
            .bind(version as i64)
            .fetch_one(&self.pool)
            .await?;
        if row.try_get::<i64, _>("n")? > 0 {
            return Err(DbError::constraint(format!(
                "version {} already has a table from an interrupted publish; its fields are frozen",
                version
            )));
        }
        Ok(())
    }

    /// Replace the field list of a version that has never been published.
    pub async fn replace_draft_fields(
        &self,
        form_id: &FormId,
        version: u32,
        fields: Vec<FormField>,
    ) -> Result<FormVersion> {
        self.ensure_unfrozen(form_id, version).await?;
        let fields_json = serde_json::to_string(&fields)?;
        let result = sqlx::query(
            "UPDATE form_versions SET fields_json = $1 WHERE form_id = $2 AND version = $3",
        )
        .bind(&fields_json)
        .bind(form_id.as_str())
        .bind(version as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!(
                "form {} version {}",
                form_id, version
            )));
        }
        debug!(form_id = %form_id, version, fields = fields.len(), "Draft fields replaced");
        self.get_version(form_id, version)
            .await?
            .ok_or_else(|| DbError::not_found(format!("form {} version {}", form_id, version)))
    }

    /// Delete the latest version if it was never published.
    pub async fn delete_draft_version(&self, form_id: &FormId, version: u32) -> Result<()> {
        let latest = self
            .latest_version(form_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("form {} has no versions", form_id)))?;
        if latest.version != version {
            return Err(DbError::constraint(format!(
                "only the latest version ({}) can be deleted",
                latest.version
            )));
        }
        self.ensure_unfrozen(form_id, version).await?;
        sqlx::query("DELETE FROM form_versions WHERE form_id = $1 AND version = $2")
            .bind(form_id.as_str())
            .bind(version as i64)
            .execute(&self.pool)
            .await?;
        info!(form_id = %form_id, version, "Draft version deleted");
        Ok(())
    }
}

/// Set `status = ACTIVE` and `current_version` from the alias. Runs inside
/// the caller's transaction so the projection moves with the alias.
pub(crate) async fn project_active_version(
    conn: &mut DbConn,
    form_id: &FormId,
    version: u32,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE forms SET
            current_version = $1,
            status = CASE WHEN status = 'ARCHIVED' THEN status ELSE 'ACTIVE' END,
            updated_at = $2
        WHERE id = $3
        "#,
    )
    .bind(version as i64)
    .bind(FormDb::now_text())
    .bind(form_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn touch_form(conn: &mut DbConn, form_id: &FormId) -> Result<()> {
    sqlx::query("UPDATE forms SET updated_at = $1 WHERE id = $2")
        .bind(FormDb::now_text())
        .bind(form_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn row_to_form(row: &DbRow) -> Result<Form> {
    let status: String = row.try_get("status")?;
    Ok(Form {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        key: row.try_get("form_key")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status: FormStatus::parse(&status)
            .ok_or_else(|| DbError::invalid_state(format!("unknown form status '{}'", status)))?,
        current_version: to_version(row.try_get("current_version")?)?,
        created_by: row.try_get("created_by")?,
        created_at: FormDb::parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: FormDb::parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_version(row: &DbRow) -> Result<FormVersion> {
    let fields_json: String = row.try_get("fields_json")?;
    Ok(FormVersion {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
        version: to_version(row.try_get("version")?)?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        validation_preset: row.try_get("validation_preset")?,
        fields: serde_json::from_str(&fields_json)?,
        created_at: FormDb::parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<FormField> {
        vec![
            FormField::new("email", FieldType::Email).required().unique(),
            FormField::new("age", FieldType::Number),
        ]
    }

    #[tokio::test]
    async fn test_create_and_fetch_form() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = db
            .create_form(NewForm::new("customer", "Customer").with_created_by("ops"))
            .await
            .unwrap();

        assert_eq!(form.status, FormStatus::Draft);
        assert_eq!(form.current_version, 0);
        assert_eq!(form.created_by.as_deref(), Some("ops"));

        let by_key = db.get_form_by_key("customer").await.unwrap().unwrap();
        assert_eq!(by_key.id, form.id);
        assert_eq!(db.list_forms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let db = FormDb::open_in_memory().await.unwrap();
        db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        let err = db
            .create_form(NewForm::new("customer", "Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_versions_are_gap_free() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = db.create_form(NewForm::new("customer", "Customer")).await.unwrap();

        let v1 = db
            .create_version(&form.id, NewFormVersion::with_fields(fields()))
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.display_name, "Customer");
        assert_eq!(v1.fields, fields());

        // v1 is still a draft
        let err = db
            .create_version(&form.id, NewFormVersion::with_fields(fields()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));

        let latest = db.latest_version(&form.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
    }

    #[tokio::test]
    async fn test_draft_fields_replace_and_delete() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        db.create_version(&form.id, NewFormVersion::with_fields(fields()))
            .await
            .unwrap();

        let replaced = db
            .replace_draft_fields(&form.id, 1, vec![FormField::new("name", FieldType::ShortText)])
            .await
            .unwrap();
        assert_eq!(replaced.fields.len(), 1);

        db.delete_draft_version(&form.id, 1).await.unwrap();
        assert!(db.latest_version(&form.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archived_form_refuses_versions() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        let archived = db.archive_form(&form.id).await.unwrap();
        assert_eq!(archived.status, FormStatus::Archived);

        let err = db
            .create_version(&form.id, NewFormVersion::with_fields(fields()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_update_details_keeps_key() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        let updated = db
            .update_form_details(&form.id, "Customers", Some("CRM contacts"))
            .await
            .unwrap();
        assert_eq!(updated.key, "customer");
        assert_eq!(updated.name, "Customers");
        assert_eq!(updated.description.as_deref(), Some("CRM contacts"));
    }
}
