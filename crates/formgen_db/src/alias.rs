//! Table alias resolver: the per-form pointer to the live table.

use formgen_ids::{AttemptId, FormId};
use sqlx::Row;
use tracing::{info, warn};

use crate::attempts::set_attempt_state;
use crate::ddl::run_statements;
use crate::error::{DbError, Result};
use crate::forms::project_active_version;
use crate::types::*;
use crate::{parse_id, to_version, DbConn, DbRow, FormDb};

impl FormDb {
    pub async fn get_alias(&self, form_id: &FormId) -> Result<Option<TableAlias>> {
        let row = sqlx::query(
            "SELECT form_id, active_table, view_name, active_version, updated_at \
             FROM form_table_aliases WHERE form_id = $1",
        )
        .bind(form_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_alias).transpose()
    }

    pub async fn list_aliases(&self) -> Result<Vec<TableAlias>> {
        let rows = sqlx::query(
            "SELECT form_id, active_table, view_name, active_version, updated_at \
             FROM form_table_aliases ORDER BY form_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_alias).collect()
    }

    /// Point the alias at a registered table generation, re-point the view
    /// (`view_statements`, may be empty) and refresh the form's cached
    /// projection, atomically.
    pub async fn set_alias(
        &self,
        form_id: &FormId,
        version: u32,
        view_statements: &[String],
    ) -> Result<TableAlias> {
        let mut tx = self.pool.begin().await?;
        upsert_alias(&mut *tx, form_id, version).await?;
        run_statements(&mut *tx, view_statements).await?;
        project_active_version(&mut *tx, form_id, version).await?;
        tx.commit().await?;
        info!(form_id = %form_id, version, "Alias switched");
        self.require_alias(form_id).await
    }

    /// Switch the alias and the view, refresh the projection and advance
    /// the attempt to `ALIASED`, in one transaction. Readers never see the
    /// view and the alias disagree.
    pub async fn commit_alias(
        &self,
        attempt_id: &AttemptId,
        form_id: &FormId,
        version: u32,
        view_statements: &[String],
    ) -> Result<TableAlias> {
        let mut tx = self.pool.begin().await?;
        upsert_alias(&mut *tx, form_id, version).await?;
        run_statements(&mut *tx, view_statements).await?;
        project_active_version(&mut *tx, form_id, version).await?;
        set_attempt_state(&mut *tx, attempt_id, PublishState::Aliased).await?;
        tx.commit().await?;
        info!(form_id = %form_id, version, attempt_id = %attempt_id, "Alias switched");
        self.require_alias(form_id).await
    }

    async fn require_alias(&self, form_id: &FormId) -> Result<TableAlias> {
        self.get_alias(form_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("alias for form {}", form_id)))
    }

    /// Where do records of `form_key` live right now? `None` until the
    /// first publish completes.
    pub async fn resolve_active_table(&self, form_key: &str) -> Result<Option<ActiveTable>> {
        let row = sqlx::query(
            r#"
            SELECT f.id AS form_id, f.form_key, a.active_table, a.view_name, a.active_version
            FROM forms f
            JOIN form_table_aliases a ON a.form_id = f.id
            WHERE f.form_key = $1
            "#,
        )
        .bind(form_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(ActiveTable {
                form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
                form_key: row.try_get("form_key")?,
                table_name: row.try_get("active_table")?,
                view_name: row.try_get("view_name")?,
                version: to_version(row.try_get("active_version")?)?,
            })),
            None => Ok(None),
        }
    }

    /// Re-derive `forms.status` and `forms.current_version` from the alias.
    /// Returns true if the projection had drifted and was corrected.
    pub async fn sync_form_projection(&self, form_id: &FormId) -> Result<bool> {
        let form = self.require_form(form_id).await?;
        let Some(alias) = self.get_alias(form_id).await? else {
            return Ok(false);
        };
        let expected_status = match form.status {
            FormStatus::Archived => FormStatus::Archived,
            _ => FormStatus::Active,
        };
        if form.current_version == alias.active_version && form.status == expected_status {
            return Ok(false);
        }

        warn!(
            form_id = %form_id,
            cached = form.current_version,
            alias = alias.active_version,
            "Form projection drifted from alias; correcting"
        );
        let mut conn = self.pool.acquire().await?;
        project_active_version(&mut conn, form_id, alias.active_version).await?;
        Ok(true)
    }
}

/// Upsert the alias row. The target generation must be registered.
async fn upsert_alias(conn: &mut DbConn, form_id: &FormId, version: u32) -> Result<()> {
    let entry = sqlx::query(
        "SELECT table_name, view_name FROM form_schema_registry WHERE form_id = $1 AND version = $2",
    )
    .bind(form_id.as_str())
    .bind(version as i64)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| {
        DbError::invalid_state(format!(
            "cannot alias form {} to unregistered version {}",
            form_id, version
        ))
    })?;
    let table_name: String = entry.try_get("table_name")?;
    let view_name: String = entry.try_get("view_name")?;

    sqlx::query(
        r#"
        INSERT INTO form_table_aliases (form_id, active_table, view_name, active_version, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (form_id) DO UPDATE SET
            active_table = excluded.active_table,
            view_name = excluded.view_name,
            active_version = excluded.active_version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(form_id.as_str())
    .bind(&table_name)
    .bind(&view_name)
    .bind(version as i64)
    .bind(FormDb::now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_alias(row: &DbRow) -> Result<TableAlias> {
    Ok(TableAlias {
        form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
        active_table: row.try_get("active_table")?,
        view_name: row.try_get("view_name")?,
        active_version: to_version(row.try_get("active_version")?)?,
        updated_at: FormDb::parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered_form(db: &FormDb, versions: &[u32]) -> Form {
        let form = db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        for &version in versions {
            db.register(NewRegistryEntry {
                form_id: form.id.clone(),
                version,
                table_name: format!("form_customer_v{}", version),
                view_name: "form_customer_active".to_string(),
                ddl: "CREATE TABLE ...".to_string(),
                ddl_hash: "h".to_string(),
            })
            .await
            .unwrap();
        }
        form
    }

    #[tokio::test]
    async fn test_unpublished_form_resolves_to_none() {
        let db = FormDb::open_in_memory().await.unwrap();
        registered_form(&db, &[]).await;
        assert!(db.resolve_active_table("customer").await.unwrap().is_none());
        assert!(db.resolve_active_table("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_alias_moves_projection() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = registered_form(&db, &[1, 2]).await;

        db.set_alias(&form.id, 1, &[]).await.unwrap();
        let active = db.resolve_active_table("customer").await.unwrap().unwrap();
        assert_eq!(active.table_name, "form_customer_v1");
        assert_eq!(active.version, 1);

        let alias = db.set_alias(&form.id, 2, &[]).await.unwrap();
        assert_eq!(alias.active_table, "form_customer_v2");

        let form = db.require_form(&form.id).await.unwrap();
        assert_eq!(form.status, FormStatus::Active);
        assert_eq!(form.current_version, 2);
    }

    #[tokio::test]
    async fn test_alias_requires_registry_entry() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = registered_form(&db, &[1]).await;

        let err = db.set_alias(&form.id, 7, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        assert!(db.get_alias(&form.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_projection_repairs_drift() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form = registered_form(&db, &[1]).await;
        db.set_alias(&form.id, 1, &[]).await.unwrap();

        sqlx::query("UPDATE forms SET current_version = 0, status = 'DRAFT' WHERE id = $1")
            .bind(form.id.as_str())
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db.sync_form_projection(&form.id).await.unwrap());
        assert!(!db.sync_form_projection(&form.id).await.unwrap());
        let form = db.require_form(&form.id).await.unwrap();
        assert_eq!(form.current_version, 1);
        assert_eq!(form.status, FormStatus::Active);
    }
}
