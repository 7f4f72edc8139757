//! Schema registry: one append-only row per physical table generation.

use formgen_ids::{AttemptId, FormId};
use sqlx::Row;
use tracing::info;

use crate::attempts::set_attempt_state;
use crate::error::{sqlx_unique_violation, DbError, Result};
use crate::types::*;
use crate::{parse_id, to_version, DbConn, DbRow, FormDb};

const ENTRY_COLUMNS: &str = "form_id, version, table_name, view_name, ddl, ddl_hash, created_at";

impl FormDb {
    /// Record a table generation. A second entry for the same
    /// `(form, version)` is refused with `Constraint`.
    pub async fn register(&self, entry: NewRegistryEntry) -> Result<RegistryEntry> {
        let mut conn = self.pool.acquire().await?;
        insert_registry_entry(&mut conn, &entry).await?;
        drop(conn);
        info!(form_id = %entry.form_id, version = entry.version, table = %entry.table_name, "Schema registered");
        self.require_entry(&entry.form_id, entry.version).await
    }

    /// Register and advance the attempt to `REGISTERED` in one transaction.
    pub async fn register_generation(
        &self,
        attempt_id: &AttemptId,
        entry: NewRegistryEntry,
    ) -> Result<RegistryEntry> {
        let mut tx = self.pool.begin().await?;
        insert_registry_entry(&mut *tx, &entry).await?;
        set_attempt_state(&mut *tx, attempt_id, PublishState::Registered).await?;
        tx.commit().await?;
        info!(
            form_id = %entry.form_id,
            version = entry.version,
            table = %entry.table_name,
            attempt_id = %attempt_id,
            "Schema registered"
        );
        self.require_entry(&entry.form_id, entry.version).await
    }

    pub async fn get_entry(&self, form_id: &FormId, version: u32) -> Result<Option<RegistryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM form_schema_registry WHERE form_id = $1 AND version = $2"
        );
        let row = sqlx::query(&sql)
            .bind(form_id.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn require_entry(&self, form_id: &FormId, version: u32) -> Result<RegistryEntry> {
        self.get_entry(form_id, version).await?.ok_or_else(|| {
            DbError::not_found(format!("registry entry for form {} version {}", form_id, version))
        })
    }

    /// Full history of a form, ascending by version.
    pub async fn list_entries(&self, form_id: &FormId) -> Result<Vec<RegistryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM form_schema_registry WHERE form_id = $1 ORDER BY version"
        );
        let rows = sqlx::query(&sql)
            .bind(form_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }
}

pub(crate) async fn insert_registry_entry(conn: &mut DbConn, entry: &NewRegistryEntry) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO form_schema_registry
            (form_id, version, table_name, view_name, ddl, ddl_hash, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.form_id.as_str())
    .bind(entry.version as i64)
    .bind(&entry.table_name)
    .bind(&entry.view_name)
    .bind(&entry.ddl)
    .bind(&entry.ddl_hash)
    .bind(FormDb::now_text())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if sqlx_unique_violation(&err) => Err(DbError::constraint(format!(
            "registry entry already exists for form {} version {}",
            entry.form_id, entry.version
        ))),
        Err(err) => Err(err.into()),
    }
}

fn row_to_entry(row: &DbRow) -> Result<RegistryEntry> {
    Ok(RegistryEntry {
        form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
        version: to_version(row.try_get("version")?)?,
        table_name: row.try_get("table_name")?,
        view_name: row.try_get("view_name")?,
        ddl: row.try_get("ddl")?,
        ddl_hash: row.try_get("ddl_hash")?,
        created_at: FormDb::parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(form_id: &FormId, version: u32) -> NewRegistryEntry {
        NewRegistryEntry {
            form_id: form_id.clone(),
            version,
            table_name: format!("form_customer_v{}", version),
            view_name: "form_customer_active".to_string(),
            ddl: format!("CREATE TABLE \"form_customer_v{}\" (...)", version),
            ddl_hash: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_history() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();

        db.register(entry(&form_id, 1)).await.unwrap();
        db.register(entry(&form_id, 2)).await.unwrap();

        let history = db.list_entries(&form_id).await.unwrap();
        let versions: Vec<u32> = history.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(history[0].table_name, "form_customer_v1");

        let one = db.get_entry(&form_id, 1).await.unwrap().unwrap();
        assert_eq!(one.ddl, "CREATE TABLE \"form_customer_v1\" (...)");
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_conflict() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();

        db.register(entry(&form_id, 1)).await.unwrap();
        let err = db.register(entry(&form_id, 1)).await.unwrap_err();
        assert!(matches!(err, DbError::Constraint(_)));

        // Original entry untouched
        let history = db.list_entries(&form_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
