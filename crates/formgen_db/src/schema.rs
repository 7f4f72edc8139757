//! Bookkeeping schema: catalog, registry, aliases, publish journal, leases.
//!
//! All CREATE TABLE statements for engine-owned tables live here. The column
//! types are chosen to mean the same thing on SQLite and PostgreSQL.

use crate::error::Result;
use crate::{Dialect, FormDb};
use tracing::info;

impl FormDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_catalog_tables().await?;
        self.create_registry_tables().await?;
        self.create_publish_tables().await?;
        self.protect_registry().await?;

        info!("Database schema verified");
        Ok(())
    }

    async fn create_catalog_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS forms (
                id TEXT PRIMARY KEY,
                form_key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'DRAFT'
                    CHECK (status IN ('DRAFT', 'ACTIVE', 'ARCHIVED')),
                current_version BIGINT NOT NULL DEFAULT 0,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Field lists are stored whole, in order, and never edited once published.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS form_versions (
                id TEXT PRIMARY KEY,
                form_id TEXT NOT NULL REFERENCES forms(id) ON DELETE CASCADE,
                version BIGINT NOT NULL CHECK (version >= 1),
                display_name TEXT NOT NULL,
                description TEXT,
                validation_preset TEXT,
                fields_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (form_id, version)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_registry_tables(&self) -> Result<()> {
        // No foreign key to forms: history must outlive catalog changes.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS form_schema_registry (
                form_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                table_name TEXT NOT NULL UNIQUE,
                view_name TEXT NOT NULL,
                ddl TEXT NOT NULL,
                ddl_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (form_id, version)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS form_table_aliases (
                form_id TEXT PRIMARY KEY,
                active_table TEXT NOT NULL,
                view_name TEXT NOT NULL,
                active_version BIGINT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_publish_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS form_publish_attempts (
                attempt_id TEXT PRIMARY KEY,
                form_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                table_name TEXT NOT NULL,
                view_name TEXT NOT NULL,
                ddl TEXT NOT NULL,
                state TEXT NOT NULL,
                failed_at_state TEXT,
                failure_stage TEXT,
                failed_statement_index BIGINT,
                failed_statement TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publish_attempts_form \
             ON form_publish_attempts(form_id, version, started_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_publish_attempts_state \
             ON form_publish_attempts(state)",
        )
        .execute(&self.pool)
        .await?;

        // At most one row per form: the row is the lease.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS form_publish_leases (
                form_id TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Make the registry append-only at the store level.
    async fn protect_registry(&self) -> Result<()> {
        match self.dialect {
            Dialect::Sqlite => {
                for (name, event) in [
                    ("form_schema_registry_no_update", "UPDATE"),
                    ("form_schema_registry_no_delete", "DELETE"),
                ] {
                    let sql = format!(
                        "CREATE TRIGGER IF NOT EXISTS {name} BEFORE {event} ON form_schema_registry \
                         BEGIN SELECT RAISE(ABORT, 'form_schema_registry is append-only'); END"
                    );
                    sqlx::query(&sql).execute(&self.pool).await?;
                }
            }
            Dialect::Postgres => {
                sqlx::query(
                    r#"CREATE OR REPLACE FUNCTION form_schema_registry_append_only()
                    RETURNS trigger AS $$
                    BEGIN
                        RAISE EXCEPTION 'form_schema_registry is append-only';
                    END;
                    $$ LANGUAGE plpgsql"#,
                )
                .execute(&self.pool)
                .await?;
                sqlx::query(
                    "CREATE OR REPLACE TRIGGER form_schema_registry_append_only \
                     BEFORE UPDATE OR DELETE ON form_schema_registry \
                     FOR EACH ROW EXECUTE FUNCTION form_schema_registry_append_only()",
                )
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}
