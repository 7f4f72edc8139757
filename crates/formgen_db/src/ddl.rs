//! Transactional DDL execution and catalog introspection.
//!
//! A script runs inside one transaction, so a failing statement leaves no
//! partial table behind. Both PostgreSQL and SQLite support transactional DDL.

use formgen_ids::AttemptId;
use sqlx::Row;
use tracing::{debug, info};

use crate::attempts::set_attempt_state;
use crate::error::{DbError, Result};
use crate::types::PublishState;
use crate::{DbConn, Dialect, FormDb};

impl FormDb {
    /// Run `statements` in order inside one transaction.
    pub async fn execute_ddl(&self, statements: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        run_statements(&mut *tx, statements).await?;
        tx.commit().await?;
        info!(statements = statements.len(), "DDL script applied");
        Ok(())
    }

    /// Run a table-creating script and advance the attempt to
    /// `TABLE_CREATED` in the same transaction.
    pub async fn create_table_generation(
        &self,
        attempt_id: &AttemptId,
        statements: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        run_statements(&mut *tx, statements).await?;
        set_attempt_state(&mut *tx, attempt_id, PublishState::TableCreated).await?;
        tx.commit().await?;
        info!(attempt_id = %attempt_id, statements = statements.len(), "Table generation created");
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.relation_exists(name, RelationKind::Table).await
    }

    pub async fn view_exists(&self, name: &str) -> Result<bool> {
        self.relation_exists(name, RelationKind::View).await
    }

    async fn relation_exists(&self, name: &str, kind: RelationKind) -> Result<bool> {
        let sql = match (self.dialect, kind) {
            (Dialect::Sqlite, RelationKind::Table) => {
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = $1"
            }
            (Dialect::Sqlite, RelationKind::View) => {
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'view' AND name = $1"
            }
            (Dialect::Postgres, RelationKind::Table) => {
                "SELECT COUNT(*) AS n FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 AND table_type = 'BASE TABLE'"
            }
            (Dialect::Postgres, RelationKind::View) => {
                "SELECT COUNT(*) AS n FROM information_schema.views \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
        };
        let row = sqlx::query(sql).bind(name).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    /// Column names of a table (or view) in declaration order. Empty if it
    /// does not exist.
    pub async fn table_columns(&self, name: &str) -> Result<Vec<String>> {
        let sql = match self.dialect {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info($1) ORDER BY cid",
            Dialect::Postgres => {
                "SELECT column_name::text AS name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
            }
        };
        let rows = sqlx::query(sql).bind(name).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(DbError::from))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum RelationKind {
    Table,
    View,
}

pub(crate) async fn run_statements(conn: &mut DbConn, statements: &[String]) -> Result<()> {
    for (index, statement) in statements.iter().enumerate() {
        debug!(index, sql = %statement, "Executing DDL");
        sqlx::raw_sql(statement)
            .execute(&mut *conn)
            .await
            .map_err(|source| DbError::Ddl {
                index,
                statement: statement.clone(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_ddl_creates_table() {
        let db = FormDb::open_in_memory().await.unwrap();
        db.execute_ddl(&[
            "CREATE TABLE \"t1\" (\"id\" text PRIMARY KEY, \"n\" integer)".to_string(),
            "CREATE VIEW \"t1_view\" AS SELECT * FROM \"t1\"".to_string(),
        ])
        .await
        .unwrap();

        assert!(db.table_exists("t1").await.unwrap());
        assert!(db.view_exists("t1_view").await.unwrap());
        assert!(!db.table_exists("t1_view").await.unwrap());
        assert_eq!(db.table_columns("t1").await.unwrap(), vec!["id", "n"]);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_script() {
        let db = FormDb::open_in_memory().await.unwrap();
        let err = db
            .execute_ddl(&[
                "CREATE TABLE \"t2\" (\"id\" text PRIMARY KEY)".to_string(),
                "CREATE INDEX \"t2_idx\" ON \"t2\" (\"missing_column\")".to_string(),
            ])
            .await
            .unwrap_err();

        match err {
            DbError::Ddl { index, statement, .. } => {
                assert_eq!(index, 1);
                assert!(statement.contains("missing_column"));
            }
            other => panic!("expected DDL error, got {other:?}"),
        }
        assert!(!db.table_exists("t2").await.unwrap());
        assert!(db.table_columns("t2").await.unwrap().is_empty());
    }
}
