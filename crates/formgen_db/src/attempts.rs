//! Publish journal: one row per run of the publish state machine.

use formgen_ids::{AttemptId, FormId};
use sqlx::Row;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::types::*;
use crate::{parse_id, to_version, DbConn, DbRow, FormDb};

const ATTEMPT_COLUMNS: &str = "attempt_id, form_id, version, table_name, view_name, ddl, state, \
     failed_at_state, failure_stage, failed_statement_index, failed_statement, error, \
     started_at, updated_at";

/// Table created, alias never switched. Mirrors `PublishAttempt::needs_reconciliation`.
const UNRECONCILED: &str = "(state IN ('TABLE_CREATED', 'REGISTERED') \
     OR (state = 'FAILED' AND failed_at_state IN ('TABLE_CREATED', 'REGISTERED')))";

/// A table was created at some point. Mirrors `PublishState::table_exists`
/// applied to `PublishAttempt::reached_state`.
pub(crate) const TABLE_CREATED: &str = "(state IN ('TABLE_CREATED', 'REGISTERED', 'ALIASED', 'DONE') \
     OR (state = 'FAILED' AND failed_at_state IN ('TABLE_CREATED', 'REGISTERED', 'ALIASED', 'DONE')))";

impl FormDb {
    /// Journal a new attempt. It starts at `DDL_BUILT`: the earlier states
    /// are pure and leave nothing to recover.
    pub async fn start_attempt(&self, new: NewPublishAttempt) -> Result<PublishAttempt> {
        let attempt_id = AttemptId::new();
        let now = Self::now_text();
        sqlx::query(
            r#"
            INSERT INTO form_publish_attempts
                (attempt_id, form_id, version, table_name, view_name, ddl, state, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(attempt_id.as_str())
        .bind(new.form_id.as_str())
        .bind(new.version as i64)
        .bind(&new.table_name)
        .bind(&new.view_name)
        .bind(&new.ddl)
        .bind(PublishState::DdlBuilt.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(attempt_id = %attempt_id, form_id = %new.form_id, version = new.version, "Publish attempt journaled");
        self.get_attempt(&attempt_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("publish attempt {}", attempt_id)))
    }

    pub async fn get_attempt(&self, attempt_id: &AttemptId) -> Result<Option<PublishAttempt>> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM form_publish_attempts WHERE attempt_id = $1");
        let row = sqlx::query(&sql)
            .bind(attempt_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    /// The attempt a publish of `(form, version)` continues from: one whose
    /// table exists but was never aliased if there is any, else the most
    /// recent. `started_at` has millisecond precision, so recency alone can
    /// tie.
    pub async fn latest_attempt(&self, form_id: &FormId, version: u32) -> Result<Option<PublishAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM form_publish_attempts \
             WHERE form_id = $1 AND version = $2 \
             ORDER BY CASE WHEN {UNRECONCILED} THEN 0 ELSE 1 END, started_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(form_id.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    /// All attempts for a form, newest first.
    pub async fn list_attempts(&self, form_id: &FormId) -> Result<Vec<PublishAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM form_publish_attempts \
             WHERE form_id = $1 ORDER BY started_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(form_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    /// Attempts whose table exists but whose alias was never switched:
    /// stopped (or still running) at `TABLE_CREATED` or `REGISTERED`.
    pub async fn unreconciled_attempts(&self) -> Result<Vec<PublishAttempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM form_publish_attempts \
             WHERE {UNRECONCILED} ORDER BY started_at"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_attempt).collect()
    }

    /// Move an attempt to `state` outside any other work (e.g. `DONE`).
    pub async fn advance_attempt(&self, attempt_id: &AttemptId, state: PublishState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        set_attempt_state(&mut conn, attempt_id, state).await
    }

    /// Mark an attempt `FAILED`, remembering where and why.
    pub async fn fail_attempt(&self, attempt_id: &AttemptId, failure: &AttemptFailure) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE form_publish_attempts SET
                state = 'FAILED',
                failed_at_state = $1,
                failure_stage = $2,
                failed_statement_index = $3,
                failed_statement = $4,
                error = $5,
                updated_at = $6
            WHERE attempt_id = $7
            "#,
        )
        .bind(failure.at_state.as_str())
        .bind(failure.stage.as_str())
        .bind(failure.statement_index.map(i64::from))
        .bind(failure.statement.as_deref())
        .bind(&failure.message)
        .bind(Self::now_text())
        .bind(attempt_id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("publish attempt {}", attempt_id)));
        }
        Ok(())
    }

    /// Put a failed attempt back at the state it had reached, clearing the
    /// failure, so a resumed publish continues from there.
    pub async fn reopen_attempt(&self, attempt_id: &AttemptId) -> Result<PublishAttempt> {
        let attempt = self
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("publish attempt {}", attempt_id)))?;
        let resume_at = attempt.reached_state();
        if !resume_at.table_exists() {
            return Err(DbError::invalid_state(format!(
                "attempt {} never created its table; start a new attempt",
                attempt_id
            )));
        }
        sqlx::query(
            r#"
            UPDATE form_publish_attempts SET
                state = $1,
                failed_at_state = NULL,
                failure_stage = NULL,
                failed_statement_index = NULL,
                failed_statement = NULL,
                error = NULL,
                updated_at = $2
            WHERE attempt_id = $3
            "#,
        )
        .bind(resume_at.as_str())
        .bind(Self::now_text())
        .bind(attempt_id.as_str())
        .execute(&self.pool)
        .await?;
        debug!(attempt_id = %attempt_id, state = %resume_at, "Publish attempt reopened");
        self.get_attempt(attempt_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("publish attempt {}", attempt_id)))
    }
}

pub(crate) async fn set_attempt_state(
    conn: &mut DbConn,
    attempt_id: &AttemptId,
    state: PublishState,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE form_publish_attempts SET state = $1, updated_at = $2 WHERE attempt_id = $3",
    )
    .bind(state.as_str())
    .bind(FormDb::now_text())
    .bind(attempt_id.as_str())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::not_found(format!("publish attempt {}", attempt_id)));
    }
    Ok(())
}

fn parse_state(raw: &str) -> Result<PublishState> {
    PublishState::parse(raw)
        .ok_or_else(|| DbError::invalid_state(format!("unknown publish state '{}'", raw)))
}

fn row_to_attempt(row: &DbRow) -> Result<PublishAttempt> {
    let state: String = row.try_get("state")?;
    let failed_at: Option<String> = row.try_get("failed_at_state")?;
    let stage: Option<String> = row.try_get("failure_stage")?;
    let statement_index: Option<i64> = row.try_get("failed_statement_index")?;
    Ok(PublishAttempt {
        attempt_id: parse_id(&row.try_get::<String, _>("attempt_id")?)?,
        form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
        version: to_version(row.try_get("version")?)?,
        table_name: row.try_get("table_name")?,
        view_name: row.try_get("view_name")?,
        ddl: row.try_get("ddl")?,
        state: parse_state(&state)?,
        failed_at_state: failed_at.as_deref().map(parse_state).transpose()?,
        failure_stage: stage.as_deref().and_then(PublishStage::parse),
        failed_statement_index: statement_index.and_then(|i| u32::try_from(i).ok()),
        failed_statement: row.try_get("failed_statement")?,
        error: row.try_get("error")?,
        started_at: FormDb::parse_ts(&row.try_get::<String, _>("started_at")?)?,
        updated_at: FormDb::parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_attempt(form_id: &FormId) -> NewPublishAttempt {
        NewPublishAttempt {
            form_id: form_id.clone(),
            version: 1,
            table_name: "form_customer_v1".to_string(),
            view_name: "form_customer_active".to_string(),
            ddl: "CREATE TABLE ...".to_string(),
        }
    }

    #[tokio::test]
    async fn test_attempt_lifecycle() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();

        let attempt = db.start_attempt(new_attempt(&form_id)).await.unwrap();
        assert_eq!(attempt.state, PublishState::DdlBuilt);

        db.advance_attempt(&attempt.attempt_id, PublishState::TableCreated)
            .await
            .unwrap();
        let pending = db.unreconciled_attempts().await.unwrap();
        assert_eq!(pending.len(), 1);

        db.advance_attempt(&attempt.attempt_id, PublishState::Done)
            .await
            .unwrap();
        assert!(db.unreconciled_attempts().await.unwrap().is_empty());

        let latest = db.latest_attempt(&form_id, 1).await.unwrap().unwrap();
        assert_eq!(latest.state, PublishState::Done);
    }

    #[tokio::test]
    async fn test_fail_and_reopen() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();
        let attempt = db.start_attempt(new_attempt(&form_id)).await.unwrap();
        db.advance_attempt(&attempt.attempt_id, PublishState::TableCreated)
            .await
            .unwrap();

        db.fail_attempt(
            &attempt.attempt_id,
            &AttemptFailure {
                at_state: PublishState::TableCreated,
                stage: PublishStage::Registration,
                statement_index: None,
                statement: None,
                message: "disk full".to_string(),
            },
        )
        .await
        .unwrap();

        let failed = db.get_attempt(&attempt.attempt_id).await.unwrap().unwrap();
        assert_eq!(failed.state, PublishState::Failed);
        assert_eq!(failed.failed_at_state, Some(PublishState::TableCreated));
        assert_eq!(failed.failure_stage, Some(PublishStage::Registration));
        assert!(failed.needs_reconciliation());
        assert_eq!(db.unreconciled_attempts().await.unwrap().len(), 1);

        let reopened = db.reopen_attempt(&attempt.attempt_id).await.unwrap();
        assert_eq!(reopened.state, PublishState::TableCreated);
        assert!(reopened.error.is_none());
    }

    #[tokio::test]
    async fn test_reopen_refuses_attempt_without_table() {
        let db = FormDb::open_in_memory().await.unwrap();
        let attempt = db.start_attempt(new_attempt(&FormId::new())).await.unwrap();
        db.fail_attempt(
            &attempt.attempt_id,
            &AttemptFailure {
                at_state: PublishState::DdlBuilt,
                stage: PublishStage::Execution,
                statement_index: Some(2),
                statement: Some("CREATE INDEX ...".to_string()),
                message: "syntax error".to_string(),
            },
        )
        .await
        .unwrap();

        let failed = db.get_attempt(&attempt.attempt_id).await.unwrap().unwrap();
        assert_eq!(failed.failed_statement_index, Some(2));
        assert!(!failed.needs_reconciliation());

        let err = db.reopen_attempt(&attempt.attempt_id).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_latest_attempt_prefers_resumable_on_timestamp_tie() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();

        let created = db.start_attempt(new_attempt(&form_id)).await.unwrap();
        db.advance_attempt(&created.attempt_id, PublishState::TableCreated)
            .await
            .unwrap();
        let abandoned = db.start_attempt(new_attempt(&form_id)).await.unwrap();
        db.fail_attempt(
            &abandoned.attempt_id,
            &AttemptFailure {
                at_state: PublishState::DdlBuilt,
                stage: PublishStage::Execution,
                statement_index: None,
                statement: None,
                message: "abandoned".to_string(),
            },
        )
        .await
        .unwrap();

        sqlx::query("UPDATE form_publish_attempts SET started_at = $1 WHERE form_id = $2")
            .bind(FormDb::now_text())
            .bind(form_id.as_str())
            .execute(db.pool())
            .await
            .unwrap();

        let latest = db.latest_attempt(&form_id, 1).await.unwrap().unwrap();
        assert_eq!(latest.attempt_id, created.attempt_id);
        assert!(latest.needs_reconciliation());

        // Once aliased, plain recency decides again
        db.advance_attempt(&created.attempt_id, PublishState::Done)
            .await
            .unwrap();
        let newer = db.start_attempt(new_attempt(&form_id)).await.unwrap();
        sqlx::query("UPDATE form_publish_attempts SET started_at = $1 WHERE attempt_id = $2")
            .bind(FormDb::format_ts(chrono::Utc::now() + chrono::Duration::seconds(5)))
            .bind(newer.attempt_id.as_str())
            .execute(db.pool())
            .await
            .unwrap();
        let latest = db.latest_attempt(&form_id, 1).await.unwrap().unwrap();
        assert_eq!(latest.attempt_id, newer.attempt_id);
    }
}
