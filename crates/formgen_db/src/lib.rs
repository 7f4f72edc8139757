//! Data-access layer for the form schema engine.
//!
//! Every SQL statement the engine issues goes through [`FormDb`]: the form
//! catalog, the append-only schema registry, per-form table aliases, the
//! publish journal and lease, the transactional DDL executor, and paged
//! record reads.
//!
//! # Usage
//!
//! ```rust,ignore
//! use formgen_db::{DbConfig, FormDb, NewForm};
//!
//! let db = FormDb::connect(DbConfig::sqlite("/var/lib/formgen/forms.sqlite3")).await?;
//! let form = db.create_form(NewForm::new("customer", "Customer")).await?;
//! let active = db.resolve_active_table("customer").await?;
//! ```

mod error;
mod pool;
mod schema;
mod types;

pub mod sql_guard;

// Method implementations organized by domain
mod alias;
mod attempts;
mod ddl;
mod forms;
mod lease;
mod records;
mod registry;

pub use error::{DbError, Result};
pub use pool::{create_pool, Db, DbConfig, DbConn, DbPool, DbRow, Dialect};
pub use types::*;

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use tracing::info;

/// Handle to the engine's store. Cheap to clone.
#[derive(Clone)]
pub struct FormDb {
    pool: DbPool,
    dialect: Dialect,
}

impl FormDb {
    /// Connect with the given configuration and create bookkeeping tables
    /// if they don't exist.
    pub async fn connect(config: DbConfig) -> Result<Self> {
        let pool = create_pool(&config).await?;
        let db = Self {
            pool,
            dialect: config.dialect,
        };
        db.ensure_schema().await?;
        info!(dialect = %db.dialect, "Form store ready");
        Ok(db)
    }

    /// Open or create a SQLite database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Self::connect(DbConfig::sqlite(path.display().to_string())).await?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Private in-memory SQLite database (tests, previews).
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect(DbConfig::sqlite_memory()).await
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities. Timestamps are stored as RFC 3339 text in UTC with
// millisecond precision, which sorts lexicographically on both backends.
impl FormDb {
    pub(crate) fn now_text() -> String {
        Self::format_ts(Utc::now())
    }

    pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub(crate) fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| DbError::Timestamp(text.to_string()))
    }
}

pub(crate) fn to_version(raw: i64) -> Result<u32> {
    u32::try_from(raw).map_err(|_| DbError::invalid_state(format!("version out of range: {}", raw)))
}

pub(crate) fn parse_id<T>(raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = formgen_ids::IdParseError>,
{
    raw.parse::<T>()
        .map_err(|e| DbError::invalid_state(format!("corrupt identifier in store: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("forms.sqlite3");

        let db = FormDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        assert_eq!(db.dialect(), Dialect::Sqlite);

        db.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("forms.sqlite3");

        let db = FormDb::open(&db_path).await.unwrap();
        db.create_form(NewForm::new("customer", "Customer")).await.unwrap();
        db.close().await;

        let db = FormDb::open(&db_path).await.unwrap();
        let form = db.get_form_by_key("customer").await.unwrap();
        assert!(form.is_some());
        db.close().await;
    }

    #[test]
    fn test_timestamp_round_trip() {
        let text = FormDb::now_text();
        assert!(text.ends_with('Z'));
        let parsed = FormDb::parse_ts(&text).unwrap();
        assert_eq!(FormDb::format_ts(parsed), text);
        assert!(matches!(
            FormDb::parse_ts("yesterday"),
            Err(DbError::Timestamp(_))
        ));
    }
}
