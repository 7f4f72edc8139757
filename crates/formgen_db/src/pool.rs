//! Connection pool creation.
//!
//! The backend is chosen at compile time via feature flags, so the pool,
//! row and connection types are concrete (`SqlitePool` or `PgPool`) rather
//! than `sqlx::Any`.
//!
//! # Feature Priority
//!
//! - `sqlite` feature (default): `SqlitePool`
//! - `postgres` feature without `sqlite`: `PgPool`

use std::fmt;
use std::time::Duration;

use tracing::info;

use crate::error::{DbError, Result};

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type Db = sqlx::Postgres;

/// Database pool type alias.
pub type DbPool = sqlx::Pool<Db>;

/// Single connection, as reached through `&mut *tx` or `&mut *pool_conn`.
pub type DbConn = <Db as sqlx::Database>::Connection;

/// Database row type for queries.
pub type DbRow = <Db as sqlx::Database>::Row;

/// SQL dialect. Drives DDL synthesis and the few dialect-specific queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Dialect of the backend this crate was compiled against.
    pub const fn compiled() -> Self {
        #[cfg(feature = "sqlite")]
        {
            Dialect::Sqlite
        }
        #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
        {
            Dialect::Postgres
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Detect the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else {
            None
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Detected dialect
    pub dialect: Dialect,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// SQLite file database, created if missing.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            dialect: Dialect::Sqlite,
            max_connections: 5,
        }
    }

    /// In-memory SQLite (for testing). A single connection, so every
    /// caller sees the same database.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            dialect: Dialect::Sqlite,
            max_connections: 1,
        }
    }

    /// PostgreSQL configuration.
    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dialect: Dialect::Postgres,
            max_connections: 10,
        }
    }

    /// Create configuration from a URL, auto-detecting the dialect.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let dialect = Dialect::from_url(&url).ok_or_else(|| DbError::InvalidUrl(url.clone()))?;
        let max_connections = match dialect {
            Dialect::Sqlite => 5,
            Dialect::Postgres => 10,
        };
        Ok(Self {
            url,
            dialect,
            max_connections,
        })
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Create a database pool from configuration.
///
/// Fails with `NotCompiled` when the URL names a backend this build lacks.
pub async fn create_pool(config: &DbConfig) -> Result<DbPool> {
    if config.dialect != Dialect::compiled() {
        return Err(DbError::NotCompiled(
            config.dialect.to_string(),
            config.dialect.as_str().to_string(),
        ));
    }

    #[cfg(feature = "sqlite")]
    {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
        use std::str::FromStr;

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);

        if config.is_memory() {
            // Dropping the last connection drops the database.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool = pool_options.connect_with(options).await?;
        info!(dialect = %config.dialect, "Connected to database");
        Ok(pool)
    }

    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;
        info!(dialect = %config.dialect, "Connected to database");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite::memory:"), Some(Dialect::Sqlite));
        assert_eq!(
            Dialect::from_url("postgres://localhost/forms"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_url("postgresql://localhost/forms"),
            Some(Dialect::Postgres)
        );
        assert_eq!(Dialect::from_url("mysql://localhost"), None);
    }

    #[test]
    fn test_from_url_rejects_unknown_scheme() {
        let err = DbConfig::from_url("mysql://localhost").unwrap_err();
        assert!(matches!(err, DbError::InvalidUrl(_)));
    }

    #[test]
    fn test_max_connections_floor() {
        let config = DbConfig::postgres("postgres://x").with_max_connections(0);
        assert_eq!(config.max_connections, 1);
    }

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn test_sqlite_pool() {
        let pool = create_pool(&DbConfig::sqlite_memory()).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn test_postgres_not_compiled_in_sqlite_build() {
        let result = create_pool(&DbConfig::postgres("postgres://localhost/forms")).await;
        assert!(matches!(result, Err(DbError::NotCompiled(_, _))));
    }
}
