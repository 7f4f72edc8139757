//! Store access shared by all subcommands.

use anyhow::{Context, Result};
use formgen_db::{DbConfig, Form, FormDb};
use formgen_ids::FormId;
use formgen_schema::{PublishOptions, PublishOrchestrator};
use tracing::debug;

use crate::cli::config::EngineConfig;
use crate::cli::error::HelpfulError;

/// Open store plus the orchestrator built on it.
pub struct Engine {
    pub db: FormDb,
    pub orchestrator: PublishOrchestrator,
}

impl Engine {
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        let db_config = DbConfig::from_url(config.database_url.clone())
            .context("Invalid database_url")?
            .with_max_connections(config.max_connections);
        if let Some(path) = sqlite_path(&config.database_url) {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
        }

        let db = FormDb::connect(db_config).await.map_err(|e| {
            HelpfulError::new(format!("Cannot open database: {}", e))
                .with_context(format!("database_url = {}", config.database_url))
                .with_suggestions([
                    "TRY: formgen config   # Show the resolved database URL",
                    "TRY: --database-url sqlite:./forms.sqlite3",
                ])
        })?;
        debug!(dialect = %db.dialect(), "store opened");
        let orchestrator = PublishOrchestrator::new(db.clone()).with_options(PublishOptions {
            lease_ttl: config.lease_ttl(),
        });
        Ok(Self { db, orchestrator })
    }

    /// Look a form up by ID or key.
    pub async fn find_form(&self, reference: &str) -> Result<Form> {
        let found = match FormId::parse(reference) {
            Ok(id) => self.db.get_form(&id).await?,
            Err(_) => self.db.get_form_by_key(reference).await?,
        };
        found.ok_or_else(|| HelpfulError::form_not_found(reference).into())
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}

/// File path of a `sqlite:` URL, if it names a file.
fn sqlite_path(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_paths() {
        assert_eq!(sqlite_path("sqlite:/tmp/f.sqlite3"), Some("/tmp/f.sqlite3"));
        assert_eq!(sqlite_path("sqlite://data/f.db?mode=rwc"), Some("data/f.db"));
        assert_eq!(sqlite_path("sqlite::memory:"), None);
        assert_eq!(sqlite_path("postgres://localhost/forms"), None);
    }

    #[tokio::test]
    async fn open_creates_database_and_finds_forms() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            database_url: format!("sqlite:{}", dir.path().join("db").join("forms.sqlite3").display()),
            ..EngineConfig::default()
        };
        let engine = Engine::open(&config).await.unwrap();
        let form = engine
            .db
            .create_form(formgen_db::NewForm::new("customer", "Customer"))
            .await
            .unwrap();

        assert_eq!(engine.find_form("customer").await.unwrap().id, form.id);
        assert_eq!(engine.find_form(form.id.as_str()).await.unwrap().key, "customer");
        assert!(engine.find_form("missing").await.is_err());
        engine.close().await;
    }
}
