//! Engine configuration
//!
//! Read from `$FORMGEN_HOME/config.toml` (or `--config`). Every field has a
//! default, so a missing file or a partial one is fine.

use anyhow::{Context, Result};
use formgen_logging::formgen_home;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_LEASE_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `sqlite:<path>` or `postgres://...`
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// A publish lease older than this is taken over.
    #[serde(default = "default_lease_ttl_secs")]
    pub publish_lease_ttl_secs: u64,
}

fn default_database_url() -> String {
    format!("sqlite:{}", formgen_home().join("formgen.sqlite3").display())
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            publish_lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse config file {}. Delete this file to reset.",
                path.display()
            )
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.publish_lease_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

/// `$FORMGEN_HOME/config.toml`
pub fn default_config_path() -> PathBuf {
    formgen_home().join("config.toml")
}

/// Run the config command - shows (and optionally saves) the resolved config
pub fn run(config: &EngineConfig, path: &Path, save: bool, json: bool) -> Result<()> {
    if save {
        config.save(path)?;
    }

    if json {
        let out = serde_json::json!({
            "home": formgen_home().to_string_lossy(),
            "config_file": {
                "path": path.to_string_lossy(),
                "exists": path.exists(),
            },
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("FORMGEN CONFIGURATION");
    println!("=====================");
    println!();
    println!("Home:        {}", formgen_home().display());
    println!(
        "Config file: {} ({})",
        path.display(),
        if path.exists() { "exists" } else { "not found, using defaults" }
    );
    println!();
    println!("database_url           = {}", config.database_url);
    println!("max_connections        = {}", config.max_connections);
    println!("publish_lease_ttl_secs = {}", config.publish_lease_ttl_secs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.publish_lease_ttl_secs, 900);
        assert!(config.database_url.starts_with("sqlite:"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_connections = 12\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.publish_lease_ttl_secs, 900);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = EngineConfig {
            database_url: "postgres://forms@localhost/forms".into(),
            max_connections: 3,
            publish_lease_ttl_secs: 60,
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
        assert_eq!(config.lease_ttl(), chrono::Duration::seconds(60));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_connections = \"many\"\n").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
