//! DDL command - preview the script a publish would run

use anyhow::{anyhow, Result};
use clap::Args;
use formgen_db::Dialect;
use formgen_schema::DdlSynthesizer;

use crate::cli::context::Engine;
use crate::cli::error::HelpfulError;
use crate::cli::output::print_json;

/// Arguments for the `ddl` command
#[derive(Debug, Args)]
pub struct DdlArgs {
    /// Form key or ID
    pub form: String,

    /// Version to render (default: latest)
    #[arg(long)]
    pub version: Option<u32>,

    /// Render for another dialect than the connected store
    #[arg(long, value_parser = parse_dialect)]
    pub dialect: Option<Dialect>,
}

fn parse_dialect(s: &str) -> Result<Dialect> {
    Dialect::parse(s).ok_or_else(|| anyhow!("unknown dialect '{}' (expected postgres or sqlite)", s))
}

pub async fn run(engine: &Engine, args: DdlArgs, json: bool) -> Result<()> {
    let form = engine.find_form(&args.form).await?;
    let version = match args.version {
        Some(n) => engine.db.get_version(&form.id, n).await?,
        None => engine.db.latest_version(&form.id).await?,
    };
    let Some(version) = version else {
        return Err(HelpfulError::new(format!("{} has no such version", form.key))
            .with_suggestion(format!("TRY: formgen version list {}", form.key))
            .into());
    };

    let dialect = args.dialect.unwrap_or(engine.db.dialect());
    let script = DdlSynthesizer::new(dialect)
        .synthesize(&form.key, version.version, &version.fields)
        .map_err(|e| {
            HelpfulError::new(format!("{} v{} cannot be published: {}", form.key, version.version, e))
                .with_suggestion(format!(
                    "TRY: formgen version set-fields {} {} --fields fields.json",
                    form.key, version.version
                ))
        })?;

    if json {
        return print_json(&serde_json::json!({
            "script": script,
            "sql": script.sql(),
            "ddlHash": script.content_hash(),
        }));
    }

    println!("-- {} v{} ({})", form.key, version.version, dialect);
    println!("-- table: {}  view: {}", script.table_name, script.view_name);
    println!("-- sha256: {}", script.content_hash());
    print!("{}", script.sql());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_names() {
        assert_eq!(parse_dialect("postgres").unwrap(), Dialect::Postgres);
        assert_eq!(parse_dialect("SQLite").unwrap(), Dialect::Sqlite);
        assert!(parse_dialect("mysql").is_err());
    }
}
