//! Rows command - page through a form's active table

use anyhow::{bail, Result};
use clap::Args;
use formgen_db::{DbValue, Pagination, TableQuery};

use crate::cli::context::Engine;
use crate::cli::error::HelpfulError;
use crate::cli::output::{json_cell, print_json, print_table, truncate};

#[derive(Args, Debug, Clone)]
pub struct RowsArgs {
    /// Form key
    pub form: String,
    #[arg(long, default_value_t = 1)]
    pub page: u32,
    #[arg(long, default_value_t = 10)]
    pub page_size: u32,
    /// Equality filter, repeatable: `--filter status=open`
    #[arg(long = "filter", value_name = "COLUMN=VALUE")]
    pub filters: Vec<String>,
    /// Include soft-deleted rows
    #[arg(long)]
    pub include_deleted: bool,
}

fn parse_filter(raw: &str) -> Result<(String, DbValue)> {
    let Some((column, value)) = raw.split_once('=') else {
        bail!("Filter '{}' must look like COLUMN=VALUE", raw);
    };
    let value = match value {
        "null" => DbValue::Null,
        "true" => DbValue::Boolean(true),
        "false" => DbValue::Boolean(false),
        v => match (v.parse::<i64>(), v.parse::<f64>()) {
            (Ok(i), _) => DbValue::Integer(i),
            (_, Ok(f)) if f.is_finite() => DbValue::Real(f),
            _ => DbValue::Text(v.to_string()),
        },
    };
    Ok((column.trim().to_string(), value))
}

pub async fn run(engine: &Engine, args: RowsArgs, json: bool) -> Result<()> {
    let Some(active) = engine.orchestrator.resolve_active_table(&args.form).await? else {
        return Err(HelpfulError::not_published(&args.form).into());
    };

    let mut query = TableQuery::new().include_deleted(args.include_deleted);
    for raw in &args.filters {
        let (column, value) = parse_filter(raw)?;
        query = query.filter(column, value);
    }
    let page = engine
        .db
        .query_table(
            &active.table_name,
            &query,
            Pagination::new(args.page, args.page_size),
        )
        .await?;

    if json {
        return print_json(&page);
    }

    println!(
        "{} v{} ({}): page {} of {}, {} row(s)",
        active.form_key,
        active.version,
        active.table_name,
        page.page,
        page.total_pages.max(1),
        page.total
    );
    let Some(first) = page.rows.first().and_then(|r| r.as_object()) else {
        return Ok(());
    };
    let headers: Vec<String> = first.keys().cloned().collect();
    let rows = page
        .rows
        .iter()
        .map(|row| {
            headers
                .iter()
                .map(|h| truncate(&json_cell(row.get(h).unwrap_or(&serde_json::Value::Null)), 40))
                .collect()
        })
        .collect();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    print_table(&header_refs, rows);
    Ok(())
}
