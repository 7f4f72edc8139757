//! Publish, resolve, history and reconcile commands

use anyhow::Result;
use comfy_table::Color;

use crate::cli::context::Engine;
use crate::cli::error::HelpfulError;
use crate::cli::output::{
    color_for_state, format_time, print_json, print_table, print_table_colored, truncate,
};

pub async fn run_publish(engine: &Engine, reference: &str, json: bool) -> Result<()> {
    let form = engine.find_form(reference).await?;
    let outcome = engine
        .orchestrator
        .publish(&form.id)
        .await
        .map_err(|e| HelpfulError::publish_failed(&form.key, &e))?;

    if json {
        return print_json(&outcome);
    }
    if outcome.resumed {
        println!("Resumed an interrupted publish of {} v{}", outcome.form_key, outcome.version);
    } else {
        println!("Published {} v{}", outcome.form_key, outcome.version);
    }
    println!("  table:   {}", outcome.table_name);
    println!("  view:    {}", outcome.view_name);
    println!("  sha256:  {}", outcome.ddl_hash);
    println!("  attempt: {}", outcome.attempt_id);
    Ok(())
}

pub async fn run_resolve(engine: &Engine, form_key: &str, json: bool) -> Result<()> {
    let Some(active) = engine.orchestrator.resolve_active_table(form_key).await? else {
        if engine.db.get_form_by_key(form_key).await?.is_none() {
            return Err(HelpfulError::form_not_found(form_key).into());
        }
        return Err(HelpfulError::not_published(form_key).into());
    };
    if json {
        return print_json(&active);
    }
    println!("{} v{}", active.form_key, active.version);
    println!("  table: {}", active.table_name);
    println!("  view:  {}", active.view_name);
    Ok(())
}

pub async fn run_history(engine: &Engine, reference: &str, json: bool) -> Result<()> {
    let form = engine.find_form(reference).await?;
    let entries = engine.db.list_entries(&form.id).await?;
    let attempts = engine.db.list_attempts(&form.id).await?;
    let alias = engine.db.get_alias(&form.id).await?;

    if json {
        return print_json(&serde_json::json!({
            "form": form,
            "alias": alias,
            "registry": entries,
            "attempts": attempts,
        }));
    }

    println!("REGISTRY: {}", form.key);
    let active_version = alias.as_ref().map(|a| a.active_version);
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                format!("v{}", e.version),
                e.table_name.clone(),
                e.ddl_hash[..12.min(e.ddl_hash.len())].to_string(),
                format_time(e.created_at),
                if Some(e.version) == active_version { "*" } else { "" }.to_string(),
            ]
        })
        .collect();
    print_table(&["version", "table", "sha256", "created", "active"], rows);

    if !attempts.is_empty() {
        println!();
        println!("PUBLISH ATTEMPTS");
        let rows = attempts
            .iter()
            .map(|a| {
                let failure = match (&a.failure_stage, &a.error) {
                    (Some(stage), Some(error)) => format!("{}: {}", stage, truncate(error, 60)),
                    (None, Some(error)) => truncate(error, 60),
                    _ => String::new(),
                };
                vec![
                    (a.attempt_id.short().to_string(), None),
                    (format!("v{}", a.version), None),
                    (a.state.to_string(), Some(color_for_state(a.state))),
                    (failure, None),
                    (format_time(a.started_at), None),
                ]
            })
            .collect();
        print_table_colored(&["attempt", "version", "state", "failure", "started"], rows);
    }
    Ok(())
}

pub async fn run_reconcile(engine: &Engine, reference: Option<&str>, json: bool) -> Result<()> {
    let reports = match reference {
        Some(reference) => {
            let form = engine.find_form(reference).await?;
            vec![engine.orchestrator.reconcile_form(&form.id).await?]
        }
        None => engine.orchestrator.reconcile_all().await?,
    };

    if json {
        return print_json(&reports);
    }

    let rows = reports
        .iter()
        .map(|r| {
            let (pending, color) = if r.pending_attempts.is_empty() {
                ("-".to_string(), None)
            } else {
                (
                    r.pending_attempts
                        .iter()
                        .map(|id| id.short().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    Some(Color::Yellow),
                )
            };
            vec![
                (r.form_key.clone(), None),
                (
                    if r.projection_fixed { "fixed" } else { "ok" }.to_string(),
                    r.projection_fixed.then_some(Color::Yellow),
                ),
                (pending, color),
            ]
        })
        .collect();
    print_table_colored(&["form", "projection", "interrupted publishes"], rows);

    if reports.iter().any(|r| !r.pending_attempts.is_empty()) {
        println!();
        println!("Interrupted publishes resume on the next: formgen publish <form>");
    }
    Ok(())
}
