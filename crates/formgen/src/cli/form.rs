//! Form commands - create, list, show and archive forms

use anyhow::Result;
use clap::Subcommand;
use formgen_db::{DbError, NewForm};

use crate::cli::context::Engine;
use crate::cli::error::HelpfulError;
use crate::cli::output::{color_for_status, format_time, print_json, print_table, print_table_colored};

#[derive(Subcommand, Debug, Clone)]
pub enum FormAction {
    /// Create a form
    Create {
        /// Immutable key, e.g. `customer`; names the form's tables
        key: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// List forms
    List,
    /// Show a form and its versions
    Show {
        /// Form key or ID
        form: String,
    },
    /// Archive a form; its tables and history are kept
    Archive {
        /// Form key or ID
        form: String,
    },
}

pub async fn run(engine: &Engine, action: FormAction, json: bool) -> Result<()> {
    match action {
        FormAction::Create {
            key,
            name,
            description,
            created_by,
        } => {
            let mut new = NewForm::new(key.clone(), name.unwrap_or_else(|| key.clone()));
            new.description = description;
            new.created_by = created_by;
            let form = engine.db.create_form(new).await.map_err(|e| match e {
                DbError::Constraint(_) => anyhow::Error::from(
                    HelpfulError::new(format!("Form key '{}' is taken", key))
                        .with_suggestion("TRY: formgen form list"),
                ),
                DbError::InvalidInput(msg) => anyhow::Error::from(
                    HelpfulError::new(msg)
                        .with_context("Form keys use lowercase letters, digits and underscores"),
                ),
                other => anyhow::Error::from(other),
            })?;
            if json {
                return print_json(&form);
            }
            println!("Created form '{}' ({})", form.key, form.id);
            Ok(())
        }
        FormAction::List => {
            let forms = engine.db.list_forms().await?;
            if json {
                return print_json(&forms);
            }
            if forms.is_empty() {
                println!("No forms. Create one with: formgen form create <key>");
                return Ok(());
            }
            let rows = forms
                .iter()
                .map(|f| {
                    vec![
                        (f.key.clone(), None),
                        (f.name.clone(), None),
                        (f.status.to_string(), Some(color_for_status(f.status))),
                        (f.current_version.to_string(), None),
                        (format_time(f.updated_at), None),
                    ]
                })
                .collect();
            print_table_colored(&["key", "name", "status", "active version", "updated"], rows);
            Ok(())
        }
        FormAction::Show { form } => {
            let form = engine.find_form(&form).await?;
            let versions = engine.db.list_versions(&form.id).await?;
            let entries = engine.db.list_entries(&form.id).await?;
            if json {
                return print_json(&serde_json::json!({
                    "form": form,
                    "versions": versions,
                }));
            }

            println!("Form:        {} ({})", form.key, form.id);
            println!("Name:        {}", form.name);
            if let Some(description) = &form.description {
                println!("Description: {}", description);
            }
            println!("Status:      {}", form.status);
            println!("Active:      v{}", form.current_version);
            println!();
            let rows = versions
                .iter()
                .map(|v| {
                    let published = entries.iter().any(|e| e.version == v.version);
                    vec![
                        format!("v{}", v.version),
                        v.display_name.clone(),
                        v.fields.len().to_string(),
                        if published { "yes" } else { "draft" }.to_string(),
                        format_time(v.created_at),
                    ]
                })
                .collect();
            print_table(&["version", "name", "fields", "published", "created"], rows);
            Ok(())
        }
        FormAction::Archive { form } => {
            let form = engine.find_form(&form).await?;
            let form = engine.db.archive_form(&form.id).await?;
            if json {
                return print_json(&form);
            }
            println!("Archived form '{}'; tables and history are kept", form.key);
            Ok(())
        }
    }
}
