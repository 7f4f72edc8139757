//! Version commands - draft, inspect and discard form versions

use anyhow::{Context, Result};
use clap::Subcommand;
use formgen_db::{DbError, FormField, NewFormVersion};
use std::path::{Path, PathBuf};

use crate::cli::context::Engine;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_time, print_json, print_table};

#[derive(Subcommand, Debug, Clone)]
pub enum VersionAction {
    /// Draft the next version from a JSON field list
    Create {
        /// Form key or ID
        form: String,
        /// JSON file: an array of fields, or an object with a `fields` array
        #[arg(long)]
        fields: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List versions of a form
    List {
        /// Form key or ID
        form: String,
    },
    /// Show the fields of one version
    Show {
        /// Form key or ID
        form: String,
        version: u32,
    },
    /// Replace the fields of an unpublished version
    SetFields {
        /// Form key or ID
        form: String,
        version: u32,
        #[arg(long)]
        fields: PathBuf,
    },
    /// Delete the latest version if it was never published
    Delete {
        /// Form key or ID
        form: String,
        version: u32,
    },
}

/// Read a field list file. Accepts a bare array or a version object.
pub fn read_fields_file(path: &Path) -> Result<NewFormVersion> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fields file {}", path.display()))?;
    parse_fields(&content).with_context(|| format!("Invalid fields file {}", path.display()))
}

fn parse_fields(content: &str) -> Result<NewFormVersion> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    if value.is_array() {
        let fields: Vec<FormField> = serde_json::from_value(value)?;
        Ok(NewFormVersion::with_fields(fields))
    } else {
        Ok(serde_json::from_value(value)?)
    }
}

fn frozen_hint(err: DbError, form_key: &str) -> anyhow::Error {
    match err {
        DbError::Constraint(msg) | DbError::InvalidState(msg) => anyhow::Error::from(
            HelpfulError::new(msg)
                .with_context("Published versions are immutable and numbering stays gap-free")
                .with_suggestion(format!("TRY: formgen form show {}", form_key)),
        ),
        other => anyhow::Error::from(other),
    }
}

pub async fn run(engine: &Engine, action: VersionAction, json: bool) -> Result<()> {
    match action {
        VersionAction::Create {
            form,
            fields,
            name,
            description,
        } => {
            let form = engine.find_form(&form).await?;
            let mut new = read_fields_file(&fields)?;
            if name.is_some() {
                new.display_name = name;
            }
            if description.is_some() {
                new.description = description;
            }
            let version = engine
                .db
                .create_version(&form.id, new)
                .await
                .map_err(|e| frozen_hint(e, &form.key))?;
            if json {
                return print_json(&version);
            }
            println!(
                "Drafted {} v{} with {} field(s)",
                form.key,
                version.version,
                version.fields.len()
            );
            println!("Preview: formgen ddl {}   Publish: formgen publish {}", form.key, form.key);
            Ok(())
        }
        VersionAction::List { form } => {
            let form = engine.find_form(&form).await?;
            let versions = engine.db.list_versions(&form.id).await?;
            if json {
                return print_json(&versions);
            }
            let rows = versions
                .iter()
                .map(|v| {
                    vec![
                        format!("v{}", v.version),
                        v.display_name.clone(),
                        v.fields.len().to_string(),
                        format_time(v.created_at),
                    ]
                })
                .collect();
            print_table(&["version", "name", "fields", "created"], rows);
            Ok(())
        }
        VersionAction::Show { form, version } => {
            let form = engine.find_form(&form).await?;
            let Some(version) = engine.db.get_version(&form.id, version).await? else {
                return Err(HelpfulError::new(format!("{} has no version {}", form.key, version))
                    .with_suggestion(format!("TRY: formgen version list {}", form.key))
                    .into());
            };
            if json {
                return print_json(&version);
            }
            println!("{} v{}: {}", form.key, version.version, version.display_name);
            let rows = version
                .fields
                .iter()
                .map(|f| {
                    let mut flags = Vec::new();
                    if f.required {
                        flags.push("required");
                    }
                    if f.unique {
                        flags.push("unique");
                    }
                    vec![
                        f.key.clone(),
                        f.field_type.to_string(),
                        flags.join(", "),
                        f.default_value.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(&["key", "type", "flags", "default"], rows);
            Ok(())
        }
        VersionAction::SetFields {
            form,
            version,
            fields,
        } => {
            let form = engine.find_form(&form).await?;
            let new = read_fields_file(&fields)?;
            let updated = engine
                .db
                .replace_draft_fields(&form.id, version, new.fields)
                .await
                .map_err(|e| frozen_hint(e, &form.key))?;
            if json {
                return print_json(&updated);
            }
            println!("Replaced fields of {} v{}", form.key, updated.version);
            Ok(())
        }
        VersionAction::Delete { form, version } => {
            let form = engine.find_form(&form).await?;
            engine
                .db
                .delete_draft_version(&form.id, version)
                .await
                .map_err(|e| frozen_hint(e, &form.key))?;
            if !json {
                println!("Deleted draft {} v{}", form.key, version);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formgen_db::FieldType;

    #[test]
    fn parses_bare_array() {
        let new = parse_fields(
            r#"[{"key":"first_name","type":"SHORT_TEXT","maxLength":50},
                {"key":"is_active","type":"BOOLEAN","required":true}]"#,
        )
        .unwrap();
        assert_eq!(new.fields.len(), 2);
        assert_eq!(new.fields[0].max_length, Some(50));
        assert_eq!(new.fields[1].field_type, FieldType::Boolean);
        assert!(new.display_name.is_none());
    }

    #[test]
    fn parses_version_object() {
        let new = parse_fields(
            r#"{"displayName":"Spring intake","fields":[{"key":"email","type":"EMAIL","unique":true}]}"#,
        )
        .unwrap();
        assert_eq!(new.display_name.as_deref(), Some("Spring intake"));
        assert!(new.fields[0].unique);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(parse_fields(r#"[{"key":"x","type":"MONEY"}]"#).is_err());
    }
}
