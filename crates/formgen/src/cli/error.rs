//! Helpful error types for CLI commands
//!
//! Every error includes what went wrong, where possible some context, and
//! suggestions for how to fix it.

use formgen_schema::{ConflictError, PublishError, ValidationError};
use std::fmt;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.suggestions.extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    // === Common error constructors ===

    pub fn form_not_found(reference: &str) -> Self {
        Self::new(format!("Form not found: {}", reference))
            .with_context("Forms are looked up by key or by ID")
            .with_suggestion("TRY: formgen form list   # List known forms")
    }

    pub fn not_published(form_key: &str) -> Self {
        Self::new(format!("Form '{}' has no active table", form_key))
            .with_context("A form gets a table on its first successful publish")
            .with_suggestion(format!("TRY: formgen publish {}", form_key))
    }

    /// Explain a publish failure by stage.
    pub fn publish_failed(form_key: &str, err: &PublishError) -> Self {
        let base = Self::new(format!("Publish of '{}' failed at {}: {}", form_key, err.stage(), err));
        match err {
            PublishError::Validation(ValidationError::NoVersions(_)) => base
                .with_context("The form has no versions yet")
                .with_suggestion(format!(
                    "TRY: formgen version create {} --fields fields.json",
                    form_key
                )),
            PublishError::Validation(_) => base
                .with_context("The field list cannot become a table as is; nothing was created")
                .with_suggestion(format!(
                    "TRY: formgen ddl {}   # Preview the DDL after fixing the fields",
                    form_key
                )),
            PublishError::Conflict(ConflictError::AlreadyPublished { .. }) => base
                .with_context("Published versions are immutable")
                .with_suggestion(format!(
                    "TRY: formgen version create {} --fields fields.json",
                    form_key
                )),
            PublishError::Conflict(ConflictError::PublishInFlight { .. }) => base
                .with_context("Another publish of this form holds its lease")
                .with_suggestion("TRY: Wait for it to finish, then publish again"),
            PublishError::Conflict(ConflictError::TableExists { table_name }) => base
                .with_context(format!("{} exists but no publish recorded creating it", table_name))
                .with_suggestion(format!("TRY: Inspect and drop {} by hand, then publish again", table_name)),
            PublishError::Conflict(_) => base,
            PublishError::Execution { statement, .. } => {
                let base = base.with_context(
                    "The DDL transaction was rolled back; no table was created",
                );
                let base = match statement {
                    Some(sql) => base.with_suggestion(format!("FAILED STATEMENT: {}", sql)),
                    None => base,
                };
                base.with_suggestion("TRY: Fix the database problem, then publish again")
            }
            PublishError::Integrity { table_name, .. } => base
                .with_context(format!(
                    "{} was created; the next publish resumes without re-running DDL",
                    table_name
                ))
                .with_suggestions([
                    format!("TRY: formgen publish {}", form_key),
                    "TRY: formgen reconcile   # List interrupted publishes".to_string(),
                ]),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;

        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }

        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

/// Print an error as a JSON object on stdout for `--json` callers.
pub fn print_json_error(err: &anyhow::Error) {
    let value = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({
            "error": helpful.message,
            "context": helpful.context,
            "suggestions": helpful.suggestions,
        }),
        None => serde_json::json!({
            "error": format!("{:#}", err),
        }),
    };
    println!("{}", value);
}
