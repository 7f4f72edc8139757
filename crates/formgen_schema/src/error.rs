//! Typed failures of the engine.
//!
//! Every publish failure names its stage so operators can tell "fix your
//! form" (validation, conflict) from "infrastructure problem" (execution,
//! integrity).

use formgen_db::{DbError, PublishStage, PublishState};
use formgen_ids::AttemptId;
use thiserror::Error;

/// The field list or form cannot be published as is. Raised before any
/// side effect; never retried automatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("form {0} not found")]
    FormNotFound(String),

    #[error("form '{0}' is archived")]
    FormArchived(String),

    #[error("form '{0}' has no versions to publish")]
    NoVersions(String),

    #[error("invalid form key '{key}': {reason}")]
    InvalidFormKey { key: String, reason: String },

    #[error("the field list is empty")]
    EmptyFieldList,

    #[error("field key '{key}' is not a safe column name: {reason}")]
    UnsafeFieldKey { key: String, reason: String },

    #[error("field key '{0}' collides with a system column")]
    ReservedFieldKey(String),

    #[error("field key '{0}' appears more than once")]
    DuplicateFieldKey(String),

    #[error("field '{key}': invalid default {value:?}: {reason}")]
    InvalidDefault {
        key: String,
        value: String,
        reason: String,
    },

    #[error("field '{key}': {reason}")]
    InvalidConstraint { key: String, reason: String },

    #[error("field '{key}': invalid enum options: {reason}")]
    InvalidEnumOptions { key: String, reason: String },

    #[error("generated name '{name}' is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
}

impl ValidationError {
    pub(crate) fn constraint(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConstraint {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn default_value(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDefault {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// The request collides with existing state. The caller may retry once the
/// other operation is done, or must publish a new version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("form '{form_key}' is already active on version {version}; create a new version to republish")]
    AlreadyPublished { form_key: String, version: u32 },

    #[error("a publish of form '{form_key}' is already in progress")]
    PublishInFlight { form_key: String },

    #[error("the registry already has an entry for form '{form_key}' version {version}")]
    DuplicateRegistryEntry { form_key: String, version: u32 },

    #[error("table '{table_name}' already exists but was never registered; drop it before publishing")]
    TableExists { table_name: String },
}

/// Failure of `PublishOrchestrator::publish`.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// The store rejected DDL or a bookkeeping read before the table existed.
    /// Nothing was created; the attempt (if any) is journaled as FAILED.
    #[error("execution failed at {state}{}: {source}", describe_statement(.statement_index))]
    Execution {
        attempt_id: Option<AttemptId>,
        state: PublishState,
        statement_index: Option<usize>,
        statement: Option<String>,
        #[source]
        source: DbError,
    },

    /// The table exists but registering or aliasing it failed. Publishing
    /// again resumes from the journaled state without re-running DDL.
    #[error("table {table_name} exists but {stage} failed (attempt {attempt_id}): {source}")]
    Integrity {
        attempt_id: AttemptId,
        table_name: String,
        stage: PublishStage,
        #[source]
        source: DbError,
    },
}

fn describe_statement(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" (statement {})", i),
        None => String::new(),
    }
}

impl PublishError {
    /// Stage the failure belongs to.
    pub fn stage(&self) -> PublishStage {
        match self {
            Self::Validation(_) | Self::Conflict(_) => PublishStage::Validation,
            Self::Execution { .. } => PublishStage::Execution,
            Self::Integrity { stage, .. } => *stage,
        }
    }

    pub fn attempt_id(&self) -> Option<&AttemptId> {
        match self {
            Self::Execution { attempt_id, .. } => attempt_id.as_ref(),
            Self::Integrity { attempt_id, .. } => Some(attempt_id),
            _ => None,
        }
    }

    /// Whether calling `publish` again may succeed without changing the form.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Conflict(ConflictError::PublishInFlight { .. }) => true,
            Self::Conflict(_) => false,
            Self::Execution { .. } | Self::Integrity { .. } => true,
        }
    }

    /// Store failure before any DDL ran.
    pub(crate) fn store(state: PublishState, attempt_id: Option<&AttemptId>, source: DbError) -> Self {
        Self::Execution {
            attempt_id: attempt_id.cloned(),
            state,
            statement_index: None,
            statement: None,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_reported() {
        let err = PublishError::from(ValidationError::EmptyFieldList);
        assert_eq!(err.stage(), PublishStage::Validation);
        assert!(!err.is_retryable());

        let err = PublishError::from(ConflictError::PublishInFlight {
            form_key: "customer".into(),
        });
        assert_eq!(err.stage(), PublishStage::Validation);
        assert!(err.is_retryable());

        let err = PublishError::Integrity {
            attempt_id: AttemptId::new(),
            table_name: "form_customer_v1".into(),
            stage: PublishStage::Aliasing,
            source: DbError::invalid_state("boom"),
        };
        assert_eq!(err.stage(), PublishStage::Aliasing);
        assert!(err.attempt_id().is_some());
    }

    #[test]
    fn execution_message_names_statement() {
        let err = PublishError::Execution {
            attempt_id: None,
            state: PublishState::DdlBuilt,
            statement_index: Some(3),
            statement: Some("CREATE INDEX ...".into()),
            source: DbError::invalid_state("boom"),
        };
        let text = err.to_string();
        assert!(text.starts_with("execution failed at DDL_BUILT (statement 3)"));
    }
}
