//! Form Schema Engine
//!
//! Turns a user-authored field list into a real relational table and
//! evolves it safely across versions.
//!
//! # Lifecycle
//!
//! 1. **Draft**: the form builder stores a numbered version with its fields.
//! 2. **Synthesize**: fields are validated and mapped to columns; a
//!    deterministic DDL script creates `form_{key}_v{n}` plus indexes,
//!    an update trigger, and the `form_{key}_active` view.
//! 3. **Publish**: the script runs in one transaction, the generation is
//!    recorded in the append-only registry, then the alias (and view) is
//!    switched together with the form's status.
//! 4. **Republish**: a new version gets a new table. Older tables and their
//!    registry entries are never touched.
//!
//! Record access code must find tables only through
//! [`PublishOrchestrator::resolve_active_table`].
//!
//! # Modules
//!
//! - [`validate`]: field-list validation, run before anything touches the store
//! - [`type_map`]: field type → column type and column constraints
//! - [`ddl`]: the DDL synthesizer and naming rules
//! - [`publish`]: the publish state machine, resumption, and reconciliation

pub mod ddl;
pub mod error;
pub mod publish;
pub mod type_map;
pub mod validate;

pub use ddl::{table_name, view_name, DdlScript, DdlStatement, DdlSynthesizer, StatementKind};
pub use error::{ConflictError, PublishError, ValidationError};
pub use publish::{PublishOptions, PublishOrchestrator, PublishOutcome, ReconcileReport};
pub use type_map::{map_type, ColumnConstraint, ColumnType};
pub use validate::{validate_fields, validate_form_key, SYSTEM_COLUMNS};

pub use formgen_db::{Dialect, FieldType, FormField, PublishStage, PublishState};
