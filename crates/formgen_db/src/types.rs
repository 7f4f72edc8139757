//! Entities stored by the engine: the form catalog, the schema registry,
//! table aliases, the publish journal, and record-query shapes.

use chrono::{DateTime, Utc};
use formgen_ids::{AttemptId, FormId, FormVersionId, LeaseId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Catalog Types
// ============================================================================

/// Lifecycle of a form. `Active` means some version has a live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FormStatus {
    Draft,
    Active,
    Archived,
}

impl FormStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DRAFT" => Some(Self::Draft),
            "ACTIVE" => Some(Self::Active),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for FormStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logical form. `key` is immutable and names its tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub id: FormId,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub status: FormStatus,
    /// Cached projection of the alias's active version; 0 until first publish.
    pub current_version: u32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `FormDb::create_form`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewForm {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewForm {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }
}

/// Semantic field types offered by the form builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    ShortText,
    LongText,
    Number,
    Decimal,
    Boolean,
    Date,
    #[serde(rename = "DATETIME")]
    DateTime,
    Email,
    Phone,
    Enum,
    Json,
    FileRef,
    Relation,
}

impl FieldType {
    pub const ALL: [FieldType; 13] = [
        Self::ShortText,
        Self::LongText,
        Self::Number,
        Self::Decimal,
        Self::Boolean,
        Self::Date,
        Self::DateTime,
        Self::Email,
        Self::Phone,
        Self::Enum,
        Self::Json,
        Self::FileRef,
        Self::Relation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortText => "SHORT_TEXT",
            Self::LongText => "LONG_TEXT",
            Self::Number => "NUMBER",
            Self::Decimal => "DECIMAL",
            Self::Boolean => "BOOLEAN",
            Self::Date => "DATE",
            Self::DateTime => "DATETIME",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Enum => "ENUM",
            Self::Json => "JSON",
            Self::FileRef => "FILE_REF",
            Self::Relation => "RELATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.to_uppercase();
        Self::ALL.into_iter().find(|t| t.as_str() == upper)
    }

    /// Types whose column gets a plain filter index.
    pub fn is_filterable(&self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::Boolean)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target of a RELATION field. Existence of the target is not checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationTarget {
    pub form_key: String,
}

/// One field of a form version. Becomes one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    /// Column name; must be a safe lowercase identifier.
    pub key: String,
    /// Display label.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    /// Raw default value text, interpreted per `field_type`.
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Enforced by the record layer, not by DDL.
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub enum_options: Vec<String>,
    #[serde(default)]
    pub relation: Option<RelationTarget>,
}

impl FormField {
    pub fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            field_type,
            required: false,
            unique: false,
            default_value: None,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            regex: None,
            enum_options: Vec::new(),
            relation: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_min_length(mut self, n: u32) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn with_max_length(mut self, n: u32) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    pub fn with_enum_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relation(mut self, form_key: impl Into<String>) -> Self {
        self.relation = Some(RelationTarget {
            form_key: form_key.into(),
        });
        self
    }
}

/// An immutable numbered snapshot of a form's field list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormVersion {
    pub id: FormVersionId,
    pub form_id: FormId,
    pub version: u32,
    pub display_name: String,
    pub description: Option<String>,
    pub validation_preset: Option<String>,
    pub fields: Vec<FormField>,
    pub created_at: DateTime<Utc>,
}

/// Input for `FormDb::create_version`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFormVersion {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validation_preset: Option<String>,
    pub fields: Vec<FormField>,
}

impl NewFormVersion {
    pub fn with_fields(fields: Vec<FormField>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

// ============================================================================
// Registry & Alias Types
// ============================================================================

/// Append-only record of one physical table generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub form_id: FormId,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    /// Exact DDL text that created the table.
    pub ddl: String,
    /// SHA-256 hex digest of `ddl`.
    pub ddl_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Input for `FormDb::register`.
#[derive(Debug, Clone)]
pub struct NewRegistryEntry {
    pub form_id: FormId,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    pub ddl: String,
    pub ddl_hash: String,
}

/// The per-form pointer to the live table. Sole source of truth for
/// "which table is active".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableAlias {
    pub form_id: FormId,
    pub active_table: String,
    pub view_name: String,
    pub active_version: u32,
    pub updated_at: DateTime<Utc>,
}

/// Answer to "where do records of form X live?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTable {
    pub form_id: FormId,
    pub form_key: String,
    pub table_name: String,
    pub view_name: String,
    pub version: u32,
}

// ============================================================================
// Publish Journal Types
// ============================================================================

/// States of the publish state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishState {
    Requested,
    Validated,
    DdlBuilt,
    TableCreated,
    Registered,
    Aliased,
    Done,
    Failed,
}

impl PublishState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Validated => "VALIDATED",
            Self::DdlBuilt => "DDL_BUILT",
            Self::TableCreated => "TABLE_CREATED",
            Self::Registered => "REGISTERED",
            Self::Aliased => "ALIASED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "REQUESTED" => Some(Self::Requested),
            "VALIDATED" => Some(Self::Validated),
            "DDL_BUILT" => Some(Self::DdlBuilt),
            "TABLE_CREATED" => Some(Self::TableCreated),
            "REGISTERED" => Some(Self::Registered),
            "ALIASED" => Some(Self::Aliased),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Once here, the table exists and DDL must never run again for this version.
    pub fn table_exists(&self) -> bool {
        matches!(self, Self::TableCreated | Self::Registered | Self::Aliased | Self::Done)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for PublishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which part of a publish a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStage {
    Validation,
    Execution,
    Registration,
    Aliasing,
}

impl PublishStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Registration => "registration",
            Self::Aliasing => "aliasing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "validation" => Some(Self::Validation),
            "execution" => Some(Self::Execution),
            "registration" => Some(Self::Registration),
            "aliasing" => Some(Self::Aliasing),
            _ => None,
        }
    }
}

impl std::fmt::Display for PublishStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One journaled run of the publish state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAttempt {
    pub attempt_id: AttemptId,
    pub form_id: FormId,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    /// DDL script as executed (or about to be).
    pub ddl: String,
    pub state: PublishState,
    /// Last state reached before the failure, when `state == Failed`.
    pub failed_at_state: Option<PublishState>,
    pub failure_stage: Option<PublishStage>,
    pub failed_statement_index: Option<u32>,
    pub failed_statement: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishAttempt {
    /// Furthest state reached, whether or not the attempt later failed.
    pub fn reached_state(&self) -> PublishState {
        match (self.state, self.failed_at_state) {
            (PublishState::Failed, Some(at)) => at,
            (state, _) => state,
        }
    }

    /// A table exists but the alias was never switched to it.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self.reached_state(),
            PublishState::TableCreated | PublishState::Registered
        )
    }
}

/// Input for `FormDb::start_attempt`.
#[derive(Debug, Clone)]
pub struct NewPublishAttempt {
    pub form_id: FormId,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    pub ddl: String,
}

/// Failure details written to the journal.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub at_state: PublishState,
    pub stage: PublishStage,
    pub statement_index: Option<u32>,
    pub statement: Option<String>,
    pub message: String,
}

/// Holder of a per-form publish lease.
#[derive(Debug, Clone)]
pub struct PublishLease {
    pub form_id: FormId,
    pub lease_id: LeaseId,
    pub acquired_at: DateTime<Utc>,
}

// ============================================================================
// Record Query Types
// ============================================================================

/// A scalar bound as a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Row filter for `FormDb::query_table`. Filters are ANDed equality tests.
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    pub filters: Vec<(String, DbValue)>,
    pub include_deleted: bool,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub const DEFAULT_PAGE_SIZE: u32 = 10;
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    /// Clamp to page >= 1 and 1 <= page_size <= MAX_PAGE_SIZE.
    pub fn normalized(self) -> Self {
        let page_size = if self.page_size == 0 {
            Self::DEFAULT_PAGE_SIZE
        } else {
            self.page_size.min(Self::MAX_PAGE_SIZE)
        };
        Self {
            page: self.page.max(1),
            page_size,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.page_size as u64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }
}

/// One page of records, each row a JSON object keyed by column name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub rows: Vec<serde_json::Value>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_wire_names() {
        let json = serde_json::to_string(&FieldType::DateTime).unwrap();
        assert_eq!(json, "\"DATETIME\"");
        let json = serde_json::to_string(&FieldType::FileRef).unwrap();
        assert_eq!(json, "\"FILE_REF\"");
        for t in FieldType::ALL {
            assert_eq!(FieldType::parse(t.as_str()), Some(t));
            let via_serde: FieldType =
                serde_json::from_str(&format!("\"{}\"", t.as_str())).unwrap();
            assert_eq!(via_serde, t);
        }
    }

    #[test]
    fn form_field_deserializes_builder_payload() {
        let field: FormField = serde_json::from_str(
            r#"{"key":"tier","name":"Tier","type":"ENUM","required":true,
                "enumOptions":["gold","silver"],"defaultValue":"gold"}"#,
        )
        .unwrap();
        assert_eq!(field.field_type, FieldType::Enum);
        assert!(field.required);
        assert!(!field.unique);
        assert_eq!(field.enum_options, vec!["gold", "silver"]);
        assert_eq!(field.default_value.as_deref(), Some("gold"));
    }

    #[test]
    fn publish_state_round_trip() {
        for state in [
            PublishState::Requested,
            PublishState::Validated,
            PublishState::DdlBuilt,
            PublishState::TableCreated,
            PublishState::Registered,
            PublishState::Aliased,
            PublishState::Done,
            PublishState::Failed,
        ] {
            assert_eq!(PublishState::parse(state.as_str()), Some(state));
        }
        assert!(PublishState::Registered.table_exists());
        assert!(!PublishState::DdlBuilt.table_exists());
    }

    #[test]
    fn pagination_is_clamped() {
        let p = Pagination::new(0, 0).normalized();
        assert_eq!(p, Pagination::new(1, 10));
        let p = Pagination::new(3, 500).normalized();
        assert_eq!(p, Pagination::new(3, 100));
        assert_eq!(Pagination::new(3, 20).offset(), 40);
    }
}
