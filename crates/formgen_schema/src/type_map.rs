//! Mapping from semantic field types to column definitions.

use formgen_db::sql_guard::{quote_ident, quote_literal};
use formgen_db::{Dialect, FieldType, FormField};

use crate::error::ValidationError;
use crate::validate::{parse_bool, DEFAULT_SHORT_TEXT_LENGTH, EMAIL_LENGTH, PHONE_LENGTH};

/// Column-level constraint, rendered in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    NotNull,
    /// Already-rendered SQL literal.
    Default(String),
    /// Boolean expression inside `CHECK (...)`.
    Check(String),
}

/// Physical type of one user column plus its constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnType {
    pub base_type: String,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnType {
    /// `"column" type [NOT NULL] [DEFAULT ...] [CHECK (...)]...`
    pub fn render(&self, column: &str) -> String {
        let mut out = format!("{} {}", quote_ident(column), self.base_type);
        for constraint in &self.constraints {
            match constraint {
                ColumnConstraint::NotNull => out.push_str(" NOT NULL"),
                ColumnConstraint::Default(literal) => {
                    out.push_str(" DEFAULT ");
                    out.push_str(literal);
                }
                ColumnConstraint::Check(expr) => {
                    out.push_str(" CHECK (");
                    out.push_str(expr);
                    out.push(')');
                }
            }
        }
        out
    }
}

fn base_type(field: &FormField, dialect: Dialect) -> String {
    match (field.field_type, dialect) {
        (FieldType::ShortText, _) => format!(
            "varchar({})",
            field.max_length.unwrap_or(DEFAULT_SHORT_TEXT_LENGTH)
        ),
        (FieldType::LongText, _) => "text".into(),
        (FieldType::Number, _) => "integer".into(),
        (FieldType::Decimal, _) => "decimal(10,2)".into(),
        (FieldType::Boolean, _) => "boolean".into(),
        (FieldType::Date, _) => "date".into(),
        (FieldType::DateTime, Dialect::Postgres) => "timestamptz".into(),
        (FieldType::DateTime, Dialect::Sqlite) => "datetime".into(),
        (FieldType::Email, _) => format!("varchar({})", EMAIL_LENGTH),
        (FieldType::Phone, _) => format!("varchar({})", PHONE_LENGTH),
        (FieldType::Enum, _) => "text".into(),
        (FieldType::Json | FieldType::FileRef, Dialect::Postgres) => "jsonb".into(),
        (FieldType::Relation, Dialect::Postgres) => "uuid".into(),
        (FieldType::Json | FieldType::FileRef | FieldType::Relation, Dialect::Sqlite) => {
            "text".into()
        }
    }
}

fn length_fn(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "char_length",
        Dialect::Sqlite => "length",
    }
}

/// Render a bound so that `18` stays `18` and `0.5` stays `0.5`.
fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn render_default(field: &FormField, raw: &str) -> Result<String, ValidationError> {
    let invalid = |reason: String| ValidationError::default_value(&field.key, raw, reason);
    match field.field_type {
        FieldType::Number | FieldType::Decimal => Ok(raw.trim().to_string()),
        FieldType::Boolean => parse_bool(raw)
            .map(|b| b.to_string())
            .ok_or_else(|| invalid("expected true or false".into())),
        _ => quote_literal(raw).map_err(|e| invalid(e.to_string())),
    }
}

/// Column definition for one field. Assumes `validate_fields` accepted it;
/// only literal quoting can still fail here.
pub fn map_type(field: &FormField, dialect: Dialect) -> Result<ColumnType, ValidationError> {
    let mut constraints = Vec::new();
    let column = quote_ident(&field.key);

    if field.required {
        constraints.push(ColumnConstraint::NotNull);
    }
    if let Some(raw) = &field.default_value {
        constraints.push(ColumnConstraint::Default(render_default(field, raw)?));
    }

    if field.field_type == FieldType::Enum && !field.enum_options.is_empty() {
        let options = field
            .enum_options
            .iter()
            .map(|o| quote_literal(o))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ValidationError::InvalidEnumOptions {
                key: field.key.clone(),
                reason: e.to_string(),
            })?;
        constraints.push(ColumnConstraint::Check(format!(
            "{} IN ({})",
            column,
            options.join(", ")
        )));
    }

    if let Some(min) = field.min_length {
        constraints.push(ColumnConstraint::Check(format!(
            "{}({}) >= {}",
            length_fn(dialect),
            column,
            min
        )));
    }
    // SHORT_TEXT carries maxLength in varchar(n) already.
    if let Some(max) = field.max_length {
        if field.field_type != FieldType::ShortText {
            constraints.push(ColumnConstraint::Check(format!(
                "{}({}) <= {}",
                length_fn(dialect),
                column,
                max
            )));
        }
    }

    if let Some(min) = field.min_value {
        constraints.push(ColumnConstraint::Check(format!(
            "{} >= {}",
            column,
            render_number(min)
        )));
    }
    if let Some(max) = field.max_value {
        constraints.push(ColumnConstraint::Check(format!(
            "{} <= {}",
            column,
            render_number(max)
        )));
    }

    Ok(ColumnType {
        base_type: base_type(field, dialect),
        constraints,
    })
}
