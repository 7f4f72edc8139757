//! Field-list validation.
//!
//! Runs before synthesis, so a field list that passes here always maps to
//! well-formed DDL.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate};
use formgen_db::sql_guard::{validate_form_key as guard_form_key, validate_identifier};
use formgen_db::{FieldType, FormField};

use crate::error::ValidationError;

/// Columns every generated table carries, in order. User fields may not reuse them.
pub const SYSTEM_COLUMNS: [&str; 4] = ["id", "created_at", "updated_at", "_deleted"];

/// Default bound for SHORT_TEXT without `maxLength`.
pub const DEFAULT_SHORT_TEXT_LENGTH: u32 = 255;
/// Largest `varchar(n)` PostgreSQL accepts.
pub const MAX_VARCHAR_LENGTH: u32 = 10_485_760;
pub const EMAIL_LENGTH: u32 = 320;
pub const PHONE_LENGTH: u32 = 20;

pub fn validate_form_key(key: &str) -> Result<(), ValidationError> {
    guard_form_key(key).map_err(|e| ValidationError::InvalidFormKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Validate a whole field list: non-empty, safe and unique keys, and every
/// field individually consistent.
pub fn validate_fields(fields: &[FormField]) -> Result<(), ValidationError> {
    if fields.is_empty() {
        return Err(ValidationError::EmptyFieldList);
    }
    let mut seen = HashSet::new();
    for field in fields {
        if SYSTEM_COLUMNS.contains(&field.key.as_str()) {
            return Err(ValidationError::ReservedFieldKey(field.key.clone()));
        }
        validate_identifier(&field.key).map_err(|e| ValidationError::UnsafeFieldKey {
            key: field.key.clone(),
            reason: e.to_string(),
        })?;
        if !seen.insert(field.key.as_str()) {
            return Err(ValidationError::DuplicateFieldKey(field.key.clone()));
        }
        validate_field(field)?;
    }
    Ok(())
}

fn is_text(field_type: FieldType) -> bool {
    matches!(
        field_type,
        FieldType::ShortText | FieldType::LongText | FieldType::Email | FieldType::Phone
    )
}

fn is_numeric(field_type: FieldType) -> bool {
    matches!(field_type, FieldType::Number | FieldType::Decimal)
}

/// Upper length bound implied by the column type, if any.
pub(crate) fn type_length_limit(field: &FormField) -> Option<u32> {
    match field.field_type {
        FieldType::ShortText => Some(field.max_length.unwrap_or(DEFAULT_SHORT_TEXT_LENGTH)),
        FieldType::Email => Some(EMAIL_LENGTH),
        FieldType::Phone => Some(PHONE_LENGTH),
        _ => None,
    }
}

fn validate_field(field: &FormField) -> Result<(), ValidationError> {
    let key = field.key.as_str();

    if field.min_length.is_some() || field.max_length.is_some() {
        if !is_text(field.field_type) {
            return Err(ValidationError::constraint(
                key,
                format!("length bounds do not apply to {}", field.field_type),
            ));
        }
        if let Some(max) = field.max_length {
            if max == 0 || max > MAX_VARCHAR_LENGTH {
                return Err(ValidationError::constraint(
                    key,
                    format!("maxLength must be between 1 and {}", MAX_VARCHAR_LENGTH),
                ));
            }
        }
        if let (Some(min), Some(max)) = (field.min_length, field.max_length) {
            if min > max {
                return Err(ValidationError::constraint(
                    key,
                    format!("minLength {} exceeds maxLength {}", min, max),
                ));
            }
        }
        if let (Some(min), Some(limit)) = (field.min_length, type_length_limit(field)) {
            if min > limit {
                return Err(ValidationError::constraint(
                    key,
                    format!("minLength {} exceeds the column bound {}", min, limit),
                ));
            }
        }
    }

    if field.min_value.is_some() || field.max_value.is_some() {
        if !is_numeric(field.field_type) {
            return Err(ValidationError::constraint(
                key,
                format!("value bounds do not apply to {}", field.field_type),
            ));
        }
        for bound in [field.min_value, field.max_value].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(ValidationError::constraint(key, "value bounds must be finite"));
            }
        }
        if let (Some(min), Some(max)) = (field.min_value, field.max_value) {
            if min > max {
                return Err(ValidationError::constraint(
                    key,
                    format!("minValue {} exceeds maxValue {}", min, max),
                ));
            }
        }
    }

    if field.field_type == FieldType::Enum {
        let mut options = HashSet::new();
        for option in &field.enum_options {
            if option.is_empty() {
                return Err(ValidationError::InvalidEnumOptions {
                    key: key.to_string(),
                    reason: "options must be non-empty strings".to_string(),
                });
            }
            if option.contains('\0') {
                return Err(ValidationError::InvalidEnumOptions {
                    key: key.to_string(),
                    reason: "options may not contain NUL".to_string(),
                });
            }
            if !options.insert(option.as_str()) {
                return Err(ValidationError::InvalidEnumOptions {
                    key: key.to_string(),
                    reason: format!("option '{}' is listed twice", option),
                });
            }
        }
    } else if !field.enum_options.is_empty() {
        return Err(ValidationError::constraint(
            key,
            format!("enum options do not apply to {}", field.field_type),
        ));
    }

    if let Some(value) = &field.default_value {
        validate_default(field, value)?;
    }
    Ok(())
}

fn validate_default(field: &FormField, value: &str) -> Result<(), ValidationError> {
    let key = field.key.as_str();
    let invalid = |reason: &str| ValidationError::default_value(key, value, reason);

    if value.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    match field.field_type {
        FieldType::ShortText | FieldType::LongText | FieldType::Email | FieldType::Phone => {
            let len = value.chars().count() as u64;
            let upper = type_length_limit(field).or(field.max_length);
            if let Some(limit) = upper {
                if len > limit as u64 {
                    return Err(invalid(&format!("longer than {} characters", limit)));
                }
            }
            if let Some(min) = field.min_length {
                if len < min as u64 {
                    return Err(invalid(&format!("shorter than {} characters", min)));
                }
            }
            if field.field_type == FieldType::Email && !value.contains('@') {
                return Err(invalid("not an email address"));
            }
        }
        FieldType::Number => {
            let n: i32 = value
                .trim()
                .parse()
                .map_err(|_| invalid("not a 32-bit integer"))?;
            check_range(field, n as f64).map_err(|reason| invalid(&reason))?;
        }
        FieldType::Decimal => {
            let n = parse_decimal(value.trim()).ok_or_else(|| invalid("not a decimal(10,2) value"))?;
            check_range(field, n).map_err(|reason| invalid(&reason))?;
        }
        FieldType::Boolean => {
            parse_bool(value).ok_or_else(|| invalid("expected true or false"))?;
        }
        FieldType::Date => {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .map_err(|_| invalid("expected YYYY-MM-DD"))?;
        }
        FieldType::DateTime => {
            DateTime::parse_from_rfc3339(value.trim())
                .map_err(|_| invalid("expected an RFC 3339 timestamp"))?;
        }
        FieldType::Enum => {
            if !field.enum_options.is_empty() && !field.enum_options.iter().any(|o| o == value) {
                return Err(invalid("not one of the enum options"));
            }
        }
        FieldType::Json | FieldType::FileRef => {
            serde_json::from_str::<serde_json::Value>(value)
                .map_err(|_| invalid("not valid JSON"))?;
        }
        FieldType::Relation => {
            uuid::Uuid::parse_str(value.trim()).map_err(|_| invalid("not a UUID"))?;
        }
    }
    Ok(())
}

fn check_range(field: &FormField, n: f64) -> Result<(), String> {
    if let Some(min) = field.min_value {
        if n < min {
            return Err(format!("below minValue {}", min));
        }
    }
    if let Some(max) = field.max_value {
        if n > max {
            return Err(format!("above maxValue {}", max));
        }
    }
    Ok(())
}

/// Parse `true`/`false`, case-insensitively.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Parse a literal that fits `decimal(10,2)`: optional sign, at most eight
/// integer digits, at most two fraction digits.
pub(crate) fn parse_decimal(value: &str) -> Option<f64> {
    let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if int_part.is_empty() || int_part.len() > 8 || !digits(int_part) {
        return None;
    }
    if let Some(frac) = frac_part {
        if frac.is_empty() || frac.len() > 2 || !digits(frac) {
            return None;
        }
    }
    value.parse().ok()
}
