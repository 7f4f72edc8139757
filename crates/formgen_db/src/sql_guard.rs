//! Identifier and literal guards.
//!
//! Every name that ends up in generated SQL (table, view, column, index)
//! passes `validate_identifier` and is emitted through `quote_ident`. User
//! text that ends up in DDL (defaults, enum options) is emitted only through
//! `quote_literal`.

use std::error::Error;
use std::fmt;

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlGuardError {
    message: String,
}

impl SqlGuardError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SqlGuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for SqlGuardError {}

/// Check that `name` is a lowercase SQL identifier: `[a-z][a-z0-9_]*`, at
/// most 63 bytes.
pub fn validate_identifier(name: &str) -> Result<(), SqlGuardError> {
    if name.is_empty() {
        return Err(SqlGuardError::new("identifier is empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(SqlGuardError::new(format!(
            "identifier '{}' is {} bytes; the limit is {}",
            name,
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(SqlGuardError::new(format!(
                "identifier '{}' must start with a lowercase letter",
                name
            )));
        }
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(SqlGuardError::new(format!(
            "identifier '{}' contains '{}'; only a-z, 0-9 and _ are allowed",
            name, bad
        )));
    }
    Ok(())
}

/// Longest accepted form key. Keeps `form_{key}_v{n}` within the identifier limit.
pub const MAX_FORM_KEY_LEN: usize = 40;

/// Check a form key against `^[a-z0-9_]+$` and `MAX_FORM_KEY_LEN`.
pub fn validate_form_key(key: &str) -> Result<(), SqlGuardError> {
    if key.is_empty() {
        return Err(SqlGuardError::new("form key is empty"));
    }
    if key.len() > MAX_FORM_KEY_LEN {
        return Err(SqlGuardError::new(format!(
            "form key '{}' is longer than {} characters",
            key, MAX_FORM_KEY_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(SqlGuardError::new(format!(
            "form key '{}' may only contain a-z, 0-9 and _",
            key
        )));
    }
    Ok(())
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
///
/// NUL cannot be represented in a PostgreSQL text literal, so it is refused.
pub fn quote_literal(value: &str) -> Result<String, SqlGuardError> {
    if value.contains('\0') {
        return Err(SqlGuardError::new("literal contains a NUL byte"));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_lowercase_identifiers() {
        assert!(validate_identifier("email").is_ok());
        assert!(validate_identifier("form_customer_v12").is_ok());
        assert!(validate_identifier("a1_b2").is_ok());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("Email").is_err());
        assert!(validate_identifier("1st").is_err());
        assert!(validate_identifier("_deleted_copy").is_err());
        assert!(validate_identifier("name; DROP TABLE forms").is_err());
        assert!(validate_identifier("na\"me").is_err());
        assert!(validate_identifier("caf\u{e9}").is_err());
    }

    #[test]
    fn enforces_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&ok).is_ok());
        let err = validate_identifier(&long).unwrap_err();
        assert!(err.to_string().contains("limit is 63"));
    }

    #[test]
    fn validates_form_keys() {
        assert!(validate_form_key("customer").is_ok());
        assert!(validate_form_key("2024_survey").is_ok());
        assert!(validate_form_key("").is_err());
        assert!(validate_form_key("Customer").is_err());
        assert!(validate_form_key("customer-form").is_err());
        assert!(validate_form_key(&"k".repeat(MAX_FORM_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("email"), "\"email\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn quotes_literals() {
        assert_eq!(quote_literal("gold").unwrap(), "'gold'");
        assert_eq!(quote_literal("O'Brien").unwrap(), "'O''Brien'");
        assert_eq!(
            quote_literal("x'); DROP TABLE forms; --").unwrap(),
            "'x''); DROP TABLE forms; --'"
        );
        assert!(quote_literal("nul\0byte").is_err());
    }
}
