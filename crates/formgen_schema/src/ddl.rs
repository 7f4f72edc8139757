//! DDL Synthesizer: turns a validated field list into the script that
//! creates one table generation and re-points the form's view at it.
//!
//! Output is deterministic. The same key, version, fields and dialect always
//! produce byte-identical text, which is what `content_hash` relies on.

use formgen_db::sql_guard::{quote_ident, validate_identifier, MAX_IDENTIFIER_LEN};
use formgen_db::{Dialect, FormField};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ValidationError;
use crate::type_map::map_type;
use crate::validate::{validate_fields, validate_form_key};

/// Physical table for one version of a form: `form_{key}_v{version}`.
pub fn table_name(form_key: &str, version: u32) -> Result<String, ValidationError> {
    validate_form_key(form_key)?;
    checked_name(format!("form_{}_v{}", form_key, version))
}

/// Stable view that always selects the live rows of the active generation.
pub fn view_name(form_key: &str) -> Result<String, ValidationError> {
    validate_form_key(form_key)?;
    checked_name(format!("form_{}_active", form_key))
}

fn checked_name(name: String) -> Result<String, ValidationError> {
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::NameTooLong {
            name,
            max: MAX_IDENTIFIER_LEN,
        });
    }
    validate_identifier(&name).map_err(|e| ValidationError::InvalidFormKey {
        key: name.clone(),
        reason: e.to_string(),
    })?;
    Ok(name)
}

/// Name of an object derived from a table. Too-long names keep a readable
/// prefix and end in `_` plus 8 hex digits of the full name's SHA-256.
fn derived_name(table: &str, suffix: &str) -> String {
    let full = format!("{}_{}", table, suffix);
    if full.len() <= MAX_IDENTIFIER_LEN {
        return full;
    }
    let digest = sha256_hex(full.as_bytes());
    let keep = MAX_IDENTIFIER_LEN - 9;
    format!("{}_{}", &full[..keep], &digest[..8])
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    CreateTable,
    CreateUniqueIndex,
    CreateIndex,
    CreateFunction,
    CreateTrigger,
    DropView,
    CreateView,
}

impl StatementKind {
    /// Statements that point the shared view at a generation. They run
    /// when the alias switches, not with the table.
    pub fn is_view(&self) -> bool {
        matches!(self, Self::DropView | Self::CreateView)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdlStatement {
    pub kind: StatementKind,
    pub sql: String,
}

/// A complete, ordered DDL script for one (form, version).
#[derive(Debug, Clone, Serialize)]
pub struct DdlScript {
    pub form_key: String,
    pub version: u32,
    pub table_name: String,
    pub view_name: String,
    pub dialect: Dialect,
    pub statements: Vec<DdlStatement>,
}

impl DdlScript {
    /// Full script text, one statement per line, each terminated by `;`.
    pub fn sql(&self) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            out.push_str(&stmt.sql);
            out.push_str(";\n");
        }
        out
    }

    /// SHA-256 hex digest of `sql()`.
    pub fn content_hash(&self) -> String {
        sha256_hex(self.sql().as_bytes())
    }

    /// Statements that create the table and its indexes and trigger.
    pub fn table_statements(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter(|s| !s.kind.is_view())
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Statements that re-point the view at this table.
    pub fn view_statements(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter(|s| s.kind.is_view())
            .map(|s| s.sql.clone())
            .collect()
    }
}

/// SQLite has no uuid type or generator; build a v4-shaped string.
const SQLITE_UUID_EXPR: &str = "(lower(hex(randomblob(4)) || '-' || hex(randomblob(2)) || '-4' || \
substr(hex(randomblob(2)), 2) || '-' || substr('89ab', 1 + (abs(random()) % 4), 1) || \
substr(hex(randomblob(2)), 2) || '-' || hex(randomblob(6))))";

/// Matches the millisecond RFC 3339 text the bookkeeping tables use.
const SQLITE_NOW_EXPR: &str = "(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))";

#[derive(Debug, Clone, Copy)]
pub struct DdlSynthesizer {
    dialect: Dialect,
}

impl DdlSynthesizer {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Validate `fields` and build the script for `form_{key}_v{version}`.
    ///
    /// Order: table, unique indexes, filter indexes, trigger (PostgreSQL:
    /// function first), then the view switch.
    pub fn synthesize(
        &self,
        form_key: &str,
        version: u32,
        fields: &[FormField],
    ) -> Result<DdlScript, ValidationError> {
        let table = table_name(form_key, version)?;
        let view = view_name(form_key)?;
        validate_fields(fields)?;

        let mut statements = vec![DdlStatement {
            kind: StatementKind::CreateTable,
            sql: self.create_table(&table, fields)?,
        }];

        for field in fields.iter().filter(|f| f.unique) {
            let index = derived_name(&table, &format!("{}_key", field.key));
            statements.push(DdlStatement {
                kind: StatementKind::CreateUniqueIndex,
                sql: format!(
                    "CREATE UNIQUE INDEX {} ON {} ({})",
                    quote_ident(&index),
                    quote_ident(&table),
                    quote_ident(&field.key)
                ),
            });
        }

        // A unique index already serves lookups on that column.
        for field in fields
            .iter()
            .filter(|f| f.field_type.is_filterable() && !f.unique)
        {
            let index = derived_name(&table, &format!("{}_idx", field.key));
            statements.push(DdlStatement {
                kind: StatementKind::CreateIndex,
                sql: format!(
                    "CREATE INDEX {} ON {} ({})",
                    quote_ident(&index),
                    quote_ident(&table),
                    quote_ident(&field.key)
                ),
            });
        }

        statements.extend(self.touch_trigger(&table));
        statements.extend(self.view_statements(&table, &view));

        Ok(DdlScript {
            form_key: form_key.to_string(),
            version,
            table_name: table,
            view_name: view,
            dialect: self.dialect,
            statements,
        })
    }

    /// `DROP VIEW IF EXISTS` + `CREATE VIEW` selecting the live rows of
    /// `table`. PostgreSQL's `CREATE OR REPLACE VIEW` cannot drop or reorder
    /// columns, and a new version may do both.
    pub fn view_statements(&self, table: &str, view: &str) -> Vec<DdlStatement> {
        vec![
            DdlStatement {
                kind: StatementKind::DropView,
                sql: format!("DROP VIEW IF EXISTS {}", quote_ident(view)),
            },
            DdlStatement {
                kind: StatementKind::CreateView,
                sql: format!(
                    "CREATE VIEW {} AS SELECT * FROM {} WHERE {} = false",
                    quote_ident(view),
                    quote_ident(table),
                    quote_ident("_deleted")
                ),
            },
        ]
    }

    fn create_table(&self, table: &str, fields: &[FormField]) -> Result<String, ValidationError> {
        let mut columns: Vec<String> = match self.dialect {
            Dialect::Postgres => vec![
                r#""id" uuid PRIMARY KEY DEFAULT gen_random_uuid()"#.to_string(),
                r#""created_at" timestamptz NOT NULL DEFAULT now()"#.to_string(),
                r#""updated_at" timestamptz NOT NULL DEFAULT now()"#.to_string(),
            ],
            Dialect::Sqlite => vec![
                format!(r#""id" text PRIMARY KEY NOT NULL DEFAULT {}"#, SQLITE_UUID_EXPR),
                format!(r#""created_at" datetime NOT NULL DEFAULT {}"#, SQLITE_NOW_EXPR),
                format!(r#""updated_at" datetime NOT NULL DEFAULT {}"#, SQLITE_NOW_EXPR),
            ],
        };
        columns.push(r#""_deleted" boolean NOT NULL DEFAULT false"#.to_string());

        for field in fields {
            columns.push(map_type(field, self.dialect)?.render(&field.key));
        }

        Ok(format!(
            "CREATE TABLE {} (\n  {}\n)",
            quote_ident(table),
            columns.join(",\n  ")
        ))
    }

    /// Keeps `updated_at` current on every update and `created_at` fixed.
    fn touch_trigger(&self, table: &str) -> Vec<DdlStatement> {
        let trigger = derived_name(table, "updated_at");
        match self.dialect {
            Dialect::Postgres => {
                let function = derived_name(table, "touch");
                vec![
                    DdlStatement {
                        kind: StatementKind::CreateFunction,
                        sql: format!(
                            "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $$\n\
                             BEGIN\n  \
                             NEW.\"updated_at\" := now();\n  \
                             NEW.\"created_at\" := OLD.\"created_at\";\n  \
                             RETURN NEW;\n\
                             END;\n\
                             $$ LANGUAGE plpgsql",
                            quote_ident(&function)
                        ),
                    },
                    DdlStatement {
                        kind: StatementKind::CreateTrigger,
                        sql: format!(
                            "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
                            quote_ident(&trigger),
                            quote_ident(table),
                            quote_ident(&function)
                        ),
                    },
                ]
            }
            // SQLite triggers cannot assign NEW; a follow-up UPDATE does it.
            // recursive_triggers is off by default, so it does not re-fire.
            Dialect::Sqlite => vec![DdlStatement {
                kind: StatementKind::CreateTrigger,
                sql: format!(
                    "CREATE TRIGGER {trigger} AFTER UPDATE ON {table} FOR EACH ROW\n\
                     WHEN NEW.\"updated_at\" IS OLD.\"updated_at\" OR NEW.\"created_at\" IS NOT OLD.\"created_at\"\n\
                     BEGIN\n  \
                     UPDATE {table} SET \"updated_at\" = {now}, \"created_at\" = OLD.\"created_at\" WHERE rowid = NEW.rowid;\n\
                     END",
                    trigger = quote_ident(&trigger),
                    table = quote_ident(table),
                    now = SQLITE_NOW_EXPR
                ),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formgen_db::FieldType;

    fn customer_fields() -> Vec<FormField> {
        vec![
            FormField::new("first_name", FieldType::ShortText).with_max_length(50),
            FormField::new("is_active", FieldType::Boolean).required(),
        ]
    }

    #[test]
    fn names_follow_convention() {
        assert_eq!(table_name("customer", 3).unwrap(), "form_customer_v3");
        assert_eq!(view_name("customer").unwrap(), "form_customer_active");
        assert!(table_name("Customer", 1).is_err());
    }

    #[test]
    fn customer_script_postgres() {
        let script = DdlSynthesizer::new(Dialect::Postgres)
            .synthesize("customer", 1, &customer_fields())
            .unwrap();
        assert_eq!(script.table_name, "form_customer_v1");
        assert_eq!(script.view_name, "form_customer_active");

        let kinds: Vec<_> = script.statements.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StatementKind::CreateTable,
                StatementKind::CreateIndex,
                StatementKind::CreateFunction,
                StatementKind::CreateTrigger,
                StatementKind::DropView,
                StatementKind::CreateView,
            ]
        );

        let create = &script.statements[0].sql;
        assert!(create.starts_with("CREATE TABLE \"form_customer_v1\" ("));
        assert!(create.contains(r#""id" uuid PRIMARY KEY DEFAULT gen_random_uuid()"#));
        assert!(create.contains(r#""_deleted" boolean NOT NULL DEFAULT false"#));
        assert!(create.contains(r#""first_name" varchar(50)"#));
        assert!(create.contains(r#""is_active" boolean NOT NULL"#));
        assert_eq!(
            script.statements[1].sql,
            r#"CREATE INDEX "form_customer_v1_is_active_idx" ON "form_customer_v1" ("is_active")"#
        );
        assert!(script.statements[3].sql.contains("\"form_customer_v1_updated_at\""));
        assert_eq!(
            script.view_statements(),
            vec![
                r#"DROP VIEW IF EXISTS "form_customer_active""#.to_string(),
                r#"CREATE VIEW "form_customer_active" AS SELECT * FROM "form_customer_v1" WHERE "_deleted" = false"#
                    .to_string(),
            ]
        );
        assert_eq!(script.table_statements().len(), 4);
    }

    #[test]
    fn unique_field_gets_unique_index_only() {
        let fields = vec![
            FormField::new("email", FieldType::Email).unique(),
            FormField::new("joined", FieldType::Date).unique(),
        ];
        let script = DdlSynthesizer::new(Dialect::Sqlite)
            .synthesize("member", 2, &fields)
            .unwrap();
        let unique: Vec<_> = script
            .statements
            .iter()
            .filter(|s| s.kind == StatementKind::CreateUniqueIndex)
            .map(|s| s.sql.as_str())
            .collect();
        assert_eq!(
            unique,
            vec![
                r#"CREATE UNIQUE INDEX "form_member_v2_email_key" ON "form_member_v2" ("email")"#,
                r#"CREATE UNIQUE INDEX "form_member_v2_joined_key" ON "form_member_v2" ("joined")"#,
            ]
        );
        assert!(!script
            .statements
            .iter()
            .any(|s| s.kind == StatementKind::CreateIndex));
    }

    #[test]
    fn output_is_deterministic() {
        let synth = DdlSynthesizer::new(Dialect::Postgres);
        let a = synth.synthesize("customer", 1, &customer_fields()).unwrap();
        let b = synth.synthesize("customer", 1, &customer_fields()).unwrap();
        assert_eq!(a.sql(), b.sql());
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);

        let c = synth.synthesize("customer", 2, &customer_fields()).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn long_derived_names_are_shortened() {
        let key = "k".repeat(40);
        let field_key = format!("f{}", "x".repeat(40));
        let fields = vec![FormField::new(field_key.as_str(), FieldType::Boolean)];
        let script = DdlSynthesizer::new(Dialect::Postgres)
            .synthesize(&key, 1, &fields)
            .unwrap();
        let index = &script.statements[1].sql;
        let name = index
            .trim_start_matches("CREATE INDEX \"")
            .split('"')
            .next()
            .unwrap();
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
        assert!(name.starts_with(&format!("form_{}_v1_", key)));

        let again = DdlSynthesizer::new(Dialect::Postgres)
            .synthesize(&key, 1, &fields)
            .unwrap();
        assert_eq!(again.statements[1].sql, *index);
    }

    #[test]
    fn invalid_fields_produce_no_script() {
        let fields = vec![
            FormField::new("email", FieldType::Email),
            FormField::new("email", FieldType::Email),
        ];
        let err = DdlSynthesizer::new(Dialect::Sqlite)
            .synthesize("customer", 1, &fields)
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateFieldKey("email".into()));
    }

    #[test]
    fn sqlite_trigger_pins_created_at() {
        let script = DdlSynthesizer::new(Dialect::Sqlite)
            .synthesize("customer", 1, &customer_fields())
            .unwrap();
        let trigger = script
            .statements
            .iter()
            .find(|s| s.kind == StatementKind::CreateTrigger)
            .unwrap();
        assert!(trigger.sql.starts_with(
            "CREATE TRIGGER \"form_customer_v1_updated_at\" AFTER UPDATE ON \"form_customer_v1\""
        ));
        assert!(trigger.sql.contains("\"created_at\" = OLD.\"created_at\""));
        assert!(!script
            .statements
            .iter()
            .any(|s| s.kind == StatementKind::CreateFunction));
    }
}
