//! Dataset namespace naming and SQL identifier quoting.
//!
//! Every dataset lives in its own Postgres schema named after the import
//! timestamp. The fixed prefix lets catalog scans tell managed schemas
//! apart from unrelated ones.

/// Prefix shared by all managed dataset schemas.
pub const SCHEMA_PREFIX: &str = "dataset_";

/// Schema name for an import that happened at the given epoch second.
pub fn format_schema_name(imported_at: i64) -> String {
    format!("{}{}", SCHEMA_PREFIX, imported_at)
}

/// SQL `LIKE` pattern matching managed schemas only.
///
/// The underscore in the prefix is escaped so it is matched literally
/// rather than as a single-character wildcard.
pub fn schema_like_pattern() -> String {
    format!("{}%", SCHEMA_PREFIX.replace('_', "\\_"))
}

/// Quote a dynamic SQL identifier (schema or table name).
///
/// Identifiers cannot be bound as parameters, so every dynamic name that
/// ends up in SQL text must pass through here. Embedded double quotes are
/// doubled per the SQL standard.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
