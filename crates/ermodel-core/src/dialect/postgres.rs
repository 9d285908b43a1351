//! PostgreSQL dialect.

use super::{Dialect, is_create_table};
use regex::Regex;
use std::sync::LazyLock;

/// PostgreSQL reserved words.
const KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "AUTHORIZATION", "BETWEEN", "BOTH", "CASE", "CAST", "CHECK",
    "COLLATE", "COLUMN", "CONSTRAINT", "CREATE", "CROSS", "CURRENT_DATE", "CURRENT_TIME",
    "CURRENT_TIMESTAMP", "CURRENT_USER", "DEFAULT", "DEFERRABLE", "DESC", "DISTINCT", "ELSE",
    "END", "EXCEPT", "FALSE", "FOR", "FOREIGN", "FROM", "FULL", "GRANT", "GROUP", "HAVING", "IN",
    "INITIALLY", "INNER", "INTERSECT", "INTO", "IS", "JOIN", "LEADING", "LEFT", "LIKE", "LIMIT",
    "NATURAL", "NOT", "NULL", "OFFSET", "ON", "ONLY", "OR", "ORDER", "OUTER", "OVERLAPS",
    "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SESSION_USER", "SOME", "TABLE", "THEN", "TO",
    "TRAILING", "TRUE", "UNION", "UNIQUE", "USER", "USING", "WHEN", "WHERE",
];

static BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:BINARY LARGE OBJECT|BLOB)\b").expect("blob pattern"));

/// PostgreSQL: binary columns become `BYTEA`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn keywords(&self) -> &'static [&'static str] {
        KEYWORDS
    }

    fn translate(&self, sql: &str) -> String {
        if is_create_table(sql) {
            BLOB.replace_all(sql, "BYTEA").into_owned()
        } else {
            sql.to_string()
        }
    }
}
