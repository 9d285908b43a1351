//! SQL dialects.
//!
//! A dialect is everything the engine needs to know about the SQL spoken by
//! a database: reserved words, supported isolation levels, literal quoting,
//! parameter placeholders, and a per-statement rewrite hook applied to every
//! generated statement before it is executed.

mod mysql;
mod postgres;
mod standard;

pub use mysql::MysqlDialect;
pub use postgres::PostgresDialect;
pub use standard::StandardDialect;

use crate::connection::IsolationLevel;
use crate::value::Value;

/// The SQL dialect contract consumed by the engine.
pub trait Dialect: Send + Sync {
    /// The dialect name.
    fn name(&self) -> &'static str;

    /// Reserved words of this dialect, in upper case.
    fn keywords(&self) -> &'static [&'static str];

    /// Return true if `word` is a reserved word. Case-insensitive.
    fn is_keyword(&self, word: &str) -> bool {
        self.keywords()
            .iter()
            .any(|keyword| keyword.eq_ignore_ascii_case(word))
    }

    /// The SQL name of `level`, or `None` if the dialect does not support it.
    fn isolation_level(&self, level: IsolationLevel) -> Option<&'static str> {
        Some(level.as_sql())
    }

    /// Render `value` as a SQL literal.
    fn sql_literal(&self, value: &Value) -> String {
        standard_literal(value)
    }

    /// Generate a placeholder for the given parameter index (1-based).
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    /// Rewrite a standard SQL statement into this dialect.
    fn translate(&self, sql: &str) -> String {
        sql.to_string()
    }
}

/// Render a SQL-92 literal.
///
/// Numbers are written as-is, strings are single-quoted with embedded quotes
/// doubled, and binary data is written as a hex string literal.
pub fn standard_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::TinyInt(_)
        | Value::SmallInt(_)
        | Value::Int(_)
        | Value::BigInt(_)
        | Value::Float(_)
        | Value::Double(_)
        | Value::Decimal(_) => value.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(_) => format!("X'{}'", value),
        Value::Date(_) | Value::Time(_) | Value::Timestamp(_) | Value::Interval(_) => {
            format!("'{}'", value)
        }
    }
}

/// Is `sql` a CREATE TABLE statement?
fn is_create_table(sql: &str) -> bool {
    let head: String = sql.trim_start().chars().take(12).collect();
    head.eq_ignore_ascii_case("CREATE TABLE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_literals() {
        assert_eq!(standard_literal(&Value::Null), "NULL");
        assert_eq!(standard_literal(&Value::BigInt(-3)), "-3");
        assert_eq!(standard_literal(&Value::Double(1.5)), "1.5");
        assert_eq!(standard_literal(&Value::Bool(true)), "TRUE");
        assert_eq!(standard_literal(&Value::from("it's")), "'it''s'");
        assert_eq!(standard_literal(&Value::Bytes(vec![0x0a, 0xff])), "X'0aff'");
        assert_eq!(
            standard_literal(&Value::Decimal("10.25".to_string())),
            "10.25"
        );
    }

    #[test]
    fn test_create_table_detection() {
        assert!(is_create_table("  create table m.e (id INTEGER)"));
        assert!(!is_create_table("CREATE SEQUENCE m.e_id_seq"));
        assert!(!is_create_table("CREATE"));
    }
}
