//! SQL identifier helpers.
//!
//! Model, object, attribute and index names become SQL identifiers
//! unquoted, so they are restricted to plain ASCII identifiers. Tables live
//! in one schema per model and are addressed as `<model>.<object>`.

use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Check whether `name` can be used as an unquoted SQL identifier.
///
/// # Examples
///
/// ```
/// use ermodel_core::is_identifier;
///
/// assert!(is_identifier("node_info"));
/// assert!(!is_identifier("1st"));
/// assert!(!is_identifier("drop table"));
/// ```
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Qualify an object name with its model's schema name.
#[inline]
pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", schema, name)
}

/// Strip any schema qualifier, returning the bare object name.
#[inline]
pub fn unqualified(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(_, bare)| bare)
}
