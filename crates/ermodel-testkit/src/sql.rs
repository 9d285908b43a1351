//! Parser for the SQL subset the engine and the schema generator emit.
//!
//! Placeholders are bound while parsing, left to right, so both numbered
//! (`$1`) and positional (`?`) styles work.

use ermodel_core::{Error, QueryError, QueryErrorKind, Result, Value};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect($re));
    };
}

pattern!(IGNORED, r"(?is)^(?:SET|GRANT|REVOKE)\s");
pattern!(CREATE_SCHEMA, r"(?i)^CREATE\s+SCHEMA\s+(\w+)$");
pattern!(CREATE_TABLE, r"(?is)^CREATE\s+TABLE\s+([\w.]+)\s*\((.*)\)(?:\s+TYPE\s*=\s*\w+)?$");
pattern!(CREATE_SEQUENCE, r"(?i)^CREATE\s+SEQUENCE\s+([\w.]+)$");
pattern!(CREATE_INDEX, r"(?i)^CREATE\s+(?:UNIQUE\s+)?INDEX\s");
pattern!(CREATE_VIEW, r"(?is)^CREATE\s+VIEW\s+([\w.]+)\s+AS\s+(.+)$");
pattern!(DROP_SCHEMA, r"(?i)^DROP\s+SCHEMA\s+(\w+)(?:\s+CASCADE)?$");
pattern!(NEXTVAL, r"(?i)^SELECT\s+nextval\('([\w.]+)'\)$");
pattern!(INSERT_DEFAULT, r"(?is)^INSERT\s+INTO\s+([\w.]+)\s+DEFAULT\s+VALUES$");
pattern!(INSERT, r"(?is)^INSERT\s+INTO\s+([\w.]+)\s*\((.*?)\)\s*VALUES\s*\((.*)\)$");
pattern!(UPDATE, r"(?is)^UPDATE\s+([\w.]+)\s+SET\s+(.+?)(?:\s+WHERE\s+(.+))?$");
pattern!(DELETE, r"(?is)^DELETE\s+FROM\s+([\w.]+)(?:\s+WHERE\s+(.+))?$");
pattern!(
    SELECT,
    r"(?is)^SELECT\s+(?P<what>.+?)\s+FROM\s+(?P<from>[\w.]+)(?:\s+WHERE\s+(?P<where>.+?))?(?:\s+ORDER\s+BY\s+(?P<order>.+?))?(?:\s+OFFSET\s+(?P<offset>\d+))?(?:\s+LIMIT\s+(?P<limit>\d+))?(?P<lock>\s+FOR\s+UPDATE)?$"
);
pattern!(DEFAULT, r"(?is)\sDEFAULT\s+(.+)$");
pattern!(COLUMN_TYPE, r"(?is)^\w+\s+(.+?)(?:\s+(?:NOT\s+NULL|NULL|DEFAULT|PRIMARY|REFERENCES)\b.*)?$");
pattern!(PRIMARY_KEY, r"(?is)^PRIMARY\s+KEY\s*\((.*)\)$");
pattern!(COMPARISON, r"(?is)^([\w.]+)\s*(=|<>|!=|<=|>=|<|>)\s*(.+)$");
pattern!(IS_NULL, r"(?i)^([\w.]+)\s+IS\s+(NOT\s+)?NULL$");
pattern!(INCREMENT, r"^(\w+)\s*([+-])\s*(\d+)$");
pattern!(NUMBERED, r"^\$(\d+)$");
pattern!(INTEGER, r"^-?\d+$");
pattern!(FLOAT, r"^-?\d+\.\d*(?:[eE][-+]?\d+)?$");
pattern!(IDENTIFIER, r"^\w+$");

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ColumnDef {
    pub name: String,
    /// Declared type, as written in the CREATE TABLE
    pub sql_type: Option<String>,
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Value(Value),
    Column(String),
    /// `column + n`
    Offset(String, i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    Star,
    Count,
    Column(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Select {
    pub what: Vec<Projection>,
    pub from: String,
    pub filter: Vec<Condition>,
    /// Column and whether it sorts descending
    pub order: Vec<(String, bool)>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub for_update: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Ignored,
    CreateSchema(String),
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    CreateSequence(String),
    CreateIndex,
    CreateView {
        name: String,
        query: String,
    },
    DropSchema(String),
    NextVal(String),
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
    Select(Select),
}

pub(crate) fn syntax_error(sql: &str, message: impl Into<String>) -> Error {
    Error::Query(
        QueryError::new(QueryErrorKind::Syntax, message)
            .with_sqlstate("42601")
            .with_sql(sql),
    )
}

/// Hands out parameters as placeholders are met.
struct Binder<'a> {
    sql: &'a str,
    params: &'a [Value],
    next: usize,
}

impl Binder<'_> {
    fn param(&mut self, index: usize) -> Result<Value> {
        self.params
            .get(index)
            .cloned()
            .ok_or_else(|| syntax_error(self.sql, format!("no value for parameter {}", index + 1)))
    }

    /// A placeholder or literal.
    fn value(&mut self, token: &str) -> Result<Value> {
        let token = token.trim();
        if token == "?" {
            let index = self.next;
            self.next += 1;
            return self.param(index);
        }
        if let Some(caps) = NUMBERED.captures(token) {
            let index: usize = caps[1]
                .parse()
                .map_err(|_| syntax_error(self.sql, "bad placeholder"))?;
            return self.param(index.saturating_sub(1));
        }
        literal(token).ok_or_else(|| syntax_error(self.sql, format!("cannot read value `{}`", token)))
    }

    fn expr(&mut self, token: &str) -> Result<Expr> {
        let token = token.trim();
        if let Some(caps) = INCREMENT.captures(token) {
            let n: i64 = caps[3]
                .parse()
                .map_err(|_| syntax_error(self.sql, "bad increment"))?;
            let n = if &caps[2] == "-" { -n } else { n };
            return Ok(Expr::Offset(caps[1].to_string(), n));
        }
        if IDENTIFIER.is_match(token) && literal(token).is_none() {
            return Ok(Expr::Column(token.to_string()));
        }
        self.value(token).map(Expr::Value)
    }

    fn conditions(&mut self, clause: Option<&str>) -> Result<Vec<Condition>> {
        let Some(clause) = clause else {
            return Ok(Vec::new());
        };
        split_keyword(clause, "AND")
            .into_iter()
            .map(|part| {
                let part = part.trim();
                if let Some(caps) = IS_NULL.captures(part) {
                    let op = if caps.get(2).is_some() { Op::IsNotNull } else { Op::IsNull };
                    return Ok(Condition {
                        column: bare_name(&caps[1]),
                        op,
                        value: Value::Null,
                    });
                }
                let caps = COMPARISON
                    .captures(part)
                    .ok_or_else(|| syntax_error(self.sql, format!("unsupported condition `{}`", part)))?;
                let op = match &caps[2] {
                    "=" => Op::Eq,
                    "<>" | "!=" => Op::Ne,
                    "<" => Op::Lt,
                    "<=" => Op::Le,
                    ">" => Op::Gt,
                    _ => Op::Ge,
                };
                Ok(Condition {
                    column: bare_name(&caps[1]),
                    op,
                    value: self.value(&caps[3])?,
                })
            })
            .collect()
    }
}

/// Parse one statement, binding `params`.
pub(crate) fn parse(sql: &str, params: &[Value]) -> Result<Statement> {
    let text = sql.trim().trim_end_matches(';').trim();
    let mut binder = Binder {
        sql,
        params,
        next: 0,
    };

    if IGNORED.is_match(text) {
        return Ok(Statement::Ignored);
    }
    if let Some(caps) = CREATE_SCHEMA.captures(text) {
        return Ok(Statement::CreateSchema(caps[1].to_string()));
    }
    if let Some(caps) = CREATE_TABLE.captures(text) {
        return create_table(sql, &caps[1], &caps[2]);
    }
    if let Some(caps) = CREATE_SEQUENCE.captures(text) {
        return Ok(Statement::CreateSequence(caps[1].to_string()));
    }
    if CREATE_INDEX.is_match(text) {
        return Ok(Statement::CreateIndex);
    }
    if let Some(caps) = CREATE_VIEW.captures(text) {
        return Ok(Statement::CreateView {
            name: caps[1].to_string(),
            query: caps[2].to_string(),
        });
    }
    if let Some(caps) = DROP_SCHEMA.captures(text) {
        return Ok(Statement::DropSchema(caps[1].to_string()));
    }
    if let Some(caps) = NEXTVAL.captures(text) {
        return Ok(Statement::NextVal(caps[1].to_string()));
    }
    if let Some(caps) = INSERT_DEFAULT.captures(text) {
        return Ok(Statement::Insert {
            table: caps[1].to_string(),
            columns: Vec::new(),
            values: Vec::new(),
        });
    }
    if let Some(caps) = INSERT.captures(text) {
        let columns: Vec<String> = split_top_level(&caps[2], ',')
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        let values = split_top_level(&caps[3], ',')
            .into_iter()
            .map(|v| binder.value(v))
            .collect::<Result<Vec<_>>>()?;
        if columns.len() != values.len() {
            return Err(syntax_error(sql, "INSERT has more target columns than expressions"));
        }
        return Ok(Statement::Insert {
            table: caps[1].to_string(),
            columns,
            values,
        });
    }
    if let Some(caps) = UPDATE.captures(text) {
        let assignments = split_top_level(&caps[2], ',')
            .into_iter()
            .map(|item| {
                let (column, expr) = item
                    .split_once('=')
                    .ok_or_else(|| syntax_error(sql, format!("bad assignment `{}`", item)))?;
                Ok((column.trim().to_string(), binder.expr(expr)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let filter = binder.conditions(caps.get(3).map(|m| m.as_str()))?;
        return Ok(Statement::Update {
            table: caps[1].to_string(),
            assignments,
            filter,
        });
    }
    if let Some(caps) = DELETE.captures(text) {
        return Ok(Statement::Delete {
            table: caps[1].to_string(),
            filter: binder.conditions(caps.get(2).map(|m| m.as_str()))?,
        });
    }
    if let Some(caps) = SELECT.captures(text) {
        let what = split_top_level(&caps["what"], ',')
            .into_iter()
            .map(|item| {
                let item = item.trim();
                if item == "*" {
                    Projection::Star
                } else if item.eq_ignore_ascii_case("COUNT(*)") {
                    Projection::Count
                } else {
                    Projection::Column(bare_name(item))
                }
            })
            .collect();
        let filter = binder.conditions(caps.name("where").map(|m| m.as_str()))?;
        let order = caps
            .name("order")
            .map(|m| {
                split_top_level(m.as_str(), ',')
                    .into_iter()
                    .map(|item| {
                        let mut words = item.split_whitespace();
                        let column = bare_name(words.next().unwrap_or_default());
                        let descending = words.next().is_some_and(|w| w.eq_ignore_ascii_case("DESC"));
                        (column, descending)
                    })
                    .collect()
            })
            .unwrap_or_default();
        return Ok(Statement::Select(Select {
            what,
            from: caps["from"].to_string(),
            filter,
            order,
            offset: caps.name("offset").and_then(|m| m.as_str().parse().ok()),
            limit: caps.name("limit").and_then(|m| m.as_str().parse().ok()),
            for_update: caps.name("lock").is_some(),
        }));
    }
    Err(syntax_error(sql, "unsupported statement"))
}

fn create_table(sql: &str, name: &str, body: &str) -> Result<Statement> {
    let mut columns = Vec::new();
    let mut primary_key = Vec::new();
    for item in split_top_level(body, ',') {
        let item = item.trim();
        if let Some(caps) = PRIMARY_KEY.captures(item) {
            primary_key = caps[1].split(',').map(|c| c.trim().to_string()).collect();
            continue;
        }
        if item.to_ascii_uppercase().starts_with("FOREIGN KEY") {
            continue;
        }
        let column = item
            .split_whitespace()
            .next()
            .ok_or_else(|| syntax_error(sql, "empty column definition"))?;
        let default = match DEFAULT.captures(item) {
            Some(caps) => {
                let token = caps[1].trim();
                let token = token.strip_suffix(" NOT NULL").unwrap_or(token);
                literal(token).ok_or_else(|| syntax_error(sql, format!("bad default `{}`", token)))?
            }
            None => Value::Null,
        };
        columns.push(ColumnDef {
            name: column.to_string(),
            sql_type: COLUMN_TYPE.captures(item).map(|caps| caps[1].trim().to_string()),
            default,
        });
    }
    Ok(Statement::CreateTable {
        name: name.to_string(),
        columns,
        primary_key,
    })
}

/// A SQL literal as written by the standard dialect.
pub(crate) fn literal(token: &str) -> Option<Value> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("NULL") {
        return Some(Value::Null);
    }
    if token.eq_ignore_ascii_case("TRUE") {
        return Some(Value::Bool(true));
    }
    if token.eq_ignore_ascii_case("FALSE") {
        return Some(Value::Bool(false));
    }
    if INTEGER.is_match(token) {
        return token.parse().ok().map(Value::BigInt);
    }
    if FLOAT.is_match(token) {
        return token.parse().ok().map(Value::Double);
    }
    if let Some(hex) = token
        .strip_prefix("X'")
        .or_else(|| token.strip_prefix("x'"))
        .and_then(|rest| rest.strip_suffix('\''))
    {
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
            .collect::<Option<Vec<u8>>>()?;
        return Some(Value::Bytes(bytes));
    }
    let inner = token.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(Value::Text(inner.replace("''", "'")))
}

/// The column part of a possibly qualified name or `expr AS alias`.
pub(crate) fn bare_name(expr: &str) -> String {
    let expr = expr.trim();
    let upper = expr.to_ascii_uppercase();
    if let Some(pos) = upper.rfind(" AS ") {
        return expr[pos + 4..].trim().to_string();
    }
    match expr.rfind('.') {
        Some(pos) => expr[pos + 1..].to_string(),
        None => expr.to_string(),
    }
}

/// Split at `delim` outside parentheses and quoted strings.
pub(crate) fn split_top_level(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            _ if c == delim && depth == 0 && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split at a keyword surrounded by whitespace, outside quoted strings.
fn split_keyword<'a>(s: &'a str, keyword: &str) -> Vec<&'a str> {
    let upper = s.to_ascii_uppercase();
    let needle = format!(" {} ", keyword.to_ascii_uppercase());
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    let mut i = 0;
    let bytes = s.as_bytes();
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            quoted = !quoted;
        } else if !quoted && upper[i..].starts_with(&needle) {
            parts.push(&s[start..i]);
            i += needle.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

/// SQL ordering of two values; `None` when they do not compare.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if !matches!(a, Value::Float(_) | Value::Double(_))
            && !matches!(b, Value::Float(_) | Value::Double(_))
        {
            return Some(x.cmp(&y));
        }
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

impl Condition {
    pub(crate) fn matches(&self, value: &Value) -> bool {
        match self.op {
            Op::IsNull => value.is_null(),
            Op::IsNotNull => !value.is_null(),
            Op::Eq => compare(value, &self.value) == Some(Ordering::Equal),
            Op::Ne => compare(value, &self.value).is_some_and(|o| o != Ordering::Equal),
            Op::Lt => compare(value, &self.value) == Some(Ordering::Less),
            Op::Le => compare(value, &self.value).is_some_and(|o| o != Ordering::Greater),
            Op::Gt => compare(value, &self.value) == Some(Ordering::Greater),
            Op::Ge => compare(value, &self.value).is_some_and(|o| o != Ordering::Less),
        }
    }
}
