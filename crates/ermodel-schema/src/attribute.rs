//! Attribute descriptors.
//!
//! An [`Attribute`] describes one typed column of an entity, relationship
//! or view: its value kind, its external SQL type and the rules applied to
//! every value stored in it.

use ermodel_core::{Error, Result, Value};
use regex::Regex;
use std::sync::LazyLock;

static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)$").expect("decimal pattern"));

/// The scalar kinds an attribute can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    /// Signed integer with at least 32 bits of precision.
    Integer,
    /// Arbitrary precision decimal.
    Decimal,
    /// IEEE-754 double.
    Float,
    /// Bounded string.
    String,
    /// Unbounded string.
    Text,
    Binary,
    Date,
    Time,
    DateTime,
    Interval,
}

impl ValueKind {
    /// Get the default external SQL type for this kind.
    pub const fn external_type(self) -> &'static str {
        match self {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Integer => "INTEGER",
            ValueKind::Decimal => "DECIMAL",
            ValueKind::Float => "DOUBLE PRECISION",
            ValueKind::String => "CHARACTER VARYING",
            ValueKind::Text => "TEXT",
            ValueKind::Binary => "BINARY LARGE OBJECT",
            ValueKind::Date => "DATE",
            ValueKind::Time => "TIME",
            ValueKind::DateTime => "TIMESTAMP WITHOUT TIME ZONE",
            ValueKind::Interval => "INTERVAL",
        }
    }

    /// The kind of a SQL type name as a driver reports it, e.g.
    /// `CHARACTER VARYING(255)` or `int8`.
    pub fn from_sql_type(sql_type: &str) -> Option<ValueKind> {
        let upper = sql_type.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or_default().trim();
        let kind = match base {
            "BOOLEAN" | "BOOL" => ValueKind::Bool,
            "INTEGER" | "INT" | "INT2" | "INT4" | "INT8" | "SMALLINT" | "BIGINT" | "TINYINT"
            | "SERIAL" | "BIGSERIAL" => ValueKind::Integer,
            "DECIMAL" | "NUMERIC" => ValueKind::Decimal,
            "DOUBLE PRECISION" | "DOUBLE" | "FLOAT" | "FLOAT4" | "FLOAT8" | "REAL" => {
                ValueKind::Float
            }
            "CHARACTER VARYING" | "VARCHAR" | "CHARACTER" | "CHAR" => ValueKind::String,
            "TEXT" | "LONGTEXT" | "MEDIUMTEXT" => ValueKind::Text,
            "BINARY LARGE OBJECT" | "BLOB" | "LONGBLOB" | "BYTEA" => ValueKind::Binary,
            "DATE" => ValueKind::Date,
            "DATETIME" => ValueKind::DateTime,
            "INTERVAL" => ValueKind::Interval,
            other if other.starts_with("TIMESTAMP") => ValueKind::DateTime,
            other if other.starts_with("TIME") => ValueKind::Time,
            _ => return None,
        };
        Some(kind)
    }

    /// Guess the kind of a value read from a result set.
    ///
    /// Used for view columns whose type the driver does not report.
    pub fn of_value(value: &Value) -> Option<ValueKind> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                Some(ValueKind::Integer)
            }
            Value::Float(_) | Value::Double(_) => Some(ValueKind::Float),
            Value::Decimal(_) => Some(ValueKind::Decimal),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Bytes(_) => Some(ValueKind::Binary),
            Value::Date(_) => Some(ValueKind::Date),
            Value::Time(_) => Some(ValueKind::Time),
            Value::Timestamp(_) => Some(ValueKind::DateTime),
            Value::Interval(_) => Some(ValueKind::Interval),
        }
    }
}

/// A typed column descriptor.
///
/// Attributes are not nullable unless [`Attribute::nullable`] is called,
/// and default to NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub kind: ValueKind,
    pub external_type: String,
    pub nullable: bool,
    pub default: Value,
    pub width: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    /// Offer values of this attribute to the message catalog.
    pub translate: bool,
    /// Translate by attribute name rather than by value.
    pub translate_by_name: bool,
    pub translation_context: Option<String>,
    /// Sequence feeding this attribute. Assigned when the model is built.
    pub sequence: Option<String>,
}

impl Attribute {
    /// Create an attribute of the given kind with its default external type.
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            external_type: kind.external_type().to_string(),
            nullable: false,
            default: Value::Null,
            width: None,
            precision: None,
            scale: None,
            translate: false,
            translate_by_name: true,
            translation_context: None,
            sequence: None,
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Bool)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Integer)
    }

    /// A decimal with 28 digits of precision and 2 after the point.
    pub fn decimal(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Decimal).precision(28, Some(2))
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Float)
    }

    /// A string of up to 255 characters.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::String).width(255)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Text)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Binary)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Date)
    }

    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Time)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::DateTime)
    }

    pub fn interval(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Interval)
    }

    /// The default primary key: a plain integer fed by a sequence.
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self::integer(name)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self.precision = None;
        self.scale = None;
        self
    }

    pub fn precision(mut self, precision: u32, scale: Option<u32>) -> Self {
        self.width = None;
        self.precision = Some(precision);
        self.scale = scale;
        self
    }

    pub fn external_type(mut self, external_type: impl Into<String>) -> Self {
        self.external_type = external_type.into();
        self
    }

    /// Mark values of this attribute as translatable.
    pub fn translate(mut self, by_name: bool, context: Option<&str>) -> Self {
        self.translate = true;
        self.translate_by_name = by_name;
        self.translation_context = context.map(str::to_string);
        self
    }

    pub fn is_integer(&self) -> bool {
        self.kind == ValueKind::Integer
    }

    /// The value an unset attribute has.
    pub fn default_value(&self) -> Value {
        self.default.clone()
    }

    /// The SQL column type, including width or precision.
    pub fn column_type(&self) -> String {
        match (self.width, self.precision, self.scale) {
            (Some(width), _, _) => format!("{}({})", self.external_type, width),
            (None, Some(precision), Some(scale)) => {
                format!("{}({},{})", self.external_type, precision, scale)
            }
            (None, Some(precision), None) => format!("{}({})", self.external_type, precision),
            (None, None, _) => self.external_type.clone(),
        }
    }

    /// Check and convert a value for storage in this attribute.
    ///
    /// NULL is rejected unless the attribute is nullable. Any other value is
    /// converted to the attribute's kind; integers always come back as
    /// `Value::BigInt`.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            if self.nullable {
                return Ok(Value::Null);
            }
            return Err(Error::integrity(format!(
                "Attribute `{}` cannot be NULL",
                self.name
            )));
        }
        convert(self.kind, value).ok_or_else(|| {
            Error::integrity(format!("Illegal value for attribute `{}`", self.name))
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn convert(kind: ValueKind, value: Value) -> Option<Value> {
    match kind {
        ValueKind::Bool => match value {
            Value::Text(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Some(Value::Bool(true)),
                "false" | "f" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            other => other.as_bool().map(Value::Bool),
        },
        ValueKind::Integer => match value {
            Value::Float(_) | Value::Double(_) => value
                .as_f64()
                .filter(|f| f.is_finite())
                .map(|f| Value::BigInt(f.trunc() as i64)),
            Value::Text(ref s) | Value::Decimal(ref s) => {
                s.trim().parse::<i64>().ok().map(Value::BigInt)
            }
            other => other.as_i64().map(Value::BigInt),
        },
        ValueKind::Decimal => match value {
            Value::Text(s) | Value::Decimal(s) => {
                let s = s.trim();
                DECIMAL.is_match(s).then(|| Value::Decimal(s.to_string()))
            }
            Value::Float(_) | Value::Double(_) => value
                .as_f64()
                .filter(|f| f.is_finite())
                .map(|f| Value::Decimal(f.to_string())),
            other if other.is_integer() => Some(Value::Decimal(other.to_string())),
            _ => None,
        },
        ValueKind::Float => match value {
            Value::Text(ref s) => s.trim().parse::<f64>().ok().map(Value::Double),
            Value::Bool(_) => None,
            other => other.as_f64().map(Value::Double),
        },
        ValueKind::String | ValueKind::Text => match value {
            Value::Text(s) | Value::Decimal(s) => Some(Value::Text(s)),
            Value::Bytes(b) => String::from_utf8(b).ok().map(Value::Text),
            Value::Bool(_)
            | Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Double(_) => Some(Value::Text(value.to_string())),
            _ => None,
        },
        ValueKind::Binary => match value {
            Value::Bytes(b) => Some(Value::Bytes(b)),
            Value::Text(s) => Some(Value::Bytes(s.into_bytes())),
            _ => None,
        },
        ValueKind::Date => match value {
            Value::Date(d) => Some(Value::Date(d)),
            other => other
                .as_i64()
                .and_then(|d| i32::try_from(d).ok())
                .map(Value::Date),
        },
        ValueKind::Time => temporal(value, Value::Time, |v| match v {
            Value::Time(t) => Some(*t),
            _ => None,
        }),
        ValueKind::DateTime => temporal(value, Value::Timestamp, |v| match v {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }),
        ValueKind::Interval => temporal(value, Value::Interval, |v| match v {
            Value::Interval(t) => Some(*t),
            _ => None,
        }),
    }
}

/// Accept the matching temporal variant, or a raw integer count of
/// microseconds.
fn temporal(
    value: Value,
    wrap: fn(i64) -> Value,
    same: impl Fn(&Value) -> Option<i64>,
) -> Option<Value> {
    if let Some(micros) = same(&value) {
        return Some(wrap(micros));
    }
    if value.is_integer() {
        return value.as_i64().map(wrap);
    }
    None
}
