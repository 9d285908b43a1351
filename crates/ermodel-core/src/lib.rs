//! Core types and collaborator contracts for ermodel.
//!
//! This crate provides the foundations shared by the schema and session
//! layers:
//!
//! - `Error` with the model error taxonomy and database error helpers
//! - `Value`, `Row` and `PrimaryKey` for dynamically typed rows
//! - `Connection` and `Database`, the blocking driver contracts
//! - `Dialect` with standard, PostgreSQL and MySQL implementations

pub mod connection;
pub mod dialect;
pub mod error;
pub mod identifiers;
pub mod key;
pub mod row;
pub mod value;

pub use connection::{Connection, Database, ErrorClass, IsolationLevel};
pub use dialect::{Dialect, MysqlDialect, PostgresDialect, StandardDialect, standard_literal};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ModelError, ModelErrorKind,
    QueryError, QueryErrorKind, Result, TypeError,
};
pub use identifiers::{is_identifier, qualify, unqualified};
pub use key::PrimaryKey;
pub use row::{ColumnInfo, Row};
pub use value::Value;
