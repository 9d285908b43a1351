//! Database connection and database collaborator contracts.
//!
//! This module defines the interfaces the transaction engine consumes:
//!
//! - [`Connection`] - one physical connection, owned by exactly one transaction
//! - [`Database`] - connection factory, dialect and error classification
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`ErrorClass`] - what the engine does with a failed statement
//!
//! All calls block the calling thread until the database answers.

use crate::dialect::Dialect;
use crate::error::{Error, QueryError, Result};
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other concurrent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: Transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Read committed: Transactions only see committed changes from others.
    ReadCommitted,

    /// Repeatable read: Transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Serializable: Transactions appear to execute sequentially.
    /// Conflicting transactions fail with serialization errors and are
    /// replayed by `Transaction::retry`.
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::Config(crate::error::ConfigError {
                message: format!("Illegal isolation level: {}", s),
                source: None,
            })),
        }
    }
}

/// A blocking database connection.
///
/// A connection always has an open SQL-level transaction: the first
/// statement after `commit` or `rollback` implicitly begins the next one.
pub trait Connection: Send {
    /// Execute a query and return all rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Commit the current SQL transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current SQL transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Set the isolation level for subsequent SQL transactions.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        tracing::debug!(level = level.as_sql(), "Setting isolation level");
        let sql = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        );
        self.execute(&sql, &[]).map(|_| ())
    }
}

/// How the engine treats a failed database statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A concurrent transaction conflicted; replaying may succeed.
    Serialization,
    /// An insert collided with an existing primary key.
    PrimaryKeyViolation,
    /// Anything else. Propagated unchanged.
    Other,
}

/// The database collaborator a model is bound to.
///
/// Implementations hand out connections and classify their errors. The
/// default classification looks at SQLSTATE codes and the query error kind,
/// which covers drivers that report standard codes.
pub trait Database: Send + Sync {
    /// Open a new physical connection.
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// The SQL dialect spoken by this database.
    fn dialect(&self) -> &dyn Dialect;

    /// Classify a failed statement.
    fn classify_error(&self, err: &Error) -> ErrorClass {
        match err {
            Error::Query(q) if q.is_serialization_failure() => ErrorClass::Serialization,
            Error::Query(q) if q.is_unique_violation() => ErrorClass::PrimaryKeyViolation,
            _ => ErrorClass::Other,
        }
    }

    fn is_serialization_error(&self, err: &Error) -> bool {
        self.classify_error(err) == ErrorClass::Serialization
    }

    fn is_primary_key_error(&self, err: &Error) -> bool {
        self.classify_error(err) == ErrorClass::PrimaryKeyViolation
    }

    /// An error that `classify_error` reports as a serialization failure.
    fn serialization_error(&self) -> Error {
        Error::Query(QueryError::serialization(
            "could not serialize access due to concurrent update",
        ))
    }

    /// Put a connection into the given isolation level.
    fn set_isolation_level(&self, conn: &mut dyn Connection, level: IsolationLevel) -> Result<()> {
        if self.dialect().isolation_level(level).is_none() {
            tracing::warn!(
                level = level.as_sql(),
                dialect = self.dialect().name(),
                "Isolation level not supported by dialect"
            );
            return Err(Error::Custom(format!(
                "isolation level {} not supported by dialect {}",
                level.as_sql(),
                self.dialect().name()
            )));
        }
        conn.set_isolation_level(level)
    }
}
