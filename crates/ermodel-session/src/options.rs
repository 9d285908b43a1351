//! Transaction configuration.

use ermodel_core::{ConfigError, Error, IsolationLevel, Result};
use std::fmt;
use std::str::FromStr;

/// What happens to a transaction that is finalized without an explicit
/// commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizationPolicy {
    Commit,
    #[default]
    Rollback,
}

impl FinalizationPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            FinalizationPolicy::Commit => "COMMIT",
            FinalizationPolicy::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for FinalizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalizationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMMIT" => Ok(FinalizationPolicy::Commit),
            "ROLLBACK" => Ok(FinalizationPolicy::Rollback),
            _ => Err(Error::Config(ConfigError {
                message: format!("Illegal finalization policy: {}", s),
                source: None,
            })),
        }
    }
}

/// Settings every transaction of a model starts with.
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Isolation level requested on connect
    pub isolation_level: IsolationLevel,
    /// Applied when a transaction is finalized
    pub finalization: FinalizationPolicy,
    /// Attempts made before a serialization failure is given up on
    pub max_attempts: u32,
    /// Upper bound of the random pause before a replay, in milliseconds
    pub max_backoff_ms: u64,
    /// Check role cardinalities at commit time
    pub check_cardinality: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Serializable,
            finalization: FinalizationPolicy::Rollback,
            max_attempts: 10,
            max_backoff_ms: 400,
            check_cardinality: false,
        }
    }
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn finalization(mut self, policy: FinalizationPolicy) -> Self {
        self.finalization = policy;
        self
    }

    /// Set the attempt budget. At least one attempt is always made.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn check_cardinality(mut self, enabled: bool) -> Self {
        self.check_cardinality = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransactionOptions::default();
        assert_eq!(options.isolation_level, IsolationLevel::Serializable);
        assert_eq!(options.finalization, FinalizationPolicy::Rollback);
        assert_eq!(options.max_attempts, 10);
        assert_eq!(options.max_backoff_ms, 400);
        assert!(!options.check_cardinality);
    }

    #[test]
    fn test_builder() {
        let options = TransactionOptions::new()
            .finalization(FinalizationPolicy::Commit)
            .max_attempts(0)
            .max_backoff(5)
            .check_cardinality(true);
        assert_eq!(options.finalization, FinalizationPolicy::Commit);
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.max_backoff_ms, 5);
        assert!(options.check_cardinality);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "commit".parse::<FinalizationPolicy>().unwrap(),
            FinalizationPolicy::Commit
        );
        assert_eq!(
            " Rollback ".parse::<FinalizationPolicy>().unwrap(),
            FinalizationPolicy::Rollback
        );
        let err = "abort".parse::<FinalizationPolicy>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("Illegal finalization policy"));
    }
}
