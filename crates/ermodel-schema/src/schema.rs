//! Creating, dropping and granting access to a model's database schema.

use crate::gensql::{Principal, SqlBuilder, SqlChecker, SqlDestroyer, SqlGranter, SqlRevoker};
use crate::model::ModelSchema;
use crate::visit::ModelVisitor;
use ermodel_core::{Database, Result, Value};
use std::sync::Arc;

/// Table recording the installed version of every model.
const VERSION_TABLE: &str = "ermodel.schemas";

/// Schema operations for one model against one database.
///
/// Every operation checks the model's names against the dialect, returns
/// the generated statements and, when asked, executes them on a fresh
/// connection and commits.
#[derive(Clone)]
pub struct Schema {
    model: Arc<ModelSchema>,
    database: Arc<dyn Database>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("model", &self.model.name())
            .field("dialect", &self.database.dialect().name())
            .finish()
    }
}

impl Schema {
    pub fn new(model: Arc<ModelSchema>, database: Arc<dyn Database>) -> Self {
        Self { model, database }
    }

    pub fn model(&self) -> &ModelSchema {
        &self.model
    }

    fn check(&self) -> Result<()> {
        SqlChecker::new(self.database.dialect()).visit(self.model.def())
    }

    /// Statements creating the model, followed by its init statements if
    /// `init` is set.
    pub fn create(&self, execute: bool, init: bool) -> Result<Vec<String>> {
        self.check()?;
        let mut builder = SqlBuilder::new(self.database.dialect(), init);
        builder.visit(self.model.def())?;
        let statements = builder.into_statements();
        if execute {
            self.execute(&statements, false)?;
        }
        Ok(statements)
    }

    /// Statements dropping the model. Failures while executing are ignored.
    pub fn drop(&self, execute: bool) -> Result<Vec<String>> {
        self.check()?;
        let mut destroyer = SqlDestroyer::new(self.database.dialect());
        destroyer.visit(self.model.def())?;
        let statements = destroyer.into_statements();
        if execute {
            self.execute(&statements, true)?;
        }
        Ok(statements)
    }

    pub fn grant(
        &self,
        principal: &Principal,
        grant_option: bool,
        execute: bool,
    ) -> Result<Vec<String>> {
        self.check()?;
        let mut granter =
            SqlGranter::new(self.database.dialect(), principal.clone(), grant_option);
        granter.visit(self.model.def())?;
        let statements = granter.into_statements();
        if execute {
            self.execute(&statements, false)?;
        }
        Ok(statements)
    }

    /// Statements revoking access. Failures while executing are ignored.
    pub fn revoke(&self, principal: &Principal, execute: bool) -> Result<Vec<String>> {
        self.check()?;
        let mut revoker = SqlRevoker::new(self.database.dialect(), principal.clone());
        revoker.visit(self.model.def())?;
        let statements = revoker.into_statements();
        if execute {
            self.execute(&statements, true)?;
        }
        Ok(statements)
    }

    /// The version of this model installed in the database, if recorded.
    pub fn version(&self) -> Result<Option<i64>> {
        let dialect = self.database.dialect();
        let sql = dialect.translate(&format!(
            "SELECT version FROM {} WHERE name={}",
            VERSION_TABLE,
            dialect.placeholder(1)
        ));
        let mut conn = self.database.connect()?;
        let row = conn.query_one(&sql, &[Value::from(self.model.name())])?;
        conn.rollback()?;
        Ok(row.and_then(|row| row.get(0).and_then(Value::as_i64)))
    }

    fn execute(&self, statements: &[String], ignore_errors: bool) -> Result<()> {
        let mut conn = self.database.connect()?;
        for sql in statements {
            tracing::debug!(sql = %sql, "Executing schema statement");
            match conn.execute(sql, &[]) {
                Ok(_) => {}
                Err(e) if ignore_errors => {
                    tracing::warn!(sql = %sql, error = %e, "Ignoring failed schema statement");
                    conn.rollback()?;
                }
                Err(e) => return Err(e),
            }
        }
        conn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::model::{ModelDef, register_model};
    use crate::object::ObjectClass;
    use ermodel_core::{
        Connection, Dialect, Error, QueryError, QueryErrorKind, Row, StandardDialect,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, event: impl Into<String>) {
            self.events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    struct RecordingConnection {
        log: Arc<Log>,
        fail_prefix: Option<&'static str>,
        version: Option<i64>,
    }

    impl Connection for RecordingConnection {
        fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            self.log.push(format!("query {} {:?}", sql, params));
            Ok(self
                .version
                .map(|v| Row::new(vec!["version".into()], vec![Value::BigInt(v)]))
                .into_iter()
                .collect())
        }

        fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
            if self.fail_prefix.is_some_and(|p| sql.starts_with(p)) {
                self.log.push(format!("fail {}", sql));
                return Err(Error::Query(QueryError::new(
                    QueryErrorKind::Database,
                    "does not exist",
                )));
            }
            self.log.push(sql.to_string());
            Ok(0)
        }

        fn commit(&mut self) -> Result<()> {
            self.log.push("COMMIT");
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.log.push("ROLLBACK");
            Ok(())
        }
    }

    struct RecordingDatabase {
        log: Arc<Log>,
        fail_prefix: Option<&'static str>,
        version: Option<i64>,
    }

    impl Database for RecordingDatabase {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(RecordingConnection {
                log: Arc::clone(&self.log),
                fail_prefix: self.fail_prefix,
                version: self.version,
            }))
        }

        fn dialect(&self) -> &dyn Dialect {
            &StandardDialect
        }
    }

    fn fixture(fail_prefix: Option<&'static str>, version: Option<i64>) -> (Schema, Arc<Log>) {
        let model = register_model(
            ModelDef::new("wiki").version(3).entity(
                ObjectClass::entity("page")
                    .attribute(Attribute::primary_key("id"))
                    .primary_key(["id"]),
            ),
        )
        .unwrap();
        let log = Arc::new(Log::default());
        let database = RecordingDatabase {
            log: Arc::clone(&log),
            fail_prefix,
            version,
        };
        (Schema::new(Arc::new(model), Arc::new(database)), log)
    }

    #[test]
    fn test_create_executes_and_commits() {
        let (schema, log) = fixture(None, None);
        let statements = schema.create(true, true).unwrap();
        assert_eq!(statements.len(), 3);
        let mut expected = statements.clone();
        expected.push("COMMIT".to_string());
        assert_eq!(log.events(), expected);
    }

    #[test]
    fn test_create_without_execute_touches_nothing() {
        let (schema, log) = fixture(None, None);
        schema.create(false, true).unwrap();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_create_propagates_failures() {
        let (schema, log) = fixture(Some("CREATE SEQUENCE"), None);
        assert!(schema.create(true, true).is_err());
        assert!(!log.events().contains(&"COMMIT".to_string()));
    }

    #[test]
    fn test_drop_and_revoke_ignore_failures() {
        let (schema, log) = fixture(Some("DROP"), None);
        let statements = schema.drop(true).unwrap();
        assert_eq!(statements, vec!["DROP SCHEMA wiki CASCADE"]);
        assert_eq!(
            log.events(),
            vec!["fail DROP SCHEMA wiki CASCADE", "ROLLBACK", "COMMIT"]
        );

        let (schema, log) = schema_for_revoke();
        schema
            .revoke(&Principal::User("bob".into()), true)
            .unwrap();
        assert_eq!(log.events().last().map(String::as_str), Some("COMMIT"));
    }

    fn schema_for_revoke() -> (Schema, Arc<Log>) {
        fixture(Some("REVOKE"), None)
    }

    #[test]
    fn test_version_lookup() {
        let (schema, log) = fixture(None, Some(3));
        assert_eq!(schema.version().unwrap(), Some(3));
        assert_eq!(
            log.events()[0],
            "query SELECT version FROM ermodel.schemas WHERE name=$1 [Text(\"wiki\")]"
        );

        let (schema, _) = fixture(None, None);
        assert_eq!(schema.version().unwrap(), None);
    }
}
