//! Select queries and join paths.

use ermodel_core::{Error, Result, Value};
use ermodel_schema::{ModelSchema, ObjectClass};
use std::fmt;

/// How a relationship table is joined in a [`JoinPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinKind {
    pub const fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::LeftOuter => "LEFT OUTER",
            JoinKind::RightOuter => "RIGHT OUTER",
            JoinKind::FullOuter => "FULL OUTER",
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// The FROM clause of a select, reaching related entities through
/// relationships.
///
/// `JoinPath::object("page").join("source", "link", JoinKind::Inner)`
/// aliases `page` as `source`, joins the `link` table on the `source` role
/// and every other role's entity under its role name. The selected
/// object's columns are taken from the innermost alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPath {
    Object(String),
    Join {
        inner: Box<JoinPath>,
        role: String,
        relationship: String,
        kind: JoinKind,
    },
}

impl JoinPath {
    pub fn object(name: impl Into<String>) -> Self {
        JoinPath::Object(name.into())
    }

    /// Join `relationship` on `role`, the role the current path plays.
    pub fn join(
        self,
        role: impl Into<String>,
        relationship: impl Into<String>,
        kind: JoinKind,
    ) -> Self {
        JoinPath::Join {
            inner: Box::new(self),
            role: role.into(),
            relationship: relationship.into(),
            kind,
        }
    }

    /// Alias qualifying the selected object's columns.
    pub(crate) fn alias(&self, schema: &ModelSchema) -> Result<String> {
        let mut path = self;
        loop {
            match path {
                JoinPath::Object(name) => return Ok(schema.require_object(name)?.table.clone()),
                JoinPath::Join { inner, role, .. } => {
                    if matches!(**inner, JoinPath::Object(_)) {
                        return Ok(role.clone());
                    }
                    path = inner;
                }
            }
        }
    }

    pub(crate) fn from_clause(&self, schema: &ModelSchema) -> Result<String> {
        match self {
            JoinPath::Object(name) => Ok(schema.require_object(name)?.table.clone()),
            JoinPath::Join {
                inner,
                role,
                relationship,
                kind,
            } => {
                let mut left = inner.from_clause(schema)?;
                if matches!(**inner, JoinPath::Object(_)) {
                    left = format!("{} AS {}", left, role);
                }
                let relationship = schema.require_object(relationship)?;
                if !relationship.is_relationship() {
                    return Err(Error::interface(format!(
                        "`{}` is not a relationship",
                        relationship.name
                    )));
                }
                let mut clause = format!(
                    "{} {} JOIN {} ON {}",
                    left,
                    kind,
                    relationship.table,
                    join_condition(&relationship, role)?
                );
                for other in relationship.roles.iter().filter(|r| &r.name != role) {
                    clause.push_str(&format!(
                        " {} JOIN {} AS {} ON {}",
                        kind,
                        other.referenced_table,
                        other.name,
                        join_condition(&relationship, &other.name)?
                    ));
                }
                Ok(format!("({})", clause))
            }
        }
    }
}

/// Joins a relationship table to the entity playing `role`, aliased by the
/// role name.
fn join_condition(relationship: &ObjectClass, role: &str) -> Result<String> {
    let role = relationship.require_role(role)?;
    Ok(role
        .foreign_key
        .iter()
        .zip(&role.referenced_columns)
        .map(|(fk, pk)| format!("{}.{} = {}.{}", relationship.table, fk, role.name, pk))
        .collect::<Vec<_>>()
        .join(" AND "))
}

/// A select against one object class.
///
/// Conditions are raw SQL using the dialect's placeholders, numbered from
/// one, e.g. `title=$1` on PostgreSQL and `title=?` on MySQL.
#[derive(Debug, Clone, Default)]
pub struct Query {
    condition: Option<String>,
    args: Vec<Value>,
    order: Option<String>,
    offset: Option<u64>,
    limit: Option<u64>,
    join: Option<JoinPath>,
    lock: bool,
    attrs: Option<Vec<String>>,
    extra_attrs: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter<I, V>(mut self, condition: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.condition = Some(condition.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn join(mut self, path: JoinPath) -> Self {
        self.join = Some(path);
        self
    }

    /// Take row locks on the result (`FOR UPDATE`).
    pub fn lock(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Select only these attributes (plus the primary key). The others are
    /// fetched lazily on first read.
    pub fn attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs = Some(attrs.into_iter().map(Into::into).collect());
        self
    }

    /// Extra select-list expressions, available through
    /// [`Object::extra_data`](crate::Object::extra_data).
    pub fn extra_attrs<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_attrs = extra.into_iter().map(Into::into).collect();
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn is_locking(&self) -> bool {
        self.lock
    }

    fn path(&self, class: &ObjectClass) -> JoinPath {
        self.join
            .clone()
            .unwrap_or_else(|| JoinPath::Object(class.name.clone()))
    }

    fn what_clause(&self, class: &ObjectClass, alias: &str) -> Result<String> {
        let mut columns: Vec<String> = if class.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            let names: Vec<&str> = match &self.attrs {
                None => class.attributes.iter().map(|a| a.name.as_str()).collect(),
                Some(attrs) => {
                    let mut names: Vec<&str> =
                        class.primary_key.iter().map(String::as_str).collect();
                    for attr in attrs {
                        class.require_attribute(attr)?;
                        if !names.contains(&attr.as_str()) {
                            names.push(attr);
                        }
                    }
                    names
                }
            };
            names
                .into_iter()
                .map(|name| format!("{}.{}", alias, name))
                .collect()
        };
        columns.extend(self.extra_attrs.iter().cloned());
        Ok(columns.join(","))
    }

    pub(crate) fn select_sql(&self, schema: &ModelSchema, class: &ObjectClass) -> Result<String> {
        let path = self.path(class);
        let alias = path.alias(schema)?;
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.what_clause(class, &alias)?,
            path.from_clause(schema)?
        );
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        if let Some(order) = &self.order {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if self.lock {
            sql.push_str(" FOR UPDATE");
        }
        Ok(sql)
    }

    pub(crate) fn count_sql(&self, schema: &ModelSchema, class: &ObjectClass) -> Result<String> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.path(class).from_clause(schema)?);
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ermodel_schema::{Attribute, Cardinality, ModelDef, register_model};

    fn schema() -> ModelSchema {
        register_model(
            ModelDef::new("wiki")
                .version(1)
                .entity(
                    ObjectClass::entity("page")
                        .attribute(Attribute::primary_key("id"))
                        .attribute(Attribute::string("title"))
                        .attribute(Attribute::text("body"))
                        .primary_key(["id"]),
                )
                .entity(
                    ObjectClass::entity("user")
                        .attribute(Attribute::string("login"))
                        .primary_key(["login"]),
                )
                .relationship(
                    ObjectClass::relationship("link")
                        .role("source", "page", Cardinality::any())
                        .role("target", "page", Cardinality::any()),
                )
                .relationship(
                    ObjectClass::relationship("author")
                        .role("writer", "user", Cardinality::any())
                        .role("work", "page", Cardinality::any()),
                )
                .view(ObjectClass::view("titles", "SELECT title FROM wiki.page")),
        )
        .unwrap()
    }

    fn select(query: &Query, name: &str) -> String {
        let schema = schema();
        let class = schema.object(name).unwrap();
        query.select_sql(&schema, &class).unwrap()
    }

    #[test]
    fn test_plain_select() {
        let sql = select(&Query::new(), "page");
        assert_eq!(
            sql,
            "SELECT wiki.page.id,wiki.page.title,wiki.page.body FROM wiki.page"
        );
    }

    #[test]
    fn test_select_clauses() {
        let query = Query::new()
            .filter("title=$1", ["Home"])
            .order("id DESC")
            .offset(10)
            .limit(5)
            .lock();
        assert_eq!(
            select(&query, "page"),
            "SELECT wiki.page.id,wiki.page.title,wiki.page.body FROM wiki.page \
             WHERE title=$1 ORDER BY id DESC OFFSET 10 LIMIT 5 FOR UPDATE"
        );
        assert_eq!(query.args(), &[Value::Text("Home".into())]);
    }

    #[test]
    fn test_attrs_always_include_primary_key() {
        let query = Query::new()
            .attrs(["title", "id"])
            .extra_attrs(["length(body) AS size"]);
        assert_eq!(
            select(&query, "page"),
            "SELECT wiki.page.id,wiki.page.title,length(body) AS size FROM wiki.page"
        );

        let schema = schema();
        let class = schema.object("page").unwrap();
        let err = Query::new()
            .attrs(["colour"])
            .select_sql(&schema, &class)
            .unwrap_err();
        assert!(err.is_interface());
    }

    #[test]
    fn test_view_selects_everything() {
        assert_eq!(select(&Query::new(), "titles"), "SELECT * FROM wiki.titles");
    }

    #[test]
    fn test_join_through_relationship() {
        let path = JoinPath::object("page").join("source", "link", JoinKind::Inner);
        let query = Query::new().join(path).filter("target.title=$1", ["Home"]);
        assert_eq!(
            select(&query, "page"),
            "SELECT source.id,source.title,source.body FROM \
             (wiki.page AS source INNER JOIN wiki.link ON wiki.link.source_id = source.id \
             INNER JOIN wiki.page AS target ON wiki.link.target_id = target.id) \
             WHERE target.title=$1"
        );
    }

    #[test]
    fn test_nested_join() {
        let path = JoinPath::object("page")
            .join("source", "link", JoinKind::LeftOuter)
            .join("work", "author", JoinKind::Inner);
        let schema = schema();
        assert_eq!(path.alias(&schema).unwrap(), "source");
        assert_eq!(
            path.from_clause(&schema).unwrap(),
            "((wiki.page AS source LEFT OUTER JOIN wiki.link ON wiki.link.source_id = source.id \
             LEFT OUTER JOIN wiki.page AS target ON wiki.link.target_id = target.id) \
             INNER JOIN wiki.author ON wiki.author.work_id = work.id \
             INNER JOIN wiki.user AS writer ON wiki.author.writer_login = writer.login)"
        );
    }

    #[test]
    fn test_count_sql() {
        let schema = schema();
        let class = schema.object("page").unwrap();
        let query = Query::new().filter("id>$1", [3]);
        assert_eq!(
            query.count_sql(&schema, &class).unwrap(),
            "SELECT COUNT(*) FROM wiki.page WHERE id>$1"
        );
    }

    #[test]
    fn test_join_needs_relationship() {
        let schema = schema();
        let path = JoinPath::object("page").join("source", "user", JoinKind::Inner);
        assert!(path.from_clause(&schema).unwrap_err().is_interface());
        let missing = JoinPath::object("page").join("nobody", "link", JoinKind::Inner);
        assert!(missing.from_clause(&schema).unwrap_err().is_interface());
    }

    #[test]
    fn test_join_kind_sql() {
        assert_eq!(JoinKind::FullOuter.to_string(), "FULL OUTER");
        assert_eq!(JoinKind::default(), JoinKind::Inner);
    }
}
