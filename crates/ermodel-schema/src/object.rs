//! Entity, relationship and view classes.

use crate::attribute::Attribute;
use ermodel_core::{Error, Result};
use std::fmt;

/// What kind of object a class describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A table row identified by a primary key.
    Entity,
    /// An association between entities, keyed by foreign keys.
    Relationship,
    /// A read-only query result.
    View,
}

impl ObjectKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Entity => "entity",
            ObjectKind::Relationship => "relationship",
            ObjectKind::View => "view",
        }
    }
}

/// Multiplicity bounds of a role. A `max` of `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cardinality {
    pub min: u32,
    pub max: Option<u32>,
}

impl Cardinality {
    pub const fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }

    /// Zero or more.
    pub const fn any() -> Self {
        Self::new(0, None)
    }

    /// Exactly one.
    pub const fn one() -> Self {
        Self::new(1, Some(1))
    }

    pub fn contains(&self, count: u64) -> bool {
        count >= u64::from(self.min) && self.max.is_none_or(|max| count <= u64::from(max))
    }

    pub fn is_well_formed(&self) -> bool {
        self.max.is_none_or(|max| self.min <= max)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}:{}]", self.min, max),
            None => write!(f, "[{}:]", self.min),
        }
    }
}

/// A named position an entity occupies in a relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub name: String,
    /// Name of the entity class playing this role.
    pub entity: String,
    pub cardinality: Cardinality,
    /// Foreign-key attribute names in this relationship. Filled by the build.
    pub foreign_key: Vec<String>,
    /// Qualified table of the role's entity. Filled by the build.
    pub referenced_table: String,
    /// Primary-key columns of the role's entity. Filled by the build.
    pub referenced_columns: Vec<String>,
}

impl Role {
    pub fn new(name: impl Into<String>, entity: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            cardinality,
            foreign_key: Vec::new(),
            referenced_table: String::new(),
            referenced_columns: Vec::new(),
        }
    }
}

/// Back reference from an entity to a relationship role it can play.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRef {
    pub role: String,
    pub relationship: String,
    pub cardinality: Cardinality,
    pub foreign_key: Vec<String>,
}

/// A database index on an entity or relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Index method (`USING ...`).
    pub method: Option<String>,
}

impl Index {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            method: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

/// The schema of one entity, relationship or view.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectClass {
    pub kind: ObjectKind,
    /// Unqualified name.
    pub name: String,
    /// Qualified `<model>.<name>`. Set by the build.
    pub table: String,
    pub attributes: Vec<Attribute>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<Index>,
    /// Roles of a relationship.
    pub roles: Vec<Role>,
    /// Roles an entity can play. Set by the build.
    pub backrefs: Vec<RoleRef>,
    /// Query of a view.
    pub query: Option<String>,
}

impl ObjectClass {
    fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind,
            table: name.clone(),
            name,
            attributes: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            roles: Vec::new(),
            backrefs: Vec::new(),
            query: None,
        }
    }

    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Entity, name)
    }

    /// A relationship. Its primary key is synthesized from its roles.
    pub fn relationship(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Relationship, name)
    }

    pub fn view(name: impl Into<String>, query: impl Into<String>) -> Self {
        let mut class = Self::new(ObjectKind::View, name);
        class.query = Some(query.into());
        class
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn primary_key<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn role(
        mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        self.roles.push(Role::new(name, entity, cardinality));
        self
    }

    pub fn is_entity(&self) -> bool {
        self.kind == ObjectKind::Entity
    }

    pub fn is_relationship(&self) -> bool {
        self.kind == ObjectKind::Relationship
    }

    pub fn is_view(&self) -> bool {
        self.kind == ObjectKind::View
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up an attribute, failing with an interface error.
    pub fn require_attribute(&self, name: &str) -> Result<&Attribute> {
        self.get_attribute(name).ok_or_else(|| {
            Error::interface(format!("No such attribute: {}", name)).for_object(&self.name)
        })
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == name)
    }

    pub fn primary_key_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.primary_key
            .iter()
            .filter_map(|name| self.get_attribute(name))
    }

    pub fn get_role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Look up a role, failing with an interface error.
    pub fn require_role(&self, name: &str) -> Result<&Role> {
        self.get_role(name).ok_or_else(|| {
            Error::interface(format!("No such role: {}", name)).for_object(&self.name)
        })
    }

    /// `a=$1 AND b=$2` over the primary key, numbered from `first`.
    pub fn primary_key_condition(
        &self,
        placeholder: impl Fn(usize) -> String,
        first: usize,
    ) -> String {
        column_condition(&self.primary_key, placeholder, first)
    }

    /// Condition selecting the relationships whose `role` is a given entity.
    pub fn foreign_key_condition(
        &self,
        role: &str,
        placeholder: impl Fn(usize) -> String,
    ) -> Result<String> {
        let role = self.require_role(role)?;
        Ok(column_condition(&role.foreign_key, placeholder, 1))
    }
}

/// `a=$n AND b=$n+1 ...`
pub fn column_condition(
    columns: &[String],
    placeholder: impl Fn(usize) -> String,
    first: usize,
) -> String {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{}={}", column, placeholder(first + i)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dollar(i: usize) -> String {
        format!("${i}")
    }

    #[test]
    fn test_cardinality() {
        let one = Cardinality::one();
        assert!(one.contains(1));
        assert!(!one.contains(0));
        assert!(!one.contains(2));
        assert!(Cardinality::any().contains(1000));
        assert!(!Cardinality::new(3, Some(1)).is_well_formed());
        assert_eq!(Cardinality::new(0, Some(2)).to_string(), "[0:2]");
        assert_eq!(Cardinality::any().to_string(), "[0:]");
    }

    #[test]
    fn test_entity_builder() {
        let node = ObjectClass::entity("node")
            .attribute(Attribute::primary_key("id"))
            .attribute(Attribute::string("name"))
            .primary_key(["id"])
            .index(Index::new("node_name_idx", ["name"]).unique());
        assert!(node.is_entity());
        assert!(node.is_primary_key("id"));
        assert!(!node.is_primary_key("name"));
        assert_eq!(node.primary_key_attributes().count(), 1);
        assert!(node.indexes[0].unique);
        assert!(node.require_attribute("missing").unwrap_err().is_interface());
    }

    #[test]
    fn test_conditions() {
        let mut link = ObjectClass::relationship("link").role("from", "node", Cardinality::any());
        link.roles[0].foreign_key = vec!["from_id".into(), "from_rev".into()];
        link.primary_key = vec!["from_id".into(), "from_rev".into()];
        assert_eq!(
            link.primary_key_condition(dollar, 1),
            "from_id=$1 AND from_rev=$2"
        );
        assert_eq!(
            link.foreign_key_condition("from", dollar).unwrap(),
            "from_id=$1 AND from_rev=$2"
        );
        assert!(link.foreign_key_condition("to", dollar).is_err());
    }
}
