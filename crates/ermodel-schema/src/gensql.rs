//! SQL generation from a built model.
//!
//! Each generator is a [`ModelVisitor`] collecting statements. Every
//! statement passes through [`Dialect::translate`] as it is emitted.

use crate::attribute::Attribute;
use crate::model::ModelDef;
use crate::object::{Index, ObjectClass};
use crate::visit::{ModelVisitor, walk};
use ermodel_core::{Dialect, Error, Result};

/// A user or group that privileges are granted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(String),
    Group(String),
}

impl Principal {
    fn sql(&self) -> String {
        match self {
            Principal::User(name) => name.clone(),
            Principal::Group(name) => format!("GROUP {}", name),
        }
    }
}

/// Statement sink shared by the generators.
struct Emitter<'a> {
    dialect: &'a dyn Dialect,
    statements: Vec<String>,
}

impl<'a> Emitter<'a> {
    fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            statements: Vec::new(),
        }
    }

    fn emit(&mut self, sql: &str) {
        self.statements.push(self.dialect.translate(sql));
    }
}

/// Sequence names of an entity's primary key.
fn sequences(entity: &ObjectClass) -> impl Iterator<Item = &str> {
    entity
        .primary_key_attributes()
        .filter_map(|a| a.sequence.as_deref())
}

/// Rejects names the dialect reserves.
pub struct SqlChecker<'a> {
    dialect: &'a dyn Dialect,
}

impl<'a> SqlChecker<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self { dialect }
    }

    fn check(&self, what: &str, name: &str, object: &str) -> Result<()> {
        if self.dialect.is_keyword(name) {
            return Err(Error::definition(format!(
                "{} name `{}` is an SQL keyword in dialect {}",
                what,
                name,
                self.dialect.name()
            ))
            .for_object(object));
        }
        Ok(())
    }
}

impl ModelVisitor for SqlChecker<'_> {
    fn visit_attribute(&mut self, owner: &ObjectClass, attribute: &Attribute) -> Result<()> {
        self.check("attribute", &attribute.name, &owner.name)
    }

    fn visit_index(&mut self, owner: &ObjectClass, index: &Index) -> Result<()> {
        self.check("index", &index.name, &owner.name)
    }

    fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
        self.check("entity", &entity.name, &entity.name)
    }

    fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
        self.check("relationship", &relationship.name, &relationship.name)
    }

    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        self.check("model", &model.name, &model.name)
    }
}

/// Emits the statements creating a model's schema.
pub struct SqlBuilder<'a> {
    out: Emitter<'a>,
    init: bool,
}

impl<'a> SqlBuilder<'a> {
    /// With `init`, the model's init statements are emitted last.
    pub fn new(dialect: &'a dyn Dialect, init: bool) -> Self {
        Self {
            out: Emitter::new(dialect),
            init,
        }
    }

    pub fn into_statements(self) -> Vec<String> {
        self.out.statements
    }

    fn column(&self, attribute: &Attribute) -> String {
        format!(
            "{} {} DEFAULT {}",
            attribute.name,
            attribute.column_type(),
            self.out.dialect.sql_literal(&attribute.default)
        )
    }
}

impl ModelVisitor for SqlBuilder<'_> {
    fn visit(&mut self, model: &ModelDef) -> Result<()> {
        self.out.emit(&format!("CREATE SCHEMA {}", model.name));
        walk(self, model)
    }

    fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
        let mut items: Vec<String> = entity.attributes.iter().map(|a| self.column(a)).collect();
        items.push("_refcount INTEGER NOT NULL DEFAULT 0".to_string());
        items.push(format!("PRIMARY KEY ({})", entity.primary_key.join(",")));
        self.out
            .emit(&format!("CREATE TABLE {} ({})", entity.table, items.join(",")));
        for sequence in sequences(entity) {
            self.out.emit(&format!("CREATE SEQUENCE {}", sequence));
        }
        Ok(())
    }

    fn visit_index(&mut self, owner: &ObjectClass, index: &Index) -> Result<()> {
        let mut sql = String::from("CREATE");
        if index.unique {
            sql.push_str(" UNIQUE");
        }
        sql.push_str(&format!(" INDEX {} ON {} ", index.name, owner.table));
        if let Some(method) = &index.method {
            sql.push_str(&format!("USING {} ", method));
        }
        sql.push_str(&format!("({})", index.columns.join(",")));
        self.out.emit(&sql);
        Ok(())
    }

    fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
        let mut items: Vec<String> = relationship
            .attributes
            .iter()
            .map(|a| self.column(a))
            .collect();
        for role in &relationship.roles {
            items.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE RESTRICT",
                role.foreign_key.join(","),
                role.referenced_table,
                role.referenced_columns.join(",")
            ));
        }
        items.push(format!(
            "PRIMARY KEY ({})",
            relationship.primary_key.join(",")
        ));
        self.out.emit(&format!(
            "CREATE TABLE {} ({})",
            relationship.table,
            items.join(",")
        ));
        Ok(())
    }

    fn visit_view(&mut self, view: &ObjectClass) -> Result<()> {
        let query = view.query.as_deref().unwrap_or_default();
        self.out
            .emit(&format!("CREATE VIEW {} AS {}", view.table, query));
        Ok(())
    }

    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        if self.init {
            for sql in &model.init_statements {
                self.out.emit(sql);
            }
        }
        Ok(())
    }
}

/// Emits the statement removing a model's schema.
pub struct SqlDestroyer<'a> {
    out: Emitter<'a>,
}

impl<'a> SqlDestroyer<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            out: Emitter::new(dialect),
        }
    }

    pub fn into_statements(self) -> Vec<String> {
        self.out.statements
    }
}

impl ModelVisitor for SqlDestroyer<'_> {
    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        self.out
            .emit(&format!("DROP SCHEMA {} CASCADE", model.name));
        Ok(())
    }
}

const TABLE_RIGHTS: &str = "SELECT,INSERT,UPDATE,DELETE";
const SCHEMA_RIGHTS: &str = "USAGE";

/// Emits the statements granting a principal access to a model.
pub struct SqlGranter<'a> {
    out: Emitter<'a>,
    principal: Principal,
    grant_option: bool,
}

impl<'a> SqlGranter<'a> {
    pub fn new(dialect: &'a dyn Dialect, principal: Principal, grant_option: bool) -> Self {
        Self {
            out: Emitter::new(dialect),
            principal,
            grant_option,
        }
    }

    pub fn into_statements(self) -> Vec<String> {
        self.out.statements
    }

    fn grant(&mut self, rights: &str, kind: &str, name: &str) {
        let mut sql = format!(
            "GRANT {} ON {} {} TO {}",
            rights,
            kind,
            name,
            self.principal.sql()
        );
        if self.grant_option {
            sql.push_str(" WITH GRANT OPTION");
        }
        self.out.emit(&sql);
    }
}

impl ModelVisitor for SqlGranter<'_> {
    fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
        self.grant(TABLE_RIGHTS, "TABLE", &entity.table);
        for sequence in sequences(entity) {
            self.grant(TABLE_RIGHTS, "TABLE", sequence);
        }
        Ok(())
    }

    fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
        self.grant(TABLE_RIGHTS, "TABLE", &relationship.table);
        Ok(())
    }

    fn visit_view(&mut self, view: &ObjectClass) -> Result<()> {
        self.grant(TABLE_RIGHTS, "TABLE", &view.table);
        Ok(())
    }

    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        self.grant(SCHEMA_RIGHTS, "SCHEMA", &model.name);
        Ok(())
    }
}

/// Emits the statements revoking a principal's access to a model.
pub struct SqlRevoker<'a> {
    out: Emitter<'a>,
    principal: Principal,
}

impl<'a> SqlRevoker<'a> {
    pub fn new(dialect: &'a dyn Dialect, principal: Principal) -> Self {
        Self {
            out: Emitter::new(dialect),
            principal,
        }
    }

    pub fn into_statements(self) -> Vec<String> {
        self.out.statements
    }

    fn revoke(&mut self, kind: &str, name: &str) {
        let sql = format!(
            "REVOKE ALL PRIVILEGES ON {} {} FROM {}",
            kind,
            name,
            self.principal.sql()
        );
        self.out.emit(&sql);
    }
}

impl ModelVisitor for SqlRevoker<'_> {
    fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
        self.revoke("TABLE", &entity.table);
        for sequence in sequences(entity) {
            self.revoke("TABLE", sequence);
        }
        Ok(())
    }

    fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
        self.revoke("TABLE", &relationship.table);
        Ok(())
    }

    fn visit_view(&mut self, view: &ObjectClass) -> Result<()> {
        self.revoke("TABLE", &view.table);
        Ok(())
    }

    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        self.revoke("SCHEMA", &model.name);
        Ok(())
    }
}
