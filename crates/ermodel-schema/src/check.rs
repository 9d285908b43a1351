//! Structural validation of model definitions.

use crate::attribute::Attribute;
use crate::model::ModelDef;
use crate::object::{Index, ObjectClass};
use crate::visit::ModelVisitor;
use ermodel_core::{Error, Result, is_identifier};
use std::collections::HashSet;

/// Validates a model as declared by the schema author.
///
/// Every violation is a model-definition error naming the offending
/// construct.
#[derive(Debug, Default)]
pub struct CheckVisitor {
    entities: HashSet<String>,
}

impl CheckVisitor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::definition(format!("{} name not set", kind)));
    }
    if !is_identifier(name) {
        return Err(Error::definition(format!(
            "{} name `{}` is not a valid identifier",
            kind, name
        )));
    }
    Ok(())
}

fn check_unique<'a>(
    owner: &str,
    what: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::definition(format!("{} names not unique: {}", what, name))
                .for_object(owner));
        }
    }
    Ok(())
}

impl ModelVisitor for CheckVisitor {
    fn visit_attribute(&mut self, owner: &ObjectClass, attribute: &Attribute) -> Result<()> {
        check_name("attribute", &attribute.name).map_err(|e| e.for_object(&owner.name))?;
        if attribute.external_type.trim().is_empty() {
            return Err(Error::definition(format!(
                "attribute `{}`: external type not set",
                attribute.name
            ))
            .for_object(&owner.name));
        }
        Ok(())
    }

    fn visit_index(&mut self, owner: &ObjectClass, index: &Index) -> Result<()> {
        check_name("index", &index.name).map_err(|e| e.for_object(&owner.name))?;
        if index.columns.is_empty() {
            return Err(
                Error::definition(format!("index `{}` has no columns", index.name))
                    .for_object(&owner.name),
            );
        }
        for column in &index.columns {
            if !owner.has_attribute(column) {
                return Err(Error::definition(format!(
                    "index `{}`: column `{}` not in attributes",
                    index.name, column
                ))
                .for_object(&owner.name));
            }
        }
        if index.method.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(
                Error::definition(format!("index `{}`: empty method", index.name))
                    .for_object(&owner.name),
            );
        }
        Ok(())
    }

    fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
        check_name("entity", &entity.name)?;
        if entity.primary_key.is_empty() {
            return Err(Error::definition("no primary key specified").for_object(&entity.name));
        }
        for pk in &entity.primary_key {
            if !entity.has_attribute(pk) {
                return Err(Error::definition(format!("primary key `{}` not in attributes", pk))
                    .for_object(&entity.name));
            }
        }
        check_unique(
            &entity.name,
            "attribute",
            entity.attributes.iter().map(|a| a.name.as_str()),
        )?;
        check_unique(
            &entity.name,
            "index",
            entity.indexes.iter().map(|i| i.name.as_str()),
        )?;
        self.entities.insert(entity.name.clone());
        Ok(())
    }

    fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
        check_name("relationship", &relationship.name)?;
        if relationship.roles.is_empty() {
            return Err(Error::definition("roles not set").for_object(&relationship.name));
        }
        for role in &relationship.roles {
            check_name("role", &role.name).map_err(|e| e.for_object(&relationship.name))?;
            if !self.entities.contains(&role.entity) {
                return Err(Error::definition(format!(
                    "role `{}`: no such entity `{}`",
                    role.name, role.entity
                ))
                .for_object(&relationship.name));
            }
            if !role.cardinality.is_well_formed() {
                return Err(Error::definition(format!(
                    "role `{}`: cardinality {} has min above max",
                    role.name, role.cardinality
                ))
                .for_object(&relationship.name));
            }
        }
        check_unique(
            &relationship.name,
            "role",
            relationship.roles.iter().map(|r| r.name.as_str()),
        )?;
        check_unique(
            &relationship.name,
            "attribute",
            relationship.attributes.iter().map(|a| a.name.as_str()),
        )?;
        check_unique(
            &relationship.name,
            "index",
            relationship.indexes.iter().map(|i| i.name.as_str()),
        )
    }

    fn visit_view(&mut self, view: &ObjectClass) -> Result<()> {
        check_name("view", &view.name)?;
        if view.query.as_deref().is_none_or(|q| q.trim().is_empty()) {
            return Err(Error::definition("query not set").for_object(&view.name));
        }
        Ok(())
    }

    fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
        check_name("model", &model.name)?;
        if model.version.is_none() {
            return Err(Error::definition("version not set").for_object(&model.name));
        }
        check_unique(
            &model.name,
            "entity/relationship",
            model
                .entities
                .iter()
                .chain(&model.relationships)
                .map(|o| o.name.as_str()),
        )
    }
}
