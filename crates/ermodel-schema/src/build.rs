//! Building a checked model into its runtime form.

use crate::attribute::Attribute;
use crate::model::{ModelDef, ModelSchema};
use crate::object::{ObjectClass, RoleRef};
use ermodel_core::{Error, Result, qualify};

/// Turns a checked [`ModelDef`] into a [`ModelSchema`].
///
/// - Tables are qualified with the model name.
/// - Integer primary-key attributes of entities get a sequence named
///   `<model>.<entity>_<attribute>_seq`.
/// - Each relationship role gets one foreign-key attribute per primary-key
///   attribute of its entity, named `<role>_<attribute>`. These become the
///   relationship's primary key and are prepended to its attributes.
/// - Entities get a back reference for every role they can play.
#[derive(Debug, Default)]
pub struct BuildVisitor;

impl BuildVisitor {
    pub fn new() -> Self {
        Self
    }

    pub fn visit(&mut self, mut model: ModelDef) -> Result<ModelSchema> {
        let schema_name = model.name.clone();
        for entity in &mut model.entities {
            build_entity(&schema_name, entity);
        }
        let entities = model.entities.clone();
        for relationship in &mut model.relationships {
            build_relationship(&schema_name, relationship, &entities)?;
        }
        for view in &mut model.views {
            view.table = qualify(&schema_name, &view.name);
        }
        link_backrefs(&mut model);
        Ok(ModelSchema::new(model))
    }
}

fn build_entity(schema: &str, entity: &mut ObjectClass) {
    entity.table = qualify(schema, &entity.name);
    entity.backrefs.clear();
    let table = entity.table.clone();
    let primary_key = entity.primary_key.clone();
    for attribute in &mut entity.attributes {
        attribute.sequence = (primary_key.contains(&attribute.name) && attribute.is_integer())
            .then(|| format!("{}_{}_seq", table, attribute.name));
    }
}

fn build_relationship(
    schema: &str,
    relationship: &mut ObjectClass,
    entities: &[ObjectClass],
) -> Result<()> {
    relationship.table = qualify(schema, &relationship.name);
    let mut foreign_keys: Vec<Attribute> = Vec::new();
    for role in &mut relationship.roles {
        let entity = entities
            .iter()
            .find(|e| e.name == role.entity)
            .ok_or_else(|| {
                Error::definition(format!("role `{}`: no such entity `{}`", role.name, role.entity))
                    .for_object(&relationship.name)
            })?;
        role.foreign_key.clear();
        for pk in entity.primary_key_attributes() {
            let mut fk = pk.clone();
            fk.name = format!("{}_{}", role.name, pk.name);
            fk.default = ermodel_core::Value::Null;
            fk.nullable = false;
            fk.sequence = None;
            role.foreign_key.push(fk.name.clone());
            foreign_keys.push(fk);
        }
        role.referenced_table.clone_from(&entity.table);
        role.referenced_columns.clone_from(&entity.primary_key);
    }
    for fk in &foreign_keys {
        if relationship.has_attribute(&fk.name) {
            return Err(Error::definition(format!(
                "Attribute names not unique: foreign key `{}` collides with a declared attribute",
                fk.name
            ))
            .for_object(&relationship.name));
        }
    }
    relationship.primary_key = foreign_keys.iter().map(|fk| fk.name.clone()).collect();
    foreign_keys.append(&mut relationship.attributes);
    relationship.attributes = foreign_keys;
    Ok(())
}

fn link_backrefs(model: &mut ModelDef) {
    for entity in &mut model.entities {
        for relationship in &model.relationships {
            for role in relationship.roles.iter().filter(|r| r.entity == entity.name) {
                entity.backrefs.push(RoleRef {
                    role: role.name.clone(),
                    relationship: relationship.name.clone(),
                    cardinality: role.cardinality,
                    foreign_key: role.foreign_key.clone(),
                });
            }
        }
    }
}
