//! Model definitions and registration.

use crate::build::BuildVisitor;
use crate::check::CheckVisitor;
use crate::object::ObjectClass;
use crate::visit::ModelVisitor;
use ermodel_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A model as declared by the schema author.
///
/// A model names one SQL schema and lists the entities, relationships and
/// views living in it. Pass it to [`register_model`] to check and build it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDef {
    pub name: String,
    pub version: Option<u32>,
    pub entities: Vec<ObjectClass>,
    pub relationships: Vec<ObjectClass>,
    pub views: Vec<ObjectClass>,
    /// Statements executed after the schema is created.
    pub init_statements: Vec<String>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn entity(mut self, entity: ObjectClass) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relationship(mut self, relationship: ObjectClass) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn view(mut self, view: ObjectClass) -> Self {
        self.views.push(view);
        self
    }

    pub fn init_statement(mut self, sql: impl Into<String>) -> Self {
        self.init_statements.push(sql.into());
        self
    }
}

/// A checked and built model.
///
/// Immutable after registration and shared freely between transactions
/// and threads.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    def: ModelDef,
    objects: HashMap<String, Arc<ObjectClass>>,
}

impl ModelSchema {
    pub(crate) fn new(def: ModelDef) -> Self {
        let objects = def
            .entities
            .iter()
            .chain(&def.relationships)
            .chain(&def.views)
            .map(|class| (class.name.clone(), Arc::new(class.clone())))
            .collect();
        Self { def, objects }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn version(&self) -> Option<u32> {
        self.def.version
    }

    /// The built definition, with qualified tables and synthesized keys.
    pub fn def(&self) -> &ModelDef {
        &self.def
    }

    /// Look up an entity, relationship or view by unqualified name.
    pub fn object(&self, name: &str) -> Option<Arc<ObjectClass>> {
        self.objects.get(name).cloned()
    }

    /// Look up an object class, failing with an interface error.
    pub fn require_object(&self, name: &str) -> Result<Arc<ObjectClass>> {
        self.object(name)
            .ok_or_else(|| Error::interface(format!("No such object: {}", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = Arc<ObjectClass>> + '_ {
        self.def
            .entities
            .iter()
            .filter_map(|class| self.object(&class.name))
    }

    pub fn relationships(&self) -> impl Iterator<Item = Arc<ObjectClass>> + '_ {
        self.def
            .relationships
            .iter()
            .filter_map(|class| self.object(&class.name))
    }
}

/// Check a model definition, then build it.
///
/// This is the only way to obtain a [`ModelSchema`], so every model a
/// transaction runs against has passed both phases exactly once.
pub fn register_model(def: ModelDef) -> Result<ModelSchema> {
    CheckVisitor::new().visit(&def)?;
    let schema = BuildVisitor::new().visit(def)?;
    tracing::debug!(
        model = %schema.name(),
        entities = schema.def().entities.len(),
        relationships = schema.def().relationships.len(),
        views = schema.def().views.len(),
        "Registered model"
    );
    Ok(schema)
}
