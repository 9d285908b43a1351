//! Model visitors.

use crate::attribute::Attribute;
use crate::model::ModelDef;
use crate::object::{Index, ObjectClass};
use ermodel_core::Result;

/// A visitor over the nodes of a model.
///
/// Every hook defaults to a no-op. [`walk`] drives the visitor in natural
/// order: for each entity its attributes, the entity itself, then its
/// indexes; relationships the same way; then views; the model last.
pub trait ModelVisitor {
    fn visit_attribute(&mut self, _owner: &ObjectClass, _attribute: &Attribute) -> Result<()> {
        Ok(())
    }

    fn visit_index(&mut self, _owner: &ObjectClass, _index: &Index) -> Result<()> {
        Ok(())
    }

    fn visit_entity(&mut self, _entity: &ObjectClass) -> Result<()> {
        Ok(())
    }

    fn visit_relationship(&mut self, _relationship: &ObjectClass) -> Result<()> {
        Ok(())
    }

    fn visit_view(&mut self, _view: &ObjectClass) -> Result<()> {
        Ok(())
    }

    fn visit_model(&mut self, _model: &ModelDef) -> Result<()> {
        Ok(())
    }

    /// Visit every node of `model` in natural order.
    fn visit(&mut self, model: &ModelDef) -> Result<()>
    where
        Self: Sized,
    {
        walk(self, model)
    }
}

/// Visit every node of `model` in natural order.
pub fn walk<V: ModelVisitor + ?Sized>(visitor: &mut V, model: &ModelDef) -> Result<()> {
    for entity in &model.entities {
        for attribute in &entity.attributes {
            visitor.visit_attribute(entity, attribute)?;
        }
        visitor.visit_entity(entity)?;
        for index in &entity.indexes {
            visitor.visit_index(entity, index)?;
        }
    }
    for relationship in &model.relationships {
        for attribute in &relationship.attributes {
            visitor.visit_attribute(relationship, attribute)?;
        }
        visitor.visit_relationship(relationship)?;
        for index in &relationship.indexes {
            visitor.visit_index(relationship, index)?;
        }
    }
    for view in &model.views {
        visitor.visit_view(view)?;
    }
    visitor.visit_model(model)
}

/// Visit every node of `model` in the exact reverse of [`walk`].
pub fn walk_reversed<V: ModelVisitor + ?Sized>(visitor: &mut V, model: &ModelDef) -> Result<()> {
    visitor.visit_model(model)?;
    for view in model.views.iter().rev() {
        visitor.visit_view(view)?;
    }
    for relationship in model.relationships.iter().rev() {
        for index in relationship.indexes.iter().rev() {
            visitor.visit_index(relationship, index)?;
        }
        visitor.visit_relationship(relationship)?;
        for attribute in relationship.attributes.iter().rev() {
            visitor.visit_attribute(relationship, attribute)?;
        }
    }
    for entity in model.entities.iter().rev() {
        for index in entity.indexes.iter().rev() {
            visitor.visit_index(entity, index)?;
        }
        visitor.visit_entity(entity)?;
        for attribute in entity.attributes.iter().rev() {
            visitor.visit_attribute(entity, attribute)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Cardinality;

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl ModelVisitor for Trace {
        fn visit_attribute(&mut self, owner: &ObjectClass, attribute: &Attribute) -> Result<()> {
            self.0.push(format!("attr {}.{}", owner.name, attribute.name));
            Ok(())
        }

        fn visit_index(&mut self, owner: &ObjectClass, index: &Index) -> Result<()> {
            self.0.push(format!("index {}.{}", owner.name, index.name));
            Ok(())
        }

        fn visit_entity(&mut self, entity: &ObjectClass) -> Result<()> {
            self.0.push(format!("entity {}", entity.name));
            Ok(())
        }

        fn visit_relationship(&mut self, relationship: &ObjectClass) -> Result<()> {
            self.0.push(format!("rel {}", relationship.name));
            Ok(())
        }

        fn visit_view(&mut self, view: &ObjectClass) -> Result<()> {
            self.0.push(format!("view {}", view.name));
            Ok(())
        }

        fn visit_model(&mut self, model: &ModelDef) -> Result<()> {
            self.0.push(format!("model {}", model.name));
            Ok(())
        }
    }

    fn model() -> ModelDef {
        ModelDef::new("m")
            .version(1)
            .entity(
                ObjectClass::entity("e")
                    .attribute(Attribute::primary_key("id"))
                    .primary_key(["id"])
                    .index(Index::new("e_idx", ["id"])),
            )
            .relationship(ObjectClass::relationship("r").role("x", "e", Cardinality::any()))
            .view(ObjectClass::view("v", "SELECT 1"))
    }

    #[test]
    fn test_natural_order() {
        let mut trace = Trace::default();
        trace.visit(&model()).unwrap();
        assert_eq!(
            trace.0,
            vec![
                "attr e.id",
                "entity e",
                "index e.e_idx",
                "rel r",
                "view v",
                "model m"
            ]
        );
    }

    #[test]
    fn test_reversed_order() {
        let mut trace = Trace::default();
        walk_reversed(&mut trace, &model()).unwrap();
        assert_eq!(
            trace.0,
            vec![
                "model m",
                "view v",
                "rel r",
                "index e.e_idx",
                "entity e",
                "attr e.id"
            ]
        );
    }
}
