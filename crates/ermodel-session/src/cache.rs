//! Per-transaction identity cache.

use crate::object::Object;
use crate::state::ObjectState;
use ermodel_core::PrimaryKey;
use ermodel_schema::ObjectKind;
use std::collections::HashMap;

type CacheKey = (String, PrimaryKey);

/// Guarantees one in-memory instance per persisted row within a
/// transaction.
///
/// Objects are kept in insertion order. Relationships are additionally
/// indexed under each role's `(entity, foreign key)`, so that deleting an
/// entity can find the cached relationships pointing at it.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: Vec<Object>,
    index: HashMap<CacheKey, usize>,
    referenced: HashMap<CacheKey, Vec<Object>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Add an object. Objects with an incomplete primary key cannot be
    /// identified yet and are not cached; `false` is returned for them.
    ///
    /// An object cached under the same key is replaced in place.
    pub fn insert(&mut self, object: &Object) -> bool {
        let pk = object.primary_key();
        if !pk.is_complete() {
            return false;
        }
        let key = (object.name().to_string(), pk);
        match self.index.get(&key) {
            Some(&position) => self.objects[position] = object.clone(),
            None => {
                self.index.insert(key, self.objects.len());
                self.objects.push(object.clone());
            }
        }
        self.add_references(object);
        true
    }

    fn add_references(&mut self, object: &Object) {
        if object.kind() != ObjectKind::Relationship {
            return;
        }
        for role in &object.class().roles {
            let Ok(fk) = object.foreign_key(&role.name) else {
                continue;
            };
            let referrers = self
                .referenced
                .entry((role.entity.clone(), fk))
                .or_default();
            if !referrers.iter().any(|r| Object::ptr_eq(r, object)) {
                referrers.push(object.clone());
            }
        }
    }

    /// The cached instance of `name` with primary key `pk`.
    pub fn select(&self, name: &str, pk: &PrimaryKey) -> Option<Object> {
        if !pk.is_complete() {
            return None;
        }
        self.index
            .get(&(name.to_string(), pk.clone()))
            .map(|&position| self.objects[position].clone())
    }

    /// Note the deletion of `object`.
    ///
    /// Cached relationships referencing a deleted entity are marked deleted.
    /// The object itself stays cached so commit-time validation still sees
    /// it; a later insert under the same key takes over the entry.
    pub fn delete(&mut self, object: &Object) {
        if object.kind() != ObjectKind::Entity {
            return;
        }
        let key = (object.name().to_string(), object.primary_key());
        for relationship in self.referenced.get(&key).into_iter().flatten() {
            relationship.set_state(ObjectState::Deleted);
        }
    }

    /// Remove the entry for `name` and `pk`.
    pub fn remove(&mut self, name: &str, pk: &PrimaryKey) -> Option<Object> {
        let position = self.index.get(&(name.to_string(), pk.clone())).copied()?;
        let object = self.objects.remove(position);
        self.reindex();
        Some(object)
    }

    /// Drop every entry added after the cache held `len` objects.
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.objects.len() {
            self.objects.truncate(len);
            self.reindex();
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        self.referenced.clear();
        for (position, object) in self.objects.iter().enumerate() {
            self.index
                .insert((object.name().to_string(), object.primary_key()), position);
        }
        for object in self.objects.clone() {
            self.add_references(&object);
        }
    }

    /// Every cached object in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter()
    }

    /// Every cached object, entities before relationships.
    ///
    /// Replaying objects in this order recreates foreign-key targets before
    /// the relationships that depend on them.
    pub fn values(&self) -> Vec<Object> {
        let entities = self
            .objects
            .iter()
            .filter(|o| o.kind() == ObjectKind::Entity);
        let relationships = self
            .objects
            .iter()
            .filter(|o| o.kind() == ObjectKind::Relationship);
        entities.chain(relationships).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.index.clear();
        self.referenced.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ermodel_core::Value;
    use ermodel_schema::{Attribute, Cardinality, ModelDef, ModelSchema, ObjectClass, register_model};

    fn model() -> ModelSchema {
        register_model(
            ModelDef::new("wiki")
                .version(1)
                .entity(
                    ObjectClass::entity("page")
                        .attribute(Attribute::primary_key("id"))
                        .primary_key(["id"]),
                )
                .entity(
                    ObjectClass::entity("tag")
                        .attribute(Attribute::string("label"))
                        .primary_key(["label"]),
                )
                .relationship(
                    ObjectClass::relationship("tagged")
                        .role("page", "page", Cardinality::any())
                        .role("tag", "tag", Cardinality::any()),
                ),
        )
        .unwrap()
    }

    fn page(model: &ModelSchema, id: i64) -> Object {
        Object::with_values(model.object("page").unwrap(), [("id", id)]).unwrap()
    }

    fn tag(model: &ModelSchema, label: &str) -> Object {
        Object::with_values(model.object("tag").unwrap(), [("label", label)]).unwrap()
    }

    fn tagged(model: &ModelSchema, page: i64, tag: &str) -> Object {
        Object::with_values(
            model.object("tagged").unwrap(),
            [("page_id", Value::from(page)), ("tag_label", Value::from(tag))],
        )
        .unwrap()
    }

    #[test]
    fn test_incomplete_key_not_cached() {
        let model = model();
        let mut cache = ObjectCache::new();
        let obj = Object::new(model.object("page").unwrap());
        assert!(!cache.insert(&obj));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_select_returns_same_instance() {
        let model = model();
        let mut cache = ObjectCache::new();
        let obj = page(&model, 1);
        assert!(cache.insert(&obj));
        let found = cache
            .select("page", &PrimaryKey::new(vec![Value::Int(1)]))
            .unwrap();
        assert!(Object::ptr_eq(&found, &obj));
        assert!(cache.select("tag", &obj.primary_key()).is_none());
    }

    #[test]
    fn test_reinsert_replaces_in_place() {
        let model = model();
        let mut cache = ObjectCache::new();
        cache.insert(&page(&model, 1));
        cache.insert(&page(&model, 2));
        let replacement = page(&model, 1);
        cache.insert(&replacement);
        assert_eq!(cache.len(), 2);
        let first = cache.iter().next().unwrap();
        assert!(Object::ptr_eq(first, &replacement));
    }

    #[test]
    fn test_values_orders_entities_first() {
        let model = model();
        let mut cache = ObjectCache::new();
        cache.insert(&tagged(&model, 1, "rust"));
        cache.insert(&page(&model, 1));
        cache.insert(&tag(&model, "rust"));
        let names: Vec<_> = cache.values().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["page", "tag", "tagged"]);
    }

    #[test]
    fn test_delete_cascades_to_relationships() {
        let model = model();
        let mut cache = ObjectCache::new();
        let home = page(&model, 1);
        let other = page(&model, 2);
        let link = tagged(&model, 1, "rust");
        let unrelated = tagged(&model, 2, "rust");
        for obj in [&home, &other, &link, &unrelated] {
            obj.set_state(ObjectState::Selected);
            cache.insert(obj);
        }
        cache.delete(&home);
        assert_eq!(link.state(), ObjectState::Deleted);
        assert_eq!(unrelated.state(), ObjectState::Selected);
        assert_eq!(home.state(), ObjectState::Selected);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_remove_and_truncate_keep_index_consistent() {
        let model = model();
        let mut cache = ObjectCache::new();
        let one = page(&model, 1);
        cache.insert(&one);
        cache.insert(&page(&model, 2));
        cache.insert(&page(&model, 3));

        assert!(cache.remove("page", &page(&model, 2).primary_key()).is_some());
        assert_eq!(cache.len(), 2);
        let three = cache.select("page", &page(&model, 3).primary_key()).unwrap();
        assert_eq!(three.get("id").unwrap(), Value::BigInt(3));

        cache.truncate(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.select("page", &three.primary_key()).is_none());
        assert!(Object::ptr_eq(&cache.select("page", &one.primary_key()).unwrap(), &one));

        cache.clear();
        assert!(cache.is_empty());
    }
}
