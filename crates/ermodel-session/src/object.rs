//! Runtime objects: one row of an entity, relationship or view.
//!
//! An [`Object`] is a cheap, cloneable handle. Clones share the same
//! underlying data, so the identity cache of a transaction can hand out the
//! same instance for every select of the same row and
//! [`Object::ptr_eq`] tells whether two handles are that instance.
//!
//! The handle keeps two things apart:
//!
//! - the *desired* attribute values, each slot being unset, lazy (not yet
//!   fetched) or a value;
//! - the *row image*, the columns last read from or written to the
//!   database.
//!
//! Objects that are free (not part of a transaction) can be filled in
//! directly with [`Object::set`] and friends. Once attached, every change
//! goes through the owning [`Transaction`], which writes it to the database
//! immediately.

use crate::state::ObjectState;
use crate::transaction::Transaction;
use ermodel_core::{Error, PrimaryKey, Result, Row, Value};
use ermodel_schema::{ObjectClass, ObjectKind};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Combines an incoming record into an existing object during a merge.
///
/// Receives the transaction, the object holding the current row and the
/// attribute values of the record being merged. Changes are made through
/// the transaction so they are written through, e.g.
/// `tx.set(existing, "count", sum)`.
pub type MergeFn =
    Arc<dyn Fn(&mut Transaction, &Object, &BTreeMap<String, Value>) -> Result<()> + Send + Sync>;

/// A merge recorded against an object, replayed when the transaction is
/// rebuilt.
#[derive(Clone)]
pub(crate) struct PendingMerge {
    pub func: Option<MergeFn>,
    pub incoming: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Unset,
    Lazy,
    Value(Value),
}

#[derive(Clone)]
pub(crate) struct ObjectData {
    pub state: ObjectState,
    pub transaction: Option<u64>,
    pub slots: Vec<Slot>,
    pub row_image: BTreeMap<String, Value>,
    pub extra: BTreeMap<String, Value>,
    pub locked: bool,
    pub merges: Vec<PendingMerge>,
    /// Attributes written by this transaction since the row was read
    pub dirty: BTreeSet<String>,
}

/// Shared handle to one runtime object.
#[derive(Clone)]
pub struct Object {
    class: Arc<ObjectClass>,
    inner: Arc<RwLock<ObjectData>>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("Object")
            .field("class", &self.class.name)
            .field("state", &data.state)
            .field("transaction", &data.transaction)
            .field("slots", &data.slots)
            .finish_non_exhaustive()
    }
}

impl Object {
    /// A free object of `class` with every attribute unset.
    pub fn new(class: Arc<ObjectClass>) -> Self {
        let slots = vec![Slot::Unset; class.attributes.len()];
        Self {
            class,
            inner: Arc::new(RwLock::new(ObjectData {
                state: ObjectState::Free,
                transaction: None,
                slots,
                row_image: BTreeMap::new(),
                extra: BTreeMap::new(),
                locked: false,
                merges: Vec::new(),
                dirty: BTreeSet::new(),
            })),
        }
    }

    /// A free object with the given attribute values.
    pub fn with_values<I, K, V>(class: Arc<ObjectClass>, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let object = Self::new(class);
        for (name, value) in values {
            object.set(name.as_ref(), value)?;
        }
        Ok(object)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ObjectData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn class(&self) -> &Arc<ObjectClass> {
        &self.class
    }

    /// Unqualified object name, e.g. `page`.
    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn kind(&self) -> ObjectKind {
        self.class.kind
    }

    pub fn state(&self) -> ObjectState {
        self.read().state
    }

    /// Id of the transaction this object belongs to, if any.
    pub fn transaction_id(&self) -> Option<u64> {
        self.read().transaction
    }

    pub fn is_locked(&self) -> bool {
        self.read().locked
    }

    /// Do both handles refer to the same instance?
    pub fn ptr_eq(a: &Object, b: &Object) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn position(&self, name: &str) -> Result<usize> {
        self.class
            .attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| {
                Error::interface(format!("No such attribute: {}", name)).for_object(&self.class.name)
            })
    }

    pub(crate) fn slot(&self, index: usize) -> Slot {
        self.read().slots[index].clone()
    }

    /// Current value of an attribute.
    ///
    /// Unset attributes read as their default. An attribute that was not
    /// part of the select this object came from is not loaded yet; read it
    /// through [`Transaction::get`] instead.
    pub fn get(&self, name: &str) -> Result<Value> {
        let index = self.position(name)?;
        match self.slot(index) {
            Slot::Unset => Ok(self.class.attributes[index].default_value()),
            Slot::Value(value) => Ok(value),
            Slot::Lazy => Err(Error::interface(format!(
                "Attribute `{}` is not loaded",
                name
            ))
            .for_object(&self.class.name)),
        }
    }

    /// Is the attribute's value available without a database round trip?
    pub fn is_loaded(&self, name: &str) -> bool {
        self.position(name)
            .is_ok_and(|index| self.slot(index) != Slot::Lazy)
    }

    fn check_mutable(&self) -> Result<()> {
        match self.state() {
            ObjectState::Free | ObjectState::Associated => Ok(()),
            ObjectState::Deleted => Err(Error::interface("Object was deleted.")),
            ObjectState::Orphan => Err(Error::interface("Object's transaction has finished.")),
            _ => Err(Error::interface(
                "Object is attached; change it through its transaction.",
            )),
        }
        .map_err(|e| e.for_object(&self.class.name))
    }

    /// Set an attribute of a free object.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.check_mutable()?;
        let index = self.position(name)?;
        let value = self.class.attributes[index].coerce(value.into())?;
        self.write().slots[index] = Slot::Value(value);
        Ok(())
    }

    /// Set several attributes of a free object.
    pub fn update(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in values {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Like [`Object::update`], but skips names that are not attributes.
    pub fn pick(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in values {
            if self.class.has_attribute(name) {
                self.set(name, value.clone())?;
            }
        }
        Ok(())
    }

    fn values_of(&self, names: &[String]) -> PrimaryKey {
        let data = self.read();
        PrimaryKey::new(
            names
                .iter()
                .map(|name| {
                    self.class
                        .attributes
                        .iter()
                        .position(|a| &a.name == name)
                        .map_or(Value::Null, |i| match &data.slots[i] {
                            Slot::Value(v) => v.clone(),
                            Slot::Unset => self.class.attributes[i].default_value(),
                            Slot::Lazy => Value::Null,
                        })
                })
                .collect(),
        )
    }

    /// The primary-key values, in primary-key order.
    pub fn primary_key(&self) -> PrimaryKey {
        self.values_of(&self.class.primary_key)
    }

    /// The foreign-key values a relationship holds for `role`.
    pub fn foreign_key(&self, role: &str) -> Result<PrimaryKey> {
        let role = self.class.require_role(role)?;
        Ok(self.values_of(&role.foreign_key))
    }

    /// `<name>.<pk1>.<pk2>...`, or `None` while the key is incomplete.
    pub fn object_id(&self) -> Option<String> {
        let pk = self.primary_key();
        if !pk.is_complete() {
            return None;
        }
        let mut id = self.class.name.clone();
        for value in pk.values() {
            id.push('.');
            id.push_str(&value.to_string());
        }
        Some(id)
    }

    /// Every column of the row this object was selected from, including
    /// extra columns requested with the query.
    pub fn extra_data(&self) -> BTreeMap<String, Value> {
        self.read().extra.clone()
    }

    /// The columns last read from or written to the database.
    pub fn row_image(&self) -> BTreeMap<String, Value> {
        self.read().row_image.clone()
    }

    /// Attribute name to value, for every loaded attribute.
    pub fn copy(&self) -> BTreeMap<String, Value> {
        let data = self.read();
        self.class
            .attributes
            .iter()
            .zip(&data.slots)
            .filter_map(|(attr, slot)| match slot {
                Slot::Value(v) => Some((attr.name.clone(), v.clone())),
                Slot::Unset => Some((attr.name.clone(), attr.default_value())),
                Slot::Lazy => None,
            })
            .collect()
    }

    /// Put `entity` in `role` of this relationship.
    ///
    /// Copies the entity's primary key into the role's foreign-key
    /// attributes. The relationship must still be free and the entity must
    /// exist in its transaction.
    pub fn set_role(&self, role: &str, entity: &Object) -> Result<()> {
        if self.state() != ObjectState::Free {
            return Err(Error::interface("Relationship already associated.").for_object(self.name()));
        }
        let role = self.class.require_role(role)?;
        if entity.name() != role.entity {
            return Err(Error::interface(format!("Illegal type for role {}", role.name))
                .for_object(self.name()));
        }
        if !entity.state().is_persisted() {
            return Err(Error::interface("Entity does not exist.").for_object(entity.name()));
        }
        let pk = entity.primary_key();
        let mut data = self.write();
        for (fk, value) in role.foreign_key.iter().zip(pk.into_values()) {
            let index = self
                .class
                .attributes
                .iter()
                .position(|a| &a.name == fk)
                .ok_or_else(|| Error::internal(format!("Foreign key `{}` not built", fk)))?;
            data.slots[index] = Slot::Value(value);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction-side mutation
    // ------------------------------------------------------------------

    pub(crate) fn set_state(&self, state: ObjectState) {
        let mut data = self.write();
        if data.state != state {
            tracing::debug!(
                object = %self.class.name,
                from = %data.state,
                to = %state,
                "Object state change"
            );
            data.state = state;
        }
    }

    pub(crate) fn set_locked(&self, locked: bool) {
        self.write().locked = locked;
    }

    pub(crate) fn attach(&self, transaction: u64) {
        let mut data = self.write();
        data.transaction = Some(transaction);
        data.state = ObjectState::Associated;
    }

    pub(crate) fn set_slot(&self, index: usize, value: Value) {
        self.write().slots[index] = Slot::Value(value);
    }

    /// Record values as read from or written to the database.
    pub(crate) fn record_row<'a>(&self, values: impl IntoIterator<Item = (&'a String, &'a Value)>) {
        let mut data = self.write();
        for (name, value) in values {
            data.row_image.insert(name.clone(), value.clone());
        }
    }

    /// Populate from a selected row. Attributes missing from the row become
    /// lazy; a missing primary-key column is an internal error.
    pub(crate) fn load_row(&self, row: &Row) -> Result<()> {
        let mut data = self.write();
        let mut image = BTreeMap::new();
        for (index, attr) in self.class.attributes.iter().enumerate() {
            match row.get_by_name(&attr.name) {
                Some(value) => {
                    let value = attr.coerce(value.clone()).unwrap_or_else(|_| value.clone());
                    image.insert(attr.name.clone(), value.clone());
                    data.slots[index] = Slot::Value(value);
                }
                None if self.class.is_primary_key(&attr.name) => {
                    return Err(Error::internal("Primary key value not provided.")
                        .for_object(&self.class.name));
                }
                None => data.slots[index] = Slot::Lazy,
            }
        }
        data.row_image = image;
        data.dirty.clear();
        data.extra = row
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Ok(())
    }

    /// `(name, value)` of every loaded attribute, optionally without the
    /// primary key.
    pub(crate) fn loaded_values(&self, with_primary_key: bool) -> Vec<(String, Value)> {
        let data = self.read();
        self.class
            .attributes
            .iter()
            .zip(&data.slots)
            .filter(|(attr, _)| with_primary_key || !self.class.is_primary_key(&attr.name))
            .filter_map(|(attr, slot)| match slot {
                Slot::Value(v) => Some((attr.name.clone(), v.clone())),
                Slot::Unset => Some((attr.name.clone(), attr.default_value())),
                Slot::Lazy => None,
            })
            .collect()
    }

    pub(crate) fn mark_dirty(&self, name: &str) {
        self.write().dirty.insert(name.to_string());
    }

    pub(crate) fn mark_all_dirty(&self) {
        let names = self.class.attributes.iter().map(|a| a.name.clone());
        self.write().dirty.extend(names);
    }

    pub(crate) fn dirty(&self) -> BTreeSet<String> {
        self.read().dirty.clone()
    }

    /// Take every attribute this transaction has not written from `row`.
    pub(crate) fn refresh_from_row(&self, row: &Row) {
        let mut data = self.write();
        for (index, attr) in self.class.attributes.iter().enumerate() {
            if data.dirty.contains(&attr.name) {
                continue;
            }
            if let Some(value) = row.get_by_name(&attr.name) {
                let value = attr.coerce(value.clone()).unwrap_or_else(|_| value.clone());
                data.row_image.insert(attr.name.clone(), value.clone());
                data.slots[index] = Slot::Value(value);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ObjectData {
        self.read().clone()
    }

    pub(crate) fn restore(&self, snapshot: ObjectData) {
        *self.write() = snapshot;
    }

    pub(crate) fn push_merge(&self, merge: PendingMerge) {
        self.write().merges.push(merge);
    }

    pub(crate) fn merges(&self) -> Vec<PendingMerge> {
        self.read().merges.clone()
    }

    /// Forget transaction-scoped bookkeeping after commit or rollback.
    pub(crate) fn finish(&self, state: ObjectState) {
        let mut data = self.write();
        data.state = state;
        data.locked = false;
        data.merges.clear();
        data.dirty.clear();
    }

    /// Replace every desired value with `values`, leaving missing
    /// attributes unset.
    pub(crate) fn reset_values(&self, values: &BTreeMap<String, Value>) {
        let mut data = self.write();
        for (index, attr) in self.class.attributes.iter().enumerate() {
            data.slots[index] = values
                .get(&attr.name)
                .map_or(Slot::Unset, |v| Slot::Value(v.clone()));
        }
        data.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ermodel_schema::{Attribute, Cardinality, ModelDef, ModelSchema, register_model};

    fn model() -> ModelSchema {
        register_model(
            ModelDef::new("wiki")
                .version(1)
                .entity(
                    ObjectClass::entity("page")
                        .attribute(Attribute::primary_key("id"))
                        .attribute(Attribute::string("title"))
                        .attribute(Attribute::integer("hits").default(0))
                        .primary_key(["id"]),
                )
                .relationship(
                    ObjectClass::relationship("link")
                        .role("source", "page", Cardinality::any())
                        .role("target", "page", Cardinality::any()),
                ),
        )
        .unwrap()
    }

    fn page(model: &ModelSchema) -> Object {
        Object::new(model.object("page").unwrap())
    }

    #[test]
    fn test_free_object_defaults_and_coercion() {
        let model = model();
        let obj = page(&model);
        assert_eq!(obj.state(), ObjectState::Free);
        assert_eq!(obj.get("hits").unwrap(), Value::Int(0));
        obj.set("hits", "12").unwrap();
        assert_eq!(obj.get("hits").unwrap(), Value::BigInt(12));
        assert!(obj.set("title", Value::Null).unwrap_err().is_integrity());
        assert!(obj.get("body").unwrap_err().is_interface());
    }

    #[test]
    fn test_primary_key_and_object_id() {
        let model = model();
        let obj = page(&model);
        assert!(!obj.primary_key().is_complete());
        assert_eq!(obj.object_id(), None);
        obj.set("id", 7).unwrap();
        assert_eq!(obj.primary_key(), PrimaryKey::new(vec![Value::BigInt(7)]));
        assert_eq!(obj.object_id().as_deref(), Some("page.7"));
    }

    #[test]
    fn test_clones_share_identity() {
        let model = model();
        let a = page(&model);
        let b = a.clone();
        let c = page(&model);
        assert!(Object::ptr_eq(&a, &b));
        assert!(!Object::ptr_eq(&a, &c));
        b.set("title", "Home").unwrap();
        assert_eq!(a.get("title").unwrap(), Value::Text("Home".into()));
    }

    #[test]
    fn test_load_row_marks_missing_columns_lazy() {
        let model = model();
        let obj = page(&model);
        let row = Row::new(
            vec!["id".into(), "title".into(), "score".into()],
            vec![Value::Int(3), Value::Text("Home".into()), Value::Double(0.5)],
        );
        obj.load_row(&row).unwrap();
        assert_eq!(obj.get("id").unwrap(), Value::BigInt(3));
        assert!(!obj.is_loaded("hits"));
        assert!(obj.get("hits").unwrap_err().is_interface());
        assert_eq!(obj.extra_data().get("score"), Some(&Value::Double(0.5)));
        assert_eq!(obj.row_image().len(), 2);
        assert!(!obj.copy().contains_key("hits"));

        let keyless = Row::new(vec!["title".into()], vec![Value::Text("x".into())]);
        assert!(page(&model).load_row(&keyless).unwrap_err().is_internal());
    }

    #[test]
    fn test_attached_objects_reject_direct_writes() {
        let model = model();
        let obj = page(&model);
        obj.set_state(ObjectState::Selected);
        assert!(obj.set("title", "x").unwrap_err().is_interface());
        obj.set_state(ObjectState::Deleted);
        let err = obj.set("title", "x").unwrap_err();
        assert!(err.to_string().contains("deleted"));
    }

    #[test]
    fn test_set_role_copies_primary_key() {
        let model = model();
        let target = page(&model);
        target.set("id", 4).unwrap();
        let link = Object::new(model.object("link").unwrap());
        assert!(link.set_role("target", &target).unwrap_err().is_interface());

        target.set_state(ObjectState::Selected);
        link.set_role("target", &target).unwrap();
        assert_eq!(link.get("target_id").unwrap(), Value::BigInt(4));
        assert_eq!(
            link.foreign_key("target").unwrap(),
            PrimaryKey::new(vec![Value::BigInt(4)])
        );
        assert!(link.set_role("nobody", &target).unwrap_err().is_interface());
    }

    #[test]
    fn test_pick_ignores_unknown_names() {
        let model = model();
        let obj = page(&model);
        let mut values = BTreeMap::new();
        values.insert("title".to_string(), Value::from("Home"));
        values.insert("colour".to_string(), Value::from("red"));
        obj.pick(&values).unwrap();
        assert_eq!(obj.get("title").unwrap(), Value::Text("Home".into()));
        assert!(obj.update(&values).unwrap_err().is_interface());
    }
}
