//! Transactions over a model.
//!
//! A [`Transaction`] owns one database connection and an identity cache.
//! Every change to an attached object is written through to the database
//! at once; commit validates the cached objects and commits the SQL
//! transaction.
//!
//! Statements run under [`Transaction::retry`]. When the database reports a
//! serialization failure the SQL transaction is rolled back and every cached
//! object is replayed on a fresh one (see [`RebuildAction`]) before the
//! failed operation runs again. Operations that touch several rows (insert,
//! merge, delete) are retried as a whole; their effect on the argument
//! object and the cache is undone before the replay.

use crate::cache::ObjectCache;
use crate::hooks::ObjectHooks;
use crate::model::Model;
use crate::object::{MergeFn, Object, PendingMerge, Slot};
use crate::options::FinalizationPolicy;
use crate::query::Query;
use crate::rebuild::{RebuildAction, plan_rebuild};
use crate::state::ObjectState;
use ermodel_core::{Connection, Error, IsolationLevel, PrimaryKey, Result, Row, Value};
use ermodel_schema::{Attribute, ObjectClass, ValueKind, column_condition};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// One object of a transaction dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry {
    /// Object name
    pub object: String,
    pub state: ObjectState,
    pub primary_key: Vec<Value>,
    /// Every loaded attribute
    pub values: BTreeMap<String, Value>,
}

/// A translatable string found in a cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationMessage {
    pub message: String,
    pub context: Option<String>,
    /// `<object>.<attribute>` when the attribute is translated by name
    pub name: Option<String>,
}

/// A unit of work against one model.
pub struct Transaction {
    id: u64,
    name: String,
    model: Model,
    connection: Box<dyn Connection>,
    cache: ObjectCache,
    isolation_level: IsolationLevel,
    finalization: FinalizationPolicy,
    retrying: bool,
    active: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model.name())
            .field("objects", &self.cache.len())
            .field("isolation_level", &self.isolation_level)
            .field("finalization", &self.finalization)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(model: Model, name: String) -> Result<Self> {
        let options = model.options().clone();
        let mut connection = model.database().connect()?;
        model
            .database()
            .set_isolation_level(connection.as_mut(), options.isolation_level)?;
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            id,
            name = %name,
            model = %model.name(),
            isolation = options.isolation_level.as_sql(),
            "Transaction started"
        );
        Ok(Self {
            id,
            name,
            model,
            connection,
            cache: ObjectCache::new(),
            isolation_level: options.isolation_level,
            finalization: options.finalization,
            retrying: false,
            active: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn finalization_policy(&self) -> FinalizationPolicy {
        self.finalization
    }

    /// Has a statement run since the last commit or rollback?
    pub fn is_active(&self) -> bool {
        self.active
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        self.model
            .database()
            .set_isolation_level(self.connection.as_mut(), level)?;
        self.isolation_level = level;
        Ok(())
    }

    /// Set the finalization policy from its name, `COMMIT` or `ROLLBACK`.
    pub fn set_finalization_policy(&mut self, policy: &str) -> Result<()> {
        self.finalization = policy.parse()?;
        Ok(())
    }

    // ========================================================================
    // Low-level statement execution
    // ========================================================================

    fn run_query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        tracing::debug!(transaction = %self.name, sql = %sql, params = ?params, "Query");
        self.active = true;
        self.connection.query(sql, params)
    }

    fn run_execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::debug!(transaction = %self.name, sql = %sql, params = ?params, "Execute");
        self.active = true;
        self.connection.execute(sql, params)
    }

    fn condition(&self, columns: &[String], first: usize) -> String {
        let dialect = self.model.database().dialect();
        column_condition(columns, |i| dialect.placeholder(i), first)
    }

    fn hooks(&self, object: &Object) -> Option<Arc<dyn ObjectHooks>> {
        self.model.hooks_for(object.name())
    }

    fn check_owner(&self, object: &Object) -> Result<()> {
        if object.transaction_id() == Some(self.id) {
            Ok(())
        } else {
            Err(Error::interface("Object is not part of this transaction.").for_object(object.name()))
        }
    }

    fn check_writable(object: &Object) -> Result<()> {
        if object.class().is_view() {
            return Err(Error::interface("Views are read-only.").for_object(object.name()));
        }
        Ok(())
    }

    /// A query selecting one row by primary key.
    fn key_query(&self, class: &ObjectClass, key: &[Value], lock: bool) -> Result<Query> {
        if key.len() != class.primary_key.len() {
            return Err(Error::interface(format!(
                "Expected {} primary key values, got {}",
                class.primary_key.len(),
                key.len()
            ))
            .for_object(&class.name));
        }
        let query = Query::new().filter(self.condition(&class.primary_key, 1), key.to_vec());
        Ok(if lock { query.lock() } else { query })
    }

    // ========================================================================
    // Retry and rebuild
    // ========================================================================

    /// Run `op`, replaying the transaction and running it again when the
    /// database reports a serialization failure.
    ///
    /// Up to `max_attempts` attempts are made. Before each replay the SQL
    /// transaction is rolled back, a random pause of up to `max_backoff_ms`
    /// is taken and every cached object is rebuilt. Calls nested inside a
    /// retry run `op` once; the outermost retry owns the replay.
    pub fn retry<T, F>(&mut self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        if self.retrying {
            return op(self);
        }
        self.retrying = true;
        let result = self.retry_loop(&mut op);
        self.retrying = false;
        result
    }

    fn retry_loop<T, F>(&mut self, op: &mut F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let max_attempts = self.model.options().max_attempts.max(1);
        let max_backoff_ms = self.model.options().max_backoff_ms;
        let database = Arc::clone(self.model.database());
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                let backoff_ms = rand::thread_rng().gen_range(0..=max_backoff_ms);
                tracing::info!(
                    transaction = %self.name,
                    attempt,
                    max_attempts,
                    backoff_ms,
                    "Serialization failure, replaying transaction"
                );
                self.connection.rollback()?;
                thread::sleep(Duration::from_millis(backoff_ms));
                if let Err(err) = self.rebuild() {
                    if database.is_serialization_error(&err) && attempt < max_attempts {
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
            match op(self) {
                Err(err) if database.is_serialization_error(&err) && attempt < max_attempts => {
                    tracing::debug!(transaction = %self.name, error = %err, "Retryable failure");
                    attempt += 1;
                }
                Err(err) => {
                    if database.is_serialization_error(&err) {
                        tracing::warn!(
                            transaction = %self.name,
                            attempts = attempt,
                            "Giving up after repeated serialization failures"
                        );
                    }
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }

    /// Run `op`; if it fails, put `object` and the cache back the way they
    /// were.
    fn undoable<T>(
        &mut self,
        object: &Object,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let snapshot = object.snapshot();
        let mark = self.cache.len();
        let result = op(self);
        if result.is_err() {
            object.restore(snapshot);
            self.cache.truncate(mark);
        }
        result
    }

    /// Replay every cached object on the current SQL transaction.
    fn rebuild(&mut self) -> Result<()> {
        let objects = self.cache.values();
        tracing::debug!(transaction = %self.name, objects = objects.len(), "Rebuilding");
        // Deleted relationships go first so their entities can be deleted again.
        let (first, rest): (Vec<Object>, Vec<Object>) = objects.into_iter().partition(|o| {
            o.class().is_relationship() && o.state() == ObjectState::Deleted
        });
        for object in first.iter().chain(&rest) {
            self.rebuild_object(object)?;
        }
        Ok(())
    }

    fn fetch_row(&mut self, object: &Object) -> Result<Option<Row>> {
        let class = Arc::clone(object.class());
        let columns: Vec<&str> = class.attributes.iter().map(|a| a.name.as_str()).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            columns.join(","),
            class.table,
            self.condition(&class.primary_key, 1)
        );
        let pk = object.primary_key();
        Ok(self.run_query(&sql, pk.values())?.into_iter().next())
    }

    /// Replay one object. A failed replay leaves the object as it was, so
    /// the next attempt plans it from the same state.
    fn rebuild_object(&mut self, object: &Object) -> Result<()> {
        let state = object.state();
        if !state.is_persisted() && state != ObjectState::Deleted {
            return Ok(());
        }
        let snapshot = object.snapshot();
        let result = self.replay_object(object, state);
        if result.is_err() {
            object.restore(snapshot);
        }
        result
    }

    fn replay_object(&mut self, object: &Object, state: ObjectState) -> Result<()> {
        let row = self.fetch_row(object)?;
        let action = plan_rebuild(state, row.is_some());
        tracing::debug!(object = ?object.object_id(), state = %state, ?action, "Rebuild object");
        match (action, row) {
            (RebuildAction::Reapply, Some(row)) => {
                object.refresh_from_row(&row);
                let dirty = object.dirty();
                let values: Vec<(String, Value)> = object
                    .loaded_values(false)
                    .into_iter()
                    .filter(|(name, _)| dirty.contains(name))
                    .collect();
                self.write_values(object, &values)?;
            }
            (RebuildAction::Reinsert, _) => {
                object.set_state(ObjectState::Associated);
                self.insert_row(object)?;
                if state != ObjectState::Inserted {
                    object.set_state(state);
                }
            }
            (RebuildAction::Remerge, Some(row)) => {
                object.load_row(&row)?;
                for merge in object.merges() {
                    if let Some(func) = &merge.func {
                        func(self, object, &merge.incoming)?;
                    }
                }
            }
            (RebuildAction::ReinsertMerged, _) => {
                let merges = object.merges();
                if let Some((first, rest)) = merges.split_first() {
                    object.reset_values(&first.incoming);
                    object.set_state(ObjectState::Associated);
                    self.insert_row(object)?;
                    for merge in rest {
                        if let Some(func) = &merge.func {
                            func(self, object, &merge.incoming)?;
                        }
                    }
                }
                object.set_state(ObjectState::Merged);
            }
            (RebuildAction::Redelete, _) => self.delete_row(object)?,
            _ => {}
        }
        if object.is_locked() {
            self.lock_row(object)?;
        }
        Ok(())
    }

    // ========================================================================
    // Row-level writes
    // ========================================================================

    /// `UPDATE ... SET` the given attributes of `object`.
    fn write_values(&mut self, object: &Object, values: &[(String, Value)]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let class = Arc::clone(object.class());
        let dialect = self.model.database().dialect();
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{}={}", name, dialect.placeholder(i + 1)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            class.table,
            assignments.join(","),
            self.condition(&class.primary_key, values.len() + 1)
        );
        let mut params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        params.extend(object.primary_key().into_values());
        self.run_execute(&sql, &params)?;
        object.record_row(values.iter().map(|(n, v)| (n, v)));
        Ok(())
    }

    fn next_value(&mut self, sequence: &str) -> Result<Value> {
        let sql = self
            .model
            .database()
            .dialect()
            .translate(&format!("SELECT nextval('{}')", sequence));
        self.run_query(&sql, &[])?
            .into_iter()
            .next()
            .and_then(|row| row.get(0).cloned())
            .ok_or_else(|| Error::internal(format!("Sequence {} returned no value", sequence)))
    }

    fn adjust_refcount(&mut self, object: &Object, increment: bool) -> Result<()> {
        let class = Arc::clone(object.class());
        for role in &class.roles {
            let fk = object.foreign_key(&role.name)?;
            let sql = format!(
                "UPDATE {} SET _refcount = _refcount {} 1 WHERE {}",
                role.referenced_table,
                if increment { "+" } else { "-" },
                self.condition(&role.referenced_columns, 1)
            );
            if self.run_execute(&sql, fk.values())? == 0 {
                return Err(Error::integrity(format!(
                    "Role `{}` refers to a missing {}",
                    role.name, role.entity
                ))
                .for_object(&class.name));
            }
        }
        Ok(())
    }

    /// Insert the row of an associated object.
    fn insert_row(&mut self, object: &Object) -> Result<()> {
        if object.state() != ObjectState::Associated {
            return Err(Error::interface("No transaction associated.").for_object(object.name()));
        }
        let class = Arc::clone(object.class());
        let hooks = self.hooks(object);
        if let Some(hooks) = &hooks {
            hooks.pre_insert(self, object)?;
        }

        if class.is_entity() {
            for (index, attr) in class.attributes.iter().enumerate() {
                if !class.is_primary_key(&attr.name) || !object.get(&attr.name)?.is_null() {
                    continue;
                }
                match &attr.sequence {
                    Some(sequence) => {
                        let value = self.next_value(sequence)?;
                        object.set_slot(index, attr.coerce(value)?);
                    }
                    None => {
                        return Err(Error::interface(format!(
                            "Primary key value not provided: {}",
                            attr.name
                        ))
                        .for_object(&class.name));
                    }
                }
            }
        } else {
            for role in &class.roles {
                if !object.foreign_key(&role.name)?.is_complete() {
                    return Err(Error::interface(format!("Role has not been set: {}", role.name))
                        .for_object(&class.name));
                }
            }
        }

        let values: Vec<(String, Value)> = object
            .loaded_values(true)
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", class.table)
        } else {
            let dialect = self.model.database().dialect();
            let names: Vec<&str> = values.iter().map(|(n, _)| n.as_str()).collect();
            let placeholders: Vec<String> =
                (1..=values.len()).map(|i| dialect.placeholder(i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                class.table,
                names.join(","),
                placeholders.join(",")
            )
        };
        let params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        self.run_execute(&sql, &params)?;
        object.record_row(values.iter().map(|(n, v)| (n, v)));
        object.mark_all_dirty();
        object.set_state(ObjectState::Inserted);

        if let Some(hooks) = &hooks {
            hooks.post_insert(self, object)?;
        }
        if class.is_relationship() {
            self.adjust_refcount(object, true)?;
        }
        Ok(())
    }

    /// Delete the row of `object`, its relationships first.
    fn delete_row(&mut self, object: &Object) -> Result<()> {
        let class = Arc::clone(object.class());
        if class.is_entity() {
            for backref in &class.backrefs {
                for related in self.in_role(object, &backref.role, &backref.relationship)? {
                    match related.state() {
                        state if state.is_persisted() => self.delete(&related)?,
                        ObjectState::Deleted if self.retrying => self.delete_row(&related)?,
                        _ => {}
                    }
                }
            }
        } else {
            self.adjust_refcount(object, false)?;
        }

        let hooks = self.hooks(object);
        if let Some(hooks) = &hooks {
            hooks.pre_delete(self, object)?;
        }
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            class.table,
            self.condition(&class.primary_key, 1)
        );
        let pk = object.primary_key();
        self.run_execute(&sql, pk.values())?;
        object.set_state(ObjectState::Deleted);
        if let Some(hooks) = &hooks {
            hooks.post_delete(self, object)?;
        }
        Ok(())
    }

    fn lock_row(&mut self, object: &Object) -> Result<()> {
        let class = Arc::clone(object.class());
        let sql = format!(
            "SELECT {} FROM {} WHERE {} FOR UPDATE",
            class.primary_key.join(","),
            class.table,
            self.condition(&class.primary_key, 1)
        );
        let pk = object.primary_key();
        self.run_query(&sql, pk.values())?;
        object.set_locked(true);
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Select objects of the class called `name`.
    ///
    /// Rows already cached resolve to the cached instance; it is returned
    /// as is, without taking values from the new row.
    #[tracing::instrument(level = "debug", skip(self, query), fields(transaction = %self.name))]
    pub fn select(&mut self, name: &str, query: &Query) -> Result<Vec<Object>> {
        let class = self.model.object(name)?;
        let sql = query.select_sql(self.model.model_schema(), &class)?;
        let rows = self.retry(|tx| tx.run_query(&sql, query.args()))?;
        if class.is_view() {
            return self.view_objects(&class, &rows);
        }
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let mut key = Vec::with_capacity(class.primary_key.len());
            for attr in class.primary_key_attributes() {
                let value = row.get_by_name(&attr.name).ok_or_else(|| {
                    Error::internal("Query did not return primary key.").for_object(&class.name)
                })?;
                key.push(attr.coerce(value.clone()).unwrap_or_else(|_| value.clone()));
            }
            let object = match self.cache.select(&class.name, &PrimaryKey::new(key)) {
                Some(cached) => cached,
                None => {
                    let object = Object::new(Arc::clone(&class));
                    object.attach(self.id);
                    object.load_row(&row)?;
                    object.set_state(ObjectState::Selected);
                    self.cache.insert(&object);
                    object
                }
            };
            if query.is_locking() {
                object.set_locked(true);
            }
            objects.push(object);
        }
        Ok(objects)
    }

    /// Objects of a view. A view declared without attributes takes its
    /// attributes from the columns of the result set once: the kind is the
    /// reported column type, or else that of the first non-null value.
    fn view_objects(&self, class: &Arc<ObjectClass>, rows: &[Row]) -> Result<Vec<Object>> {
        let class = match rows.first() {
            Some(first) if class.attributes.is_empty() => {
                let columns = first.column_info();
                let mut derived = ObjectClass::clone(class);
                derived.attributes = columns
                    .names()
                    .iter()
                    .enumerate()
                    .map(|(index, name)| {
                        let kind = columns
                            .type_of(index)
                            .and_then(ValueKind::from_sql_type)
                            .or_else(|| {
                                rows.iter()
                                    .find_map(|row| row.get(index).and_then(ValueKind::of_value))
                            })
                            .unwrap_or(ValueKind::Text);
                        Attribute::new(name.as_str(), kind).nullable()
                    })
                    .collect();
                Arc::new(derived)
            }
            _ => Arc::clone(class),
        };
        rows.iter()
            .map(|row| {
                let object = Object::new(Arc::clone(&class));
                object.attach(self.id);
                object.load_row(row)?;
                object.set_state(ObjectState::Selected);
                Ok(object)
            })
            .collect()
    }

    /// Number of rows `query` selects from the class called `name`.
    pub fn count(&mut self, name: &str, query: &Query) -> Result<u64> {
        let class = self.model.object(name)?;
        let sql = query.count_sql(self.model.model_schema(), &class)?;
        let rows = self.retry(|tx| tx.run_query(&sql, query.args()))?;
        rows.first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::internal("COUNT(*) returned no value").for_object(&class.name))
    }

    /// The entity called `name` with primary key `key`.
    pub fn entity(&mut self, name: &str, key: &[Value]) -> Result<Object> {
        let class = self.model.object(name)?;
        let query = self.key_query(&class, key, false)?;
        self.select(name, &query)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::interface("Object does not exist.").for_object(name))
    }

    /// The entity playing `role` in a relationship.
    pub fn role(&mut self, relationship: &Object, role: &str) -> Result<Object> {
        if relationship.state() == ObjectState::Deleted {
            return Err(Error::interface("Object was deleted.").for_object(relationship.name()));
        }
        let role = relationship.class().require_role(role)?.clone();
        let fk = relationship.foreign_key(&role.name)?;
        let entity = self.model.object(&role.entity)?;
        let query = self.key_query(&entity, fk.values(), false)?;
        let mut found = self.select(&role.entity, &query)?;
        if found.len() != 1 {
            return Err(Error::internal("Referenced object is deleted?").for_object(&role.entity));
        }
        Ok(found.remove(0))
    }

    /// Every relationship called `relationship` in which `entity` plays
    /// `role`.
    pub fn in_role(&mut self, entity: &Object, role: &str, relationship: &str) -> Result<Vec<Object>> {
        let class = self.model.object(relationship)?;
        let role = class.require_role(role)?;
        if role.entity != entity.name() {
            return Err(Error::interface("Object has no role in relationship.")
                .for_object(entity.name()));
        }
        let query = Query::new().filter(
            self.condition(&role.foreign_key, 1),
            entity.primary_key().into_values(),
        );
        self.select(relationship, &query)
    }

    /// Value of an attribute, fetching it if it was not selected.
    pub fn get(&mut self, object: &Object, name: &str) -> Result<Value> {
        let index = object.position(name)?;
        if object.slot(index) != Slot::Lazy {
            return object.get(name);
        }
        if object.state() == ObjectState::Deleted {
            return Err(Error::interface("Object was deleted.").for_object(object.name()));
        }
        self.check_owner(object)?;
        let class = Arc::clone(object.class());
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            name,
            class.table,
            self.condition(&class.primary_key, 1)
        );
        let pk = object.primary_key();
        let rows = self.retry(|tx| tx.run_query(&sql, pk.values()))?;
        let value = rows
            .into_iter()
            .next()
            .and_then(|row| row.get(0).cloned())
            .ok_or_else(|| Error::internal("Object does not exist in database?").for_object(&class.name))?;
        let value = class.attributes[index]
            .coerce(value.clone())
            .unwrap_or(value);
        object.set_slot(index, value.clone());
        object.record_row([(&class.attributes[index].name, &value)]);
        Ok(value)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    fn check_insertable(&self, object: &Object) -> Result<()> {
        Self::check_writable(object)?;
        match (object.state(), object.transaction_id()) {
            (ObjectState::Free, _) => Ok(()),
            (_, Some(id)) if id != self.id => {
                Err(Error::interface("A transaction is already associated.").for_object(object.name()))
            }
            (ObjectState::Associated | ObjectState::Deleted | ObjectState::Orphan, _) => Ok(()),
            _ => Err(Error::interface("Object already exists.").for_object(object.name())),
        }
    }

    /// Insert a free object.
    ///
    /// Entity keys left null are filled from their sequence. Inserting a
    /// relationship increments the reference count of every entity it
    /// refers to.
    #[tracing::instrument(level = "debug", skip(self, object), fields(transaction = %self.name, object = %object.name()))]
    pub fn insert(&mut self, object: &Object) -> Result<()> {
        self.check_insertable(object)?;
        self.retry(|tx| {
            tx.undoable(object, |tx| {
                object.attach(tx.id);
                tx.insert_row(object)?;
                tx.cache.insert(object);
                Ok(())
            })
        })
    }

    /// Delete an object. Deleting an entity deletes every relationship it
    /// plays a role in first.
    #[tracing::instrument(level = "debug", skip(self, object), fields(transaction = %self.name, object = %object.name()))]
    pub fn delete(&mut self, object: &Object) -> Result<()> {
        Self::check_writable(object)?;
        self.check_owner(object)?;
        if !object.state().is_persisted() {
            return Err(Error::interface("Object does not exist.").for_object(object.name()));
        }
        self.retry(|tx| {
            tx.delete_row(object)?;
            tx.cache.delete(object);
            Ok(())
        })
    }

    /// Insert `object`, or combine it into the row that already has its
    /// primary key.
    ///
    /// With an existing row, `func` receives the cached object for that row
    /// and the incoming values; without `func` the existing row is kept.
    /// Returns the object that now represents the row. Merges are recorded
    /// and applied again in order if the transaction is replayed.
    #[tracing::instrument(level = "debug", skip(self, object, func), fields(transaction = %self.name, object = %object.name()))]
    pub fn merge(&mut self, object: &Object, func: Option<MergeFn>, lock: bool) -> Result<Object> {
        if !object.primary_key().is_complete() {
            return Err(Error::interface("Primary key value not provided.").for_object(object.name()));
        }
        self.check_insertable(object)?;
        let merge = PendingMerge {
            func,
            incoming: object.copy(),
        };
        self.retry(|tx| tx.undoable(object, |tx| tx.merge_row(object, &merge, lock)))
    }

    fn merge_row(&mut self, object: &Object, merge: &PendingMerge, lock: bool) -> Result<Object> {
        let class = Arc::clone(object.class());
        let query = self.key_query(&class, object.primary_key().values(), lock)?;
        let existing = self.select(&class.name, &query)?.into_iter().next();
        // Rows this transaction inserted are replayed from their own values.
        let replayed_by_insert = existing
            .as_ref()
            .is_some_and(|e| e.state() == ObjectState::Inserted);
        let target = match existing {
            Some(existing) => {
                if let Some(func) = &merge.func {
                    let snapshot = existing.snapshot();
                    if let Err(err) = func(self, &existing, &merge.incoming) {
                        existing.restore(snapshot);
                        return Err(err);
                    }
                }
                existing
            }
            None => {
                if let Err(err) = self.insert(object) {
                    let database = self.model.database();
                    return Err(if database.is_primary_key_error(&err) {
                        database.serialization_error()
                    } else {
                        err
                    });
                }
                object.clone()
            }
        };
        if !replayed_by_insert {
            target.push_merge(merge.clone());
            target.set_state(ObjectState::Merged);
        }
        Ok(target)
    }

    /// Store a value in the object's slot, running the update hooks.
    /// Returns whether the change must be written to the database.
    fn assign(&mut self, object: &Object, name: &str, value: Value) -> Result<bool> {
        let state = object.state();
        match state {
            ObjectState::Deleted => {
                return Err(Error::interface("Object was deleted.").for_object(object.name()));
            }
            ObjectState::Orphan => {
                return Err(Error::interface("Object's transaction has finished.")
                    .for_object(object.name()));
            }
            _ => {}
        }
        if state.is_attached() {
            self.check_owner(object)?;
        }
        Self::check_writable(object)?;
        let class = Arc::clone(object.class());
        let index = object.position(name)?;
        let attr = &class.attributes[index];
        let value = attr.coerce(value)?;
        let unchanged = match object.slot(index) {
            Slot::Value(current) => current.sql_eq(&value),
            Slot::Unset => attr.default_value().sql_eq(&value),
            Slot::Lazy => false,
        };
        if unchanged {
            return Ok(false);
        }
        if state.is_attached() && class.is_primary_key(name) {
            return Err(Error::interface("Changing value of primary key.").for_object(&class.name));
        }

        let hooks = self.hooks(object);
        if let Some(hooks) = &hooks {
            hooks.pre_update(self, object, name)?;
        }
        object.set_slot(index, value.clone());
        if let Some(hooks) = &hooks {
            hooks.validate_attribute(object, attr, &value)?;
            hooks.post_update(self, object, name)?;
        }
        if state.is_attached() {
            object.mark_dirty(name);
        }
        Ok(state.is_attached())
    }

    fn write_through(&mut self, object: &Object, names: &[String]) -> Result<()> {
        let values = names
            .iter()
            .map(|name| Ok((name.clone(), object.get(name)?)))
            .collect::<Result<Vec<_>>>()?;
        self.retry(|tx| tx.write_values(object, &values))?;
        if object.state() == ObjectState::Selected {
            object.set_state(ObjectState::Updated);
        }
        Ok(())
    }

    /// Set one attribute. Changes to attached objects are written through.
    pub fn set(&mut self, object: &Object, name: &str, value: impl Into<Value>) -> Result<()> {
        if self.assign(object, name, value.into())? {
            self.write_through(object, &[name.to_string()])?;
        }
        Ok(())
    }

    /// Set several attributes with a single write.
    pub fn update(&mut self, object: &Object, values: &BTreeMap<String, Value>) -> Result<()> {
        let mut changed = Vec::new();
        for (name, value) in values {
            if self.assign(object, name, value.clone())? {
                changed.push(name.clone());
            }
        }
        if !changed.is_empty() {
            self.write_through(object, &changed)?;
        }
        Ok(())
    }

    /// Like [`Transaction::update`], but skips names that are not
    /// attributes of the object.
    pub fn pick(&mut self, object: &Object, values: &BTreeMap<String, Value>) -> Result<()> {
        let known: BTreeMap<String, Value> = values
            .iter()
            .filter(|(name, _)| object.class().has_attribute(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        self.update(object, &known)
    }

    /// Set an attribute back to its default.
    pub fn reset(&mut self, object: &Object, name: &str) -> Result<()> {
        let default = object.class().require_attribute(name)?.default_value();
        self.set(object, name, default)
    }

    /// Take a row lock on an object for the rest of the transaction.
    pub fn lock(&mut self, object: &Object) -> Result<()> {
        self.check_owner(object)?;
        if !object.state().is_persisted() {
            return Err(Error::interface("Object does not exist.").for_object(object.name()));
        }
        self.retry(|tx| tx.lock_row(object))
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn count_rows(&mut self, table: &str, columns: &[String], values: &[Value]) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, self.condition(columns, 1));
        let rows = self.run_query(&sql, values)?;
        Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0))
    }

    fn check_not_null(object: &Object) -> Result<()> {
        for attr in &object.class().attributes {
            if attr.nullable || !object.is_loaded(&attr.name) {
                continue;
            }
            if object.get(&attr.name)?.is_null() {
                return Err(Error::integrity(format!(
                    "No value for attribute w/o default: {}",
                    attr.name
                ))
                .for_object(object.name()));
            }
        }
        Ok(())
    }

    fn check_cardinality(&mut self, object: &Object) -> Result<()> {
        let class = Arc::clone(object.class());
        if class.is_entity() {
            if object.state() != ObjectState::Inserted {
                return Ok(());
            }
            let pk = object.primary_key();
            for backref in &class.backrefs {
                let relationship = self.model.object(&backref.relationship)?;
                let count = self.count_rows(&relationship.table, &backref.foreign_key, pk.values())?;
                if !backref.cardinality.contains(count) {
                    return Err(Error::integrity(format!(
                        "Cardinality for role `{}` not in {}",
                        backref.role, backref.cardinality
                    ))
                    .for_object(&class.name));
                }
            }
        } else {
            for role in &class.roles {
                let fk = object.foreign_key(&role.name)?;
                let exists =
                    self.count_rows(&role.referenced_table, &role.referenced_columns, fk.values())?;
                if exists == 0 {
                    continue;
                }
                let count = self.count_rows(&class.table, &role.foreign_key, fk.values())?;
                if !role.cardinality.contains(count) {
                    return Err(Error::integrity(format!(
                        "Cardinality for role `{}` not in {}",
                        role.name, role.cardinality
                    ))
                    .for_object(&class.name));
                }
            }
        }
        Ok(())
    }

    fn validate(&mut self, object: &Object) -> Result<()> {
        let hooks = self.hooks(object);
        let check_cardinality = self.model.options().check_cardinality;
        match object.state() {
            ObjectState::Inserted => {
                Self::check_not_null(object)?;
                if check_cardinality {
                    self.check_cardinality(object)?;
                }
                if let Some(hooks) = &hooks {
                    hooks.validate_insert(self, object)?;
                }
            }
            ObjectState::Merged => {
                Self::check_not_null(object)?;
                if let Some(hooks) = &hooks {
                    hooks.validate_update(self, object)?;
                }
            }
            ObjectState::Updated => {
                if let Some(hooks) = &hooks {
                    hooks.validate_update(self, object)?;
                }
            }
            ObjectState::Deleted => {
                if check_cardinality {
                    self.check_cardinality(object)?;
                }
                if let Some(hooks) = &hooks {
                    hooks.validate_delete(self, object)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Validate every changed object and commit.
    ///
    /// On success inserted, updated and merged objects become selected and
    /// stay usable in the next unit of work. A failed commit leaves the
    /// transaction as it was.
    #[tracing::instrument(level = "debug", skip(self), fields(transaction = %self.name))]
    pub fn commit(&mut self) -> Result<()> {
        self.retry(|tx| {
            for object in tx.cache.values() {
                tx.validate(&object)?;
            }
            tx.connection.commit()
        })?;
        for object in self.cache.iter() {
            match object.state() {
                ObjectState::Inserted | ObjectState::Updated | ObjectState::Merged => {
                    object.finish(ObjectState::Selected);
                }
                state => object.finish(state),
            }
        }
        self.active = false;
        tracing::info!(transaction = %self.name, objects = self.cache.len(), "Committed");
        Ok(())
    }

    /// Roll back. Every cached object is orphaned and the cache emptied.
    #[tracing::instrument(level = "debug", skip(self), fields(transaction = %self.name))]
    pub fn rollback(&mut self) -> Result<()> {
        for object in self.cache.iter() {
            object.finish(ObjectState::Orphan);
        }
        self.cache.clear();
        self.active = false;
        self.connection.rollback()?;
        tracing::info!(transaction = %self.name, "Rolled back");
        Ok(())
    }

    /// Commit or roll back according to the finalization policy.
    pub fn finalize(&mut self) -> Result<()> {
        match self.finalization {
            FinalizationPolicy::Commit => self.commit(),
            FinalizationPolicy::Rollback => self.rollback(),
        }
    }

    // ========================================================================
    // Dump and load
    // ========================================================================

    /// The pending work of this transaction, in replay order.
    ///
    /// Merged objects are left out: their values were computed from rows
    /// that may have changed, and the merge functions cannot be dumped.
    pub fn dump(&self) -> Vec<DumpEntry> {
        self.cache
            .values()
            .into_iter()
            .filter(|o| {
                matches!(
                    o.state(),
                    ObjectState::Inserted
                        | ObjectState::Selected
                        | ObjectState::Updated
                        | ObjectState::Deleted
                )
            })
            .map(|object| DumpEntry {
                object: object.name().to_string(),
                state: object.state(),
                primary_key: object.primary_key().into_values(),
                values: object.copy(),
            })
            .collect()
    }

    pub fn dump_json(&self) -> Result<String> {
        serde_json::to_string(&self.dump()).map_err(|e| Error::Serde(e.to_string()))
    }

    /// Apply a dump to this transaction.
    ///
    /// Existing rows are updated with the dumped values, missing ones
    /// inserted; deleted entries are deleted if their row still exists.
    #[tracing::instrument(level = "debug", skip(self, entries), fields(transaction = %self.name, entries = entries.len()))]
    pub fn load(&mut self, entries: &[DumpEntry]) -> Result<()> {
        for entry in entries {
            let class = self.model.object(&entry.object).map_err(|_| {
                Error::interface(format!("Unknown object {}", entry.object))
            })?;
            let query = self.key_query(&class, &entry.primary_key, false)?;
            let existing = self.select(&class.name, &query)?.into_iter().next();
            match (entry.state, existing) {
                (ObjectState::Deleted, Some(object)) => {
                    if object.state().is_persisted() {
                        self.delete(&object)?;
                    }
                }
                (ObjectState::Deleted, None) => {}
                (_, Some(object)) => self.update(&object, &entry.values)?,
                (_, None) => {
                    let object = Object::new(class);
                    object.update(&entry.values)?;
                    self.insert(&object)?;
                }
            }
        }
        Ok(())
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let entries: Vec<DumpEntry> =
            serde_json::from_str(json).map_err(|e| Error::Serde(e.to_string()))?;
        self.load(&entries)
    }

    /// Translatable strings held by cached objects.
    pub fn extract_messages(&mut self) -> Result<Vec<TranslationMessage>> {
        let objects: Vec<Object> = self
            .cache
            .iter()
            .filter(|o| o.state() != ObjectState::Deleted)
            .cloned()
            .collect();
        let mut messages = Vec::new();
        for object in objects {
            let class = Arc::clone(object.class());
            for attr in class.attributes.iter().filter(|a| a.translate) {
                let value = self.get(&object, &attr.name)?;
                let Some(message) = value.as_str().filter(|s| !s.is_empty()) else {
                    continue;
                };
                messages.push(TranslationMessage {
                    message: message.to_string(),
                    context: attr.translation_context.clone(),
                    name: attr
                        .translate_by_name
                        .then(|| format!("{}.{}", class.name, attr.name)),
                });
            }
        }
        Ok(messages)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.finalize() {
            tracing::warn!(
                transaction = %self.name,
                policy = %self.finalization,
                error = %err,
                "Finalizing dropped transaction failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TransactionOptions;
    use ermodel_core::{Database, Dialect, QueryError, StandardDialect};
    use ermodel_schema::{Cardinality, ModelDef, register_model};
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Recording mock database
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockState {
        log: Vec<String>,
        /// Rows answered to queries containing the key
        responses: Vec<(String, Row)>,
        /// Serialization failures injected into the next UPDATEs
        failing_updates: usize,
        commits: usize,
        rollbacks: usize,
    }

    struct MockConnection {
        state: Arc<Mutex<MockState>>,
    }

    impl Connection for MockConnection {
        fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.log.push(sql.to_string());
            Ok(state
                .responses
                .iter()
                .filter(|(key, _)| sql.contains(key.as_str()))
                .map(|(_, row)| row.clone())
                .collect())
        }

        fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.log.push(sql.to_string());
            if sql.starts_with("UPDATE") && state.failing_updates > 0 {
                state.failing_updates -= 1;
                return Err(Error::Query(QueryError::serialization("conflict")));
            }
            Ok(1)
        }

        fn commit(&mut self) -> Result<()> {
            self.state.lock().expect("lock poisoned").commits += 1;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.state.lock().expect("lock poisoned").rollbacks += 1;
            Ok(())
        }
    }

    struct MockDatabase {
        state: Arc<Mutex<MockState>>,
        dialect: StandardDialect,
    }

    impl Database for MockDatabase {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(MockConnection {
                state: Arc::clone(&self.state),
            }))
        }

        fn dialect(&self) -> &dyn Dialect {
            &self.dialect
        }
    }

    struct Fixture {
        state: Arc<Mutex<MockState>>,
        model: Model,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_options(TransactionOptions::new().max_backoff(0))
        }

        fn with_options(options: TransactionOptions) -> Self {
            let schema = register_model(
                ModelDef::new("wiki")
                    .entity(
                        ObjectClass::entity("page")
                            .attribute(Attribute::primary_key("id"))
                            .attribute(Attribute::string("title").translate(false, Some("wiki")))
                            .attribute(Attribute::integer("hits").default(0))
                            .primary_key(["id"]),
                    )
                    .entity(
                        ObjectClass::entity("tag")
                            .attribute(Attribute::primary_key("id"))
                            .attribute(Attribute::string("label").nullable())
                            .primary_key(["id"]),
                    )
                    .relationship(
                        ObjectClass::relationship("tagged")
                            .role("page", "page", Cardinality::any())
                            .role("tag", "tag", Cardinality::any()),
                    ),
            )
            .unwrap();
            let state = Arc::new(Mutex::new(MockState::default()));
            let database = Arc::new(MockDatabase {
                state: Arc::clone(&state),
                dialect: StandardDialect,
            });
            let model = Model::builder(schema)
                .database(database)
                .options(options)
                .build()
                .unwrap();
            Self { state, model }
        }

        fn respond(&self, key: &str, columns: &[&str], values: Vec<Value>) {
            let row = Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values);
            self.state
                .lock()
                .unwrap()
                .responses
                .push((key.to_string(), row));
        }

        fn log(&self) -> Vec<String> {
            self.state.lock().unwrap().log.clone()
        }

        fn clear_log(&self) {
            self.state.lock().unwrap().log.clear();
        }

        fn page(&self, id: i64, title: &str) -> Object {
            let page = self.model.new_object("page").unwrap();
            page.set("id", id).unwrap();
            page.set("title", title).unwrap();
            page
        }

        fn respond_page(&self, id: i64, title: &str) {
            self.respond(
                "FROM wiki.page",
                &["id", "title", "hits"],
                vec![Value::BigInt(id), Value::from(title), Value::BigInt(0)],
            );
        }
    }

    // ------------------------------------------------------------------
    // Inserting
    // ------------------------------------------------------------------

    #[test]
    fn test_insert_takes_key_from_sequence() {
        let fx = Fixture::new();
        fx.respond("nextval", &["nextval"], vec![Value::BigInt(7)]);
        let mut tx = fx.model.begin().unwrap();
        let page = fx.model.new_object("page").unwrap();
        page.set("title", "Home").unwrap();

        tx.insert(&page).unwrap();

        assert_eq!(page.get("id").unwrap(), Value::BigInt(7));
        assert_eq!(page.state(), ObjectState::Inserted);
        assert_eq!(page.transaction_id(), Some(tx.id()));
        let log = fx.log();
        assert!(log.contains(&"SELECT nextval('wiki.page_id_seq')".to_string()));
        assert!(log.contains(&"INSERT INTO wiki.page (id,title,hits) VALUES ($1,$2,$3)".to_string()));
        assert_eq!(tx.cache().len(), 1);
    }

    #[test]
    fn test_insert_twice_is_rejected() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(1, "Home");
        tx.insert(&page).unwrap();
        let err = tx.insert(&page).unwrap_err();
        assert!(err.is_interface());

        let mut other = fx.model.begin().unwrap();
        let err = other.insert(&page).unwrap_err();
        assert!(err.to_string().contains("A transaction is already associated"));
    }

    #[test]
    fn test_relationship_needs_roles() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let tagged = fx.model.new_object("tagged").unwrap();
        let err = tx.insert(&tagged).unwrap_err();
        assert!(err.is_interface());
        assert!(err.to_string().contains("Role has not been set: page"));
        assert_eq!(tagged.state(), ObjectState::Free);
        assert!(tx.cache().is_empty());
    }

    #[test]
    fn test_relationship_insert_counts_references() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(1, "Home");
        let tag = fx.model.new_object("tag").unwrap();
        tag.set("id", 2).unwrap();
        tx.insert(&page).unwrap();
        tx.insert(&tag).unwrap();
        fx.clear_log();

        let tagged = fx.model.new_object("tagged").unwrap();
        tagged.set_role("page", &page).unwrap();
        tagged.set_role("tag", &tag).unwrap();
        tx.insert(&tagged).unwrap();

        assert_eq!(
            fx.log(),
            vec![
                "INSERT INTO wiki.tagged (page_id,tag_id) VALUES ($1,$2)",
                "UPDATE wiki.page SET _refcount = _refcount + 1 WHERE id=$1",
                "UPDATE wiki.tag SET _refcount = _refcount + 1 WHERE id=$1",
            ]
        );
    }

    // ------------------------------------------------------------------
    // Selecting and writing through
    // ------------------------------------------------------------------

    #[test]
    fn test_select_reuses_cached_instance() {
        let fx = Fixture::new();
        fx.respond_page(1, "Home");
        let mut tx = fx.model.begin().unwrap();
        let first = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        let second = tx.select("page", &Query::new()).unwrap();
        assert_eq!(second.len(), 1);
        assert!(Object::ptr_eq(&first, &second[0]));
        assert_eq!(first.state(), ObjectState::Selected);
    }

    #[test]
    fn test_missing_entity() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let err = tx.entity("page", &[Value::BigInt(9)]).unwrap_err();
        assert!(err.is_interface());
        assert!(err.to_string().contains("Object does not exist"));
    }

    #[test]
    fn test_set_writes_through_once() {
        let fx = Fixture::new();
        fx.respond_page(1, "Home");
        let mut tx = fx.model.begin().unwrap();
        let page = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        fx.clear_log();

        tx.set(&page, "title", "Start").unwrap();
        tx.set(&page, "title", "Start").unwrap();

        assert_eq!(fx.log(), vec!["UPDATE wiki.page SET title=$1 WHERE id=$2"]);
        assert_eq!(page.state(), ObjectState::Updated);
        assert_eq!(page.row_image()["title"], Value::from("Start"));
    }

    #[test]
    fn test_attached_objects_change_through_transaction() {
        let fx = Fixture::new();
        fx.respond_page(1, "Home");
        let mut tx = fx.model.begin().unwrap();
        let page = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        assert!(page.set("title", "x").unwrap_err().is_interface());
        let err = tx.set(&page, "id", 5).unwrap_err();
        assert!(err.to_string().contains("Changing value of primary key"));
    }

    #[test]
    fn test_lazy_attribute_is_fetched() {
        let fx = Fixture::new();
        fx.respond(
            "SELECT wiki.page.id,wiki.page.title FROM",
            &["id", "title"],
            vec![Value::BigInt(1), Value::from("Home")],
        );
        fx.respond("SELECT hits FROM wiki.page", &["hits"], vec![Value::BigInt(12)]);
        let mut tx = fx.model.begin().unwrap();
        let pages = tx.select("page", &Query::new().attrs(["title"])).unwrap();
        let page = &pages[0];
        assert!(!page.is_loaded("hits"));
        assert!(page.get("hits").is_err());

        assert_eq!(tx.get(page, "hits").unwrap(), Value::BigInt(12));
        assert!(page.is_loaded("hits"));
        assert!(fx.log().contains(&"SELECT hits FROM wiki.page WHERE id=$1".to_string()));
    }

    #[test]
    fn test_in_role_checks_entity() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let tag = fx.model.new_object("tag").unwrap();
        tag.set("id", 1).unwrap();
        tx.insert(&tag).unwrap();
        let err = tx.in_role(&tag, "page", "tagged").unwrap_err();
        assert!(err.to_string().contains("Object has no role in relationship"));
        assert!(tx.in_role(&tag, "tag", "tagged").unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    #[test]
    fn test_serialization_failure_is_replayed() {
        let fx = Fixture::new();
        fx.respond_page(1, "Home");
        let mut tx = fx.model.begin().unwrap();
        let page = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        fx.clear_log();
        fx.state.lock().unwrap().failing_updates = 1;

        tx.set(&page, "title", "Start").unwrap();

        assert_eq!(
            fx.log(),
            vec![
                "UPDATE wiki.page SET title=$1 WHERE id=$2",
                "SELECT id,title,hits FROM wiki.page WHERE id=$1",
                "UPDATE wiki.page SET title=$1 WHERE id=$2",
                "UPDATE wiki.page SET title=$1 WHERE id=$2",
            ]
        );
        assert_eq!(fx.state.lock().unwrap().rollbacks, 1);
        assert_eq!(page.get("title").unwrap(), Value::from("Start"));
        assert_eq!(page.state(), ObjectState::Updated);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let fx = Fixture::with_options(TransactionOptions::new().max_attempts(3).max_backoff(0));
        fx.respond_page(1, "Home");
        let mut tx = fx.model.begin().unwrap();
        let page = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        fx.state.lock().unwrap().failing_updates = 100;

        let err = tx.set(&page, "title", "Start").unwrap_err();
        assert!(fx.model.database().is_serialization_error(&err));
        // The first rebuild already fails, the second replay is the last attempt.
        assert_eq!(fx.state.lock().unwrap().rollbacks, 2);
    }

    #[test]
    fn test_nested_retry_defers_to_outermost() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let mut calls = 0;
        let result: Result<()> = tx.retry(|tx| {
            tx.retry(|_| {
                calls += 1;
                Err(Error::Query(QueryError::serialization("conflict")))
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 10);
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    #[test]
    fn test_merge_inserts_missing_row() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(3, "New");
        let merged = tx.merge(&page, None, false).unwrap();
        assert!(Object::ptr_eq(&merged, &page));
        // Still a merge: a replay combines with a row inserted meanwhile
        assert_eq!(page.state(), ObjectState::Merged);
        assert!(fx.log().contains(&"INSERT INTO wiki.page (id,title,hits) VALUES ($1,$2,$3)".to_string()));
        assert!(tx.dump().is_empty());

        tx.commit().unwrap();
        assert_eq!(page.state(), ObjectState::Selected);
    }

    #[test]
    fn test_merge_into_own_insert_is_not_recorded() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(3, "New");
        tx.insert(&page).unwrap();
        fx.respond_page(3, "New");

        let merged = tx.merge(&fx.page(3, "Again"), None, false).unwrap();
        assert!(Object::ptr_eq(&merged, &page));
        assert_eq!(page.state(), ObjectState::Inserted);
    }

    #[test]
    fn test_merge_combines_into_existing_row() {
        let fx = Fixture::new();
        fx.respond_page(3, "Old");
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(3, "New");
        page.set("hits", 5).unwrap();
        let add: MergeFn = Arc::new(
            |tx: &mut Transaction, existing: &Object, incoming: &BTreeMap<String, Value>| {
                let hits = existing.get("hits")?.as_i64().unwrap_or(0)
                    + incoming["hits"].as_i64().unwrap_or(0);
                tx.set(existing, "hits", hits)
            },
        );

        let merged = tx.merge(&page, Some(add), true).unwrap();

        assert!(!Object::ptr_eq(&merged, &page));
        assert_eq!(merged.get("hits").unwrap(), Value::BigInt(5));
        assert_eq!(merged.get("title").unwrap(), Value::from("Old"));
        assert_eq!(merged.state(), ObjectState::Merged);
        assert!(merged.is_locked());
        assert_eq!(page.state(), ObjectState::Free);
    }

    #[test]
    fn test_merge_needs_primary_key() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.model.new_object("page").unwrap();
        let err = tx.merge(&page, None, false).unwrap_err();
        assert!(err.to_string().contains("Primary key value not provided"));
    }

    // ------------------------------------------------------------------
    // Delete, commit and rollback
    // ------------------------------------------------------------------

    #[test]
    fn test_delete_entity_deletes_relationships_first() {
        let fx = Fixture::new();
        fx.respond_page(1, "Home");
        fx.respond(
            "FROM wiki.tagged",
            &["page_id", "tag_id"],
            vec![Value::BigInt(1), Value::BigInt(2)],
        );
        let mut tx = fx.model.begin().unwrap();
        let page = tx.entity("page", &[Value::BigInt(1)]).unwrap();
        fx.clear_log();

        tx.delete(&page).unwrap();

        let log = fx.log();
        assert_eq!(
            &log[1..],
            &[
                "UPDATE wiki.page SET _refcount = _refcount - 1 WHERE id=$1",
                "UPDATE wiki.tag SET _refcount = _refcount - 1 WHERE id=$1",
                "DELETE FROM wiki.tagged WHERE page_id=$1 AND tag_id=$2",
                "DELETE FROM wiki.page WHERE id=$1",
            ]
        );
        assert_eq!(page.state(), ObjectState::Deleted);
        assert!(tx.delete(&page).unwrap_err().is_interface());
    }

    #[test]
    fn test_commit_requires_values() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.model.new_object("page").unwrap();
        page.set("id", 1).unwrap();
        tx.insert(&page).unwrap();

        let err = tx.commit().unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("No value for attribute w/o default: title"));
        assert_eq!(fx.state.lock().unwrap().commits, 0);
        assert_eq!(page.state(), ObjectState::Inserted);
    }

    #[test]
    fn test_commit_and_rollback_states() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let page = fx.page(1, "Home");
        tx.insert(&page).unwrap();
        tx.commit().unwrap();
        assert_eq!(page.state(), ObjectState::Selected);
        assert!(!tx.is_active());

        let other = fx.page(2, "About");
        tx.insert(&other).unwrap();
        tx.rollback().unwrap();
        assert_eq!(page.state(), ObjectState::Orphan);
        assert_eq!(other.state(), ObjectState::Orphan);
        assert!(tx.cache().is_empty());
        let err = tx.set(&page, "title", "x").unwrap_err();
        assert!(err.to_string().contains("transaction has finished"));
    }

    #[test]
    fn test_drop_finalizes_by_policy() {
        let fx = Fixture::new();
        {
            let mut tx = fx.model.begin().unwrap();
            tx.set_finalization_policy("commit").unwrap();
            tx.insert(&fx.page(1, "Home")).unwrap();
        }
        assert_eq!(fx.state.lock().unwrap().commits, 1);

        let mut tx = fx.model.begin().unwrap();
        assert!(tx.set_finalization_policy("abort").is_err());
        assert_eq!(tx.finalization_policy(), FinalizationPolicy::Rollback);
    }

    #[test]
    fn test_hook_failure_restores_object() {
        struct Reject;
        impl ObjectHooks for Reject {
            fn pre_insert(&self, _tx: &mut Transaction, _object: &Object) -> Result<()> {
                Err(Error::integrity("rejected"))
            }
        }
        let fx = Fixture::new();
        let model = Model::builder(Arc::clone(fx.model.model_schema()))
            .database(Arc::clone(fx.model.database()))
            .hooks("page", Reject)
            .build()
            .unwrap();
        let mut tx = model.begin().unwrap();
        let page = fx.page(1, "Home");
        assert!(tx.insert(&page).unwrap_err().is_integrity());
        assert_eq!(page.state(), ObjectState::Free);
        assert!(tx.cache().is_empty());
    }

    // ------------------------------------------------------------------
    // Dump and messages
    // ------------------------------------------------------------------

    #[test]
    fn test_dump_lists_pending_work() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        tx.insert(&fx.page(1, "Home")).unwrap();
        let dump = tx.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].object, "page");
        assert_eq!(dump[0].state, ObjectState::Inserted);
        assert_eq!(dump[0].primary_key, vec![Value::BigInt(1)]);
        assert_eq!(dump[0].values["title"], Value::from("Home"));

        let json = tx.dump_json().unwrap();
        let parsed: Vec<DumpEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, dump);
    }

    #[test]
    fn test_load_rejects_unknown_objects() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        let entry = DumpEntry {
            object: "ghost".to_string(),
            state: ObjectState::Inserted,
            primary_key: vec![Value::BigInt(1)],
            values: BTreeMap::new(),
        };
        let err = tx.load(&[entry]).unwrap_err();
        assert!(err.to_string().contains("Unknown object ghost"));
    }

    #[test]
    fn test_extract_messages() {
        let fx = Fixture::new();
        let mut tx = fx.model.begin().unwrap();
        tx.insert(&fx.page(1, "Home")).unwrap();
        let messages = tx.extract_messages().unwrap();
        assert_eq!(
            messages,
            vec![TranslationMessage {
                message: "Home".to_string(),
                context: Some("wiki".to_string()),
                name: None,
            }]
        );
    }
}
