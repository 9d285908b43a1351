//! A model bound to a database, and the per-thread transaction registry.

use crate::hooks::ObjectHooks;
use crate::object::Object;
use crate::options::TransactionOptions;
use crate::transaction::Transaction;
use ermodel_core::{Database, Error, Result};
use ermodel_schema::{ModelSchema, ObjectClass, Schema};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared handle to a named transaction of the current thread.
pub type TransactionRef = Rc<RefCell<Transaction>>;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Named transactions, keyed by model id and name.
    static TRANSACTIONS: RefCell<HashMap<(u64, String), TransactionRef>> =
        RefCell::new(HashMap::new());
}

struct ModelInner {
    id: u64,
    schema: Arc<ModelSchema>,
    database: Arc<dyn Database>,
    hooks: HashMap<String, Arc<dyn ObjectHooks>>,
    options: TransactionOptions,
    anonymous: AtomicU64,
}

/// A registered model bound to the database its transactions run on.
///
/// Cheap to clone; clones share the same bindings.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.schema.name())
            .field("dialect", &self.inner.database.dialect().name())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Model`].
pub struct ModelBuilder {
    schema: Arc<ModelSchema>,
    database: Option<Arc<dyn Database>>,
    hooks: HashMap<String, Arc<dyn ObjectHooks>>,
    options: TransactionOptions,
}

impl ModelBuilder {
    /// The database every transaction of the model connects to.
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Lifecycle hooks for the object called `name`.
    pub fn hooks(mut self, name: impl Into<String>, hooks: impl ObjectHooks + 'static) -> Self {
        self.hooks.insert(name.into(), Arc::new(hooks));
        self
    }

    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Model> {
        let database = self.database.ok_or_else(|| {
            Error::definition("no transaction factory").for_object(self.schema.name())
        })?;
        if let Some(name) = self.hooks.keys().find(|name| self.schema.object(name).is_none()) {
            return Err(Error::definition(format!("Hooks for unknown object: {}", name))
                .for_object(self.schema.name()));
        }
        tracing::info!(
            model = %self.schema.name(),
            dialect = database.dialect().name(),
            hooks = self.hooks.len(),
            "Model bound to database"
        );
        Ok(Model {
            inner: Arc::new(ModelInner {
                id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
                schema: self.schema,
                database,
                hooks: self.hooks,
                options: self.options,
                anonymous: AtomicU64::new(0),
            }),
        })
    }
}

impl Model {
    pub fn builder(schema: impl Into<Arc<ModelSchema>>) -> ModelBuilder {
        ModelBuilder {
            schema: schema.into(),
            database: None,
            hooks: HashMap::new(),
            options: TransactionOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.schema.name()
    }

    pub fn model_schema(&self) -> &Arc<ModelSchema> {
        &self.inner.schema
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.inner.database
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.inner.options
    }

    /// Schema operations (create, drop, grant, revoke) for this model.
    pub fn schema(&self) -> Schema {
        Schema::new(
            Arc::clone(&self.inner.schema),
            Arc::clone(&self.inner.database),
        )
    }

    pub(crate) fn hooks_for(&self, name: &str) -> Option<Arc<dyn ObjectHooks>> {
        self.inner.hooks.get(name).cloned()
    }

    pub fn object(&self, name: &str) -> Result<Arc<ObjectClass>> {
        self.inner.schema.require_object(name)
    }

    /// A free object of the class called `name`.
    pub fn new_object(&self, name: &str) -> Result<Object> {
        Ok(Object::new(self.object(name)?))
    }

    /// A new transaction that is not registered anywhere.
    pub fn begin(&self) -> Result<Transaction> {
        let name = self.anonymous_name();
        Transaction::new(self.clone(), name)
    }

    fn anonymous_name(&self) -> String {
        format!("anon/{}", self.inner.anonymous.fetch_add(1, Ordering::Relaxed))
    }

    /// The transaction called `name` on the current thread, created on
    /// first use. Without a name a fresh anonymous transaction is created
    /// and registered.
    pub fn transaction(&self, name: Option<&str>) -> Result<TransactionRef> {
        let name = name.map_or_else(|| self.anonymous_name(), str::to_string);
        let key = (self.inner.id, name);
        if let Some(existing) = TRANSACTIONS.with(|map| map.borrow().get(&key).cloned()) {
            return Ok(existing);
        }
        let transaction = Rc::new(RefCell::new(Transaction::new(self.clone(), key.1.clone())?));
        TRANSACTIONS.with(|map| map.borrow_mut().insert(key, Rc::clone(&transaction)));
        Ok(transaction)
    }

    /// Finalize and forget every registered transaction of this model on
    /// the current thread. All of them are finalized; the first error is
    /// returned.
    pub fn finalize(&self) -> Result<()> {
        let id = self.inner.id;
        let transactions: Vec<TransactionRef> = TRANSACTIONS.with(|map| {
            let mut map = map.borrow_mut();
            let keys: Vec<_> = map.keys().filter(|(model, _)| *model == id).cloned().collect();
            keys.into_iter().filter_map(|key| map.remove(&key)).collect()
        });
        tracing::debug!(model = %self.name(), count = transactions.len(), "Finalizing transactions");
        let mut first_error = None;
        for transaction in transactions {
            let result = match transaction.try_borrow_mut() {
                Ok(mut tx) => tx.finalize(),
                Err(_) => Err(Error::interface("Transaction is in use.")),
            };
            if let Err(err) = result {
                tracing::warn!(model = %self.name(), error = %err, "Finalizing transaction failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
