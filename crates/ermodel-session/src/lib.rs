//! Objects, identity cache and replayable transactions for ermodel.
//!
//! `ermodel-session` is the **unit-of-work layer**. It binds a registered
//! model to a database and runs transactions against it.
//!
//! # Role In The Architecture
//!
//! - **Objects**: shared handles to one row, keeping desired values apart
//!   from the last known row image.
//! - **Identity cache**: one in-memory instance per row and transaction.
//! - **Write-through**: every change of an attached object is written at
//!   once; commit only validates and commits.
//! - **Replay**: serialization failures roll back, rebuild every cached
//!   object on a fresh SQL transaction and run the failed operation again.
//!
//! # Example
//!
//! ```ignore
//! let model = Model::builder(register_model(def)?)
//!     .database(database)
//!     .build()?;
//!
//! let mut tx = model.begin()?;
//! let page = model.new_object("page")?;
//! page.set("title", "Home")?;
//! tx.insert(&page)?;
//!
//! let hits = tx.entity("page", &[Value::from(1)])?.get("hits")?;
//! tx.commit()?;
//! ```

pub mod cache;
pub mod hooks;
pub mod model;
pub mod object;
pub mod options;
pub mod query;
pub mod rebuild;
pub mod state;
pub mod transaction;

pub use cache::ObjectCache;
pub use hooks::ObjectHooks;
pub use model::{Model, ModelBuilder, TransactionRef};
pub use object::{MergeFn, Object};
pub use options::{FinalizationPolicy, TransactionOptions};
pub use query::{JoinKind, JoinPath, Query};
pub use rebuild::{RebuildAction, plan_rebuild};
pub use state::ObjectState;
pub use transaction::{DumpEntry, TranslationMessage, Transaction};
