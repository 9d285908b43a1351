//! Test support for ermodel.
//!
//! - [`MemoryDatabase`]: a snapshot-isolated database in process memory
//!   that understands the SQL the engine and the schema generator emit,
//!   and reports write conflicts as serialization failures
//! - [`fixtures`]: a ready-made wiki model bound to a fresh memory database
//!
//! ```ignore
//! let (database, model) = fixtures::setup(TransactionOptions::default())?;
//! let mut tx = model.begin()?;
//! ```

pub mod fixtures;
pub mod memory;
mod sql;

pub use fixtures::{setup, wiki_def};
pub use memory::{MemoryConnection, MemoryDatabase};
