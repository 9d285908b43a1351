//! Per-object lifecycle hooks.

use crate::object::Object;
use crate::transaction::Transaction;
use ermodel_core::{Result, Value};
use ermodel_schema::Attribute;

/// Callbacks fired around the writes of one object class.
///
/// Register an implementation per object name with
/// [`ModelBuilder::hooks`](crate::ModelBuilder::hooks). Every method
/// defaults to doing nothing. Returning an error aborts the operation; the
/// `validate_*` hooks run at commit time and abort the commit.
///
/// A typical `pre_insert` enforces a uniqueness rule the table cannot:
///
/// ```ignore
/// fn pre_insert(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
///     let query = Query::new().filter("hash=$1", [object.get("hash")?]);
///     if tx.count("message", &query)? > 0 {
///         return Err(Error::integrity("duplicate message"));
///     }
///     Ok(())
/// }
/// ```
#[allow(unused_variables)]
pub trait ObjectHooks: Send + Sync {
    fn pre_insert(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    fn post_insert(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    fn pre_update(&self, tx: &mut Transaction, object: &Object, attribute: &str) -> Result<()> {
        Ok(())
    }

    fn post_update(&self, tx: &mut Transaction, object: &Object, attribute: &str) -> Result<()> {
        Ok(())
    }

    fn pre_delete(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    fn post_delete(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    /// Commit-time check of an object inserted in the transaction.
    fn validate_insert(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    /// Commit-time check of an object updated or merged in the transaction.
    fn validate_update(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    /// Commit-time check of an object deleted in the transaction.
    fn validate_delete(&self, tx: &mut Transaction, object: &Object) -> Result<()> {
        Ok(())
    }

    /// Check a coerced value before it is stored in `attribute`.
    fn validate_attribute(&self, object: &Object, attribute: &Attribute, value: &Value) -> Result<()> {
        Ok(())
    }
}
