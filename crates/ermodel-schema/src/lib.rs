//! Model definition and schema generation for ermodel.
//!
//! This crate provides:
//! - Typed attribute descriptors with value coercion
//! - Entity, relationship and view classes
//! - Model checking and building (`register_model`)
//! - A visitor over models, and SQL generators built on it
//! - `Schema` for creating, dropping, granting and revoking a model

pub mod attribute;
pub mod build;
pub mod check;
pub mod gensql;
pub mod model;
pub mod object;
pub mod schema;
pub mod visit;

pub use attribute::{Attribute, ValueKind};
pub use build::BuildVisitor;
pub use check::CheckVisitor;
pub use gensql::{Principal, SqlBuilder, SqlChecker, SqlDestroyer, SqlGranter, SqlRevoker};
pub use model::{ModelDef, ModelSchema, register_model};
pub use object::{Cardinality, Index, ObjectClass, ObjectKind, Role, RoleRef, column_condition};
pub use schema::Schema;
pub use visit::{ModelVisitor, walk, walk_reversed};
