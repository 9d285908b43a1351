//! ermodel - entity/relationship models over SQL databases.
//!
//! ermodel maps a model of entities, relationships and views onto a SQL
//! schema and runs serializable transactions against it:
//!
//! - Declarative models, checked and built into qualified tables, foreign
//!   keys and sequences
//! - SQL generation to create, drop, grant and revoke a model's schema,
//!   through a pluggable dialect
//! - Transactions with an identity cache and write-through objects
//! - Automatic replay of a transaction after a serialization failure
//! - Dump and load of a transaction's pending work
//!
//! # Quick Start
//!
//! ```ignore
//! use ermodel::prelude::*;
//!
//! let def = ModelDef::new("wiki")
//!     .entity(
//!         ObjectClass::entity("page")
//!             .attribute(Attribute::primary_key("id"))
//!             .attribute(Attribute::string("title"))
//!             .primary_key(["id"]),
//!     );
//!
//! let model = Model::builder(register_model(def)?)
//!     .database(database)
//!     .build()?;
//! model.schema().create(true, false)?;
//!
//! let mut tx = model.begin()?;
//! let page = model.new_object("page")?;
//! page.set("title", "Home")?;
//! tx.insert(&page)?;
//!
//! let pages = tx.select("page", &Query::new().filter("title=$1", ["Home"]))?;
//! tx.set(&pages[0], "title", "Start")?;
//! tx.commit()?;
//! ```
//!
//! # Crates
//!
//! - `ermodel-core`: values, rows, errors, dialects and the driver contracts
//! - `ermodel-schema`: model definitions, check and build, SQL generation
//! - `ermodel-session`: objects, the identity cache and transactions

pub use ermodel_core::{
    Connection, Database, Dialect, Error, ErrorClass, IsolationLevel, ModelErrorKind,
    MysqlDialect, PostgresDialect, PrimaryKey, QueryError, QueryErrorKind, Result, Row,
    StandardDialect, Value,
};

pub use ermodel_schema::{
    Attribute, Cardinality, Index, ModelDef, ModelSchema, ObjectClass, ObjectKind, Principal,
    Role, Schema, ValueKind, register_model,
};

pub use ermodel_session::{
    DumpEntry, FinalizationPolicy, JoinKind, JoinPath, MergeFn, Model, ModelBuilder, Object,
    ObjectHooks, ObjectState, Query, Transaction, TransactionOptions, TransactionRef,
    TranslationMessage,
};

/// Everything needed to define a model and work with its transactions.
pub mod prelude {
    pub use crate::{
        // Definition
        Attribute,
        Cardinality,
        // Core
        Database,
        Error,
        Index,
        ModelDef,
        // Transactions
        MergeFn,
        Model,
        Object,
        ObjectClass,
        ObjectHooks,
        ObjectState,
        Query,
        Result,
        Transaction,
        TransactionOptions,
        Value,
        register_model,
    };
}
