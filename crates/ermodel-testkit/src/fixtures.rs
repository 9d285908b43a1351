//! A small wiki model used across the test suites.

use crate::memory::MemoryDatabase;
use ermodel_core::Result;
use ermodel_schema::{Attribute, Cardinality, ModelDef, ObjectClass, register_model};
use ermodel_session::{Model, TransactionOptions};
use std::sync::Arc;

/// Pages, tags, named counters, the `tagged` relationship and a `titles`
/// view.
///
/// A page carries at most two tags when cardinalities are checked.
pub fn wiki_def() -> ModelDef {
    ModelDef::new("wiki")
        .version(1)
        .entity(
            ObjectClass::entity("page")
                .attribute(Attribute::primary_key("id"))
                .attribute(Attribute::string("title").translate(false, Some("wiki")))
                .attribute(Attribute::text("body").nullable())
                .attribute(Attribute::integer("hits").default(0))
                .primary_key(["id"]),
        )
        .entity(
            ObjectClass::entity("tag")
                .attribute(Attribute::primary_key("id"))
                .attribute(Attribute::string("label"))
                .primary_key(["id"]),
        )
        .entity(
            ObjectClass::entity("counter")
                .attribute(Attribute::string("name"))
                .attribute(Attribute::integer("total").default(0))
                .primary_key(["name"]),
        )
        .relationship(
            ObjectClass::relationship("tagged")
                .role("page", "page", Cardinality::new(0, Some(2)))
                .role("tag", "tag", Cardinality::any()),
        )
        .view(ObjectClass::view("titles", "SELECT id,title FROM wiki.page"))
}

/// A fresh memory database with the wiki schema created, and a model
/// bound to it.
pub fn setup(options: TransactionOptions) -> Result<(Arc<MemoryDatabase>, Model)> {
    let database = Arc::new(MemoryDatabase::new());
    let model = Model::builder(register_model(wiki_def())?)
        .database(Arc::clone(&database) as Arc<dyn ermodel_core::Database>)
        .options(options)
        .build()?;
    model.schema().create(true, false)?;
    tracing::debug!(model = %model.name(), "Wiki fixture ready");
    Ok((database, model))
}
