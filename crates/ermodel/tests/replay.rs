//! Replays after serialization failures, driven step by step on one thread.
//!
//! Each test reads a row in transaction A, commits a change to that row
//! from transaction B, then lets A write it. The write conflicts, A rolls
//! back and every object it cached is replayed before the write runs again.

use ermodel::prelude::*;
use ermodel_testkit::{MemoryDatabase, setup};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Action = Box<dyn FnOnce() + Send>;

/// Runs a queued action the next time a tag is about to be inserted.
#[derive(Clone, Default)]
struct BeforeTagInsert(Arc<Mutex<Option<Action>>>);

impl BeforeTagInsert {
    fn queue(&self, action: impl FnOnce() + Send + 'static) {
        *self.0.lock().unwrap() = Some(Box::new(action));
    }
}

impl ObjectHooks for BeforeTagInsert {
    fn pre_insert(&self, _tx: &mut Transaction, _object: &Object) -> Result<()> {
        let action = self.0.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
        Ok(())
    }
}

fn options() -> TransactionOptions {
    TransactionOptions::new().max_backoff(0)
}

fn wiki(hook: &BeforeTagInsert) -> (Arc<MemoryDatabase>, Model) {
    let (database, model) = setup(options()).unwrap();
    let model = Model::builder(Arc::clone(model.model_schema()))
        .database(Arc::clone(&database) as Arc<dyn Database>)
        .hooks("tag", hook.clone())
        .options(options())
        .build()
        .unwrap();
    (database, model)
}

fn adder() -> MergeFn {
    Arc::new(
        |tx: &mut Transaction, existing: &Object, incoming: &BTreeMap<String, Value>| {
            let total = existing.get("total")?.as_i64().unwrap_or(0)
                + incoming["total"].as_i64().unwrap_or(0);
            tx.set(existing, "total", total)
        },
    )
}

fn counter(model: &Model, name: &str, total: i64) -> Object {
    let counter = model.new_object("counter").unwrap();
    counter.set("name", name).unwrap();
    counter.set("total", total).unwrap();
    counter
}

fn totals(database: &MemoryDatabase) -> Vec<(String, i64)> {
    database
        .rows("wiki.counter")
        .unwrap()
        .iter()
        .map(|row| {
            (
                row.get_by_name("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                row.get_by_name("total").and_then(Value::as_i64).unwrap(),
            )
        })
        .collect()
}

/// Commit `total` into counter `b` from a second transaction.
fn overwrite_b(model: &Model, total: i64) {
    let mut other = model.begin().unwrap();
    let b = other.entity("counter", &[Value::from("b")]).unwrap();
    other.set(&b, "total", total).unwrap();
    other.commit().unwrap();
}

fn seed(model: &Model) {
    let mut tx = model.begin().unwrap();
    tx.insert(&counter(model, "b", 0)).unwrap();
    tx.commit().unwrap();
}

#[test]
fn merged_insert_combines_with_a_row_committed_before_the_replay() {
    let hook = BeforeTagInsert::default();
    let (database, model) = wiki(&hook);
    seed(&model);

    let mut tx = model.begin().unwrap();
    let tag = model.new_object("tag").unwrap();
    tag.set("label", "x").unwrap();
    tx.insert(&tag).unwrap();
    let a = tx.merge(&counter(&model, "a", 1), Some(adder()), false).unwrap();
    assert_eq!(a.state(), ObjectState::Merged);
    let b = tx.entity("counter", &[Value::from("b")]).unwrap();

    overwrite_b(&model, 7);
    // While the replay reinserts the tag, another transaction commits its
    // own merge into `a`. The first replay then fails to insert `a` and
    // the second one merges into the committed row.
    let concurrent = model.clone();
    hook.queue(move || {
        let mut other = concurrent.begin().unwrap();
        other
            .merge(&counter(&concurrent, "a", 10), Some(adder()), false)
            .unwrap();
        other.commit().unwrap();
    });

    tx.set(&b, "total", 5).unwrap();
    assert_eq!(a.state(), ObjectState::Merged);
    assert_eq!(a.get("total").unwrap(), Value::BigInt(11));
    tx.commit().unwrap();

    assert!(database.conflicts() >= 2);
    assert_eq!(
        totals(&database),
        [("a".to_string(), 11), ("b".to_string(), 5)]
    );
    assert_eq!(database.rows("wiki.tag").unwrap().len(), 1);
    assert_eq!(a.state(), ObjectState::Selected);
}

#[test]
fn merged_insert_is_reinserted_when_the_row_is_still_missing() {
    let hook = BeforeTagInsert::default();
    let (database, model) = wiki(&hook);
    seed(&model);

    let mut tx = model.begin().unwrap();
    let a = tx.merge(&counter(&model, "a", 1), Some(adder()), false).unwrap();
    tx.merge(&counter(&model, "a", 2), Some(adder()), false).unwrap();
    assert_eq!(a.get("total").unwrap(), Value::BigInt(3));
    let b = tx.entity("counter", &[Value::from("b")]).unwrap();

    overwrite_b(&model, 7);
    tx.set(&b, "total", 5).unwrap();
    tx.commit().unwrap();

    assert!(database.conflicts() >= 1);
    assert_eq!(
        totals(&database),
        [("a".to_string(), 3), ("b".to_string(), 5)]
    );
}

#[test]
fn deletes_are_replayed_with_their_relationships() {
    let hook = BeforeTagInsert::default();
    let (database, model) = wiki(&hook);
    seed(&model);
    let mut tx = model.begin().unwrap();
    let page = model.new_object("page").unwrap();
    page.set("title", "Home").unwrap();
    tx.insert(&page).unwrap();
    let tag = model.new_object("tag").unwrap();
    tag.set("label", "news").unwrap();
    tx.insert(&tag).unwrap();
    let tagged = model.new_object("tagged").unwrap();
    tagged.set_role("page", &page).unwrap();
    tagged.set_role("tag", &tag).unwrap();
    tx.insert(&tagged).unwrap();
    tx.commit().unwrap();

    let mut tx = model.begin().unwrap();
    let page = tx.entity("page", &[Value::from(1)]).unwrap();
    let b = tx.entity("counter", &[Value::from("b")]).unwrap();
    let tagged = tx.in_role(&page, "page", "tagged").unwrap().remove(0);
    tx.delete(&page).unwrap();

    overwrite_b(&model, 7);
    tx.set(&b, "total", 5).unwrap();
    assert_eq!(tagged.state(), ObjectState::Deleted);
    assert_eq!(page.state(), ObjectState::Deleted);
    tx.commit().unwrap();

    assert!(database.conflicts() >= 1);
    assert!(database.rows("wiki.tagged").unwrap().is_empty());
    assert!(database.rows("wiki.page").unwrap().is_empty());
    let tags = database.rows("wiki.tag").unwrap();
    assert_eq!(tags[0].get_by_name("_refcount"), Some(&Value::BigInt(0)));
    assert_eq!(totals(&database)[0], ("b".to_string(), 5));
}

#[test]
fn loading_a_dump_recreates_relationships() {
    let hook = BeforeTagInsert::default();
    let (database, model) = wiki(&hook);
    let mut tx = model.begin().unwrap();
    let page = model.new_object("page").unwrap();
    page.set("title", "Home").unwrap();
    tx.insert(&page).unwrap();
    let tag = model.new_object("tag").unwrap();
    tag.set("label", "news").unwrap();
    tx.insert(&tag).unwrap();
    tx.commit().unwrap();

    let mut tx = model.begin().unwrap();
    let page = tx.entity("page", &[Value::from(1)]).unwrap();
    let tag = tx.entity("tag", &[Value::from(1)]).unwrap();
    let tagged = model.new_object("tagged").unwrap();
    tagged.set_role("page", &page).unwrap();
    tagged.set_role("tag", &tag).unwrap();
    tx.insert(&tagged).unwrap();
    tx.set(&page, "title", "Start").unwrap();
    let json = tx.dump_json().unwrap();
    tx.rollback().unwrap();
    assert!(database.rows("wiki.tagged").unwrap().is_empty());

    let mut replay = model.begin().unwrap();
    replay.load_json(&json).unwrap();
    replay.commit().unwrap();

    let links = database.rows("wiki.tagged").unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get_by_name("page_id"), Some(&Value::BigInt(1)));
    let pages = database.rows("wiki.page").unwrap();
    assert_eq!(pages[0].get_by_name("title"), Some(&Value::from("Start")));
    assert_eq!(pages[0].get_by_name("_refcount"), Some(&Value::BigInt(1)));
    let tags = database.rows("wiki.tag").unwrap();
    assert_eq!(tags[0].get_by_name("_refcount"), Some(&Value::BigInt(1)));
}

#[test]
fn merges_are_left_out_of_dumps() {
    let hook = BeforeTagInsert::default();
    let (_database, model) = wiki(&hook);
    seed(&model);
    let mut tx = model.begin().unwrap();
    tx.merge(&counter(&model, "b", 4), Some(adder()), false).unwrap();
    tx.merge(&counter(&model, "c", 1), Some(adder()), false).unwrap();
    assert!(tx.dump().is_empty());
}
