//! Conflicting transactions on separate threads.

use ermodel::prelude::*;
use ermodel_testkit::setup;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn options() -> TransactionOptions {
    TransactionOptions::new().max_backoff(20).max_attempts(100)
}

#[test]
fn concurrent_updates_replay_and_last_writer_wins() {
    let (database, model) = setup(options()).unwrap();
    let mut tx = model.begin().unwrap();
    let page = model.new_object("page").unwrap();
    page.set("title", "Home").unwrap();
    tx.insert(&page).unwrap();
    tx.commit().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let first = {
        let model = model.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut tx = model.begin().unwrap();
            let page = tx.entity("page", &[Value::from(1)]).unwrap();
            tx.set(&page, "title", "first").unwrap();
            barrier.wait();
            thread::sleep(Duration::from_millis(50));
            tx.commit().unwrap();
        })
    };
    let second = {
        let model = model.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut tx = model.begin().unwrap();
            let page = tx.entity("page", &[Value::from(1)]).unwrap();
            barrier.wait();
            // Conflicts with the first writer and is replayed until it commits
            tx.set(&page, "hits", 5).unwrap();
            tx.set(&page, "title", "second").unwrap();
            tx.commit().unwrap();
        })
    };
    first.join().unwrap();
    second.join().unwrap();

    assert!(database.conflicts() > 0);
    let rows = database.rows("wiki.page").unwrap();
    assert_eq!(rows[0].get_by_name("title"), Some(&Value::from("second")));
    assert_eq!(rows[0].get_by_name("hits"), Some(&Value::BigInt(5)));
}

#[test]
fn concurrent_merges_accumulate() {
    const THREADS: i64 = 4;
    const ROUNDS: i64 = 5;

    let (database, model) = setup(options()).unwrap();
    let add: MergeFn = Arc::new(
        |tx: &mut Transaction, existing: &Object, incoming: &BTreeMap<String, Value>| {
            let total = existing.get("total")?.as_i64().unwrap_or(0)
                + incoming["total"].as_i64().unwrap_or(0);
            tx.set(existing, "total", total)
        },
    );

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let model = model.clone();
            let add = Arc::clone(&add);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let mut tx = model.begin().unwrap();
                    let counter = model.new_object("counter").unwrap();
                    counter.set("name", "visits").unwrap();
                    counter.set("total", 1).unwrap();
                    tx.merge(&counter, Some(Arc::clone(&add)), false).unwrap();
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let rows = database.rows("wiki.counter").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get_by_name("total"),
        Some(&Value::BigInt(THREADS * ROUNDS))
    );
}
