//! Concurrency properties: strict two-phase locking and deadlock detection
//! under a real two-thread schedule, plus a `Transaction`-level check that a
//! committed transaction's locks are fully released before the next one
//! can proceed.

use std::sync::{Arc, Barrier};
use std::thread;

use lstore_db::config::Config;
use lstore_db::lock::{LockError, LockManager, LockMode};
use lstore_db::table::Table;
use lstore_db::transaction::{Op, Transaction};

#[path = "support/mod.rs"]
mod support;

#[test]
fn two_transactions_opposite_lock_order_exactly_one_deadlocks() {
    support::init_tracing();
    let manager = Arc::new(LockManager::new());
    let barrier = Arc::new(Barrier::new(2));

    let m1 = Arc::clone(&manager);
    let b1 = Arc::clone(&barrier);
    let t1 = thread::spawn(move || {
        m1.acquire(1, "row:a", LockMode::X).unwrap();
        b1.wait();
        let result = m1.acquire(1, "row:b", LockMode::X);
        if result.is_err() {
            m1.release_all(1);
        }
        result
    });

    let m2 = Arc::clone(&manager);
    let b2 = Arc::clone(&barrier);
    let t2 = thread::spawn(move || {
        m2.acquire(2, "row:b", LockMode::X).unwrap();
        b2.wait();
        let result = m2.acquire(2, "row:a", LockMode::X);
        if result.is_err() {
            m2.release_all(2);
        }
        result
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    // Exactly one side detects the cycle and aborts; the other proceeds
    // once the deadlocked side releases its locks.
    assert_ne!(r1.is_ok(), r2.is_ok(), "exactly one transaction should deadlock");
    let failed = if r1.is_err() { r1 } else { r2 };
    assert!(matches!(failed.unwrap_err(), LockError::Deadlock { .. }));

    manager.release_all(1);
    manager.release_all(2);
}

#[test]
fn committed_transaction_fully_releases_before_next_acquires() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_string_lossy().to_string(),
        page_size: 64,
        pages_per_range: 4,
        frames_per_column: 16,
        merge_trigger_pages: 1000,
    };
    let table = Table::create("grades", 3, 0, config).unwrap();
    let lock_manager = Arc::new(LockManager::new());

    let mut first = Transaction::new(1, Arc::clone(&lock_manager));
    first.queue(Op::Insert {
        table: Arc::clone(&table),
        columns: vec![1, 2, 3],
    });
    first.run().unwrap();

    // A second transaction, on its own thread, must be able to take an X
    // lock on the same row: the first transaction's release_all ran to
    // completion before `run()` returned.
    let table2 = Arc::clone(&table);
    let lock_manager2 = Arc::clone(&lock_manager);
    let handle = thread::spawn(move || {
        let mut second = Transaction::new(2, lock_manager2);
        second.queue(Op::Update {
            table: table2,
            key: 1,
            new_columns: vec![None, Some(99), None],
        });
        second.run()
    });

    assert!(handle.join().unwrap().is_ok());
    table.close().unwrap();
}
