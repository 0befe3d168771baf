//! A thin dispatcher that runs a batch of queued transactions to completion
//! on its own thread, collecting a committed/aborted tally. It holds no
//! storage or locking logic of its own — everything interesting happens
//! inside `Transaction::run`.

use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::error;

use crate::transaction::Transaction;

/// Outcome of running one queued transaction.
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    Committed,
    Aborted(String),
}

/// Collects a batch of transactions and runs them sequentially on a single
/// background thread. Multiple workers can run concurrently against the
/// same `Database`/`LockManager`; each worker is just a queue plus a thread.
pub struct TransactionWorker {
    pending: Mutex<Vec<Transaction>>,
    stats: Mutex<Vec<TransactionOutcome>>,
    handle: Mutex<Option<JoinHandle<Vec<TransactionOutcome>>>>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn add_transaction(&self, transaction: Transaction) {
        self.pending.lock().push(transaction);
    }

    /// Spawns the worker thread over whatever transactions are currently
    /// queued. Further `add_transaction` calls after this have no effect on
    /// the in-flight run.
    pub fn run(&self) {
        let transactions = std::mem::take(&mut *self.pending.lock());
        let handle = std::thread::spawn(move || {
            let mut results = Vec::with_capacity(transactions.len());
            for transaction in transactions {
                let id = transaction.id;
                match transaction.run() {
                    Ok(_) => results.push(TransactionOutcome::Committed),
                    Err(e) => {
                        error!(transaction = id, error = %e, "transaction aborted");
                        results.push(TransactionOutcome::Aborted(e.to_string()));
                    }
                }
            }
            results
        });
        *self.handle.lock() = Some(handle);
    }

    /// Blocks until the worker thread finishes, returning the number of
    /// transactions that committed.
    pub fn join(&self) -> usize {
        if let Some(handle) = self.handle.lock().take() {
            let results = handle.join().unwrap_or_default();
            let committed = results
                .iter()
                .filter(|r| matches!(r, TransactionOutcome::Committed))
                .count();
            *self.stats.lock() = results;
            committed
        } else {
            0
        }
    }

    pub fn stats(&self) -> Vec<TransactionOutcome> {
        self.stats.lock().clone()
    }
}

impl Default for TransactionWorker {
    fn default() -> Self {
        Self::new()
    }
}
