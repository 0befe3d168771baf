use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::common::{Rid, TransactionId};
use crate::error::DbError;
use crate::lock::{LockManager, LockMode};
use crate::query;
use crate::table::Table;

use super::error::TransactionError;

/// One queued operation. `select` is included alongside the write
/// operations because it still needs its row-level `S` lock acquired up
/// front like everything else.
pub enum Op {
    Insert {
        table: Arc<Table>,
        columns: Vec<i32>,
    },
    Select {
        table: Arc<Table>,
        key: i32,
        projection: Vec<bool>,
    },
    Update {
        table: Arc<Table>,
        key: i32,
        new_columns: Vec<Option<i32>>,
    },
    Delete {
        table: Arc<Table>,
        key: i32,
    },
    Increment {
        table: Arc<Table>,
        key: i32,
        column: usize,
    },
}

impl Op {
    fn table(&self) -> &Arc<Table> {
        match self {
            Op::Insert { table, .. }
            | Op::Select { table, .. }
            | Op::Update { table, .. }
            | Op::Delete { table, .. }
            | Op::Increment { table, .. } => table,
        }
    }

    fn row_resource(&self) -> String {
        match self {
            Op::Insert { table, columns } => {
                format!("{}:row:{}", table.name, columns[table.key_column])
            }
            Op::Select { table, key, .. }
            | Op::Update { table, key, .. }
            | Op::Delete { table, key, .. }
            | Op::Increment { table, key, .. } => format!("{}:row:{key}", table.name),
        }
    }

    fn row_mode(&self) -> LockMode {
        match self {
            Op::Select { .. } => LockMode::S,
            _ => LockMode::X,
        }
    }
}

fn strongest_row_mode(a: LockMode, b: LockMode) -> LockMode {
    if matches!(a, LockMode::X) || matches!(b, LockMode::X) {
        LockMode::X
    } else {
        LockMode::S
    }
}

fn strongest_table_mode(a: LockMode, b: LockMode) -> LockMode {
    if matches!(a, LockMode::IX) || matches!(b, LockMode::IX) {
        LockMode::IX
    } else {
        LockMode::IS
    }
}

#[derive(Debug, Clone)]
pub enum OpResult {
    Inserted(Rid),
    Selected(Vec<query::Record>),
    Updated(Rid),
    Deleted(Rid),
    Incremented(Rid),
}

enum UndoEntry {
    Insert {
        table: Arc<Table>,
        key: i32,
    },
    Update {
        table: Arc<Table>,
        key: i32,
        previous_columns: Vec<i32>,
    },
    /// Re-inserts the row's prior values on abort. The row comes back with
    /// a freshly allocated rid rather than its original one — an
    /// acknowledged simplification of the undo-by-inverse-operation
    /// approach, since rid reuse for an in-flight delete isn't revocable
    /// once the delete worker may have already run.
    Delete {
        table: Arc<Table>,
        columns: Vec<i32>,
    },
}

/// Pre-scans every queued operation to compute the strongest lock mode each
/// table and row resource will need, acquires each resource exactly once at
/// that mode, then executes the operations in order. Runs to completion or
/// aborts on the first failure, and always releases every lock it holds
/// exactly once, on commit or on abort.
pub struct Transaction {
    pub id: TransactionId,
    lock_manager: Arc<LockManager>,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new(id: TransactionId, lock_manager: Arc<LockManager>) -> Self {
        Self {
            id,
            lock_manager,
            ops: Vec::new(),
        }
    }

    pub fn queue(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Acquires every lock the queued operations will need, executes them
    /// in order, and commits. On the first failure, undoes every operation
    /// already applied (in reverse) and releases all locks before
    /// returning the error.
    pub fn run(mut self) -> Result<Vec<OpResult>, TransactionError> {
        let ops = std::mem::take(&mut self.ops);

        // Pre-scan: the strongest mode each resource needs across every
        // queued op, so each table/row is locked exactly once instead of
        // acquired once per op and left to escalate mid-execution.
        let mut table_modes: BTreeMap<String, LockMode> = BTreeMap::new();
        let mut row_modes: BTreeMap<String, LockMode> = BTreeMap::new();
        for op in &ops {
            let table_resource = format!("table:{}", op.table().name);
            let table_mode = if matches!(op.row_mode(), LockMode::S) {
                LockMode::IS
            } else {
                LockMode::IX
            };
            table_modes
                .entry(table_resource)
                .and_modify(|m| *m = strongest_table_mode(*m, table_mode))
                .or_insert(table_mode);
            row_modes
                .entry(op.row_resource())
                .and_modify(|m| *m = strongest_row_mode(*m, op.row_mode()))
                .or_insert(op.row_mode());
        }
        for (resource, mode) in table_modes {
            self.lock_manager.acquire(self.id, resource, mode)?;
        }
        for (resource, mode) in row_modes {
            self.lock_manager.acquire(self.id, resource, mode)?;
        }

        let mut results = Vec::with_capacity(ops.len());
        let mut undo_log: Vec<UndoEntry> = Vec::new();

        for op in ops {
            match self.execute(op) {
                Ok((result, undo)) => {
                    results.push(result);
                    if let Some(entry) = undo {
                        undo_log.push(entry);
                    }
                }
                Err(e) => {
                    warn!(transaction = self.id, error = %e, "operation failed, aborting");
                    self.unwind(undo_log);
                    self.lock_manager.release_all(self.id);
                    return Err(TransactionError::Aborted(self.id, e.to_string()));
                }
            }
        }

        self.lock_manager.release_all(self.id);
        info!(transaction = self.id, "committed");
        Ok(results)
    }

    fn execute(&self, op: Op) -> Result<(OpResult, Option<UndoEntry>), DbError> {
        match op {
            Op::Insert { table, columns } => {
                let key = columns[table.key_column];
                let rid = query::insert(&table, &columns)?;
                Ok((OpResult::Inserted(rid), Some(UndoEntry::Insert { table, key })))
            }
            Op::Select { table, key, projection } => {
                let rows = query::select(&table, key, table.key_column, &projection)?;
                Ok((OpResult::Selected(rows), None))
            }
            Op::Update { table, key, new_columns } => {
                let outcome = query::update(&table, key, &new_columns)?;
                Ok((
                    OpResult::Updated(outcome.rid),
                    Some(UndoEntry::Update {
                        table,
                        key,
                        previous_columns: outcome.previous_columns,
                    }),
                ))
            }
            Op::Delete { table, key } => {
                let projection = vec![true; table.num_user_columns];
                let rows = query::select(&table, key, table.key_column, &projection)?;
                let columns = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| DbError::NotFound(key.to_string()))?
                    .columns;
                let rid = query::delete(&table, key)?;
                Ok((OpResult::Deleted(rid), Some(UndoEntry::Delete { table, columns })))
            }
            Op::Increment { table, key, column } => {
                let outcome = query::increment(&table, key, column)?;
                Ok((
                    OpResult::Incremented(outcome.rid),
                    Some(UndoEntry::Update {
                        table,
                        key,
                        previous_columns: outcome.previous_columns,
                    }),
                ))
            }
        }
    }

    fn unwind(&self, undo_log: Vec<UndoEntry>) {
        for entry in undo_log.into_iter().rev() {
            let outcome = match entry {
                UndoEntry::Insert { table, key } => query::delete(&table, key).map(|_| ()),
                UndoEntry::Update {
                    table,
                    key,
                    previous_columns,
                } => {
                    let restore: Vec<Option<i32>> = previous_columns.into_iter().map(Some).collect();
                    query::update(&table, key, &restore).map(|_| ())
                }
                UndoEntry::Delete { table, columns } => query::insert(&table, &columns).map(|_| ()),
            };
            if let Err(e) = outcome {
                warn!(transaction = self.id, error = %e, "undo step failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn test_table(dir: &std::path::Path) -> Arc<Table> {
        let config = Config {
            data_dir: dir.to_string_lossy().to_string(),
            page_size: 32,
            pages_per_range: 2,
            frames_per_column: 8,
            merge_trigger_pages: 1000,
        };
        Table::create("grades", 3, 0, config).unwrap()
    }

    #[test]
    fn committed_transaction_releases_locks() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        let lock_manager = Arc::new(LockManager::new());

        let mut txn = Transaction::new(1, Arc::clone(&lock_manager));
        txn.queue(Op::Insert {
            table: Arc::clone(&table),
            columns: vec![1, 2, 3],
        });
        let results = txn.run().unwrap();
        assert!(matches!(results[0], OpResult::Inserted(_)));

        // A second transaction can now freely take an X lock on the same row.
        let mut txn2 = Transaction::new(2, Arc::clone(&lock_manager));
        txn2.queue(Op::Update {
            table: Arc::clone(&table),
            key: 1,
            new_columns: vec![None, Some(99), None],
        });
        assert!(txn2.run().is_ok());
        table.close().unwrap();
    }

    #[test]
    fn aborted_insert_is_undone() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        let lock_manager = Arc::new(LockManager::new());

        let mut txn = Transaction::new(1, Arc::clone(&lock_manager));
        txn.queue(Op::Insert {
            table: Arc::clone(&table),
            columns: vec![1, 2, 3],
        });
        txn.queue(Op::Insert {
            table: Arc::clone(&table),
            columns: vec![1, 9, 9], // duplicate key -> this op fails
        });
        assert!(txn.run().is_err());

        let rows = query::select(&table, 1, 0, &[true, true, true]).unwrap();
        assert!(rows.is_empty(), "insert must have been undone on abort");
        table.close().unwrap();
    }
}
