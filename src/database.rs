//! The thin external-collaborator surface: opening/closing a database
//! directory, creating and dropping tables, and persisting just enough
//! catalog metadata that a reopen can pick up where the last session left
//! off. None of this is core engineering — it exists so the storage and
//! transaction core has somewhere to live on disk between runs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::Rid;
use crate::config::Config;
use crate::error::{DbError, Result};
use crate::index::Index;
use crate::lock::LockManager;
use crate::query;
use crate::storage::page_range::PageRangeSnapshot;
use crate::storage::{BufferPool, PageRange};
use crate::table::Table;

const CATALOG_FILE: &str = "tables.json";

#[derive(Debug, Serialize, Deserialize)]
struct CatalogEntry {
    name: String,
    num_user_columns: usize,
    key_column: usize,
    next_rid: Rid,
    free_rids: Vec<Rid>,
    /// Secondary-indexed columns, rebuilt by scan on open.
    indexed_columns: Vec<usize>,
    page_ranges: Vec<PageRangeSnapshot>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Catalog {
    tables: Vec<CatalogEntry>,
}

/// One open database directory. Owns every table's resources and the lock
/// manager transactions share.
pub struct Database {
    config: Config,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    lock_manager: Arc<LockManager>,
}

impl Database {
    /// Opens (creating if absent) the database directory named by
    /// `config.data_dir`, restoring any tables recorded in its catalog.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let catalog_path = PathBuf::from(&config.data_dir).join(CATALOG_FILE);

        let mut tables = HashMap::new();
        if catalog_path.exists() {
            let bytes = fs::read(&catalog_path)?;
            let catalog: Catalog = serde_json::from_slice(&bytes)?;
            for entry in catalog.tables {
                let table = Self::restore_table(&config, entry)?;
                tables.insert(table.name.clone(), table);
            }
        }

        info!(data_dir = %config.data_dir, tables = tables.len(), "database opened");
        Ok(Self {
            config,
            tables: RwLock::new(tables),
            lock_manager: Arc::new(LockManager::new()),
        })
    }

    fn restore_table(config: &Config, entry: CatalogEntry) -> Result<Arc<Table>> {
        let table_dir = PathBuf::from(&config.data_dir).join(&entry.name);
        let total_columns = entry.num_user_columns + crate::common::NUM_HIDDEN_COLUMNS;
        let buffer = Arc::new(BufferPool::new(
            table_dir,
            config.frames_per_column * total_columns,
            config.records_per_page(),
        ));

        let page_ranges: Vec<Arc<PageRange>> = entry
            .page_ranges
            .into_iter()
            .map(|snapshot| {
                Arc::new(PageRange::from_snapshot(
                    snapshot,
                    entry.num_user_columns,
                    config.records_per_page(),
                    config.pages_per_range,
                    Arc::clone(&buffer),
                ))
            })
            .collect();

        let index = Arc::new(Index::new(entry.key_column));
        let table = Table::restore(
            entry.name,
            entry.num_user_columns,
            entry.key_column,
            config.clone(),
            buffer,
            Arc::clone(&index),
            page_ranges,
            entry.next_rid,
            entry.free_rids,
        );

        // Primary key index and every previously created secondary index
        // are rebuilt by scanning live records, matching how a fresh
        // `create_index` call builds one (see `index::Index::create_index`).
        rebuild_index(&table)?;
        for column in entry.indexed_columns {
            if column != table.key_column {
                let values: Result<Vec<(Rid, i32)>> = table
                    .live_rids()
                    .into_iter()
                    .map(|rid| query::resolve_all_columns(&table, rid).map(|r| (rid, r.columns[column])))
                    .collect();
                index.create_index(column, values?)?;
            }
        }

        Ok(table)
    }

    pub fn create_table(&self, name: impl Into<String>, num_user_columns: usize, key_column: usize) -> Result<Arc<Table>> {
        let name = name.into();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(DbError::TableAlreadyExists(name));
        }
        let table = Table::create(name.clone(), num_user_columns, key_column, self.config.clone())?;
        tables.insert(name, Arc::clone(&table));
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        table.close()?;
        std::fs::remove_dir_all(PathBuf::from(&self.config.data_dir).join(name)).ok();
        Ok(())
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Flushes and stops every table's workers, then writes the catalog.
    pub fn close(self) -> Result<()> {
        let tables = self.tables.into_inner();
        let mut entries = Vec::with_capacity(tables.len());
        for (name, table) in &tables {
            table.close()?;
            entries.push(CatalogEntry {
                name: name.clone(),
                num_user_columns: table.num_user_columns,
                key_column: table.key_column,
                next_rid: table.next_rid(),
                free_rids: table.free_rids_snapshot(),
                indexed_columns: Vec::new(),
                page_ranges: table
                    .page_ranges_snapshot()
                    .iter()
                    .map(|pr| pr.snapshot())
                    .collect(),
            });
        }
        let catalog = Catalog { tables: entries };
        let catalog_path = PathBuf::from(&self.config.data_dir).join(CATALOG_FILE);
        fs::write(catalog_path, serde_json::to_vec_pretty(&catalog)?)?;
        Ok(())
    }
}

fn rebuild_index(table: &Arc<Table>) -> Result<()> {
    // The primary index always exists on `Index::new`; this just repopulates
    // it from the page ranges a fresh `Table::restore` was handed, using the
    // same user-columns-only layout `query::insert` indexes with.
    for rid in table.live_rids() {
        let record = query::resolve_all_columns(table, rid)?;
        table.index().insert_all(rid, &record.columns)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_string_lossy().to_string(),
            page_size: 32,
            pages_per_range: 2,
            frames_per_column: 8,
            merge_trigger_pages: 1000,
        }
    }

    #[test]
    fn create_then_reopen_preserves_rows() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let db = Database::open(config.clone()).unwrap();
            let table = db.create_table("grades", 3, 0).unwrap();
            query::insert(&table, &[1, 2, 3]).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(config).unwrap();
        let table = db.get_table("grades").unwrap();
        let rows = query::select(&table, 1, 0, &[true, true, true]).unwrap();
        assert_eq!(rows[0].columns, vec![1, 2, 3]);
        table.close().unwrap();
    }

    #[test]
    fn create_table_twice_fails() {
        let dir = tempdir().unwrap();
        let db = Database::open(test_config(dir.path())).unwrap();
        db.create_table("grades", 3, 0).unwrap();
        assert!(db.create_table("grades", 3, 0).is_err());
    }
}
