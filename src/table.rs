use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::{Rid, NUM_HIDDEN_COLUMNS};
use crate::config::Config;
use crate::error::{DbError, Result};
use crate::index::Index;
use crate::merge;
use crate::storage::{BufferPool, PageRange};

enum MergeRequest {
    Range(usize),
    Stop,
}

enum DeallocRequest {
    Base(Rid),
    Stop,
}

/// Owns one table's page ranges, buffer pool and index, and runs the
/// background merge and delete workers against them.
pub struct Table {
    pub name: String,
    pub num_user_columns: usize,
    pub key_column: usize,
    config: Config,
    buffer: Arc<BufferPool>,
    index: Arc<Index>,
    page_ranges: RwLock<Vec<Arc<PageRange>>>,
    next_rid: AtomicU64,
    free_rids: Mutex<Vec<Rid>>,
    merge_tx: Sender<MergeRequest>,
    dealloc_tx: Sender<DeallocRequest>,
    merge_handle: Mutex<Option<JoinHandle<()>>>,
    delete_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Table {
    pub fn create(
        name: impl Into<String>,
        num_user_columns: usize,
        key_column: usize,
        config: Config,
    ) -> Result<Arc<Table>> {
        if key_column >= num_user_columns {
            return Err(DbError::Configuration(format!(
                "key column {key_column} out of range for {num_user_columns} columns"
            )));
        }
        let name = name.into();
        let table_dir: PathBuf = PathBuf::from(&config.data_dir).join(&name);
        std::fs::create_dir_all(&table_dir)?;

        let total_columns = num_user_columns + NUM_HIDDEN_COLUMNS;
        let buffer = Arc::new(BufferPool::new(
            table_dir,
            config.frames_per_column * total_columns,
            config.records_per_page(),
        ));
        let index = Arc::new(Index::new(key_column));

        Ok(Self::spawn(
            name,
            num_user_columns,
            key_column,
            config,
            buffer,
            index,
            Vec::new(),
            0,
            Vec::new(),
        ))
    }

    /// Reconstructs a table from a catalog snapshot (see `database`), with
    /// already-populated page ranges and index.
    pub fn restore(
        name: String,
        num_user_columns: usize,
        key_column: usize,
        config: Config,
        buffer: Arc<BufferPool>,
        index: Arc<Index>,
        page_ranges: Vec<Arc<PageRange>>,
        next_rid: Rid,
        free_rids: Vec<Rid>,
    ) -> Arc<Table> {
        Self::spawn(
            name,
            num_user_columns,
            key_column,
            config,
            buffer,
            index,
            page_ranges,
            next_rid,
            free_rids,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        name: String,
        num_user_columns: usize,
        key_column: usize,
        config: Config,
        buffer: Arc<BufferPool>,
        index: Arc<Index>,
        page_ranges: Vec<Arc<PageRange>>,
        next_rid: Rid,
        free_rids: Vec<Rid>,
    ) -> Arc<Table> {
        let (merge_tx, merge_rx) = unbounded();
        let (dealloc_tx, dealloc_rx) = unbounded();

        let table = Arc::new(Table {
            name,
            num_user_columns,
            key_column,
            config,
            buffer,
            index,
            page_ranges: RwLock::new(page_ranges),
            next_rid: AtomicU64::new(next_rid),
            free_rids: Mutex::new(free_rids),
            merge_tx,
            dealloc_tx,
            merge_handle: Mutex::new(None),
            delete_handle: Mutex::new(None),
        });

        let merge_handle = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.run_merge_worker(merge_rx))
        };
        let delete_handle = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.run_delete_worker(dealloc_rx))
        };
        *table.merge_handle.lock() = Some(merge_handle);
        *table.delete_handle.lock() = Some(delete_handle);

        table
    }

    fn run_merge_worker(&self, rx: Receiver<MergeRequest>) {
        while let Ok(request) = rx.recv() {
            match request {
                MergeRequest::Range(idx) => {
                    let page_range = match self.page_ranges.read().get(idx).cloned() {
                        Some(pr) => pr,
                        None => continue,
                    };
                    let start_rid = (idx * self.config.records_per_range()) as Rid;
                    let end_rid = self.next_rid.load(Ordering::SeqCst).min(
                        start_rid + self.config.records_per_range() as Rid,
                    );
                    debug!(page_range = idx, start_rid, end_rid, "merge cycle starting");
                    if let Err(e) =
                        merge::consolidate_range(&page_range, self.num_user_columns, start_rid, end_rid)
                    {
                        warn!(page_range = idx, error = %e, "merge cycle failed");
                    } else {
                        info!(page_range = idx, "merge cycle complete");
                    }
                }
                MergeRequest::Stop => break,
            }
        }
    }

    fn run_delete_worker(&self, rx: Receiver<DeallocRequest>) {
        while let Ok(request) = rx.recv() {
            match request {
                DeallocRequest::Base(rid) => {
                    if let Err(e) = self.reclaim(rid) {
                        warn!(rid, error = %e, "delete worker failed to reclaim record");
                    }
                }
                DeallocRequest::Stop => break,
            }
        }
    }

    fn reclaim(&self, rid: Rid) -> Result<()> {
        let page_range = self.page_range_for_rid(rid);
        let (_, page_in_range, slot) = self.locate_base(rid);
        let local_rid = page_range.normalize(rid);
        let indirection =
            page_range.read_base_column(page_in_range, slot, crate::common::INDIRECTION_COLUMN)? as Rid;

        let mut current = indirection;
        while !page_range.is_base_rid(current) {
            let next = page_range.read_tail_hidden(current, crate::common::INDIRECTION_COLUMN)? as Rid;
            page_range.free_logical_rid(current);
            current = next;
        }
        let _ = local_rid;
        self.free_rids.lock().push(rid);
        Ok(())
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn buffer(&self) -> &Arc<BufferPool> {
        &self.buffer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn allocate_rid(&self) -> Rid {
        if let Some(rid) = self.free_rids.lock().pop() {
            return rid;
        }
        self.next_rid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_rid(&self) -> Rid {
        self.next_rid.load(Ordering::SeqCst)
    }

    pub fn free_rids_snapshot(&self) -> Vec<Rid> {
        self.free_rids.lock().clone()
    }

    /// Every allocated base rid not currently on the free list, in
    /// ascending order. Used to rebuild a secondary index from a scan.
    pub fn live_rids(&self) -> Vec<Rid> {
        let free: std::collections::HashSet<Rid> = self.free_rids.lock().iter().copied().collect();
        (0..self.next_rid()).filter(|r| !free.contains(r)).collect()
    }

    /// `(page_range_index, page_in_range, slot)` for a table-global base rid.
    pub fn locate_base(&self, rid: Rid) -> (usize, usize, usize) {
        let records_per_range = self.config.records_per_range();
        let records_per_page = self.config.records_per_page();
        let page_range = (rid as usize) / records_per_range;
        let offset_in_range = (rid as usize) % records_per_range;
        let page_in_range = offset_in_range / records_per_page;
        let slot = rid as usize % records_per_page;
        (page_range, page_in_range, slot)
    }

    pub fn page_ranges_snapshot(&self) -> Vec<Arc<PageRange>> {
        self.page_ranges.read().clone()
    }

    pub fn page_range_for_rid(&self, rid: Rid) -> Arc<PageRange> {
        let (idx, _, _) = self.locate_base(rid);
        self.ensure_page_range(idx)
    }

    pub fn page_range(&self, idx: usize) -> Option<Arc<PageRange>> {
        self.page_ranges.read().get(idx).cloned()
    }

    fn ensure_page_range(&self, idx: usize) -> Arc<PageRange> {
        {
            let ranges = self.page_ranges.read();
            if let Some(pr) = ranges.get(idx) {
                return Arc::clone(pr);
            }
        }
        let mut ranges = self.page_ranges.write();
        while ranges.len() <= idx {
            let new_index = ranges.len();
            ranges.push(Arc::new(PageRange::new(
                new_index,
                self.num_user_columns,
                self.config.records_per_page(),
                self.config.pages_per_range,
                Arc::clone(&self.buffer),
            )));
        }
        Arc::clone(&ranges[idx])
    }

    /// Writes a full base record at `rid`'s derived location. Callers
    /// (the query engine) allocate the rid themselves via `allocate_rid`,
    /// stamp it into `columns[RID_COLUMN]`, and own duplicate-key checking
    /// and index maintenance, so a rejected insert never reaches storage.
    pub fn write_base_record(&self, rid: Rid, columns: Vec<i32>) -> Result<()> {
        let (range_idx, page_in_range, slot) = self.locate_base(rid);
        let page_range = self.ensure_page_range(range_idx);
        let local_rid = page_range.normalize(rid);
        page_range.write_base(page_in_range, slot, local_rid, columns)
    }

    /// Appends a tail record for `rid`'s owning page range, assigning a
    /// fresh logical rid, and triggers a merge if the page range's TPS has
    /// crossed the configured threshold.
    pub fn apply_tail(
        &self,
        rid: Rid,
        mut hidden: [i32; NUM_HIDDEN_COLUMNS],
        user: &[Option<i32>],
    ) -> Result<Rid> {
        let page_range = self.page_range_for_rid(rid);
        let (range_idx, _, _) = self.locate_base(rid);
        let logical_rid = page_range.assign_logical_rid();
        hidden[crate::common::TIMESTAMP_COLUMN] = page_range.tps() as i32;
        page_range.write_tail(logical_rid, hidden, user)?;

        let trigger = (self.config.merge_trigger_pages * self.config.records_per_page()) as u64;
        if trigger > 0 && page_range.tps() % trigger == 0 {
            let _ = self.merge_tx.send(MergeRequest::Range(range_idx));
        }
        Ok(logical_rid)
    }

    /// Marks a base record deleted, queuing its physical reclamation on the
    /// delete worker. Returns immediately; the rid is not reusable until
    /// the worker runs.
    pub fn enqueue_deletion(&self, rid: Rid) {
        let _ = self.dealloc_tx.send(DeallocRequest::Base(rid));
    }

    /// Flushes all dirty pages and stops the background workers. Further
    /// use of the table after `close()` is a programming error.
    pub fn close(&self) -> Result<()> {
        let _ = self.merge_tx.send(MergeRequest::Stop);
        let _ = self.dealloc_tx.send(DeallocRequest::Stop);
        if let Some(handle) = self.merge_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.delete_handle.lock().take() {
            let _ = handle.join();
        }
        self.buffer.flush_all()
    }
}
