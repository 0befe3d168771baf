use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::{Rid, INDIRECTION_COLUMN, NUM_HIDDEN_COLUMNS};
use crate::error::Result;
use crate::storage::buffer::BufferPool;

/// One contiguous block of base RIDs and the base/tail pages that back them.
///
/// Base pages occupy `page_in_range` `0..pages_per_range`; tail pages for
/// user column `i` occupy `pages_per_range..` and grow independently per
/// column, since a tail record only materializes the columns it updates.
pub struct PageRange {
    index: usize,
    num_user_columns: usize,
    total_columns: usize,
    records_per_page: usize,
    records_per_range: usize,
    pages_per_range: usize,
    buffer: Arc<BufferPool>,
    state: Mutex<PageRangeState>,
}

struct PageRangeState {
    /// Next tail page-in-range to append into, per user column.
    tail_page_index: Vec<usize>,
    /// logical_rid -> per-user-column absolute slot (`page_in_range * records_per_page + slot`).
    logical_directory: HashMap<Rid, Vec<Option<usize>>>,
    logical_rid_counter: Rid,
    free_logical_rids: Vec<Rid>,
    tps: u64,
}

/// Serializable snapshot of a page range's bookkeeping state, persisted as
/// part of the table catalog (see `database::CatalogEntry`).
#[derive(Debug, Serialize, Deserialize)]
pub struct PageRangeSnapshot {
    pub index: usize,
    pub tail_page_index: Vec<usize>,
    pub logical_directory: HashMap<Rid, Vec<Option<usize>>>,
    pub logical_rid_counter: Rid,
    pub free_logical_rids: Vec<Rid>,
    pub tps: u64,
}

impl PageRange {
    pub fn new(
        index: usize,
        num_user_columns: usize,
        records_per_page: usize,
        pages_per_range: usize,
        buffer: Arc<BufferPool>,
    ) -> Self {
        let total_columns = num_user_columns + NUM_HIDDEN_COLUMNS;
        let records_per_range = records_per_page * pages_per_range;
        Self {
            index,
            num_user_columns,
            total_columns,
            records_per_page,
            records_per_range,
            pages_per_range,
            buffer,
            state: Mutex::new(PageRangeState {
                tail_page_index: vec![pages_per_range; num_user_columns],
                logical_directory: HashMap::new(),
                logical_rid_counter: records_per_range as Rid,
                free_logical_rids: Vec::new(),
                tps: 0,
            }),
        }
    }

    pub fn from_snapshot(
        snapshot: PageRangeSnapshot,
        num_user_columns: usize,
        records_per_page: usize,
        pages_per_range: usize,
        buffer: Arc<BufferPool>,
    ) -> Self {
        let total_columns = num_user_columns + NUM_HIDDEN_COLUMNS;
        let records_per_range = records_per_page * pages_per_range;
        Self {
            index: snapshot.index,
            num_user_columns,
            total_columns,
            records_per_page,
            records_per_range,
            pages_per_range,
            buffer,
            state: Mutex::new(PageRangeState {
                tail_page_index: snapshot.tail_page_index,
                logical_directory: snapshot.logical_directory,
                logical_rid_counter: snapshot.logical_rid_counter,
                free_logical_rids: snapshot.free_logical_rids,
                tps: snapshot.tps,
            }),
        }
    }

    pub fn snapshot(&self) -> PageRangeSnapshot {
        let st = self.state.lock();
        PageRangeSnapshot {
            index: self.index,
            tail_page_index: st.tail_page_index.clone(),
            logical_directory: st.logical_directory.clone(),
            logical_rid_counter: st.logical_rid_counter,
            free_logical_rids: st.free_logical_rids.clone(),
            tps: st.tps,
        }
    }

    pub fn tps(&self) -> u64 {
        self.state.lock().tps
    }

    /// True for any rid that names a base record rather than a tail record
    /// (including a base record's self-pointing INDIRECTION value).
    pub fn is_base_rid(&self, local_rid: Rid) -> bool {
        local_rid < self.records_per_range as Rid
    }

    /// Normalizes a table-global base rid into this range's local addressing
    /// space, used for the INDIRECTION self-pointer and chain comparisons.
    pub fn normalize(&self, global_rid: Rid) -> Rid {
        global_rid % self.records_per_range as Rid
    }

    fn hidden_location(&self, logical_rid: Rid) -> (usize, usize) {
        let offset = (logical_rid - self.records_per_range as Rid) as usize;
        (
            self.pages_per_range + offset / self.records_per_page,
            offset % self.records_per_page,
        )
    }

    /// Writes a full base record (hidden + user columns) at the given
    /// physical position. `columns[INDIRECTION_COLUMN]` is overwritten with
    /// `local_rid` so callers don't need to special-case the self-pointer.
    pub fn write_base(
        &self,
        page_in_range: usize,
        slot: usize,
        local_rid: Rid,
        mut columns: Vec<i32>,
    ) -> Result<()> {
        columns[INDIRECTION_COLUMN] = local_rid as i32;
        for (col, value) in columns.into_iter().enumerate() {
            self.buffer
                .write_slot((self.index, col, page_in_range), slot, value)?;
        }
        self.state.lock().tps += 1;
        Ok(())
    }

    /// Writes a full base record for the merge worker: same layout as
    /// `write_base` but leaves `columns[INDIRECTION_COLUMN]` exactly as
    /// given. Consolidation never changes which tail record is newest, so
    /// unlike an insert it must not reset the base record to self-point —
    /// doing so would sever the tail chain a reader's version walk still
    /// depends on.
    pub fn write_base_for_merge(&self, page_in_range: usize, slot: usize, columns: Vec<i32>) -> Result<()> {
        for (col, value) in columns.into_iter().enumerate() {
            self.buffer
                .write_slot((self.index, col, page_in_range), slot, value)?;
        }
        self.state.lock().tps += 1;
        Ok(())
    }

    pub fn read_base_column(&self, page_in_range: usize, slot: usize, column: usize) -> Result<i32> {
        self.buffer.read_slot((self.index, column, page_in_range), slot)
    }

    pub fn read_base_record(&self, page_in_range: usize, slot: usize) -> Result<Vec<i32>> {
        (0..self.total_columns)
            .map(|col| self.read_base_column(page_in_range, slot, col))
            .collect()
    }

    pub fn write_base_column(
        &self,
        page_in_range: usize,
        slot: usize,
        column: usize,
        value: i32,
    ) -> Result<()> {
        self.buffer
            .write_slot((self.index, column, page_in_range), slot, value)
    }

    pub fn assign_logical_rid(&self) -> Rid {
        let mut st = self.state.lock();
        if let Some(rid) = st.free_logical_rids.pop() {
            rid
        } else {
            let rid = st.logical_rid_counter;
            st.logical_rid_counter += 1;
            rid
        }
    }

    /// Returns a logical rid's directory-tracked user-column slots to the
    /// reuse queue; called by the delete worker once a row's whole chain is
    /// unreachable.
    pub fn free_logical_rid(&self, logical_rid: Rid) {
        let mut st = self.state.lock();
        st.logical_directory.remove(&logical_rid);
        st.free_logical_rids.push(logical_rid);
    }

    /// Appends a tail record. `hidden` must be fully populated; `user[i] ==
    /// None` means column `i` was not touched by this update and is left
    /// unmaterialized (not merely zero).
    pub fn write_tail(
        &self,
        logical_rid: Rid,
        hidden: [i32; NUM_HIDDEN_COLUMNS],
        user: &[Option<i32>],
    ) -> Result<()> {
        let (hidden_page, hidden_slot) = self.hidden_location(logical_rid);
        for (col, value) in hidden.into_iter().enumerate() {
            self.buffer
                .write_slot((self.index, col, hidden_page), hidden_slot, value)?;
        }

        let mut st = self.state.lock();
        let mut absolute_slots: Vec<Option<usize>> = vec![None; self.num_user_columns];
        for (i, value) in user.iter().enumerate() {
            if let Some(v) = value {
                let col = NUM_HIDDEN_COLUMNS + i;
                let page_in_range = st.tail_page_index[i];
                if !self.buffer.has_capacity((self.index, col, page_in_range))? {
                    st.tail_page_index[i] += 1;
                }
                let page_in_range = st.tail_page_index[i];
                let slot = self.buffer.append_slot((self.index, col, page_in_range), *v)?;
                absolute_slots[i] = Some(page_in_range * self.records_per_page + slot);
            }
        }
        st.logical_directory.insert(logical_rid, absolute_slots);
        st.tps += 1;
        Ok(())
    }

    pub fn read_tail_hidden(&self, logical_rid: Rid, column: usize) -> Result<i32> {
        let (page_in_range, slot) = self.hidden_location(logical_rid);
        self.buffer.read_slot((self.index, column, page_in_range), slot)
    }

    /// Overwrites just the INDIRECTION column of an already-written tail
    /// record. Used by the merge worker to splice its idempotency copy in
    /// as the new oldest tail record.
    pub fn write_tail_indirection(&self, logical_rid: Rid, new_indirection: i32) -> Result<()> {
        let (page_in_range, slot) = self.hidden_location(logical_rid);
        self.buffer
            .write_slot((self.index, INDIRECTION_COLUMN, page_in_range), slot, new_indirection)
    }

    /// `(page_in_range, slot)` for a rid already local to this range (as
    /// returned by `normalize`).
    pub fn base_position(&self, local_rid: Rid) -> (usize, usize) {
        let local = local_rid as usize;
        (local / self.records_per_page, local % self.records_per_page)
    }

    /// Reads a tail record's value for user column `i`, or `None` if that
    /// tail never materialized the column.
    pub fn read_tail_user_column(&self, logical_rid: Rid, user_col: usize) -> Result<Option<i32>> {
        let absolute_slot = {
            let st = self.state.lock();
            match st.logical_directory.get(&logical_rid) {
                Some(slots) => slots[user_col],
                None => return Ok(None),
            }
        };
        match absolute_slot {
            Some(abs) => {
                let page_in_range = abs / self.records_per_page;
                let slot = abs % self.records_per_page;
                let col = NUM_HIDDEN_COLUMNS + user_col;
                Ok(Some(
                    self.buffer.read_slot((self.index, col, page_in_range), slot)?,
                ))
            }
            None => Ok(None),
        }
    }

    /// Follows INDIRECTION from `start` (a logical rid, typically the base
    /// record's current INDIRECTION value) down to the oldest tail record —
    /// the one whose own INDIRECTION points back to the base. Returns
    /// `None` if `start` already names the base record (no tail chain).
    pub fn find_last_logical_rid(&self, start: Rid) -> Result<Option<Rid>> {
        if self.is_base_rid(start) {
            return Ok(None);
        }
        let mut current = start;
        loop {
            let next = self.read_tail_hidden(current, INDIRECTION_COLUMN)? as Rid;
            if self.is_base_rid(next) {
                return Ok(Some(current));
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_range(num_user_columns: usize) -> PageRange {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(BufferPool::new(dir.path(), 64, 8));
        PageRange::new(0, num_user_columns, 8, 4, buffer)
    }

    #[test]
    fn base_record_self_points_when_unmodified() {
        let range = test_range(3);
        let columns = vec![0, 0, 0, -2, 0, 10, 20, 30];
        range.write_base(0, 0, 0, columns).unwrap();
        let indirection = range.read_base_column(0, 0, INDIRECTION_COLUMN).unwrap();
        assert_eq!(indirection, 0);
    }

    #[test]
    fn tail_write_skips_untouched_columns() {
        let range = test_range(3);
        let base_cols = vec![0, 0, 0, -2, 0, 1, 2, 3];
        range.write_base(0, 0, 0, base_cols).unwrap();

        let logical_rid = range.assign_logical_rid();
        assert!(!range.is_base_rid(logical_rid));
        let hidden = [0, 1, 1, -2, 0b010];
        range.write_tail(logical_rid, hidden, &[None, Some(99), None]).unwrap();

        assert_eq!(range.read_tail_user_column(logical_rid, 1).unwrap(), Some(99));
        assert_eq!(range.read_tail_user_column(logical_rid, 0).unwrap(), None);
    }

    #[test]
    fn find_last_logical_rid_walks_chain_to_base() {
        let range = test_range(1);
        range.write_base(0, 0, 0, vec![0, 0, 0, -2, 0, 5]).unwrap();

        let first = range.assign_logical_rid();
        range.write_tail(first, [0, 0, 1, -2, 0b1], &[Some(6)]).unwrap();

        let second = range.assign_logical_rid();
        range.write_tail(second, [first as i32, 0, 2, -2, 0b1], &[Some(7)]).unwrap();

        // "last" means the oldest tail record, the one adjacent to base —
        // used by the merge worker to splice in its idempotency copy.
        let last = range.find_last_logical_rid(second).unwrap();
        assert_eq!(last, Some(first));
    }
}
