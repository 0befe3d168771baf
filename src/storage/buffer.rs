use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{DbError, Result};
use crate::storage::page::Page;

/// Identifies one page file: `(page_range, column, page_in_range)`.
pub type PageKey = (usize, usize, usize);

struct Frame {
    key: Option<PageKey>,
    page: Option<Page>,
    dirty: bool,
    pin_count: usize,
}

impl Frame {
    fn empty() -> Self {
        Self {
            key: None,
            page: None,
            dirty: false,
            pin_count: 0,
        }
    }
}

/// LRU victim selection over frames with a zero pin count. Mirrors a plain
/// most-recently-used stack: `unpin` pushes to the front, `victim` pops from
/// the back, `pin` removes a key from consideration while it's in use.
struct LruReplacer {
    order: Vec<PageKey>,
}

impl LruReplacer {
    fn new() -> Self {
        Self { order: Vec::new() }
    }

    fn victim(&mut self) -> Option<PageKey> {
        self.order.pop()
    }

    fn pin(&mut self, key: PageKey) {
        self.order.retain(|&k| k != key);
    }

    fn unpin(&mut self, key: PageKey) {
        if !self.order.contains(&key) {
            self.order.insert(0, key);
        }
    }
}

/// Handle to a pinned page. Callers must `unpin` exactly once per
/// `get_or_load`/`read_slot`/`write_slot`/`append_slot` call.
pub struct PinnedFrame {
    pub key: PageKey,
}

/// Maps `(page_range, column, page_in_range)` to a bounded set of in-memory
/// frames, backed by one file per page under `<table_dir>/PageRange_<n>/Page_<c>_<p>.bin`.
///
/// The page table is sharded (`DashMap`) rather than a single locked
/// `HashMap`: every `read_slot`/`write_slot` call looks a key up here first,
/// so a global lock would serialize unrelated columns and page ranges
/// against each other for no reason.
pub struct BufferPool {
    table_dir: PathBuf,
    records_per_page: usize,
    frames: RwLock<Vec<Frame>>,
    page_table: DashMap<PageKey, usize>,
    free_list: Mutex<Vec<usize>>,
    replacer: Mutex<LruReplacer>,
}

impl BufferPool {
    pub fn new(table_dir: impl Into<PathBuf>, capacity: usize, records_per_page: usize) -> Self {
        let frames = (0..capacity).map(|_| Frame::empty()).collect();
        Self {
            table_dir: table_dir.into(),
            records_per_page,
            frames: RwLock::new(frames),
            page_table: DashMap::new(),
            free_list: Mutex::new((0..capacity).collect()),
            replacer: Mutex::new(LruReplacer::new()),
        }
    }

    fn path_for(&self, key: PageKey) -> PathBuf {
        let (page_range, column, page_in_range) = key;
        self.table_dir
            .join(format!("PageRange_{page_range}"))
            .join(format!("Page_{column}_{page_in_range}.bin"))
    }

    fn frame_id_for(&self, key: PageKey) -> Option<usize> {
        self.page_table.get(&key).map(|entry| *entry)
    }

    /// Pins and returns the frame index holding `key`, loading or creating
    /// the page if it is not already resident.
    fn pin_frame(&self, key: PageKey) -> Result<usize> {
        if let Some(frame_id) = self.frame_id_for(key) {
            let mut frames = self.frames.write();
            frames[frame_id].pin_count += 1;
            self.replacer.lock().pin(key);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame_slot(key)?;

        let path = self.path_for(key);
        let page = if path.exists() {
            let bytes = fs::read(&path)?;
            Page::from_serialized(self.records_per_page, &bytes)?
        } else {
            Page::new(self.records_per_page)
        };

        let mut frames = self.frames.write();
        frames[frame_id] = Frame {
            key: Some(key),
            page: Some(page),
            dirty: !path.exists(),
            pin_count: 1,
        };
        drop(frames);

        self.page_table.insert(key, frame_id);
        self.replacer.lock().pin(key);
        Ok(frame_id)
    }

    fn acquire_frame_slot(&self, incoming: PageKey) -> Result<usize> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let victim = self
            .replacer
            .lock()
            .victim()
            .ok_or(DbError::NoFrameAvailable)?;
        let frame_id = self
            .page_table
            .remove(&victim)
            .map(|(_, frame_id)| frame_id)
            .ok_or_else(|| DbError::Storage("victim key missing from page table".to_string()))?;

        self.flush_frame(frame_id)?;
        let _ = incoming;
        Ok(frame_id)
    }

    fn flush_frame(&self, frame_id: usize) -> Result<()> {
        let mut frames = self.frames.write();
        let frame = &mut frames[frame_id];
        if frame.dirty {
            if let (Some(key), Some(page)) = (frame.key, frame.page.as_ref()) {
                let path = self.path_for(key);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, page.to_serialized()?)?;
            }
            frame.dirty = false;
        }
        Ok(())
    }

    pub fn unpin(&self, key: PageKey) {
        let frame_id = match self.frame_id_for(key) {
            Some(id) => id,
            None => return,
        };
        let mut frames = self.frames.write();
        if frames[frame_id].pin_count > 0 {
            frames[frame_id].pin_count -= 1;
        }
        if frames[frame_id].pin_count == 0 {
            self.replacer.lock().unpin(key);
        }
    }

    pub fn has_capacity(&self, key: PageKey) -> Result<bool> {
        let frame_id = self.pin_frame(key)?;
        let has_capacity = self.frames.read()[frame_id]
            .page
            .as_ref()
            .expect("pinned frame always holds a page")
            .has_capacity();
        self.unpin(key);
        Ok(has_capacity)
    }

    pub fn read_slot(&self, key: PageKey, slot: usize) -> Result<i32> {
        let frame_id = self.pin_frame(key)?;
        let value = self.frames.read()[frame_id]
            .page
            .as_ref()
            .expect("pinned frame always holds a page")
            .read(slot);
        self.unpin(key);
        value
    }

    pub fn write_slot(&self, key: PageKey, slot: usize, value: i32) -> Result<()> {
        let frame_id = self.pin_frame(key)?;
        {
            let mut frames = self.frames.write();
            let frame = &mut frames[frame_id];
            frame
                .page
                .as_mut()
                .expect("pinned frame always holds a page")
                .write_at(slot, value)?;
            frame.dirty = true;
        }
        self.unpin(key);
        Ok(())
    }

    pub fn append_slot(&self, key: PageKey, value: i32) -> Result<usize> {
        let frame_id = self.pin_frame(key)?;
        let slot = {
            let mut frames = self.frames.write();
            let frame = &mut frames[frame_id];
            let slot = frame
                .page
                .as_mut()
                .expect("pinned frame always holds a page")
                .append(value)?;
            frame.dirty = true;
            slot
        };
        self.unpin(key);
        Ok(slot)
    }

    /// Writes every dirty frame to disk. Called on table/database close.
    pub fn flush_all(&self) -> Result<()> {
        let frame_ids: Vec<usize> = self.page_table.iter().map(|entry| *entry.value()).collect();
        for frame_id in frame_ids {
            self.flush_frame(frame_id)?;
        }
        Ok(())
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_same_slot() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path(), 4, 16);
        let key = (0, 0, 0);
        pool.write_slot(key, 3, 77).unwrap();
        assert_eq!(pool.read_slot(key, 3).unwrap(), 77);
    }

    #[test]
    fn append_advances_slot() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path(), 4, 16);
        let key = (0, 1, 0);
        let s0 = pool.append_slot(key, 1).unwrap();
        let s1 = pool.append_slot(key, 2).unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
    }

    #[test]
    fn eviction_persists_dirty_pages_across_pool_pressure() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path(), 1, 16);
        pool.write_slot((0, 0, 0), 0, 111).unwrap();
        // Forces eviction of the only frame since capacity is 1.
        pool.write_slot((0, 0, 1), 0, 222).unwrap();
        assert_eq!(pool.read_slot((0, 0, 0), 0).unwrap(), 111);
        assert_eq!(pool.read_slot((0, 0, 1), 0).unwrap(), 222);
    }

    #[test]
    fn flush_all_writes_every_dirty_frame() {
        let dir = tempdir().unwrap();
        let pool = BufferPool::new(dir.path(), 4, 16);
        pool.write_slot((0, 0, 0), 0, 5).unwrap();
        pool.flush_all().unwrap();
        assert!(pool.path_for((0, 0, 0)).exists());
    }
}
