/// Tunables for one open `Database`. Threaded down to every `Table` and its
/// `BufferPool` at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding the catalog file and one subdirectory per table.
    pub data_dir: String,
    /// Bytes per page. Must be a multiple of 4 (one `i32` per slot).
    pub page_size: usize,
    /// Base pages per page range.
    pub pages_per_range: usize,
    /// Buffer pool frames held per column. Total pool capacity is
    /// `frames_per_column * (num_user_columns + NUM_HIDDEN_COLUMNS)`.
    pub frames_per_column: usize,
    /// Number of page-worth of tail writes (in units of `records_per_page`)
    /// between merge triggers for a page range.
    pub merge_trigger_pages: usize,
}

impl Config {
    pub fn records_per_page(&self) -> usize {
        self.page_size / 4
    }

    pub fn records_per_range(&self) -> usize {
        self.records_per_page() * self.pages_per_range
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            page_size: 4096,
            pages_per_range: 32,
            frames_per_column: 64,
            merge_trigger_pages: 64,
        }
    }
}
