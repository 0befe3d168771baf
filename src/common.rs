//! Shared identifiers and constants for the hidden-column record layout.

/// A base or logical record identifier. Base RIDs are dense from 0; logical
/// (tail) RIDs begin at `MAX_RECORDS_PER_RANGE` and are scoped to one page range.
pub type Rid = u64;
pub type TransactionId = u64;
pub type PageRangeIndex = usize;
pub type ColumnIndex = usize;

/// Index of the INDIRECTION hidden column: logical RID of the newest tail
/// version, or the base RID itself when unmodified.
pub const INDIRECTION_COLUMN: usize = 0;
/// Index of the RID hidden column.
pub const RID_COLUMN: usize = 1;
/// Index of the TIMESTAMP hidden column, snapshotted from the page range's TPS.
pub const TIMESTAMP_COLUMN: usize = 2;
/// Index of the UPDATE_TIMESTAMP hidden column, set by the merge worker.
pub const UPDATE_TIMESTAMP_COLUMN: usize = 3;
/// Index of the SCHEMA_ENCODING hidden column: bitmap of updated user columns.
pub const SCHEMA_ENCODING_COLUMN: usize = 4;

pub const NUM_HIDDEN_COLUMNS: usize = 5;

/// Sentinel written to a user or hidden column to mark the owning base
/// record deleted (not used for tail/column payload values).
pub const DELETION_FLAG: i32 = -1;
/// Sentinel meaning "no value written" (e.g. UPDATE_TIMESTAMP before the
/// first merge).
pub const NONE_VALUE: i32 = -2;
