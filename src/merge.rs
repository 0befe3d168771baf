//! Background consolidation of a page range's tail chains into its base
//! columns. Runs on the table's dedicated merge thread (see `table::Table`);
//! never blocks a reader, since readers always resolve values by walking
//! the chain themselves rather than taking a lock this worker holds.

use chrono::Utc;

use crate::common::{
    Rid, INDIRECTION_COLUMN, NONE_VALUE, NUM_HIDDEN_COLUMNS, SCHEMA_ENCODING_COLUMN,
    TIMESTAMP_COLUMN, UPDATE_TIMESTAMP_COLUMN,
};
use crate::error::Result;
use crate::storage::PageRange;

/// Consolidates every base record in `[start_rid, end_rid)` of `page_range`.
pub fn consolidate_range(
    page_range: &PageRange,
    num_user_columns: usize,
    start_rid: Rid,
    end_rid: Rid,
) -> Result<()> {
    for rid in start_rid..end_rid {
        consolidate_one(page_range, num_user_columns, rid)?;
    }
    Ok(())
}

fn consolidate_one(page_range: &PageRange, num_user_columns: usize, rid: Rid) -> Result<()> {
    let local_rid = page_range.normalize(rid);
    let (page_in_range, slot) = page_range.base_position(local_rid);
    let mut columns = page_range.read_base_record(page_in_range, slot)?;

    let schema = columns[SCHEMA_ENCODING_COLUMN];
    let indirection = columns[INDIRECTION_COLUMN] as Rid;
    let mut update_ts = columns[UPDATE_TIMESTAMP_COLUMN];

    if update_ts == NONE_VALUE {
        update_ts = splice_idempotency_copy(page_range, num_user_columns, local_rid, indirection, &columns)?;
        columns[UPDATE_TIMESTAMP_COLUMN] = update_ts;
    }

    if schema != 0 {
        apply_stable_tail_values(page_range, num_user_columns, indirection, update_ts, schema, &mut columns)?;
    }

    columns[UPDATE_TIMESTAMP_COLUMN] = Utc::now().timestamp() as i32;
    page_range.write_base_for_merge(page_in_range, slot, columns)
}

/// First merge of a record: copies its current base columns into the tail
/// chain as a new oldest tail record, rewiring the previous oldest tail's
/// INDIRECTION to point at the copy. This anchors future merges at
/// timestamp 0 without ever losing a value a reader might still be mid-walk
/// toward. Returns the update-timestamp to use for this merge (0).
fn splice_idempotency_copy(
    page_range: &PageRange,
    num_user_columns: usize,
    local_rid: Rid,
    indirection: Rid,
    base_columns: &[i32],
) -> Result<i32> {
    if let Some(oldest_tail) = page_range.find_last_logical_rid(indirection)? {
        let copy_rid = page_range.assign_logical_rid();
        let hidden = [
            local_rid as i32, // points back to base: marks this copy as the new oldest tail
            base_columns[crate::common::RID_COLUMN],
            base_columns[TIMESTAMP_COLUMN],
            NONE_VALUE,
            base_columns[SCHEMA_ENCODING_COLUMN],
        ];
        let user_values: Vec<Option<i32>> = base_columns[NUM_HIDDEN_COLUMNS..NUM_HIDDEN_COLUMNS + num_user_columns]
            .iter()
            .map(|v| Some(*v))
            .collect();
        page_range.write_tail(copy_rid, hidden, &user_values)?;
        page_range.write_tail_indirection(oldest_tail, copy_rid as i32)?;
    }
    Ok(0)
}

/// Walks the tail chain from `indirection` toward base, pulling the newest
/// value for each column still marked dirty in `schema` into `columns`,
/// stopping once every dirty bit has been satisfied or the chain reaches a
/// record no newer than `update_ts`.
fn apply_stable_tail_values(
    page_range: &PageRange,
    num_user_columns: usize,
    indirection: Rid,
    update_ts: i32,
    schema: i32,
    columns: &mut [i32],
) -> Result<()> {
    let mut remaining = schema;
    let mut current = indirection;
    while !page_range.is_base_rid(current) && remaining != 0 {
        let tail_ts = page_range.read_tail_hidden(current, TIMESTAMP_COLUMN)?;
        if tail_ts <= update_ts {
            break;
        }
        let tail_schema = page_range.read_tail_hidden(current, SCHEMA_ENCODING_COLUMN)?;
        for i in 0..num_user_columns {
            let bit = 1 << i;
            if remaining & bit != 0 && tail_schema & bit != 0 {
                if let Some(value) = page_range.read_tail_user_column(current, i)? {
                    columns[NUM_HIDDEN_COLUMNS + i] = value;
                }
                remaining &= !bit;
            }
        }
        current = page_range.read_tail_hidden(current, INDIRECTION_COLUMN)? as Rid;
    }
    Ok(())
}
