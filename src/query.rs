//! Insert/select/update/delete/sum built on `Table`, `Index`, and the
//! page-range tail-chain walk. Every operation here is safe to call either
//! standalone or from inside a `Transaction` once the transaction has
//! acquired the appropriate locks; these functions never touch the lock
//! manager themselves.

use crate::common::{
    Rid, INDIRECTION_COLUMN, NONE_VALUE, NUM_HIDDEN_COLUMNS, RID_COLUMN, SCHEMA_ENCODING_COLUMN,
    TIMESTAMP_COLUMN, UPDATE_TIMESTAMP_COLUMN,
};
use crate::error::{DbError, Result};
use crate::storage::PageRange;
use crate::table::Table;

/// A fully materialized row, hidden columns stripped, in table column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub columns: Vec<i32>,
}

fn check_projection(table: &Table, projection: &[bool]) -> Result<()> {
    if projection.len() != table.num_user_columns {
        return Err(DbError::InvalidProjection {
            expected: table.num_user_columns,
            actual: projection.len(),
        });
    }
    Ok(())
}

/// Inserts a new row. Rejects a duplicate primary key without allocating a
/// rid or writing any page.
pub fn insert(table: &Table, columns: &[i32]) -> Result<Rid> {
    if columns.len() != table.num_user_columns {
        return Err(DbError::InvalidProjection {
            expected: table.num_user_columns,
            actual: columns.len(),
        });
    }
    let key_value = columns[table.key_column];
    if table
        .index()
        .locate(table.key_column, key_value)
        .map(|rids| !rids.is_empty())
        .unwrap_or(false)
    {
        return Err(DbError::DuplicateKey(key_value.to_string()));
    }

    let rid = table.allocate_rid();
    let mut full = vec![0i32; NUM_HIDDEN_COLUMNS + columns.len()];
    full[RID_COLUMN] = rid as i32;
    full[TIMESTAMP_COLUMN] = 0;
    full[UPDATE_TIMESTAMP_COLUMN] = NONE_VALUE;
    full[SCHEMA_ENCODING_COLUMN] = 0;
    full[NUM_HIDDEN_COLUMNS..].copy_from_slice(columns);

    table.write_base_record(rid, full)?;
    // Index trees are keyed by the same raw user-column indices `locate`/
    // `locate_range`/`create_index` use, so the index sees the user columns
    // only, not the hidden-column-prefixed storage layout.
    table.index().insert_all(rid, columns)?;
    Ok(rid)
}

/// Resolves the current visible value of every requested user column for
/// one base rid, per `version`: `0` is the latest value, `-k` skips `k`
/// qualifying tail records further back before reading.
fn resolve_record(
    page_range: &PageRange,
    num_user_columns: usize,
    page_in_range: usize,
    slot: usize,
    projection: &[bool],
    version: i64,
) -> Result<Record> {
    let base = page_range.read_base_record(page_in_range, slot)?;
    let base_schema = base[SCHEMA_ENCODING_COLUMN];
    let base_ts = base[TIMESTAMP_COLUMN];
    let indirection = base[INDIRECTION_COLUMN] as Rid;
    let rid = base[RID_COLUMN] as Rid;

    let mut values = base[NUM_HIDDEN_COLUMNS..NUM_HIDDEN_COLUMNS + num_user_columns].to_vec();

    if !page_range.is_base_rid(indirection) {
        for i in 0..num_user_columns {
            if !projection[i] {
                continue;
            }
            let bit = 1 << i;
            if base_schema & bit == 0 {
                continue; // never updated; base value is authoritative
            }
            if let Some(v) = walk_for_version(page_range, indirection, base_ts, i, version)? {
                values[i] = v;
            }
        }
    }

    let mut projected = Vec::with_capacity(projection.iter().filter(|p| **p).count());
    for (i, keep) in projection.iter().enumerate() {
        if *keep {
            projected.push(values[i]);
        }
    }
    Ok(Record { rid, columns: projected })
}

/// Walks the tail chain for column `i`, collecting qualifying versions
/// (those whose own schema bit is set and whose timestamp is at or after
/// `base_ts`) until the `version`-th (0 = newest) one is found.
fn walk_for_version(
    page_range: &PageRange,
    start: Rid,
    base_ts: i32,
    column: usize,
    version: i64,
) -> Result<Option<i32>> {
    let mut current = start;
    let mut skip = (-version).max(0);
    let bit = 1 << column;
    while !page_range.is_base_rid(current) {
        let tail_schema = page_range.read_tail_hidden(current, SCHEMA_ENCODING_COLUMN)?;
        let tail_ts = page_range.read_tail_hidden(current, TIMESTAMP_COLUMN)?;
        if tail_schema & bit != 0 && tail_ts >= base_ts {
            if skip == 0 {
                return page_range.read_tail_user_column(current, column);
            }
            skip -= 1;
        }
        current = page_range.read_tail_hidden(current, INDIRECTION_COLUMN)? as Rid;
    }
    Ok(None)
}

pub fn select_version(
    table: &Table,
    search_value: i32,
    search_column: usize,
    projection: &[bool],
    version: i64,
) -> Result<Vec<Record>> {
    check_projection(table, projection)?;
    let rids = table
        .index()
        .locate(search_column, search_value)
        .ok_or_else(|| DbError::Index(format!("column {search_column} is not indexed")))?;

    let mut out = Vec::with_capacity(rids.len());
    for rid in rids {
        let (range_idx, page_in_range, slot) = table.locate_base(rid);
        let page_range = table
            .page_range(range_idx)
            .ok_or_else(|| DbError::NotFound(rid.to_string()))?;
        out.push(resolve_record(
            &page_range,
            table.num_user_columns,
            page_in_range,
            slot,
            projection,
            version,
        )?);
    }
    Ok(out)
}

/// Resolves every user column's current visible value for one base rid.
/// Used when rebuilding a secondary index by scanning live records (see
/// `database::Database::create_index`), not part of the search-by-index path.
pub fn resolve_all_columns(table: &Table, rid: Rid) -> Result<Record> {
    let (range_idx, page_in_range, slot) = table.locate_base(rid);
    let page_range = table
        .page_range(range_idx)
        .ok_or_else(|| DbError::NotFound(rid.to_string()))?;
    let projection = vec![true; table.num_user_columns];
    resolve_record(&page_range, table.num_user_columns, page_in_range, slot, &projection, 0)
}

pub fn select(table: &Table, search_value: i32, search_column: usize, projection: &[bool]) -> Result<Vec<Record>> {
    select_version(table, search_value, search_column, projection, 0)
}

pub fn sum_version(table: &Table, lo: i32, hi: i32, column: usize, version: i64) -> Result<Option<i64>> {
    let rids = table
        .index()
        .locate_range(table.key_column, lo, hi)
        .ok_or_else(|| DbError::Index(format!("column {} is not indexed", table.key_column)))?;
    if rids.is_empty() {
        return Ok(None);
    }
    let mut projection = vec![false; table.num_user_columns];
    projection[column] = true;
    let mut total: i64 = 0;
    for rid in rids {
        let (range_idx, page_in_range, slot) = table.locate_base(rid);
        let page_range = table
            .page_range(range_idx)
            .ok_or_else(|| DbError::NotFound(rid.to_string()))?;
        let record = resolve_record(
            &page_range,
            table.num_user_columns,
            page_in_range,
            slot,
            &projection,
            version,
        )?;
        total += record.columns[0] as i64;
    }
    Ok(Some(total))
}

pub fn sum(table: &Table, lo: i32, hi: i32, column: usize) -> Result<Option<i64>> {
    sum_version(table, lo, hi, column, 0)
}

/// Result of a successful update, carrying what the query engine needs to
/// build an undo record: the row's previous fully-materialized columns.
pub struct UpdateOutcome {
    pub rid: Rid,
    pub previous_columns: Vec<i32>,
}

/// Applies `new_columns` (same length as the table's user columns; `None`
/// entries are left untouched) to the row keyed by `key_value`. Changing
/// the primary key is rejected unless the new key is unused.
pub fn update(table: &Table, key_value: i32, new_columns: &[Option<i32>]) -> Result<UpdateOutcome> {
    if new_columns.len() != table.num_user_columns {
        return Err(DbError::InvalidProjection {
            expected: table.num_user_columns,
            actual: new_columns.len(),
        });
    }
    let rids = table
        .index()
        .locate(table.key_column, key_value)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| DbError::NotFound(key_value.to_string()))?;
    let rid = rids[0];

    if let Some(Some(new_key)) = new_columns.get(table.key_column) {
        if *new_key != key_value
            && table
                .index()
                .locate(table.key_column, *new_key)
                .map(|r| !r.is_empty())
                .unwrap_or(false)
        {
            return Err(DbError::DuplicateKey(new_key.to_string()));
        }
    }

    let (range_idx, page_in_range, slot) = table.locate_base(rid);
    let page_range = table
        .page_range(range_idx)
        .ok_or_else(|| DbError::NotFound(rid.to_string()))?;

    let projection = vec![true; table.num_user_columns];
    let previous = resolve_record(&page_range, table.num_user_columns, page_in_range, slot, &projection, 0)?;

    let mut schema_bits: i32 = 0;
    for (i, value) in new_columns.iter().enumerate() {
        if value.is_some() {
            schema_bits |= 1 << i;
        }
    }

    let base_indirection = page_range.read_base_column(page_in_range, slot, INDIRECTION_COLUMN)? as Rid;
    let hidden = [
        base_indirection as i32,
        rid as i32,
        0, // stamped with TPS by Table::apply_tail
        NONE_VALUE,
        schema_bits,
    ];
    let logical_rid = table.apply_tail(rid, hidden, new_columns)?;

    page_range.write_base_column(page_in_range, slot, INDIRECTION_COLUMN, logical_rid as i32)?;
    let prior_schema = page_range.read_base_column(page_in_range, slot, SCHEMA_ENCODING_COLUMN)?;
    page_range.write_base_column(page_in_range, slot, SCHEMA_ENCODING_COLUMN, prior_schema | schema_bits)?;

    let mut new_columns_full = previous.columns.clone();
    for (i, value) in new_columns.iter().enumerate() {
        if let Some(v) = value {
            new_columns_full[i] = *v;
        }
    }
    table.index().update_all(rid, &previous.columns, &new_columns_full)?;

    Ok(UpdateOutcome {
        rid,
        previous_columns: previous.columns,
    })
}

/// Marks the row keyed by `key_value` deleted: removed from every index
/// immediately, physically reclaimed asynchronously by the delete worker.
pub fn delete(table: &Table, key_value: i32) -> Result<Rid> {
    let rids = table
        .index()
        .locate(table.key_column, key_value)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| DbError::NotFound(key_value.to_string()))?;
    let rid = rids[0];

    let (range_idx, page_in_range, slot) = table.locate_base(rid);
    let page_range = table
        .page_range(range_idx)
        .ok_or_else(|| DbError::NotFound(rid.to_string()))?;
    let projection = vec![true; table.num_user_columns];
    let current = resolve_record(&page_range, table.num_user_columns, page_in_range, slot, &projection, 0)?;

    table.index().delete_all(rid, &current.columns)?;
    table.enqueue_deletion(rid);
    Ok(rid)
}

pub fn increment(table: &Table, key_value: i32, column: usize) -> Result<UpdateOutcome> {
    let mut projection = vec![false; table.num_user_columns];
    projection[column] = true;
    let rows = select(table, key_value, table.key_column, &projection)?;
    let current = rows
        .first()
        .ok_or_else(|| DbError::NotFound(key_value.to_string()))?;
    let mut new_columns = vec![None; table.num_user_columns];
    new_columns[column] = Some(current.columns[0] + 1);
    update(table, key_value, &new_columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn test_table(dir: &std::path::Path) -> std::sync::Arc<Table> {
        let config = Config {
            data_dir: dir.to_string_lossy().to_string(),
            page_size: 32,
            pages_per_range: 2,
            frames_per_column: 8,
            merge_trigger_pages: 1000,
        };
        Table::create("grades", 5, 0, config).unwrap()
    }

    #[test]
    fn insert_then_select_round_trips() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[1, 10, 20, 30, 40]).unwrap();
        let rows = select(&table, 1, 0, &[true, true, true, true, true]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec![1, 10, 20, 30, 40]);
        table.close().unwrap();
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[1, 1, 1, 1, 1]).unwrap();
        assert!(insert(&table, &[1, 2, 2, 2, 2]).is_err());
        table.close().unwrap();
    }

    #[test]
    fn update_then_select_sees_new_value_and_select_version_sees_old() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[2, 5, 5, 5, 5]).unwrap();
        update(&table, 2, &[None, Some(99), None, None, None]).unwrap();

        let latest = select(&table, 2, 0, &[true, true, true, true, true]).unwrap();
        assert_eq!(latest[0].columns, vec![2, 5, 99, 5, 5]);

        let prior = select_version(&table, 2, 0, &[true, true, true, true, true], -1).unwrap();
        assert_eq!(prior[0].columns, vec![2, 5, 5, 5, 5]);
        table.close().unwrap();
    }

    #[test]
    fn delete_then_select_finds_nothing() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[3, 1, 2, 3, 4]).unwrap();
        delete(&table, 3).unwrap();
        assert!(select(&table, 3, 0, &[true, true, true, true, true])
            .unwrap()
            .is_empty());
        table.close().unwrap();
    }

    #[test]
    fn sum_over_range_reflects_updates() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[1, 10, 20, 30, 40]).unwrap();
        insert(&table, &[2, 5, 5, 5, 5]).unwrap();
        update(&table, 2, &[None, Some(99), None, None, None]).unwrap();
        let total = sum(&table, 1, 2, 1).unwrap();
        assert_eq!(total, Some(20 + 99));
        table.close().unwrap();
    }

    #[test]
    fn increment_bumps_column_by_one() {
        let dir = tempdir().unwrap();
        let table = test_table(dir.path());
        insert(&table, &[1, 10, 0, 0, 0]).unwrap();
        increment(&table, 1, 1).unwrap();
        let rows = select(&table, 1, 0, &[true, true, false, false, false]).unwrap();
        assert_eq!(rows[0].columns, vec![1, 11]);
        table.close().unwrap();
    }
}
