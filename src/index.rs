use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::common::{ColumnIndex, Rid};
use crate::error::{DbError, Result};

/// Ordered `value -> {rid}` maps, one per indexed column. The primary-key
/// column is always present and is the sole source of truth for "does a
/// record with this key exist" — there is no separate secondary copy of it,
/// so a lookup on the key column and a lookup on any other indexed column
/// go through the same code path.
pub struct Index {
    key_column: ColumnIndex,
    trees: RwLock<HashMap<ColumnIndex, BTreeMap<i32, BTreeSet<Rid>>>>,
}

impl Index {
    pub fn new(key_column: ColumnIndex) -> Self {
        let mut trees = HashMap::new();
        trees.insert(key_column, BTreeMap::new());
        Self {
            key_column,
            trees: RwLock::new(trees),
        }
    }

    pub fn key_column(&self) -> ColumnIndex {
        self.key_column
    }

    pub fn is_indexed(&self, column: ColumnIndex) -> bool {
        self.trees.read().contains_key(&column)
    }

    /// All rids whose value in `column` equals `value`, if `column` is indexed.
    pub fn locate(&self, column: ColumnIndex, value: i32) -> Option<Vec<Rid>> {
        let trees = self.trees.read();
        let tree = trees.get(&column)?;
        Some(
            tree.get(&value)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
        )
    }

    /// All rids whose value in `column` falls in `[lo, hi]`, if indexed.
    pub fn locate_range(&self, column: ColumnIndex, lo: i32, hi: i32) -> Option<Vec<Rid>> {
        let trees = self.trees.read();
        let tree = trees.get(&column)?;
        Some(
            tree.range(lo..=hi)
                .flat_map(|(_, set)| set.iter().copied())
                .collect(),
        )
    }

    /// Inserts `rid` into every indexed column's tree using `columns` (user
    /// columns only, addressed by the same raw column indices `locate`,
    /// `locate_range`, and `create_index` use). Rejects a duplicate primary
    /// key without mutating any tree.
    pub fn insert_all(&self, rid: Rid, columns: &[i32]) -> Result<()> {
        let mut trees = self.trees.write();
        let key_value = columns[self.key_column];
        if trees[&self.key_column].contains_key(&key_value) {
            return Err(DbError::DuplicateKey(key_value.to_string()));
        }
        for (column, tree) in trees.iter_mut() {
            tree.entry(columns[*column]).or_default().insert(rid);
        }
        Ok(())
    }

    /// Re-homes `rid` in every indexed column whose value actually changed
    /// between `old_columns` and `new_columns`.
    pub fn update_all(&self, rid: Rid, old_columns: &[i32], new_columns: &[i32]) -> Result<()> {
        let mut trees = self.trees.write();
        for (column, tree) in trees.iter_mut() {
            let old_value = old_columns[*column];
            let new_value = new_columns[*column];
            if old_value == new_value {
                continue;
            }
            if let Some(set) = tree.get_mut(&old_value) {
                set.remove(&rid);
                if set.is_empty() {
                    tree.remove(&old_value);
                }
            }
            tree.entry(new_value).or_default().insert(rid);
        }
        Ok(())
    }

    pub fn delete_all(&self, rid: Rid, columns: &[i32]) -> Result<()> {
        let mut trees = self.trees.write();
        for (column, tree) in trees.iter_mut() {
            let value = columns[*column];
            if let Some(set) = tree.get_mut(&value) {
                set.remove(&rid);
                if set.is_empty() {
                    tree.remove(&value);
                }
            }
        }
        Ok(())
    }

    /// Builds a secondary index over `column` from the supplied `(rid,
    /// value)` pairs. Callers (the table) resolve each rid's current value
    /// through the tail chain before calling this — the index itself only
    /// ever sees a flat rid/value snapshot.
    pub fn create_index(
        &self,
        column: ColumnIndex,
        values: impl IntoIterator<Item = (Rid, i32)>,
    ) -> Result<()> {
        let mut trees = self.trees.write();
        if trees.contains_key(&column) {
            return Err(DbError::Index(format!("column {column} is already indexed")));
        }
        let mut tree: BTreeMap<i32, BTreeSet<Rid>> = BTreeMap::new();
        for (rid, value) in values {
            tree.entry(value).or_default().insert(rid);
        }
        trees.insert(column, tree);
        Ok(())
    }

    pub fn drop_index(&self, column: ColumnIndex) -> Result<()> {
        if column == self.key_column {
            return Err(DbError::Index("cannot drop the primary key index".to_string()));
        }
        let mut trees = self.trees.write();
        if trees.remove(&column).is_none() {
            return Err(DbError::Index(format!("column {column} is not indexed")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_locate_by_key() {
        let index = Index::new(0);
        index.insert_all(7, &[1, 10, 20]).unwrap();
        assert_eq!(index.locate(0, 1), Some(vec![7]));
    }

    #[test]
    fn duplicate_key_rejected() {
        let index = Index::new(0);
        index.insert_all(7, &[1, 10, 20]).unwrap();
        assert!(index.insert_all(8, &[1, 99, 99]).is_err());
        // failed insert must not have touched any tree
        assert_eq!(index.locate(0, 1), Some(vec![7]));
    }

    #[test]
    fn update_moves_entry_between_buckets() {
        let index = Index::new(0);
        index.insert_all(1, &[5, 100]).unwrap();
        index.update_all(1, &[5, 100], &[5, 200]).unwrap();
        assert_eq!(index.locate(0, 5), Some(vec![1]));
    }

    #[test]
    fn secondary_index_locate_range() {
        let index = Index::new(0);
        index.insert_all(1, &[1, 10]).unwrap();
        index.insert_all(2, &[2, 20]).unwrap();
        index.insert_all(3, &[3, 30]).unwrap();
        index
            .create_index(1, vec![(1, 10), (2, 20), (3, 30)])
            .unwrap();
        let mut rids = index.locate_range(1, 15, 30).unwrap();
        rids.sort();
        assert_eq!(rids, vec![2, 3]);
    }

    #[test]
    fn cannot_drop_primary_index() {
        let index = Index::new(0);
        assert!(index.drop_index(0).is_err());
    }
}
