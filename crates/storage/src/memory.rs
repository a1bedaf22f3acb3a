use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process store used by tests and throwaway indexes.
pub struct MemoryStore {
    columns: RwLock<Vec<ColumnMap>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![ColumnMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored in `column`.
    pub fn len(&self, column: Column) -> usize {
        self.read()
            .map(|guard| guard[column.index()].len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, column: Column) -> bool {
        self.len(column) == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<ColumnMap>>, StoreError> {
        self.columns
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<ColumnMap>>, StoreError> {
        self.columns
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn prefix_range<'m>(
    map: &'m ColumnMap,
    prefix: &[u8],
) -> impl Iterator<Item = (&'m Vec<u8>, &'m Vec<u8>)> + 'm {
    let owned = prefix.to_vec();
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(&owned))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        Ok(prefix_range(&guard[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for (key, value) in prefix_range(&guard[column.index()], prefix) {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard[column.index()].insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stops_at_prefix_boundary() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"ha", b"1").expect("put");
        store.put(Column::Utxo, b"hb", b"2").expect("put");
        store.put(Column::Utxo, b"i", b"3").expect("put");
        store.put(Column::Header, b"hc", b"4").expect("put");

        let rows = store.scan_prefix(Column::Utxo, b"h").expect("scan");
        assert_eq!(
            rows,
            vec![
                (b"ha".to_vec(), b"1".to_vec()),
                (b"hb".to_vec(), b"2".to_vec())
            ]
        );
        assert_eq!(store.len(Column::Header), 1);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, b"k", b"old");
        batch.delete(Column::Utxo, b"k");
        batch.put(Column::Utxo, b"k", b"new");
        store.write_batch(&batch).expect("batch");
        assert_eq!(
            store.get(Column::Utxo, b"k").expect("get"),
            Some(b"new".to_vec())
        );
    }
}
