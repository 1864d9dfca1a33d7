// Path: crates/store/src/backend/memory.rs

//! In-memory ordered key-value store backed by a `BTreeMap`.

use canopy_api::{KvBatch, KvIter, KvStore, StorageError};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile backend, primarily for tests and tooling.
#[derive(Clone, Default)]
pub struct MemDb {
    map: Arc<RwLock<Map>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Map> {
        self.map.read().expect("memdb lock poisoned")
    }

    fn collect_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        self.read()
            .range::<[u8], _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KvStore for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.read().contains_key(key))
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIter, StorageError> {
        Ok(Box::new(self.collect_range(start, end).into_iter()))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter, StorageError> {
        Ok(Box::new(self.collect_range(start, end).into_iter().rev()))
    }

    fn new_batch(&self) -> Box<dyn KvBatch> {
        Box::new(MemBatch {
            map: self.map.clone(),
            ops: Vec::new(),
        })
    }
}

enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemBatch {
    map: Arc<RwLock<Map>>,
    ops: Vec<Op>,
}

impl KvBatch for MemBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.ops.push(Op::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.ops.push(Op::Delete(key.to_vec()));
        Ok(())
    }

    fn write(&mut self) -> Result<(), StorageError> {
        let mut map = self.map.write().expect("memdb lock poisoned");
        for op in self.ops.drain(..) {
            match op {
                Op::Set(k, v) => {
                    map.insert(k, v);
                }
                Op::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn write_sync(&mut self) -> Result<(), StorageError> {
        self.write()
    }
}
