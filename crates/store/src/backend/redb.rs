// Path: crates/store/src/backend/redb.rs

//! Durable single-file backend on `redb`.
//!
//! One table holds the whole keyspace; the record kinds are already
//! disambiguated by the key-format prefixes, so the store maps directly onto
//! ordered byte keys. Batches buffer operations and apply them inside a
//! single write transaction, with `write` vs `write_sync` mapped onto redb's
//! durability levels.

use canopy_api::{KvBatch, KvIter, KvStore, StorageError};
use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("canopy");

#[derive(Clone)]
pub struct RedbDb {
    db: Arc<Database>,
}

impl RedbDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        // Ensure the table exists so read transactions never race its creation.
        let txn = db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        txn.open_table(DATA)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        txn.commit()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn collect_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = txn
            .open_table(DATA)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        let mut out = Vec::new();
        for entry in table
            .range::<&[u8]>((lower, upper))
            .map_err(|e| StorageError::Backend(e.to_string()))?
        {
            let (k, v) = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }
}

impl KvStore for RedbDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = txn
            .open_table(DATA)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIter, StorageError> {
        Ok(Box::new(self.collect_range(start, end)?.into_iter()))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter, StorageError> {
        Ok(Box::new(self.collect_range(start, end)?.into_iter().rev()))
    }

    fn new_batch(&self) -> Box<dyn KvBatch> {
        Box::new(RedbBatch {
            db: self.db.clone(),
            ops: Vec::new(),
        })
    }
}

enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct RedbBatch {
    db: Arc<Database>,
    ops: Vec<Op>,
}

impl RedbBatch {
    fn apply(&mut self, durability: Durability) -> Result<(), StorageError> {
        let mut txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        txn.set_durability(durability);
        {
            let mut table = txn
                .open_table(DATA)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            for op in &self.ops {
                match op {
                    Op::Set(k, v) => {
                        table
                            .insert(k.as_slice(), v.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                    Op::Delete(k) => {
                        table
                            .remove(k.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                }
            }
        }
        txn.commit()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.ops.clear();
        Ok(())
    }
}

impl KvBatch for RedbBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.ops.push(Op::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.ops.push(Op::Delete(key.to_vec()));
        Ok(())
    }

    fn write(&mut self) -> Result<(), StorageError> {
        self.apply(Durability::Eventual)
    }

    fn write_sync(&mut self) -> Result<(), StorageError> {
        self.apply(Durability::Immediate)
    }
}
