// Path: crates/api/src/lib.rs
#![forbid(unsafe_code)]

//! # Canopy API
//!
//! External interfaces consumed by the canopy store.
//!
//! The store is written against an injected, byte-ordered key-value backend
//! with batched atomic writes ([`KvStore`] / [`KvBatch`]). Backends live in
//! `canopy-store`; this crate only defines the contract, the error type, and
//! the shared hash/version primitives.

use thiserror::Error;

/// A monotonically increasing integer naming a committed tree snapshot.
pub type Version = u64;

/// A 32-byte content hash of a node's canonical representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHash(pub [u8; 32]);

impl NodeHash {
    /// Hash width in bytes (SHA-256).
    pub const LEN: usize = 32;

    /// Builds a hash from a byte slice; `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeHash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Encodes a u64 into a big-endian byte array, so lexicographic key order
/// matches numeric order in range scans.
#[inline]
pub fn be64(x: u64) -> [u8; 8] {
    x.to_be_bytes()
}

/// Errors surfaced by a key-value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A generic error originating from the underlying key-value engine.
    #[error("backend error: {0}")]
    Backend(String),
    /// An error occurred while serializing a record for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// An error occurred while deserializing a record from storage.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Owned iterator over key/value pairs of a fixed range.
///
/// Backends materialize the range at creation time, so iteration itself is
/// infallible; I/O errors surface when the iterator is created.
pub type KvIter = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>;

/// A byte-ordered key-value store with batched atomic writes.
///
/// Keys compare lexicographically. Range bounds are `[start, end)`; a `None`
/// bound is unbounded on that side.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates `[start, end)` in ascending key order.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIter, StorageError>;

    /// Iterates `[start, end)` in descending key order.
    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter, StorageError>;

    /// Iterates every key beginning with `prefix`, ascending.
    fn prefix_iterator(&self, prefix: &[u8]) -> Result<KvIter, StorageError> {
        match prefix_end(prefix) {
            Some(end) => self.iterator(Some(prefix), Some(&end)),
            None => self.iterator(Some(prefix), None),
        }
    }

    /// Opens a fresh write batch against this store.
    fn new_batch(&self) -> Box<dyn KvBatch>;
}

/// Buffered writes applied atomically by [`KvBatch::write`] or
/// [`KvBatch::write_sync`]. Nothing is durable until one of those succeeds.
pub trait KvBatch: Send {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Applies all buffered operations atomically.
    fn write(&mut self) -> Result<(), StorageError>;

    /// Like [`KvBatch::write`], but durable before returning.
    fn write_sync(&mut self) -> Result<(), StorageError>;
}

/// The smallest key strictly greater than every key carrying `prefix`, or
/// `None` when the prefix is empty or all `0xff`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == 0xff {
            end.pop();
        } else {
            *last += 1;
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"f"), Some(b"g".to_vec()));
        assert_eq!(prefix_end(&[0x6e, 0x00]), Some(vec![0x6e, 0x01]));
    }

    #[test]
    fn prefix_end_carries_past_0xff() {
        assert_eq!(prefix_end(&[0x61, 0xff]), Some(vec![0x62]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
        assert_eq!(prefix_end(&[]), None);
    }

    #[test]
    fn node_hash_debug_is_hex() {
        let h = NodeHash([0xab; 32]);
        assert!(format!("{h:?}").contains(&"ab".repeat(32)));
    }

    #[test]
    fn node_hash_from_slice_checks_length() {
        assert!(NodeHash::from_slice(&[0u8; 31]).is_none());
        assert!(NodeHash::from_slice(&[0u8; 32]).is_some());
    }
}
