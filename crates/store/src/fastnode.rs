// Path: crates/store/src/fastnode.rs

//! Fast-layer index records.
//!
//! A fast node maps a raw user key to its value as of the version named
//! inside. It is a cache-like side index: never referenced by hash, keyed
//! directly by the user key, and only meaningful for the latest version.

use crate::encoding::{bytes_len, read_bytes, read_varint, varint_len, write_bytes, write_varint};
use canopy_api::{StorageError, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastNode {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) version_last_updated_at: Version,
}

impl FastNode {
    pub fn new(key: Vec<u8>, value: Vec<u8>, version_last_updated_at: Version) -> Self {
        Self {
            key,
            value,
            version_last_updated_at,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version_last_updated_at(&self) -> Version {
        self.version_last_updated_at
    }

    pub fn encoded_size(&self) -> usize {
        varint_len(self.version_last_updated_at as i64) + bytes_len(self.value.len())
    }

    /// Appends the storage encoding. The key is not part of the record; it
    /// lives in the database key.
    pub fn write_bytes(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.version_last_updated_at as i64);
        write_bytes(buf, &self.value);
    }

    pub fn decode(key: &[u8], bytes: &[u8]) -> Result<Self, StorageError> {
        let mut rd = bytes;
        let version = read_varint(&mut rd)?;
        if version < 1 {
            return Err(StorageError::Decode(format!(
                "invalid fast node version {version}"
            )));
        }
        let value = read_bytes(&mut rd)?;
        if !rd.is_empty() {
            return Err(StorageError::Decode(format!(
                "{} trailing bytes after fast node record",
                rd.len()
            )));
        }
        Ok(Self {
            key: key.to_vec(),
            value,
            version_last_updated_at: version as Version,
        })
    }
}
