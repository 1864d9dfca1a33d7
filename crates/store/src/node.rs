// Path: crates/store/src/node.rs

//! Tree node records.
//!
//! A node is immutable once hashed: inner-node hashes commit to both child
//! hashes, so an edit anywhere produces a fresh node up to the root. Nodes
//! reference each other by content hash; direct child handles exist only
//! while the working tree is under construction and collapse back to hashes
//! when the branch is saved.

use crate::encoding::{bytes_len, read_bytes, read_varint, varint_len, write_bytes, write_varint};
use canopy_api::{NodeHash, StorageError, Version};
use sha2::{Digest, Sha256};

/// A child slot of an inner node.
#[derive(Debug, Clone)]
pub enum Child {
    /// Persisted child addressed by content hash.
    Saved(NodeHash),
    /// In-memory child handle, held only during tree construction.
    Owned(Box<Node>),
}

impl Child {
    pub fn hash(&self) -> Option<NodeHash> {
        match self {
            Child::Saved(h) => Some(*h),
            Child::Owned(n) => n.hash,
        }
    }
}

/// A leaf or inner node of the tree.
///
/// Leaves have `height == 0`, carry the user value, and no children. Inner
/// nodes carry the smallest key of their right subtree as the split key and
/// always have both children.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) version: Version,
    pub(crate) height: i8,
    pub(crate) size: u64,
    pub(crate) hash: Option<NodeHash>,
    pub(crate) left: Option<Child>,
    pub(crate) right: Option<Child>,
    pub(crate) persisted: bool,
}

impl Node {
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        Self {
            key,
            value,
            version,
            height: 0,
            size: 1,
            hash: None,
            left: None,
            right: None,
            persisted: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The user value; empty for inner nodes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn height(&self) -> i8 {
        self.height
    }

    /// Number of leaves in the subtree rooted here.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> Option<NodeHash> {
        self.hash
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn left_hash(&self) -> Option<NodeHash> {
        self.left.as_ref().and_then(Child::hash)
    }

    pub(crate) fn right_hash(&self) -> Option<NodeHash> {
        self.right.as_ref().and_then(Child::hash)
    }

    /// Byte length of the storage encoding, used to pre-grow write buffers.
    pub fn encoded_size(&self) -> usize {
        let mut n = varint_len(self.height as i64)
            + varint_len(self.size as i64)
            + varint_len(self.version as i64)
            + bytes_len(self.key.len());
        if self.is_leaf() {
            n += bytes_len(self.value.len());
        } else {
            n += 2 * bytes_len(NodeHash::LEN);
        }
        n
    }

    /// Appends the storage encoding. Inner nodes must have both child hashes
    /// resolved.
    pub fn write_bytes(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        write_varint(buf, self.height as i64);
        write_varint(buf, self.size as i64);
        write_varint(buf, self.version as i64);
        write_bytes(buf, &self.key);
        if self.is_leaf() {
            write_bytes(buf, &self.value);
        } else {
            let left = self
                .left_hash()
                .ok_or_else(|| StorageError::Encode("inner node has unresolved left hash".into()))?;
            let right = self.right_hash().ok_or_else(|| {
                StorageError::Encode("inner node has unresolved right hash".into())
            })?;
            write_bytes(buf, left.as_bytes());
            write_bytes(buf, right.as_bytes());
        }
        Ok(())
    }

    /// Parses a storage encoding produced by [`Node::write_bytes`]. The
    /// result carries no hash and is not marked persisted; the caller owns
    /// both.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut rd = bytes;
        let height = read_varint(&mut rd)?;
        if !(0..=i8::MAX as i64).contains(&height) {
            return Err(StorageError::Decode(format!("invalid node height {height}")));
        }
        let size = read_varint(&mut rd)?;
        if size < 1 {
            return Err(StorageError::Decode(format!("invalid node size {size}")));
        }
        let version = read_varint(&mut rd)?;
        if version < 1 {
            return Err(StorageError::Decode(format!(
                "invalid node version {version}"
            )));
        }
        let key = read_bytes(&mut rd)?;

        let mut node = Node {
            key,
            value: Vec::new(),
            version: version as Version,
            height: height as i8,
            size: size as u64,
            hash: None,
            left: None,
            right: None,
            persisted: false,
        };
        if node.is_leaf() {
            node.value = read_bytes(&mut rd)?;
        } else {
            let left = read_bytes(&mut rd)?;
            let right = read_bytes(&mut rd)?;
            let left = NodeHash::from_slice(&left)
                .ok_or_else(|| StorageError::Decode("malformed left child hash".into()))?;
            let right = NodeHash::from_slice(&right)
                .ok_or_else(|| StorageError::Decode("malformed right child hash".into()))?;
            node.left = Some(Child::Saved(left));
            node.right = Some(Child::Saved(right));
        }
        if !rd.is_empty() {
            return Err(StorageError::Decode(format!(
                "{} trailing bytes after node record",
                rd.len()
            )));
        }
        Ok(node)
    }

    /// Appends the hash preimage: header varints, then for leaves the key and
    /// the value's SHA-256, for inner nodes the two child hashes, all as
    /// length-prefixed byte strings.
    fn write_hash_bytes(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        write_varint(buf, self.height as i64);
        write_varint(buf, self.size as i64);
        write_varint(buf, self.version as i64);
        if self.is_leaf() {
            write_bytes(buf, &self.key);
            write_bytes(buf, Sha256::digest(&self.value).as_slice());
        } else {
            let left = self
                .left_hash()
                .ok_or_else(|| StorageError::Encode("hashing inner node before left child".into()))?;
            let right = self.right_hash().ok_or_else(|| {
                StorageError::Encode("hashing inner node before right child".into())
            })?;
            write_bytes(buf, left.as_bytes());
            write_bytes(buf, right.as_bytes());
        }
        Ok(())
    }

    /// Computes and caches the content hash, hashing owned children first.
    /// Returns the cached hash unchanged for already-hashed nodes.
    pub(crate) fn hash_recursive(&mut self) -> NodeHash {
        if let Some(h) = self.hash {
            return h;
        }
        if let Some(Child::Owned(n)) = self.left.as_mut() {
            n.hash_recursive();
        }
        if let Some(Child::Owned(n)) = self.right.as_mut() {
            n.hash_recursive();
        }
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.write_hash_bytes(&mut buf)
            .unwrap_or_else(|e| panic!("node hash preimage: {e}"));
        let hash = NodeHash(Sha256::digest(&buf).into());
        self.hash = Some(hash);
        hash
    }

    /// Clone with owned children collapsed to their hashes, suitable for the
    /// shared node cache.
    pub(crate) fn detached(&self) -> Node {
        let collapse = |c: &Option<Child>| {
            c.as_ref().map(|c| match c {
                Child::Saved(h) => Child::Saved(*h),
                Child::Owned(n) => {
                    Child::Saved(n.hash.unwrap_or_else(|| panic!("detaching unhashed child")))
                }
            })
        };
        Node {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            height: self.height,
            size: self.size,
            hash: self.hash,
            left: collapse(&self.left),
            right: collapse(&self.right),
            persisted: self.persisted,
        }
    }
}
