// Path: crates/store/src/immutable.rs

//! Read-only snapshot of a committed version.
//!
//! A snapshot is a root hash plus the shared node database; traversal
//! resolves child hashes through the cache on demand. Constructing a
//! snapshot registers it as an active reader of its version, which blocks
//! pruning of that version until the snapshot is dropped.

use crate::node::{Child, Node};
use crate::nodedb::NodeDb;
use canopy_api::{NodeHash, Version};
use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

/// A resolved node handle: either borrowed from the working tree or shared
/// out of the node cache.
pub(crate) enum NodeRef<'a> {
    Borrowed(&'a Node),
    Shared(Arc<Node>),
}

impl Deref for NodeRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            NodeRef::Borrowed(n) => n,
            NodeRef::Shared(n) => n,
        }
    }
}

pub(crate) fn resolve<'a>(ndb: &NodeDb, child: &'a Child) -> NodeRef<'a> {
    match child {
        Child::Owned(n) => NodeRef::Borrowed(n),
        Child::Saved(h) => NodeRef::Shared(ndb.get_node(h)),
    }
}

pub(crate) fn left_of<'a>(ndb: &NodeDb, node: &'a Node) -> NodeRef<'a> {
    let child = node.left.as_ref().expect("inner node missing left child");
    resolve(ndb, child)
}

pub(crate) fn right_of<'a>(ndb: &NodeDb, node: &'a Node) -> NodeRef<'a> {
    let child = node.right.as_ref().expect("inner node missing right child");
    resolve(ndb, child)
}

/// Point lookup under `node`. Descends left when `key < split key`.
pub(crate) fn get_in(ndb: &NodeDb, node: &Node, key: &[u8]) -> Option<Vec<u8>> {
    if node.is_leaf() {
        return (key == node.key()).then(|| node.value().to_vec());
    }
    if key < node.key() {
        get_in(ndb, &left_of(ndb, node), key)
    } else {
        get_in(ndb, &right_of(ndb, node), key)
    }
}

/// Returns the in-order index where `key` sits (or would be inserted) and
/// its value when present.
pub(crate) fn get_with_index_in(
    ndb: &NodeDb,
    node: &Node,
    key: &[u8],
) -> (u64, Option<Vec<u8>>) {
    if node.is_leaf() {
        return match key.cmp(node.key()) {
            Ordering::Less => (0, None),
            Ordering::Equal => (0, Some(node.value().to_vec())),
            Ordering::Greater => (1, None),
        };
    }
    if key < node.key() {
        get_with_index_in(ndb, &left_of(ndb, node), key)
    } else {
        let left = left_of(ndb, node);
        let left_size = left.size();
        let (index, value) = get_with_index_in(ndb, &right_of(ndb, node), key);
        (index + left_size, value)
    }
}

/// Returns the key/value at in-order position `index`.
pub(crate) fn get_by_index_in(
    ndb: &NodeDb,
    node: &Node,
    index: u64,
) -> Option<(Vec<u8>, Vec<u8>)> {
    if node.is_leaf() {
        return (index == 0).then(|| (node.key().to_vec(), node.value().to_vec()));
    }
    let left = left_of(ndb, node);
    if index < left.size() {
        get_by_index_in(ndb, &left, index)
    } else {
        let left_size = left.size();
        get_by_index_in(ndb, &right_of(ndb, node), index - left_size)
    }
}

/// In-order leaf walk; `f` returns `true` to stop early. Returns whether the
/// walk was stopped.
pub(crate) fn iterate_in(
    ndb: &NodeDb,
    node: &Node,
    f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
) -> bool {
    if node.is_leaf() {
        return f(node.key(), node.value());
    }
    if iterate_in(ndb, &left_of(ndb, node), f) {
        return true;
    }
    iterate_in(ndb, &right_of(ndb, node), f)
}

/// Read-only tree bound to one committed version.
pub struct ImmutableTree {
    ndb: Arc<NodeDb>,
    root_hash: Option<NodeHash>,
    version: Version,
}

impl ImmutableTree {
    /// Registers as an active reader of `version`; released on drop.
    pub(crate) fn new(ndb: Arc<NodeDb>, root_hash: Option<NodeHash>, version: Version) -> Self {
        ndb.increment_version_readers(version);
        Self {
            ndb,
            root_hash,
            version,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn root_hash(&self) -> Option<NodeHash> {
        self.root_hash
    }

    pub fn is_empty(&self) -> bool {
        self.root_hash.is_none()
    }

    /// Number of leaves in this version.
    pub fn size(&self) -> u64 {
        self.root_node().map_or(0, |n| n.size())
    }

    pub(crate) fn node_db(&self) -> &Arc<NodeDb> {
        &self.ndb
    }

    pub(crate) fn root_node(&self) -> Option<Arc<Node>> {
        self.root_hash.map(|h| self.ndb.get_node(&h))
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root_node()?;
        get_in(&self.ndb, &root, key)
    }

    /// The in-order index where `key` sits (or would be inserted), plus its
    /// value when present.
    pub fn get_with_index(&self, key: &[u8]) -> (u64, Option<Vec<u8>>) {
        match self.root_node() {
            Some(root) => get_with_index_in(&self.ndb, &root, key),
            None => (0, None),
        }
    }

    /// The key/value at in-order position `index`.
    pub fn get_by_index(&self, index: u64) -> Option<(Vec<u8>, Vec<u8>)> {
        let root = self.root_node()?;
        get_by_index_in(&self.ndb, &root, index)
    }

    /// In-order iteration; `f` returns `true` to stop. Returns whether the
    /// walk was stopped early.
    pub fn iterate(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> bool {
        match self.root_node() {
            Some(root) => iterate_in(&self.ndb, &root, &mut f),
            None => false,
        }
    }
}

impl Drop for ImmutableTree {
    fn drop(&mut self) {
        self.ndb.decrement_version_readers(self.version);
    }
}
