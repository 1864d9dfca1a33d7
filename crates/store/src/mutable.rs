// Path: crates/store/src/mutable.rs

//! The mutable working tree.
//!
//! Edits are copy-on-write: every node on the path from the root to an
//! edited leaf is rebuilt at the working version, and each displaced
//! persisted node is recorded as an orphan (`hash → from_version`) so the
//! version it last belonged to can be pruned later. Nodes created and
//! dropped inside a single working version never get an orphan record.
//!
//! `save_version` persists the working tree as `version + 1`: branch save,
//! orphan save, root save, fast-layer flush, then one atomic commit.

use crate::error::StoreError;
use crate::fastnode::FastNode;
use crate::immutable::{get_in, iterate_in, resolve, ImmutableTree};
use crate::node::{Child, Node};
use crate::nodedb::{NodeDb, Options};
use canopy_api::{KvStore, NodeHash, StorageError, Version};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

enum RemoveOutcome {
    /// Key absent; the subtree is handed back unchanged.
    NotFound(Child),
    Removed {
        /// The subtree that takes this one's place; `None` when it vanished.
        replacement: Option<Child>,
        /// New smallest key of the subtree, when the removal changed it.
        new_leftmost: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

/// A versioned tree accepting edits on top of its last saved version.
pub struct MutableTree {
    ndb: Arc<NodeDb>,
    root: Option<Child>,
    version: Version,
    orphans: HashMap<NodeHash, Version>,
    unsaved_additions: BTreeMap<Vec<u8>, FastNode>,
    unsaved_removals: BTreeSet<Vec<u8>>,
}

impl MutableTree {
    /// An empty tree at version 0. Both caches take `cache_size`.
    pub fn new(db: Arc<dyn KvStore>, cache_size: usize, opts: Options) -> Self {
        Self {
            ndb: Arc::new(NodeDb::new(db, cache_size, opts)),
            root: None,
            version: 0,
            orphans: HashMap::new(),
            unsaved_additions: BTreeMap::new(),
            unsaved_removals: BTreeSet::new(),
        }
    }

    pub fn node_db(&self) -> &Arc<NodeDb> {
        &self.ndb
    }

    /// The last saved version; 0 before the first save.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Number of leaves in the working tree.
    pub fn size(&self) -> u64 {
        match &self.root {
            Some(child) => resolve(&self.ndb, child).size(),
            None => 0,
        }
    }

    /// Whether point reads are served by the fast index.
    pub fn is_fast_storage_enabled(&self) -> bool {
        self.ndb.has_upgraded_to_fast_storage()
    }

    pub(crate) fn root_child(&self) -> Option<&Child> {
        self.root.as_ref()
    }

    /// Whether non-membership proofs may consult the fast index: it only
    /// reflects the latest saved version, with no unsaved edits on top.
    pub(crate) fn fast_proof_eligible(&self) -> Result<bool, StoreError> {
        Ok(self.ndb.options().fast_non_membership
            && self.ndb.has_upgraded_to_fast_storage()
            && self.unsaved_additions.is_empty()
            && self.unsaved_removals.is_empty()
            && self.version == self.ndb.latest_version()?)
    }

    // --- reads ---

    /// Point read of the working tree. Unsaved edits win; untouched keys are
    /// served from the fast index when enabled, falling back to a tree walk.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(node) = self.unsaved_additions.get(key) {
            return Ok(Some(node.value().to_vec()));
        }
        if self.unsaved_removals.contains(key) {
            return Ok(None);
        }
        if self.ndb.has_upgraded_to_fast_storage() {
            if let Some(fast) = self.ndb.get_fast_node(key)? {
                if fast.version_last_updated_at() <= self.version {
                    return Ok(Some(fast.value().to_vec()));
                }
            }
        }
        Ok(self.get_from_tree(key))
    }

    fn get_from_tree(&self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root.as_ref()?;
        let node = resolve(&self.ndb, root);
        get_in(&self.ndb, &node, key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Historical point read against a committed version. `None` when the
    /// version does not exist or the key was absent in it.
    pub fn get_versioned(&self, key: &[u8], version: Version) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.ndb.has_root(version)? {
            return Ok(None);
        }
        let tree = self.get_immutable(version)?;
        Ok(tree.get(key))
    }

    /// A read-only snapshot of a committed version. The snapshot counts as
    /// an active reader of that version until dropped.
    pub fn get_immutable(&self, version: Version) -> Result<ImmutableTree, StoreError> {
        let root = self
            .ndb
            .get_root(version)?
            .ok_or(StoreError::VersionNotFound(version))?;
        let root_hash = decode_root_hash(&root)?;
        Ok(ImmutableTree::new(self.ndb.clone(), root_hash, version))
    }

    /// In-order iteration over the working tree; `f` returns `true` to stop.
    /// Returns whether the walk was stopped early.
    pub fn iterate(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> bool {
        match &self.root {
            Some(child) => {
                let node = resolve(&self.ndb, child);
                iterate_in(&self.ndb, &node, &mut f)
            }
            None => false,
        }
    }

    /// Root hash of the working tree, computing node hashes as needed.
    pub fn working_hash(&mut self) -> Option<NodeHash> {
        match &mut self.root {
            None => None,
            Some(Child::Saved(h)) => Some(*h),
            Some(Child::Owned(node)) => Some(node.hash_recursive()),
        }
    }

    // --- writes ---

    /// Sets `key` to `value` in the working tree. Returns whether an
    /// existing value was overwritten.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> bool {
        let version = self.version + 1;
        let updated = match self.root.take() {
            None => {
                self.root = Some(Child::Owned(Box::new(Node::new_leaf(
                    key.to_vec(),
                    value.to_vec(),
                    version,
                ))));
                false
            }
            Some(root) => {
                let (node, updated) = self.recursive_set(root, key, value, version);
                self.root = Some(Child::Owned(node));
                updated
            }
        };
        self.unsaved_removals.remove(key);
        self.unsaved_additions.insert(
            key.to_vec(),
            FastNode::new(key.to_vec(), value.to_vec(), version),
        );
        updated
    }

    /// Removes `key` from the working tree, returning its value if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root.take()?;
        let version = self.version + 1;
        match self.recursive_remove(root, key, version) {
            RemoveOutcome::NotFound(child) => {
                self.root = Some(child);
                None
            }
            RemoveOutcome::Removed {
                replacement, value, ..
            } => {
                self.root = replacement;
                self.unsaved_additions.remove(key);
                self.unsaved_removals.insert(key.to_vec());
                Some(value)
            }
        }
    }

    fn recursive_set(
        &mut self,
        child: Child,
        key: &[u8],
        value: &[u8],
        version: Version,
    ) -> (Box<Node>, bool) {
        let node = self.resolve_owned(child);
        if node.is_leaf() {
            return match key.cmp(node.key()) {
                Ordering::Less => {
                    let inner = Node {
                        key: node.key().to_vec(),
                        value: Vec::new(),
                        version,
                        height: 1,
                        size: 2,
                        hash: None,
                        left: Some(Child::Owned(Box::new(Node::new_leaf(
                            key.to_vec(),
                            value.to_vec(),
                            version,
                        )))),
                        right: Some(Child::Owned(node)),
                        persisted: false,
                    };
                    (Box::new(inner), false)
                }
                Ordering::Greater => {
                    let inner = Node {
                        key: key.to_vec(),
                        value: Vec::new(),
                        version,
                        height: 1,
                        size: 2,
                        hash: None,
                        left: Some(Child::Owned(node)),
                        right: Some(Child::Owned(Box::new(Node::new_leaf(
                            key.to_vec(),
                            value.to_vec(),
                            version,
                        )))),
                        persisted: false,
                    };
                    (Box::new(inner), false)
                }
                Ordering::Equal => {
                    self.orphan(&node);
                    (
                        Box::new(Node::new_leaf(key.to_vec(), value.to_vec(), version)),
                        true,
                    )
                }
            };
        }

        // The whole path to the leaf is rebuilt at the working version.
        self.orphan(&node);
        let n = *node;
        let (old_left, old_right) = take_children(n.left, n.right);
        let (left, right, updated) = if key < n.key.as_slice() {
            let (new_left, updated) = self.recursive_set(old_left, key, value, version);
            (Child::Owned(new_left), old_right, updated)
        } else {
            let (new_right, updated) = self.recursive_set(old_right, key, value, version);
            (old_left, Child::Owned(new_right), updated)
        };
        let mut node = Box::new(Node {
            key: n.key,
            value: Vec::new(),
            version,
            height: n.height,
            size: n.size,
            hash: None,
            left: Some(left),
            right: Some(right),
            persisted: false,
        });
        if updated {
            (node, true)
        } else {
            self.calc_height_and_size(&mut node);
            (self.balance(node, version), false)
        }
    }

    fn recursive_remove(&mut self, child: Child, key: &[u8], version: Version) -> RemoveOutcome {
        let node = self.resolve_owned(child);
        if node.is_leaf() {
            return if key == node.key() {
                self.orphan(&node);
                RemoveOutcome::Removed {
                    replacement: None,
                    new_leftmost: None,
                    value: node.value,
                }
            } else {
                RemoveOutcome::NotFound(Child::Owned(node))
            };
        }

        let mut node = node;
        if key < node.key() {
            let old_left = node.left.take().expect("inner node missing left child");
            match self.recursive_remove(old_left, key, version) {
                RemoveOutcome::NotFound(left) => {
                    node.left = Some(left);
                    RemoveOutcome::NotFound(Child::Owned(node))
                }
                RemoveOutcome::Removed {
                    replacement: None,
                    value,
                    ..
                } => {
                    // The left subtree vanished: the right child takes this
                    // node's place, and its smallest key is the split key.
                    self.orphan(&node);
                    let new_leftmost = Some(node.key().to_vec());
                    RemoveOutcome::Removed {
                        replacement: node.right.take(),
                        new_leftmost,
                        value,
                    }
                }
                RemoveOutcome::Removed {
                    replacement: Some(left),
                    new_leftmost,
                    value,
                } => {
                    self.orphan(&node);
                    let n = *node;
                    let mut node = Box::new(Node {
                        key: n.key,
                        value: Vec::new(),
                        version,
                        height: n.height,
                        size: n.size,
                        hash: None,
                        left: Some(left),
                        right: n.right,
                        persisted: false,
                    });
                    self.calc_height_and_size(&mut node);
                    let node = self.balance(node, version);
                    RemoveOutcome::Removed {
                        replacement: Some(Child::Owned(node)),
                        new_leftmost,
                        value,
                    }
                }
            }
        } else {
            let old_right = node.right.take().expect("inner node missing right child");
            match self.recursive_remove(old_right, key, version) {
                RemoveOutcome::NotFound(right) => {
                    node.right = Some(right);
                    RemoveOutcome::NotFound(Child::Owned(node))
                }
                RemoveOutcome::Removed {
                    replacement: None,
                    value,
                    ..
                } => {
                    self.orphan(&node);
                    RemoveOutcome::Removed {
                        replacement: node.left.take(),
                        new_leftmost: None,
                        value,
                    }
                }
                RemoveOutcome::Removed {
                    replacement: Some(right),
                    new_leftmost,
                    value,
                } => {
                    self.orphan(&node);
                    let n = *node;
                    let mut node = Box::new(Node {
                        // The removed leaf may have been the right subtree's
                        // smallest key, which is exactly this split key.
                        key: new_leftmost.unwrap_or(n.key),
                        value: Vec::new(),
                        version,
                        height: n.height,
                        size: n.size,
                        hash: None,
                        left: n.left,
                        right: Some(right),
                        persisted: false,
                    });
                    self.calc_height_and_size(&mut node);
                    let node = self.balance(node, version);
                    RemoveOutcome::Removed {
                        replacement: Some(Child::Owned(node)),
                        new_leftmost: None,
                        value,
                    }
                }
            }
        }
    }

    /// Takes ownership of a child subtree root for editing. Persisted nodes
    /// are cloned out of the shared cache; the original stays immutable.
    fn resolve_owned(&self, child: Child) -> Box<Node> {
        match child {
            Child::Owned(node) => node,
            Child::Saved(hash) => Box::new((*self.ndb.get_node(&hash)).clone()),
        }
    }

    /// Records a displaced node. Only persisted nodes leave orphan records;
    /// a persisted node without a hash is a violated invariant.
    fn orphan(&mut self, node: &Node) {
        if !node.is_persisted() {
            return;
        }
        let hash = node
            .hash()
            .unwrap_or_else(|| panic!("expected persisted node to have a hash"));
        self.orphans.insert(hash, node.version());
    }

    fn child_dims(&self, child: &Child) -> (i8, u64) {
        match child {
            Child::Owned(node) => (node.height(), node.size()),
            Child::Saved(hash) => {
                let node = self.ndb.get_node(hash);
                (node.height(), node.size())
            }
        }
    }

    fn calc_height_and_size(&self, node: &mut Node) {
        let (lh, ls) = self.child_dims(node.left.as_ref().expect("inner node missing left child"));
        let (rh, rs) = self.child_dims(node.right.as_ref().expect("inner node missing right child"));
        node.height = 1 + lh.max(rh);
        node.size = ls + rs;
    }

    fn balance_factor(&self, node: &Node) -> i64 {
        let (lh, _) = self.child_dims(node.left.as_ref().expect("inner node missing left child"));
        let (rh, _) = self.child_dims(node.right.as_ref().expect("inner node missing right child"));
        lh as i64 - rh as i64
    }

    /// AVL rebalancing of a freshly rebuilt node. Rotations displace more
    /// persisted nodes, which are orphaned as they are pulled into the
    /// working set.
    fn balance(&mut self, mut node: Box<Node>, version: Version) -> Box<Node> {
        debug_assert!(!node.is_persisted(), "balancing a persisted node");
        let bf = self.balance_factor(&node);
        if bf > 1 {
            let left_bf = {
                let left = resolve(
                    &self.ndb,
                    node.left.as_ref().expect("inner node missing left child"),
                );
                self.balance_factor(&left)
            };
            if left_bf >= 0 {
                // left-left
                return self.rotate_right(node, version);
            }
            // left-right
            let old_left = node.left.take().expect("inner node missing left child");
            let left = self.working_child(old_left, version);
            let left = self.rotate_left(left, version);
            node.left = Some(Child::Owned(left));
            return self.rotate_right(node, version);
        }
        if bf < -1 {
            let right_bf = {
                let right = resolve(
                    &self.ndb,
                    node.right.as_ref().expect("inner node missing right child"),
                );
                self.balance_factor(&right)
            };
            if right_bf <= 0 {
                // right-right
                return self.rotate_left(node, version);
            }
            // right-left
            let old_right = node.right.take().expect("inner node missing right child");
            let right = self.working_child(old_right, version);
            let right = self.rotate_right(right, version);
            node.right = Some(Child::Owned(right));
            return self.rotate_left(node, version);
        }
        node
    }

    fn rotate_right(&mut self, mut node: Box<Node>, version: Version) -> Box<Node> {
        let old_left = node.left.take().expect("rotate_right requires left child");
        let mut new_root = self.working_child(old_left, version);
        node.left = new_root.right.take();
        self.calc_height_and_size(&mut node);
        new_root.right = Some(Child::Owned(node));
        self.calc_height_and_size(&mut new_root);
        new_root
    }

    fn rotate_left(&mut self, mut node: Box<Node>, version: Version) -> Box<Node> {
        let old_right = node.right.take().expect("rotate_left requires right child");
        let mut new_root = self.working_child(old_right, version);
        node.right = new_root.left.take();
        self.calc_height_and_size(&mut node);
        new_root.left = Some(Child::Owned(node));
        self.calc_height_and_size(&mut new_root);
        new_root
    }

    /// Pulls a child into the working set: orphans it if it was persisted
    /// and rebuilds it unhashed at the working version.
    fn working_child(&mut self, child: Child, version: Version) -> Box<Node> {
        let node = self.resolve_owned(child);
        self.orphan(&node);
        let n = *node;
        Box::new(Node {
            key: n.key,
            value: n.value,
            version,
            height: n.height,
            size: n.size,
            hash: None,
            left: n.left,
            right: n.right,
            persisted: false,
        })
    }

    // --- version lifecycle ---

    /// Persists the working tree as the next version and commits. Returns
    /// the new root hash (`None` for an empty tree) and the version.
    pub fn save_version(&mut self) -> Result<(Option<NodeHash>, Version), StoreError> {
        let version = self.version + 1;
        let root_hash = match &mut self.root {
            None => {
                // Clearing the tree still displaces nodes; they must be
                // orphaned or they can never be pruned.
                self.ndb.save_orphans(version, &self.orphans)?;
                self.ndb.save_empty_root(version)?;
                None
            }
            Some(Child::Saved(hash)) => {
                // No structural changes since the last load.
                let hash = *hash;
                self.ndb.save_orphans(version, &self.orphans)?;
                self.ndb.save_root_hash(Some(hash), version)?;
                Some(hash)
            }
            Some(Child::Owned(node)) => {
                let hash = self.ndb.save_branch(node)?;
                self.ndb.save_orphans(version, &self.orphans)?;
                self.ndb.save_root_hash(Some(hash), version)?;
                Some(hash)
            }
        };
        if self.ndb.has_upgraded_to_fast_storage() {
            self.save_fast_node_version()?;
        }
        self.ndb.commit()?;
        log::debug!(
            "saved version {version} with root {:?}",
            root_hash.map(hex::encode)
        );

        self.version = version;
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
        Ok((root_hash, version))
    }

    /// Flushes buffered fast-layer edits in key order and restamps the
    /// storage version with the new latest.
    fn save_fast_node_version(&mut self) -> Result<(), StoreError> {
        for node in self.unsaved_additions.values() {
            self.ndb.save_fast_node(node)?;
        }
        for key in &self.unsaved_removals {
            self.ndb.delete_fast_node(key)?;
        }
        self.ndb.set_fast_storage_version_to_batch()
    }

    /// Loads the latest saved version, upgrading the fast layer if needed.
    /// Returns 0 on an empty store.
    pub fn load_latest(&mut self) -> Result<Version, StoreError> {
        let latest = self.ndb.latest_version()?;
        if latest == 0 {
            self.auto_upgrade()?;
            return Ok(0);
        }
        self.load_version(latest)
    }

    /// Loads a specific committed version as the working base, upgrading the
    /// fast layer if needed.
    pub fn load_version(&mut self, version: Version) -> Result<Version, StoreError> {
        self.load_version_inner(version)?;
        self.auto_upgrade()?;
        Ok(version)
    }

    fn load_version_inner(&mut self, version: Version) -> Result<(), StoreError> {
        let root = self
            .ndb
            .get_root(version)?
            .ok_or(StoreError::VersionNotFound(version))?;
        self.root = decode_root_hash(&root)?.map(Child::Saved);
        self.version = version;
        self.orphans.clear();
        self.unsaved_additions.clear();
        self.unsaved_removals.clear();
        Ok(())
    }

    /// Loads `version` and destroys everything above it, so the next save
    /// produces `version + 1` again. Refuses while readers hold any of the
    /// rolled-back versions.
    pub fn load_version_for_overwriting(&mut self, version: Version) -> Result<Version, StoreError> {
        self.load_version_inner(version)?;
        self.ndb.delete_versions_from(version + 1)?;
        self.ndb.reset_latest_version(version);
        // Values rolled back on disk may still be current in the fast index;
        // rebuild it from the target version outright.
        self.reindex_fast_nodes(true)?;
        Ok(version)
    }

    /// Discards all uncommitted working state, restoring the last saved
    /// version.
    pub fn rollback(&mut self) -> Result<(), StoreError> {
        if self.version > 0 {
            self.load_version_inner(self.version)?;
        } else {
            self.root = None;
            self.orphans.clear();
            self.unsaved_additions.clear();
            self.unsaved_removals.clear();
        }
        Ok(())
    }

    /// Deletes a committed version. The latest version and versions with
    /// active readers are refused.
    pub fn delete_version(&mut self, version: Version) -> Result<(), StoreError> {
        if version == 0 {
            return Err(StoreError::VersionNotFound(0));
        }
        if version == self.version {
            return Err(StoreError::DeleteLatest(version));
        }
        if !self.ndb.has_root(version)? {
            return Err(StoreError::VersionNotFound(version));
        }
        self.ndb.delete_version(version, true)?;
        self.ndb.commit()
    }

    /// Deletes versions in `[from_version, to_version)` and commits.
    pub fn delete_versions_range(
        &mut self,
        from_version: Version,
        to_version: Version,
    ) -> Result<(), StoreError> {
        self.ndb.delete_versions_range(from_version, to_version)?;
        self.ndb.commit()
    }

    // --- fast-layer migration ---

    /// Brings the fast index in line with the storage-version contract:
    /// upgrade a legacy layout, or rebuild after detecting an aborted
    /// upgrade.
    fn auto_upgrade(&mut self) -> Result<(), StoreError> {
        let force = self.ndb.should_force_fast_storage_upgrade()?;
        if self.ndb.has_upgraded_to_fast_storage() && !force {
            return Ok(());
        }
        log::debug!(
            "upgrading storage layout {} to fast (forced: {force})",
            self.ndb.storage_version()
        );
        self.reindex_fast_nodes(force)
    }

    /// Rebuilds the fast index from the current tree, optionally purging all
    /// existing records first, then stamps the storage version and commits.
    fn reindex_fast_nodes(&mut self, purge: bool) -> Result<(), StoreError> {
        if purge {
            self.ndb.delete_all_fast_nodes()?;
        }
        if let Some(root) = &self.root {
            let node = resolve(&self.ndb, root);
            let mut result = Ok(());
            iterate_in(&self.ndb, &node, &mut |key, value| {
                let fast = FastNode::new(key.to_vec(), value.to_vec(), self.version);
                match self.ndb.save_fast_node_no_cache(&fast) {
                    Ok(()) => false,
                    Err(e) => {
                        result = Err(e);
                        true
                    }
                }
            });
            result?;
        }
        self.ndb.set_fast_storage_version_to_batch()?;
        self.ndb.commit()
    }
}

fn decode_root_hash(raw: &[u8]) -> Result<Option<NodeHash>, StoreError> {
    if raw.is_empty() {
        return Ok(None);
    }
    NodeHash::from_slice(raw)
        .map(Some)
        .ok_or_else(|| StoreError::Storage(StorageError::Decode("malformed root hash".into())))
}

fn take_children(left: Option<Child>, right: Option<Child>) -> (Child, Child) {
    (
        left.expect("inner node missing left child"),
        right.expect("inner node missing right child"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemDb;
    use crate::immutable::{left_of, right_of};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn tree() -> MutableTree {
        MutableTree::new(Arc::new(MemDb::new()), 64, Options::default())
    }

    /// Checks AVL balance, split keys, and height/size bookkeeping for the
    /// whole working tree.
    fn check_invariants(tree: &MutableTree) {
        fn check(tree: &MutableTree, node: &Node) -> (i8, u64, Vec<u8>) {
            if node.is_leaf() {
                assert_eq!(node.height(), 0);
                assert_eq!(node.size(), 1);
                return (0, 1, node.key().to_vec());
            }
            let left = left_of(tree.node_db(), node);
            let right = right_of(tree.node_db(), node);
            let (lh, ls, lmin) = check(tree, &left);
            let (rh, rs, rmin) = check(tree, &right);
            assert!(
                (lh as i64 - rh as i64).abs() <= 1,
                "unbalanced node {:?}",
                node.key()
            );
            assert_eq!(node.height(), 1 + lh.max(rh));
            assert_eq!(node.size(), ls + rs);
            assert_eq!(node.key(), rmin.as_slice(), "split key must be right min");
            assert!(lmin < rmin);
            (node.height(), node.size(), lmin)
        }
        if let Some(root) = tree.root_child() {
            let node = resolve(tree.node_db(), root);
            check(tree, &node);
        }
    }

    #[test]
    fn set_get_remove_round_trip() {
        let mut tree = tree();
        assert!(!tree.set(b"a", b"1"));
        assert!(!tree.set(b"b", b"2"));
        assert!(tree.set(b"a", b"1'"));

        assert_eq!(tree.get(b"a").unwrap(), Some(b"1'".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"c").unwrap(), None);

        assert_eq!(tree.remove(b"a"), Some(b"1'".to_vec()));
        assert_eq!(tree.remove(b"a"), None);
        assert_eq!(tree.get(b"a").unwrap(), None);
        check_invariants(&tree);
    }

    #[test]
    fn structure_stays_balanced_under_sequential_inserts() {
        let mut tree = tree();
        for i in 0u32..200 {
            tree.set(&i.to_be_bytes(), b"v");
        }
        check_invariants(&tree);
        assert_eq!(tree.size(), 200);

        for i in (0u32..200).step_by(2) {
            assert!(tree.remove(&i.to_be_bytes()).is_some());
        }
        check_invariants(&tree);
        assert_eq!(tree.size(), 100);
    }

    #[test]
    fn save_and_reload_preserves_values() {
        let db = Arc::new(MemDb::new());
        let mut tree = MutableTree::new(db.clone(), 64, Options::default());
        for i in 0u32..50 {
            tree.set(&i.to_be_bytes(), format!("value-{i}").as_bytes());
        }
        let (root, version) = tree.save_version().unwrap();
        assert_eq!(version, 1);
        let root = root.unwrap();

        let mut reloaded = MutableTree::new(db, 64, Options::default());
        assert_eq!(reloaded.load_latest().unwrap(), 1);
        for i in 0u32..50 {
            assert_eq!(
                reloaded.get(&i.to_be_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes())
            );
        }
        assert_eq!(reloaded.working_hash(), Some(root));
    }

    #[test]
    fn historical_reads_see_old_versions() {
        let mut tree = tree();
        tree.set(b"k", b"v1");
        tree.save_version().unwrap();
        tree.set(b"k", b"v2");
        tree.save_version().unwrap();
        tree.remove(b"k");
        tree.save_version().unwrap();

        assert_eq!(tree.get_versioned(b"k", 1).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tree.get_versioned(b"k", 2).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tree.get_versioned(b"k", 3).unwrap(), None);
        assert_eq!(tree.get_versioned(b"k", 9).unwrap(), None);
    }

    #[test]
    fn each_version_gets_its_own_root_hash() {
        let mut tree = tree();
        tree.set(b"k", b"v1");
        let (r1, _) = tree.save_version().unwrap();
        tree.set(b"k", b"v2");
        let (r2, _) = tree.save_version().unwrap();
        assert_ne!(r1, r2);

        let t1 = tree.get_immutable(1).unwrap();
        let t2 = tree.get_immutable(2).unwrap();
        assert_eq!(t1.root_hash(), r1);
        assert_eq!(t2.root_hash(), r2);
        assert_eq!(t1.get(b"k"), Some(b"v1".to_vec()));
        assert_eq!(t2.get(b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn unchanged_subtrees_are_shared_across_versions() {
        let mut tree = tree();
        for i in 0u32..20 {
            tree.set(&i.to_be_bytes(), b"v");
        }
        tree.save_version().unwrap();

        // One edit must not re-persist the whole tree: far subtrees keep
        // their node records (same hashes reachable from both roots).
        tree.set(&0u32.to_be_bytes(), b"v'");
        tree.save_version().unwrap();

        let t1 = tree.get_immutable(1).unwrap();
        let t2 = tree.get_immutable(2).unwrap();
        assert_eq!(t1.get(&0u32.to_be_bytes()), Some(b"v".to_vec()));
        assert_eq!(t2.get(&0u32.to_be_bytes()), Some(b"v'".to_vec()));
        assert_eq!(t1.get(&19u32.to_be_bytes()), Some(b"v".to_vec()));
        assert_eq!(t2.get(&19u32.to_be_bytes()), Some(b"v".to_vec()));
    }

    #[test]
    fn orphans_are_recorded_for_displaced_persisted_nodes() {
        let mut tree = tree();
        tree.set(b"a", b"1");
        tree.set(b"b", b"2");
        tree.save_version().unwrap();

        // Overwriting one key displaces its leaf and the root above it.
        tree.set(b"a", b"1'");
        assert_eq!(tree.orphans.len(), 2);
        for &from in tree.orphans.values() {
            assert_eq!(from, 1);
        }

        // Unsaved nodes churned inside the working version leave no orphans.
        tree.set(b"a", b"1''");
        assert_eq!(tree.orphans.len(), 2);
    }

    #[test]
    fn rollback_discards_working_state() {
        let mut tree = tree();
        tree.set(b"a", b"1");
        tree.save_version().unwrap();

        tree.set(b"a", b"2");
        tree.set(b"b", b"3");
        tree.rollback().unwrap();

        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), None);
        assert!(tree.orphans.is_empty());

        let (_, version) = tree.save_version().unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn load_latest_upgrades_to_fast_storage() {
        let db = Arc::new(MemDb::new());
        let mut tree = MutableTree::new(db.clone(), 64, Options::default());
        tree.set(b"a", b"1");
        tree.set(b"b", b"2");
        tree.save_version().unwrap();
        // The tree was never loaded, so the layout is still legacy.
        assert!(!tree.is_fast_storage_enabled());

        let mut reloaded = MutableTree::new(db, 64, Options::default());
        reloaded.load_latest().unwrap();
        assert!(reloaded.is_fast_storage_enabled());
        assert_eq!(reloaded.node_db().storage_version(), "1.1.0-1");

        let fast = reloaded.node_db().get_fast_node(b"a").unwrap().unwrap();
        assert_eq!(fast.value(), b"1");
        assert_eq!(fast.version_last_updated_at(), 1);
    }

    #[test]
    fn fast_index_tracks_saved_edits() {
        let db = Arc::new(MemDb::new());
        let mut tree = MutableTree::new(db, 64, Options::default());
        tree.load_latest().unwrap();
        assert!(tree.is_fast_storage_enabled());

        tree.set(b"a", b"1");
        tree.save_version().unwrap();
        tree.set(b"a", b"2");
        tree.remove(b"a");
        tree.set(b"b", b"3");
        tree.save_version().unwrap();

        let ndb = tree.node_db();
        assert!(ndb.get_fast_node(b"a").unwrap().is_none());
        let b = ndb.get_fast_node(b"b").unwrap().unwrap();
        assert_eq!(b.value(), b"3");
        assert_eq!(b.version_last_updated_at(), 2);
        assert_eq!(ndb.storage_version(), "1.1.0-2");
    }

    #[test]
    fn load_version_for_overwriting_rolls_back() {
        let db = Arc::new(MemDb::new());
        let mut tree = MutableTree::new(db.clone(), 64, Options::default());
        tree.load_latest().unwrap();
        for v in 1u32..=5 {
            tree.set(b"k", format!("v{v}").as_bytes());
            tree.set(format!("only-{v}").as_bytes(), b"x");
            tree.save_version().unwrap();
        }

        tree.load_version_for_overwriting(2).unwrap();
        assert_eq!(tree.version(), 2);
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tree.get(b"only-5").unwrap(), None);
        assert!(!tree.node_db().has_root(3).unwrap());

        // The fast index was rebuilt for version 2.
        let fast = tree.node_db().get_fast_node(b"k").unwrap().unwrap();
        assert_eq!(fast.value(), b"v2");

        // History continues from the overwritten version.
        tree.set(b"k", b"v3'");
        let (_, version) = tree.save_version().unwrap();
        assert_eq!(version, 3);
        assert_eq!(tree.get_versioned(b"k", 3).unwrap(), Some(b"v3'".to_vec()));
    }

    #[test]
    fn delete_version_guards() {
        let mut tree = tree();
        tree.set(b"a", b"1");
        tree.save_version().unwrap();
        tree.set(b"a", b"2");
        tree.save_version().unwrap();

        assert!(matches!(
            tree.delete_version(2),
            Err(StoreError::DeleteLatest(2))
        ));
        assert!(matches!(
            tree.delete_version(7),
            Err(StoreError::VersionNotFound(7))
        ));

        tree.delete_version(1).unwrap();
        // Deleting again is an error and leaves state intact.
        assert!(matches!(
            tree.delete_version(1),
            Err(StoreError::VersionNotFound(1))
        ));
        assert_eq!(tree.get_versioned(b"a", 2).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn snapshot_readers_block_deletion() {
        let mut tree = tree();
        tree.set(b"a", b"1");
        tree.save_version().unwrap();
        tree.set(b"a", b"2");
        tree.save_version().unwrap();

        let snapshot = tree.get_immutable(1).unwrap();
        assert!(matches!(
            tree.delete_version(1),
            Err(StoreError::ActiveReaders {
                version: 1,
                readers: 1
            })
        ));
        drop(snapshot);
        tree.delete_version(1).unwrap();
    }

    #[test]
    fn iterate_yields_sorted_keys() {
        let mut tree = tree();
        for key in [b"d", b"a", b"c", b"b"] {
            tree.set(key, b"v");
        }
        let mut keys = Vec::new();
        tree.iterate(|k, _| {
            keys.push(k.to_vec());
            false
        });
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    proptest! {
        #[test]
        fn behaves_like_a_sorted_map(ops in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 1..4), any::<Option<u8>>()),
            1..120,
        )) {
            let mut tree = tree();
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

            for (key, op) in ops {
                match op {
                    Some(v) => {
                        tree.set(&key, &[v]);
                        model.insert(key, vec![v]);
                    }
                    None => {
                        let removed = tree.remove(&key);
                        prop_assert_eq!(removed, model.remove(&key));
                    }
                }
            }

            check_invariants(&tree);
            prop_assert_eq!(tree.size(), model.len() as u64);
            for (key, value) in &model {
                prop_assert_eq!(tree.get(key).unwrap(), Some(value.clone()));
            }

            let mut iterated = Vec::new();
            tree.iterate(|k, v| {
                iterated.push((k.to_vec(), v.to_vec()));
                false
            });
            let expected: Vec<_> = model.into_iter().collect();
            prop_assert_eq!(iterated, expected);
        }
    }
}
