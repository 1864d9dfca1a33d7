// Path: crates/store/src/nodedb.rs

//! The node database: translates tree mutations into the backing store.
//!
//! Owns the write batch, both LRU caches, the latest-version counter, the
//! active-reader counts, and the storage-version string. Four key-format
//! prefixes carve the backing keyspace:
//!
//! - `'n' ‖ hash` — node records, indexed by content hash
//! - `'o' ‖ to_version ‖ from_version ‖ hash` — orphan records, keyed by
//!   expected lifetime: `to_version` is the last version the node was live
//!   at, `from_version` the version it was created at
//! - `'f' ‖ user_key` — fast-layer index records
//! - `'r' ‖ version` — root pointers
//! - `'m' ‖ name` — free-form metadata (the storage-version string)
//!
//! Version integers are big-endian so lexicographic order matches numeric
//! order; reverse scans find the largest version below a bound.
//!
//! All observable state transitions happen under one mutex. Missing or
//! undecodable node records for a hash that is still referenced are treated
//! as corruption and panic; see `error.rs`.

use crate::cache::BoundedCache;
use crate::error::StoreError;
use crate::fastnode::FastNode;
use crate::keyformat::{KeyField, KeyFormat, ScannedField};
use crate::node::{Child, Node};
use canopy_api::{KvBatch, KvIter, KvStore, NodeHash, StorageError, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const GENESIS_VERSION: Version = 1;

const STORAGE_VERSION_KEY: &[u8] = b"storage_version";
const DEFAULT_STORAGE_VERSION: &str = "1.0.0";
const FAST_STORAGE_VERSION: &str = "1.1.0";
const FAST_STORAGE_DELIMITER: char = '-';

static NODE_KEY_FORMAT: KeyFormat = KeyFormat::new(b'n', &[NodeHash::LEN]);
static ORPHAN_KEY_FORMAT: KeyFormat = KeyFormat::new(b'o', &[8, 8, NodeHash::LEN]);
static FAST_KEY_FORMAT: KeyFormat = KeyFormat::new(b'f', &[0]);
static METADATA_KEY_FORMAT: KeyFormat = KeyFormat::new(b'm', &[0]);
static ROOT_KEY_FORMAT: KeyFormat = KeyFormat::new(b'r', &[8]);

/// Store-wide options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Make commits durable before returning.
    pub sync: bool,
    /// Serve non-membership proofs from the fast index instead of walking
    /// the tree. Behaviorally identical; applies to the latest version only.
    pub fast_non_membership: bool,
}

struct Inner {
    batch: Box<dyn KvBatch>,
    latest_version: Version, // 0 = not yet computed
    storage_version: String,
    version_readers: HashMap<Version, u32>,
    node_cache: BoundedCache<NodeHash, Arc<Node>>,
    fast_node_cache: BoundedCache<Vec<u8>, Arc<FastNode>>,
}

/// Central node storage. Shared by the mutable tree and every snapshot.
pub struct NodeDb {
    db: Arc<dyn KvStore>,
    opts: Options,
    inner: Mutex<Inner>,
}

impl NodeDb {
    /// Both caches take `cache_size`; the storage-version string is loaded
    /// from metadata, defaulting to the legacy layout when absent or
    /// unreadable.
    pub fn new(db: Arc<dyn KvStore>, cache_size: usize, opts: Options) -> Self {
        let storage_version = match db.get(&Self::metadata_key(STORAGE_VERSION_KEY)) {
            Ok(Some(bytes)) => String::from_utf8(bytes).unwrap_or_else(|_| {
                log::warn!("storage version is not utf-8, assuming legacy layout");
                DEFAULT_STORAGE_VERSION.to_string()
            }),
            Ok(None) => DEFAULT_STORAGE_VERSION.to_string(),
            Err(e) => {
                log::warn!("failed to read storage version, assuming legacy layout: {e}");
                DEFAULT_STORAGE_VERSION.to_string()
            }
        };
        let batch = db.new_batch();
        Self {
            db,
            opts,
            inner: Mutex::new(Inner {
                batch,
                latest_version: 0,
                storage_version,
                version_readers: HashMap::new(),
                node_cache: BoundedCache::new(cache_size),
                fast_node_cache: BoundedCache::new(cache_size),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("node db mutex poisoned")
    }

    // --- key construction ---

    fn node_key(hash: &NodeHash) -> Vec<u8> {
        NODE_KEY_FORMAT.key_bytes(hash.as_bytes())
    }

    fn fast_node_key(key: &[u8]) -> Vec<u8> {
        FAST_KEY_FORMAT.key_bytes(key)
    }

    fn orphan_key(from_version: Version, to_version: Version, hash: &NodeHash) -> Vec<u8> {
        ORPHAN_KEY_FORMAT.key(&[
            KeyField::U64(to_version),
            KeyField::U64(from_version),
            KeyField::Bytes(hash.as_bytes()),
        ])
    }

    fn root_key(version: Version) -> Vec<u8> {
        ROOT_KEY_FORMAT.key(&[KeyField::U64(version)])
    }

    fn metadata_key(name: &[u8]) -> Vec<u8> {
        METADATA_KEY_FORMAT.key_bytes(name)
    }

    fn scan_orphan_key(key: &[u8]) -> Result<(Version, Version, NodeHash), StoreError> {
        let fields = ORPHAN_KEY_FORMAT.scan(key)?;
        match (&fields[0], &fields[1], &fields[2]) {
            (ScannedField::U64(to), ScannedField::U64(from), ScannedField::Bytes(h)) => {
                let hash = NodeHash::from_slice(h).ok_or_else(|| {
                    StoreError::Storage(StorageError::Decode("malformed orphan hash".into()))
                })?;
                Ok((*to, *from, hash))
            }
            _ => Err(StoreError::Storage(StorageError::Decode(
                "malformed orphan key".into(),
            ))),
        }
    }

    fn scan_root_key(key: &[u8]) -> Result<Version, StoreError> {
        let fields = ROOT_KEY_FORMAT.scan(key)?;
        fields[0].as_u64().ok_or_else(|| {
            StoreError::Storage(StorageError::Decode("malformed root key".into()))
        })
    }

    // --- node reads and writes ---

    /// Fetches a node by hash, from cache or disk. A missing record or a
    /// record that fails to decode means a referenced node is gone: that is
    /// corruption, and it panics.
    pub fn get_node(&self, hash: &NodeHash) -> Arc<Node> {
        let mut inner = self.lock();
        self.get_node_locked(&mut inner, hash)
    }

    fn get_node_locked(&self, inner: &mut Inner, hash: &NodeHash) -> Arc<Node> {
        if let Some(node) = inner.node_cache.get(hash) {
            return node.clone();
        }
        let buf = self
            .db
            .get(&Self::node_key(hash))
            .unwrap_or_else(|e| panic!("can't get node {}: {e}", hex::encode(hash)))
            .unwrap_or_else(|| panic!("value missing for node hash {}", hex::encode(hash)));
        let mut node = Node::decode(&buf)
            .unwrap_or_else(|e| panic!("error decoding node {}: {e}", hex::encode(hash)));
        node.hash = Some(*hash);
        node.persisted = true;
        let node = Arc::new(node);
        inner.node_cache.put(*hash, node.clone());
        node
    }

    /// Fetches a fast node by user key. `Ok(None)` when the key has no index
    /// record; an error when the fast layer is not enabled yet.
    pub fn get_fast_node(&self, key: &[u8]) -> Result<Option<Arc<FastNode>>, StoreError> {
        let mut inner = self.lock();
        if !is_fast(&inner.storage_version) {
            return Err(StoreError::NotFastStorage);
        }
        if key.is_empty() {
            return Err(StoreError::EmptyFastNodeKey);
        }
        if let Some(node) = inner.fast_node_cache.get(key) {
            return Ok(Some(node.clone()));
        }
        let Some(buf) = self.db.get(&Self::fast_node_key(key))? else {
            return Ok(None);
        };
        let node = Arc::new(FastNode::decode(key, &buf)?);
        inner.fast_node_cache.put(key.to_vec(), node.clone());
        Ok(Some(node))
    }

    /// Batches a node record under its hash and flips it to persisted.
    /// Calling this without a hash, or on an already persisted node, is a
    /// violated invariant and panics.
    pub fn save_node(&self, node: &mut Node) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.save_node_locked(&mut inner, node)
    }

    fn save_node_locked(&self, inner: &mut Inner, node: &mut Node) -> Result<(), StoreError> {
        let hash = node
            .hash
            .unwrap_or_else(|| panic!("expected to find node hash, but none found"));
        if node.persisted {
            panic!("shouldn't be calling save on an already persisted node");
        }
        let mut buf = Vec::with_capacity(node.encoded_size());
        node.write_bytes(&mut buf)?;
        inner.batch.set(&Self::node_key(&hash), &buf)?;
        log::trace!("batched node {}", hex::encode(hash));
        node.persisted = true;
        inner.node_cache.put(hash, Arc::new(node.detached()));
        Ok(())
    }

    /// Batches a fast node under its user key and caches it.
    pub fn save_fast_node(&self, node: &FastNode) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.save_fast_node_locked(&mut inner, node, true)
    }

    /// Batches a fast node without touching the cache; used by bulk
    /// reindexing, which would otherwise evict the whole cache.
    pub fn save_fast_node_no_cache(&self, node: &FastNode) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.save_fast_node_locked(&mut inner, node, false)
    }

    fn save_fast_node_locked(
        &self,
        inner: &mut Inner,
        node: &FastNode,
        cache: bool,
    ) -> Result<(), StoreError> {
        if node.key.is_empty() {
            return Err(StoreError::EmptyFastNodeKey);
        }
        let mut buf = Vec::with_capacity(node.encoded_size());
        node.write_bytes(&mut buf);
        inner.batch.set(&Self::fast_node_key(&node.key), &buf)?;
        if cache {
            inner
                .fast_node_cache
                .put(node.key.clone(), Arc::new(node.clone()));
        }
        Ok(())
    }

    /// Batch-deletes a fast node and evicts it from the cache.
    pub fn delete_fast_node(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.batch.delete(&Self::fast_node_key(key))?;
        inner.fast_node_cache.remove(key);
        Ok(())
    }

    /// Recursively persists a subtree and returns its hash. Already
    /// persisted nodes return their hash unchanged; owned child handles
    /// collapse to hashes as they are saved. Writes at the genesis version
    /// flush the batch eagerly to bound peak memory during initial import.
    pub fn save_branch(&self, node: &mut Node) -> Result<NodeHash, StoreError> {
        let mut inner = self.lock();
        self.save_branch_locked(&mut inner, node)
    }

    fn save_branch_locked(&self, inner: &mut Inner, node: &mut Node) -> Result<NodeHash, StoreError> {
        if node.persisted {
            return Ok(node
                .hash
                .unwrap_or_else(|| panic!("persisted node is missing its hash")));
        }
        if let Some(child) = node.left.take() {
            node.left = Some(match child {
                Child::Owned(mut n) => Child::Saved(self.save_branch_locked(inner, &mut n)?),
                saved => saved,
            });
        }
        if let Some(child) = node.right.take() {
            node.right = Some(match child {
                Child::Owned(mut n) => Child::Saved(self.save_branch_locked(inner, &mut n)?),
                saved => saved,
            });
        }
        let hash = node.hash_recursive();
        self.save_node_locked(inner, node)?;
        if node.version <= GENESIS_VERSION {
            self.reset_batch_locked(inner)?;
        }
        Ok(hash)
    }

    fn reset_batch_locked(&self, inner: &mut Inner) -> Result<(), StorageError> {
        if self.opts.sync {
            inner.batch.write_sync()?;
        } else {
            inner.batch.write()?;
        }
        inner.batch = self.db.new_batch();
        Ok(())
    }

    /// Writes the batch atomically (durably iff configured) and opens a
    /// fresh one.
    pub fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.reset_batch_locked(&mut inner)?;
        log::debug!("committed batch");
        Ok(())
    }

    // --- roots and versions ---

    /// Writes the root pointer for `version`. Only `latest + 1` is accepted,
    /// except that the very first version may be any positive integer.
    pub fn save_root(&self, root: &Node, version: Version) -> Result<(), StoreError> {
        let hash = root
            .hash
            .unwrap_or_else(|| panic!("save_root: root hash should not be empty"));
        self.save_root_hash(Some(hash), version)
    }

    /// Writes an empty-tree root pointer for `version`.
    pub fn save_empty_root(&self, version: Version) -> Result<(), StoreError> {
        self.save_root_hash(None, version)
    }

    pub(crate) fn save_root_hash(
        &self,
        hash: Option<NodeHash>,
        version: Version,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let latest = self.latest_version_locked(&mut inner)?;
        if latest > 0 && version != latest + 1 {
            return Err(StoreError::NonConsecutiveVersion {
                expected: latest + 1,
                got: version,
            });
        }
        let value = hash.map(|h| h.0.to_vec()).unwrap_or_default();
        inner.batch.set(&Self::root_key(version), &value)?;
        if inner.latest_version < version {
            inner.latest_version = version;
        }
        log::debug!("batched root for version {version}");
        Ok(())
    }

    /// Records the orphans displaced while building `version`: each node's
    /// lifetime ends at the predecessor of `version`. An orphan that expires
    /// before it was created is a violated invariant and panics.
    pub fn save_orphans(
        &self,
        version: Version,
        orphans: &HashMap<NodeHash, Version>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let to_version = self.previous_version_scan(version)?;
        for (hash, &from_version) in orphans {
            self.save_orphan_locked(&mut inner, hash, from_version, to_version)?;
        }
        Ok(())
    }

    fn save_orphan_locked(
        &self,
        inner: &mut Inner,
        hash: &NodeHash,
        from_version: Version,
        to_version: Version,
    ) -> Result<(), StoreError> {
        if from_version > to_version {
            panic!("orphan expires at {to_version} before it comes alive at {from_version}");
        }
        log::trace!(
            "orphan {} live [{from_version}, {to_version}]",
            hex::encode(hash)
        );
        inner
            .batch
            .set(&Self::orphan_key(from_version, to_version, hash), hash.as_bytes())?;
        Ok(())
    }

    /// Deletes a single version: its orphans, then its root pointer. The
    /// node the root points to is reclaimed transitively through orphan
    /// records, never here.
    pub fn delete_version(&self, version: Version, check_latest: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let readers = inner.version_readers.get(&version).copied().unwrap_or(0);
        if readers > 0 {
            return Err(StoreError::ActiveReaders { version, readers });
        }
        self.delete_orphans_locked(&mut inner, version)?;
        self.delete_root_locked(&mut inner, version, check_latest)?;
        Ok(())
    }

    /// Deletes versions in `[from_version, to_version)`. Orphans whose whole
    /// lifetime falls inside the window are reclaimed together with their
    /// nodes; orphans that predate it get their lifetime shortened to the
    /// window's predecessor. Fast-node disk records are left untouched: the
    /// current values remain valid when old versions are pruned.
    pub fn delete_versions_range(
        &self,
        from_version: Version,
        to_version: Version,
    ) -> Result<(), StoreError> {
        if from_version >= to_version || to_version == 0 {
            return Err(StoreError::InvalidVersionRange {
                from: from_version,
                to: to_version,
            });
        }

        let mut inner = self.lock();
        let latest = self.latest_version_locked(&mut inner)?;
        if latest < to_version {
            return Err(StoreError::DeleteLatest(latest));
        }
        let predecessor = self.previous_version_scan(from_version)?;
        for (&v, &readers) in &inner.version_readers {
            if v < to_version && v > predecessor && readers != 0 {
                return Err(StoreError::ActiveReaders {
                    version: v,
                    readers,
                });
            }
        }

        for version in from_version..to_version {
            let prefix = ORPHAN_KEY_FORMAT.key(&[KeyField::U64(version)]);
            let entries: Vec<_> = self.db.prefix_iterator(&prefix)?.collect();
            for (key, _) in entries {
                let (_, from, hash) = Self::scan_orphan_key(&key)?;
                inner.batch.delete(&key)?;
                if from > predecessor {
                    log::trace!("prune node {} from [{from}, {version}]", hex::encode(hash));
                    inner.batch.delete(&Self::node_key(&hash))?;
                    inner.node_cache.remove(&hash);
                } else {
                    self.save_orphan_locked(&mut inner, &hash, from, predecessor)?;
                }
            }
        }

        // Values written inside the window may still be current; only the
        // cached fast nodes stamped with a pruned version are evicted.
        let stale: Vec<Vec<u8>> = inner
            .fast_node_cache
            .iter()
            .filter(|(_, node)| {
                let v = node.version_last_updated_at;
                from_version <= v && v < to_version
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            inner.fast_node_cache.remove(&key);
        }

        let roots: Vec<_> = self
            .db
            .iterator(
                Some(&Self::root_key(from_version)),
                Some(&Self::root_key(to_version)),
            )?
            .collect();
        for (key, _) in roots {
            inner.batch.delete(&key)?;
        }
        Ok(())
    }

    /// Destructive rollback: deletes every version at or above `version`,
    /// including live nodes of the latest tree written at those versions,
    /// orphan records that reference them, root pointers, and fast nodes
    /// last updated inside the rolled-back range.
    pub fn delete_versions_from(&self, version: Version) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let latest = self.latest_version_locked(&mut inner)?;
        if latest < version {
            return Ok(());
        }
        let root = self
            .get_root(latest)?
            .ok_or(StoreError::VersionNotFound(latest))?;
        for (&v, &readers) in &inner.version_readers {
            if v >= version && readers != 0 {
                return Err(StoreError::ActiveReaders {
                    version: v,
                    readers,
                });
            }
        }

        // Nodes still live in the latest tree but written at or after the
        // rollback point.
        if !root.is_empty() {
            let root_hash = NodeHash::from_slice(&root).ok_or_else(|| {
                StoreError::Storage(StorageError::Decode("malformed root hash".into()))
            })?;
            self.delete_nodes_from_locked(&mut inner, version, &root_hash)?;
        }

        // Orphans created at or after the rollback point go away with their
        // nodes; orphans merely expiring inside it were not orphans after
        // all, so only the record is dropped.
        let orphans: Vec<_> = self
            .db
            .prefix_iterator(&ORPHAN_KEY_FORMAT.prefix_key())?
            .collect();
        for (key, _) in orphans {
            let (to, from, hash) = Self::scan_orphan_key(&key)?;
            if from >= version {
                inner.batch.delete(&key)?;
                inner.batch.delete(&Self::node_key(&hash))?;
            } else if to >= version.saturating_sub(1) {
                inner.batch.delete(&key)?;
            }
        }

        let roots: Vec<_> = self
            .db
            .iterator(
                Some(&Self::root_key(version)),
                Some(&Self::root_key(Version::MAX)),
            )?
            .collect();
        for (key, _) in roots {
            inner.batch.delete(&key)?;
        }

        let fast_nodes: Vec<_> = self
            .db
            .prefix_iterator(&FAST_KEY_FORMAT.prefix_key())?
            .collect();
        for (key, value) in fast_nodes {
            let user_key = &key[1..];
            let node = FastNode::decode(user_key, &value)?;
            if node.version_last_updated_at >= version {
                inner.batch.delete(&key)?;
                inner.fast_node_cache.remove(user_key);
            }
        }
        Ok(())
    }

    fn delete_nodes_from_locked(
        &self,
        inner: &mut Inner,
        version: Version,
        hash: &NodeHash,
    ) -> Result<(), StoreError> {
        let node = self.get_node_locked(inner, hash);
        if let Some(left) = node.left_hash() {
            self.delete_nodes_from_locked(inner, version, &left)?;
        }
        if let Some(right) = node.right_hash() {
            self.delete_nodes_from_locked(inner, version, &right)?;
        }
        if node.version >= version {
            inner.batch.delete(&Self::node_key(hash))?;
            inner.node_cache.remove(hash);
        }
        Ok(())
    }

    fn delete_orphans_locked(&self, inner: &mut Inner, version: Version) -> Result<(), StoreError> {
        let predecessor = self.previous_version_scan(version)?;
        let prefix = ORPHAN_KEY_FORMAT.key(&[KeyField::U64(version)]);
        let entries: Vec<_> = self.db.prefix_iterator(&prefix)?.collect();
        for (key, _) in entries {
            let (to, from, hash) = Self::scan_orphan_key(&key)?;
            inner.batch.delete(&key)?;

            // With no predecessor inside the lifetime the orphan dies here;
            // otherwise its endpoint moves back to the predecessor.
            if predecessor < from || from == to {
                log::trace!("prune node {} from [{from}, {to}]", hex::encode(hash));
                inner.batch.delete(&Self::node_key(&hash))?;
                inner.node_cache.remove(&hash);
            } else {
                log::trace!("shorten orphan {} to [{from}, {predecessor}]", hex::encode(hash));
                self.save_orphan_locked(inner, &hash, from, predecessor)?;
            }
        }
        Ok(())
    }

    fn delete_root_locked(
        &self,
        inner: &mut Inner,
        version: Version,
        check_latest: bool,
    ) -> Result<(), StoreError> {
        if check_latest && version == self.latest_version_locked(inner)? {
            return Err(StoreError::DeleteLatest(version));
        }
        inner.batch.delete(&Self::root_key(version))?;
        Ok(())
    }

    /// The latest saved version; lazily computed by a reverse scan over the
    /// root prefix and cached until reset.
    pub fn latest_version(&self) -> Result<Version, StoreError> {
        let mut inner = self.lock();
        self.latest_version_locked(&mut inner)
    }

    fn latest_version_locked(&self, inner: &mut Inner) -> Result<Version, StoreError> {
        if inner.latest_version == 0 {
            inner.latest_version = self.previous_version_scan(Version::MAX)?;
        }
        Ok(inner.latest_version)
    }

    /// Overrides the cached latest version after a rollback.
    pub fn reset_latest_version(&self, version: Version) {
        self.lock().latest_version = version;
    }

    /// The largest version strictly below `version` with a root record, or 0.
    pub fn previous_version(&self, version: Version) -> Result<Version, StoreError> {
        self.previous_version_scan(version)
    }

    fn previous_version_scan(&self, version: Version) -> Result<Version, StoreError> {
        if version <= 1 {
            return Ok(0);
        }
        let mut iter = self
            .db
            .reverse_iterator(Some(&Self::root_key(1)), Some(&Self::root_key(version)))?;
        match iter.next() {
            Some((key, _)) => Self::scan_root_key(&key),
            None => Ok(0),
        }
    }

    pub fn has_root(&self, version: Version) -> Result<bool, StoreError> {
        Ok(self.db.has(&Self::root_key(version))?)
    }

    /// The raw root hash bytes for `version`; `Some` and empty for an empty
    /// tree, `None` when the version does not exist.
    pub fn get_root(&self, version: Version) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(&Self::root_key(version))?)
    }

    /// Every root record, keyed by version.
    pub fn get_roots(&self) -> Result<BTreeMap<Version, Vec<u8>>, StoreError> {
        let mut roots = BTreeMap::new();
        for (key, value) in self.db.prefix_iterator(&ROOT_KEY_FORMAT.prefix_key())? {
            roots.insert(Self::scan_root_key(&key)?, value);
        }
        Ok(roots)
    }

    // --- reader accounting ---

    /// Protects `version` from pruning while a long read is outstanding.
    pub fn increment_version_readers(&self, version: Version) {
        *self.lock().version_readers.entry(version).or_insert(0) += 1;
    }

    pub fn decrement_version_readers(&self, version: Version) {
        let mut inner = self.lock();
        if let Some(count) = inner.version_readers.get_mut(&version) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.version_readers.remove(&version);
            }
        }
    }

    // --- storage version ---

    pub fn storage_version(&self) -> String {
        self.lock().storage_version.clone()
    }

    /// Whether the fast-enabled layout is in place.
    pub fn has_upgraded_to_fast_storage(&self) -> bool {
        is_fast(&self.lock().storage_version)
    }

    /// Whether a prior upgrade no longer matches the live state: the version
    /// suffix recorded at the last fast-layer flush differs from the actual
    /// latest version, as happens after an aborted upgrade or a
    /// downgrade-reupgrade cycle.
    pub fn should_force_fast_storage_upgrade(&self) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let storage_version = inner.storage_version.clone();
        let parts: Vec<&str> = storage_version.split(FAST_STORAGE_DELIMITER).collect();
        if parts.len() == 2 {
            let latest = self.latest_version_locked(&mut inner)?;
            if parts[1] != latest.to_string() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Batches the storage-version string as `<fast version>-<latest>`. The
    /// in-memory string only changes once the batch write is accepted.
    pub fn set_fast_storage_version_to_batch(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let storage_version = inner.storage_version.clone();

        let mut new_version = if storage_version.as_str() >= FAST_STORAGE_VERSION {
            let parts: Vec<&str> = storage_version.split(FAST_STORAGE_DELIMITER).collect();
            if parts.len() > 2 {
                return Err(StoreError::InvalidFastStorageVersion);
            }
            parts[0].to_string()
        } else {
            FAST_STORAGE_VERSION.to_string()
        };

        let latest = self.latest_version_locked(&mut inner)?;
        new_version.push(FAST_STORAGE_DELIMITER);
        new_version.push_str(&latest.to_string());

        inner
            .batch
            .set(&Self::metadata_key(STORAGE_VERSION_KEY), new_version.as_bytes())?;
        inner.storage_version = new_version;
        Ok(())
    }

    // --- fast index scans ---

    /// Raw iterator over the fast index restricted to `[start, end)` user
    /// keys; yields database keys (prefix byte included).
    pub(crate) fn fast_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<KvIter, StoreError> {
        let start_key = match start {
            Some(s) => Self::fast_node_key(s),
            None => FAST_KEY_FORMAT.prefix_key(),
        };
        let end_key = match end {
            Some(e) => Self::fast_node_key(e),
            None => {
                let mut k = FAST_KEY_FORMAT.prefix_key();
                k[0] += 1;
                k
            }
        };
        let iter = if ascending {
            self.db.iterator(Some(&start_key), Some(&end_key))?
        } else {
            self.db.reverse_iterator(Some(&start_key), Some(&end_key))?
        };
        Ok(iter)
    }

    /// Batch-deletes every fast-node record, evicting as it goes. Used when
    /// a forced re-upgrade must drop a stale index.
    pub(crate) fn delete_all_fast_nodes(&self) -> Result<(), StoreError> {
        let entries: Vec<Vec<u8>> = self
            .db
            .prefix_iterator(&FAST_KEY_FORMAT.prefix_key())?
            .map(|(key, _)| key)
            .collect();
        let mut inner = self.lock();
        for key in entries {
            inner.batch.delete(&key)?;
            let user_key = key[1..].to_vec();
            inner.fast_node_cache.remove(&user_key);
        }
        Ok(())
    }
}

fn is_fast(storage_version: &str) -> bool {
    storage_version >= FAST_STORAGE_VERSION
}
