// Path: crates/store/src/proof.rs

//! Range-proof production by tree traversal.
//!
//! A single-key range proof is the ordered path of inner steps from the root
//! down to one leaf descriptor. Each step carries the sibling hash on the
//! side the walk did not take; recomputing hashes leaf-to-root reproduces the
//! version's root hash. Conversion to the ICS23 wire form lives in
//! `proof_ics23.rs`.

use crate::error::StoreError;
use crate::immutable::{resolve, ImmutableTree, NodeRef};
use crate::node::Node;
use crate::nodedb::NodeDb;
use canopy_api::Version;
use parity_scale_codec::{Decode, Encode};
use sha2::{Digest, Sha256};

/// One inner step of a proof path, root-to-leaf order. Exactly one of
/// `left` / `right` carries the sibling hash; the other is empty.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProofInnerNode {
    pub height: i8,
    pub size: u64,
    pub version: Version,
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

/// The leaf a proof path terminates in. Carries the SHA-256 of the value,
/// not the value itself.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProofLeafNode {
    pub key: Vec<u8>,
    pub value_hash: Vec<u8>,
    pub version: Version,
}

/// A proof produced by tree traversal: the left path of inner steps and the
/// visited leaves. Single-key proofs carry exactly one leaf.
#[derive(Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeProof {
    pub left_path: Vec<ProofInnerNode>,
    pub leaves: Vec<ProofLeafNode>,
}

/// Walks from `node` to the leaf position of `key`, recording inner steps.
/// Returns the value when the visited leaf is `key` itself; otherwise the
/// leaf descriptor belongs to the neighbor at the key's insertion point.
pub(crate) fn range_proof_in(
    ndb: &NodeDb,
    node: &Node,
    key: &[u8],
) -> (Option<Vec<u8>>, RangeProof) {
    let mut left_path = Vec::new();
    let (value, leaf) = build_path(ndb, node, key, &mut left_path);
    (
        value,
        RangeProof {
            left_path,
            leaves: vec![leaf],
        },
    )
}

fn build_path(
    ndb: &NodeDb,
    node: &Node,
    key: &[u8],
    path: &mut Vec<ProofInnerNode>,
) -> (Option<Vec<u8>>, ProofLeafNode) {
    if node.is_leaf() {
        let leaf = ProofLeafNode {
            key: node.key().to_vec(),
            value_hash: Sha256::digest(node.value()).to_vec(),
            version: node.version(),
        };
        let value = (key == node.key()).then(|| node.value().to_vec());
        return (value, leaf);
    }

    let sibling = |hash: Option<canopy_api::NodeHash>| -> Vec<u8> {
        hash.unwrap_or_else(|| panic!("proof walk over unhashed tree"))
            .as_bytes()
            .to_vec()
    };

    let next: NodeRef<'_>;
    if key < node.key() {
        path.push(ProofInnerNode {
            height: node.height(),
            size: node.size(),
            version: node.version(),
            left: Vec::new(),
            right: sibling(node.right_hash()),
        });
        next = resolve(ndb, node.left.as_ref().expect("inner node missing left child"));
    } else {
        path.push(ProofInnerNode {
            height: node.height(),
            size: node.size(),
            version: node.version(),
            left: sibling(node.left_hash()),
            right: Vec::new(),
        });
        next = resolve(ndb, node.right.as_ref().expect("inner node missing right child"));
    }
    build_path(ndb, &next, key, path)
}

impl ImmutableTree {
    /// The value under `key` (when present) together with a single-leaf range
    /// proof anchored at this version's root. On an empty tree the proof has
    /// no leaves.
    pub fn get_with_proof(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, RangeProof), StoreError> {
        match self.root_node() {
            Some(root) => Ok(range_proof_in(self.node_db(), &root, key)),
            None => Ok((None, RangeProof::default())),
        }
    }
}
