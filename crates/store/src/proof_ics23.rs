// Path: crates/store/src/proof_ics23.rs

//! Conversion of range proofs into ICS23 commitment proofs.
//!
//! The leaf op commits to `varint(0) ‖ varint(1) ‖ varint(version)` (height,
//! size, version of a leaf) with a VAR_PROTO length op and SHA-256
//! pre-hashed values. Inner ops are emitted leaf-to-root, reversing the
//! range proof's root-to-leaf path; the byte `0x20` is the SHA-256 length
//! prefix carried by every child hash.

use crate::encoding::write_varint;
use crate::error::StoreError;
use crate::immutable::{get_by_index_in, get_with_index_in, resolve, ImmutableTree};
use crate::mutable::MutableTree;
use crate::node::Node;
use crate::nodedb::NodeDb;
use crate::proof::{range_proof_in, ProofInnerNode, RangeProof};
use canopy_api::Version;
use ics23::commitment_proof::Proof;
use ics23::{CommitmentProof, ExistenceProof, HashOp, InnerOp, LeafOp, LengthOp, NonExistenceProof};

/// SHA-256 output length, prepended to each child hash per ICS23.
const LENGTH_BYTE: u8 = 0x20;

/// Converts a single-leaf range proof into an ICS23 existence proof.
pub fn convert_existence_proof(
    proof: &RangeProof,
    key: &[u8],
    value: &[u8],
) -> Result<ExistenceProof, StoreError> {
    if proof.leaves.len() != 1 {
        return Err(StoreError::RangeProofLeaves(proof.leaves.len()));
    }
    Ok(ExistenceProof {
        key: key.to_vec(),
        value: value.to_vec(),
        leaf: Some(convert_leaf_op(proof.leaves[0].version)),
        path: convert_inner_ops(&proof.left_path),
    })
}

fn convert_leaf_op(version: Version) -> LeafOp {
    // Mirrors the leaf hash preimage: height 0, size 1, then the version.
    let mut prefix = Vec::new();
    write_varint(&mut prefix, 0);
    write_varint(&mut prefix, 1);
    write_varint(&mut prefix, version as i64);

    LeafOp {
        hash: HashOp::Sha256 as i32,
        prehash_key: HashOp::NoHash as i32,
        prehash_value: HashOp::Sha256 as i32,
        length: LengthOp::VarProto as i32,
        prefix,
    }
}

fn convert_inner_ops(path: &[ProofInnerNode]) -> Vec<InnerOp> {
    let mut steps = Vec::with_capacity(path.len());

    // The range proof runs root to leaf; ICS23 applies ops leaf to root.
    for step in path.iter().rev() {
        let mut prefix = Vec::new();
        write_varint(&mut prefix, step.height as i64);
        write_varint(&mut prefix, step.size as i64);
        write_varint(&mut prefix, step.version as i64);

        let mut suffix = Vec::new();
        if !step.left.is_empty() {
            // The walk took the right branch: the left sibling lands in the
            // prefix, and the child slot opens after it.
            prefix.push(LENGTH_BYTE);
            prefix.extend_from_slice(&step.left);
            prefix.push(LENGTH_BYTE);
        } else {
            prefix.push(LENGTH_BYTE);
            suffix.push(LENGTH_BYTE);
            suffix.extend_from_slice(&step.right);
        }

        steps.push(InnerOp {
            hash: HashOp::Sha256 as i32,
            prefix,
            suffix,
        });
    }
    steps
}

fn wrap_existence(proof: ExistenceProof) -> CommitmentProof {
    CommitmentProof {
        proof: Some(Proof::Exist(proof)),
    }
}

fn wrap_non_existence(proof: NonExistenceProof) -> CommitmentProof {
    CommitmentProof {
        proof: Some(Proof::Nonexist(proof)),
    }
}

fn create_existence_in(
    ndb: &NodeDb,
    root: &Node,
    key: &[u8],
) -> Result<ExistenceProof, StoreError> {
    let (value, proof) = range_proof_in(ndb, root, key);
    let value = value.ok_or(StoreError::KeyNotInState)?;
    convert_existence_proof(&proof, key, &value)
}

fn non_membership_in(
    ndb: &NodeDb,
    root: Option<&Node>,
    key: &[u8],
    use_fast: bool,
) -> Result<NonExistenceProof, StoreError> {
    let Some(root) = root else {
        // An empty tree has no neighbors to anchor the proof to.
        return Ok(NonExistenceProof {
            key: key.to_vec(),
            left: None,
            right: None,
        });
    };
    if use_fast {
        non_membership_fast_in(ndb, root, key)
    } else {
        non_membership_tree_in(ndb, root, key)
    }
}

/// Locates the key's insertion point by tree descent and proves both
/// neighbors.
fn non_membership_tree_in(
    ndb: &NodeDb,
    root: &Node,
    key: &[u8],
) -> Result<NonExistenceProof, StoreError> {
    let (index, value) = get_with_index_in(ndb, root, key);
    if value.is_some() {
        return Err(StoreError::KeyInState);
    }

    let mut proof = NonExistenceProof {
        key: key.to_vec(),
        left: None,
        right: None,
    };
    if index >= 1 {
        if let Some((left_key, _)) = get_by_index_in(ndb, root, index - 1) {
            proof.left = Some(create_existence_in(ndb, root, &left_key)?);
        }
    }
    if let Some((right_key, _)) = get_by_index_in(ndb, root, index) {
        proof.right = Some(create_existence_in(ndb, root, &right_key)?);
    }
    Ok(proof)
}

/// Locates the key's immediate neighbors by scanning the fast index instead
/// of descending the tree. Behaviorally identical to the tree walk; only
/// valid when the index reflects the proven version.
fn non_membership_fast_in(
    ndb: &NodeDb,
    root: &Node,
    key: &[u8],
) -> Result<NonExistenceProof, StoreError> {
    let prev_key = ndb
        .fast_iterator(None, Some(key), false)?
        .next()
        .map(|(db_key, _)| db_key[1..].to_vec());

    let mut next_key = None;
    if let Some((db_key, _)) = ndb.fast_iterator(Some(key), None, true)?.next() {
        let user_key = db_key[1..].to_vec();
        if user_key == key {
            return Err(StoreError::KeyInState);
        }
        next_key = Some(user_key);
    }

    let mut proof = NonExistenceProof {
        key: key.to_vec(),
        left: None,
        right: None,
    };
    if let Some(k) = prev_key {
        proof.left = Some(create_existence_in(ndb, root, &k)?);
    }
    if let Some(k) = next_key {
        proof.right = Some(create_existence_in(ndb, root, &k)?);
    }
    Ok(proof)
}

impl ImmutableTree {
    /// A commitment proof that `key` exists in this version with its value.
    pub fn get_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof, StoreError> {
        let root = self.root_node().ok_or(StoreError::KeyNotInState)?;
        let proof = create_existence_in(self.node_db(), &root, key)?;
        Ok(wrap_existence(proof))
    }

    /// A commitment proof that `key` is absent from this version, anchored
    /// to its in-order neighbors.
    pub fn get_non_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof, StoreError> {
        let ndb = self.node_db();
        let use_fast = ndb.options().fast_non_membership
            && ndb.has_upgraded_to_fast_storage()
            && self.version() == ndb.latest_version()?;
        let root = self.root_node();
        let proof = non_membership_in(ndb, root.as_deref(), key, use_fast)?;
        Ok(wrap_non_existence(proof))
    }
}

impl MutableTree {
    /// A commitment proof that `key` exists in the working tree, anchored to
    /// the working root hash.
    pub fn get_membership_proof(&mut self, key: &[u8]) -> Result<CommitmentProof, StoreError> {
        self.working_hash();
        let root = self.root_child().ok_or(StoreError::KeyNotInState)?;
        let root = resolve(self.node_db(), root);
        let proof = create_existence_in(self.node_db(), &root, key)?;
        Ok(wrap_existence(proof))
    }

    /// A commitment proof that `key` is absent from the working tree.
    pub fn get_non_membership_proof(&mut self, key: &[u8]) -> Result<CommitmentProof, StoreError> {
        self.working_hash();
        let use_fast = self.fast_proof_eligible()?;
        let root = self.root_child().map(|c| resolve(self.node_db(), c));
        let proof = non_membership_in(self.node_db(), root.as_deref(), key, use_fast)?;
        Ok(wrap_non_existence(proof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemDb;
    use crate::nodedb::Options;
    use crate::proof::ProofLeafNode;
    use std::sync::Arc;

    fn tree_with(pairs: &[(&[u8], &[u8])]) -> MutableTree {
        let mut tree = MutableTree::new(Arc::new(MemDb::new()), 64, Options::default());
        for (k, v) in pairs {
            tree.set(k, v);
        }
        tree
    }

    #[test]
    fn leaf_op_prefix_is_height_size_version() {
        let leaf = convert_leaf_op(5);
        // zigzag varints: 0 -> 0x00, 1 -> 0x02, 5 -> 0x0a
        assert_eq!(leaf.prefix, vec![0x00, 0x02, 0x0a]);
        assert_eq!(leaf.hash, HashOp::Sha256 as i32);
        assert_eq!(leaf.prehash_key, HashOp::NoHash as i32);
        assert_eq!(leaf.prehash_value, HashOp::Sha256 as i32);
        assert_eq!(leaf.length, LengthOp::VarProto as i32);
    }

    #[test]
    fn inner_ops_reverse_path_and_place_siblings() {
        let path = vec![
            ProofInnerNode {
                height: 2,
                size: 3,
                version: 1,
                left: vec![0xaa; 32],
                right: Vec::new(),
            },
            ProofInnerNode {
                height: 1,
                size: 2,
                version: 1,
                left: Vec::new(),
                right: vec![0xbb; 32],
            },
        ];
        let ops = convert_inner_ops(&path);
        assert_eq!(ops.len(), 2);

        // Leaf-to-root: the deepest step comes first.
        let first = &ops[0];
        assert_eq!(&first.prefix[..3], &[0x02, 0x04, 0x02]);
        assert_eq!(first.prefix[3], 0x20);
        assert_eq!(first.suffix[0], 0x20);
        assert_eq!(&first.suffix[1..], &[0xbb; 32]);

        let second = &ops[1];
        assert_eq!(&second.prefix[..3], &[0x04, 0x06, 0x02]);
        assert_eq!(second.prefix[3], 0x20);
        assert_eq!(&second.prefix[4..36], &[0xaa; 32]);
        assert_eq!(second.prefix[36], 0x20);
        assert!(second.suffix.is_empty());
    }

    #[test]
    fn existence_conversion_requires_one_leaf() {
        let empty = RangeProof::default();
        assert!(matches!(
            convert_existence_proof(&empty, b"k", b"v"),
            Err(StoreError::RangeProofLeaves(0))
        ));

        let two = RangeProof {
            left_path: Vec::new(),
            leaves: vec![
                ProofLeafNode {
                    key: b"a".to_vec(),
                    value_hash: vec![0; 32],
                    version: 1,
                },
                ProofLeafNode {
                    key: b"b".to_vec(),
                    value_hash: vec![0; 32],
                    version: 1,
                },
            ],
        };
        assert!(matches!(
            convert_existence_proof(&two, b"k", b"v"),
            Err(StoreError::RangeProofLeaves(2))
        ));
    }

    #[test]
    fn converted_existence_proof_recomputes_the_root() {
        let mut tree = tree_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")]);
        let root = tree.working_hash().unwrap();

        let proof = tree.get_membership_proof(b"c").unwrap();
        let Some(Proof::Exist(exist)) = proof.proof else {
            panic!("expected existence proof");
        };
        let calculated =
            ics23::calculate_existence_root::<ics23::HostFunctionsManager>(&exist).unwrap();
        assert_eq!(calculated.as_slice(), root.as_bytes());
    }

    #[test]
    fn membership_proof_for_absent_key_is_refused() {
        let mut tree = tree_with(&[(b"a", b"1")]);
        assert!(matches!(
            tree.get_membership_proof(b"zz"),
            Err(StoreError::KeyNotInState)
        ));
    }

    #[test]
    fn non_membership_proof_for_present_key_is_refused() {
        let mut tree = tree_with(&[(b"a", b"1")]);
        assert!(matches!(
            tree.get_non_membership_proof(b"a"),
            Err(StoreError::KeyInState)
        ));
    }

    #[test]
    fn non_membership_edges_carry_one_neighbor() {
        let mut tree = tree_with(&[(b"b", b"1"), (b"c", b"2"), (b"d", b"3")]);

        let proof = tree.get_non_membership_proof(b"a").unwrap();
        let Some(Proof::Nonexist(nonexist)) = proof.proof else {
            panic!("expected non-existence proof");
        };
        assert!(nonexist.left.is_none());
        assert_eq!(nonexist.right.unwrap().key, b"b");

        let proof = tree.get_non_membership_proof(b"e").unwrap();
        let Some(Proof::Nonexist(nonexist)) = proof.proof else {
            panic!("expected non-existence proof");
        };
        assert_eq!(nonexist.left.unwrap().key, b"d");
        assert!(nonexist.right.is_none());
    }

    #[test]
    fn fast_variant_finds_the_same_neighbors() {
        let db = Arc::new(MemDb::new());
        let opts = Options {
            fast_non_membership: true,
            ..Options::default()
        };
        let mut tree = MutableTree::new(db, 64, opts);
        tree.load_latest().unwrap();
        for (k, v) in [(b"b", b"1"), (b"d", b"2"), (b"f", b"3")] {
            tree.set(k, v);
        }
        tree.save_version().unwrap();
        assert!(tree.fast_proof_eligible().unwrap());

        let proof = tree.get_non_membership_proof(b"c").unwrap();
        let Some(Proof::Nonexist(fast)) = proof.proof else {
            panic!("expected non-existence proof");
        };

        // The tree-walk variant must produce the identical proof.
        let slow = non_membership_tree_in(
            tree.node_db(),
            &resolve(tree.node_db(), tree.root_child().unwrap()),
            b"c",
        )
        .unwrap();
        assert_eq!(fast, slow);
        assert_eq!(fast.left.as_ref().unwrap().key, b"b");
        assert_eq!(fast.right.as_ref().unwrap().key, b"d");
    }
}
