// Path: crates/store/tests/proofs_ics23.rs

//! End-to-end proof checks against the ICS23 IAVL spec: every proof the
//! store produces must verify with the stock `ics23` verifier and the
//! unmodified `iavl_spec`.

use canopy_store::backend::MemDb;
use canopy_store::{convert_existence_proof, MutableTree, Options};
use ics23::commitment_proof::Proof;
use ics23::HostFunctionsManager;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

#[derive(Clone, Copy)]
enum Loc {
    Left,
    Middle,
    Right,
}

/// Builds a tree of `size` random 4-byte keys; returns the sorted distinct
/// keys alongside it.
fn build_tree(size: usize, seed: u64) -> (MutableTree, Vec<Vec<u8>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = MutableTree::new(Arc::new(MemDb::new()), 0, Options::default());
    let mut keys = Vec::with_capacity(size);
    for _ in 0..size {
        let key: [u8; 4] = rng.gen();
        let value = format!("value_for_key:{}", hex::encode(key));
        tree.set(&key, value.as_bytes());
        keys.push(key.to_vec());
    }
    keys.sort();
    keys.dedup();
    (tree, keys)
}

fn pick_key(keys: &[Vec<u8>], loc: Loc, rng: &mut StdRng) -> Vec<u8> {
    match loc {
        Loc::Left => keys[0].clone(),
        Loc::Right => keys[keys.len() - 1].clone(),
        Loc::Middle => keys[rng.gen_range(1..keys.len() - 1)].clone(),
    }
}

/// A key guaranteed absent: beyond either edge, or right next to an
/// existing key.
fn pick_non_key(keys: &[Vec<u8>], loc: Loc, rng: &mut StdRng) -> Vec<u8> {
    match loc {
        Loc::Left => vec![0x00, 0x00, 0x00, 0x01],
        Loc::Right => vec![0xff, 0xff, 0xff, 0xff],
        Loc::Middle => {
            let mut key = pick_key(keys, Loc::Middle, rng);
            let n = key.len();
            key[n - 2] = 255;
            key[n - 1] = 255;
            if keys.contains(&key) {
                key.push(0);
            }
            key
        }
    }
}

fn check_membership(size: usize, loc: Loc) {
    let mut rng = StdRng::seed_from_u64(size as u64 ^ 0xC0FFEE);
    let (mut tree, keys) = build_tree(size, size as u64);
    let key = pick_key(&keys, loc, &mut rng);
    let value = tree.get(&key).unwrap().expect("picked key must exist");

    let proof = tree.get_membership_proof(&key).unwrap();
    let root = tree.working_hash().unwrap().as_bytes().to_vec();
    assert!(
        ics23::verify_membership::<HostFunctionsManager>(
            &proof,
            &ics23::iavl_spec(),
            &root,
            &key,
            &value,
        ),
        "membership proof failed for {}",
        hex::encode(&key)
    );
}

fn check_non_membership(size: usize, loc: Loc) {
    let mut rng = StdRng::seed_from_u64(size as u64 ^ 0xBEEF);
    let (mut tree, keys) = build_tree(size, size as u64);
    let key = pick_non_key(&keys, loc, &mut rng);
    assert_eq!(tree.get(&key).unwrap(), None);

    let proof = tree.get_non_membership_proof(&key).unwrap();
    let root = tree.working_hash().unwrap().as_bytes().to_vec();
    assert!(
        ics23::verify_non_membership::<HostFunctionsManager>(
            &proof,
            &ics23::iavl_spec(),
            &root,
            &key,
        ),
        "non-membership proof failed for {}",
        hex::encode(&key)
    );
}

#[test]
fn membership_small_left() {
    check_membership(100, Loc::Left);
}

#[test]
fn membership_small_middle() {
    check_membership(100, Loc::Middle);
}

#[test]
fn membership_small_right() {
    check_membership(100, Loc::Right);
}

#[test]
fn membership_200_random_key() {
    check_membership(200, Loc::Middle);
}

#[test]
fn membership_big_left() {
    check_membership(5431, Loc::Left);
}

#[test]
fn membership_big_middle() {
    check_membership(5431, Loc::Middle);
}

#[test]
fn membership_big_right() {
    check_membership(5431, Loc::Right);
}

#[test]
fn non_membership_small_all_locations() {
    check_non_membership(100, Loc::Left);
    check_non_membership(100, Loc::Middle);
    check_non_membership(100, Loc::Right);
}

#[test]
fn non_membership_big_all_locations() {
    check_non_membership(5431, Loc::Left);
    check_non_membership(5431, Loc::Middle);
    check_non_membership(5431, Loc::Right);
}

#[test]
fn non_membership_leftmost_has_right_neighbor_only() {
    let (mut tree, _) = build_tree(100, 7);
    let proof = tree.get_non_membership_proof(&[0x00, 0x00, 0x00, 0x01]).unwrap();
    let Some(Proof::Nonexist(nonexist)) = proof.proof else {
        panic!("expected non-existence proof");
    };
    assert!(nonexist.left.is_none());
    assert!(nonexist.right.is_some());
}

#[test]
fn non_membership_rightmost_has_left_neighbor_only() {
    let (mut tree, _) = build_tree(5431, 8);
    let proof = tree.get_non_membership_proof(&[0xff, 0xff, 0xff, 0xff]).unwrap();
    let Some(Proof::Nonexist(nonexist)) = proof.proof else {
        panic!("expected non-existence proof");
    };
    assert!(nonexist.left.is_some());
    assert!(nonexist.right.is_none());

    let root = tree.working_hash().unwrap().as_bytes().to_vec();
    let full = tree.get_non_membership_proof(&[0xff, 0xff, 0xff, 0xff]).unwrap();
    assert!(ics23::verify_non_membership::<HostFunctionsManager>(
        &full,
        &ics23::iavl_spec(),
        &root,
        &[0xff, 0xff, 0xff, 0xff],
    ));
}

#[test]
fn converted_existence_proof_matches_saved_root() {
    let (mut tree, keys) = build_tree(200, 42);
    let (root, _) = tree.save_version().unwrap();
    let root = root.unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let key = pick_key(&keys, Loc::Middle, &mut rng);

    let snapshot = tree.get_immutable(1).unwrap();
    let (value, range_proof) = snapshot.get_with_proof(&key).unwrap();
    let value = value.expect("picked key must exist");

    let exist = convert_existence_proof(&range_proof, &key, &value).unwrap();
    let calculated = ics23::calculate_existence_root::<HostFunctionsManager>(&exist).unwrap();
    assert_eq!(calculated.as_slice(), root.as_bytes());
}

#[test]
fn proofs_verify_against_historical_roots() {
    let mut tree = MutableTree::new(Arc::new(MemDb::new()), 0, Options::default());
    tree.set(b"a", b"1");
    tree.set(b"b", b"2");
    let (r1, _) = tree.save_version().unwrap();
    tree.set(b"b", b"2'");
    tree.set(b"c", b"3");
    let (r2, _) = tree.save_version().unwrap();

    let spec = ics23::iavl_spec();
    let v1 = tree.get_immutable(1).unwrap();
    let proof = v1.get_membership_proof(b"b").unwrap();
    let root1 = r1.unwrap().as_bytes().to_vec();
    assert!(ics23::verify_membership::<HostFunctionsManager>(
        &proof, &spec, &root1, b"b", b"2",
    ));

    let proof = v1.get_non_membership_proof(b"c").unwrap();
    assert!(ics23::verify_non_membership::<HostFunctionsManager>(
        &proof, &spec, &root1, b"c",
    ));

    let v2 = tree.get_immutable(2).unwrap();
    let proof = v2.get_membership_proof(b"b").unwrap();
    let root2 = r2.unwrap().as_bytes().to_vec();
    assert!(ics23::verify_membership::<HostFunctionsManager>(
        &proof, &spec, &root2, b"b", b"2'",
    ));
}

#[test]
fn fast_and_regular_non_membership_agree() {
    let keys: [(&[u8], &[u8]); 3] = [(b"b", b"1"), (b"d", b"2"), (b"f", b"3")];

    let fast_opts = Options {
        fast_non_membership: true,
        ..Options::default()
    };
    let mut fast_tree = MutableTree::new(Arc::new(MemDb::new()), 0, fast_opts);
    fast_tree.load_latest().unwrap();
    let mut slow_tree = MutableTree::new(Arc::new(MemDb::new()), 0, Options::default());
    slow_tree.load_latest().unwrap();

    for (k, v) in keys {
        fast_tree.set(k, v);
        slow_tree.set(k, v);
    }
    let (fast_root, _) = fast_tree.save_version().unwrap();
    let (slow_root, _) = slow_tree.save_version().unwrap();
    assert_eq!(fast_root, slow_root);

    for missing in [b"a".as_slice(), b"c", b"e", b"g"] {
        let fast_proof = fast_tree.get_non_membership_proof(missing).unwrap();
        let slow_proof = slow_tree.get_non_membership_proof(missing).unwrap();
        assert_eq!(fast_proof, slow_proof);

        let root = fast_root.unwrap().as_bytes().to_vec();
        assert!(ics23::verify_non_membership::<HostFunctionsManager>(
            &fast_proof,
            &ics23::iavl_spec(),
            &root,
            missing,
        ));
    }
}
