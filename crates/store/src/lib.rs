// Path: crates/store/src/lib.rs
#![forbid(unsafe_code)]

//! # Canopy store
//!
//! A persistent, versioned, authenticated key-value store on an AVL-balanced
//! Merkle tree. Every committed version is an immutable snapshot whose root
//! hash commits to all of its key-value pairs; versions share unchanged
//! subtrees through a content-addressed node store, and an orphan lifecycle
//! makes old versions reclaimable without touching live ones.
//!
//! The pieces, bottom up:
//!
//! - [`KeyFormat`] namespaces the record kinds inside one ordered byte
//!   keyspace ([`backend::MemDb`] / [`backend::RedbDb`] implement it).
//! - [`Node`] / [`FastNode`] are the two record kinds: tree nodes addressed
//!   by content hash, and the fast side index addressed by user key.
//! - [`NodeDb`] owns the write batch, both LRU caches, version accounting,
//!   orphan bookkeeping, and the storage-version migrator.
//! - [`MutableTree`] applies copy-on-write edits and drives the version
//!   lifecycle; [`ImmutableTree`] serves historical reads of any live
//!   version.
//! - [`RangeProof`] production and ICS23 conversion anchor membership and
//!   non-membership proofs to a version's root hash.

pub mod backend;
mod cache;
mod encoding;
mod error;
mod fastnode;
mod immutable;
mod keyformat;
mod mutable;
mod node;
mod nodedb;
mod proof;
mod proof_ics23;

pub use error::StoreError;
pub use fastnode::FastNode;
pub use immutable::ImmutableTree;
pub use keyformat::{KeyField, KeyFormat, ScannedField};
pub use mutable::MutableTree;
pub use node::{Child, Node};
pub use nodedb::{NodeDb, Options};
pub use proof::{ProofInnerNode, ProofLeafNode, RangeProof};
pub use proof_ics23::convert_existence_proof;

pub use canopy_api::{NodeHash, Version};
