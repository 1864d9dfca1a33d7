// Path: crates/store/src/error.rs

//! Recoverable error types for the store.
//!
//! Corruption of internal invariants (a referenced node record missing from
//! disk, a node that fails to decode, an orphan whose lifetime is inverted)
//! is not represented here: continuing past those risks producing a wrong
//! root hash, so they panic at the point of detection.

use canopy_api::{StorageError, Version};
use thiserror::Error;

/// Errors returned to callers of the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error surfaced by the key-value backend.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The fast layer was queried before the storage layout was upgraded.
    #[error("storage version is not fast")]
    NotFastStorage,
    /// A fast node was saved or queried under an empty key.
    #[error("fast node key must not be empty")]
    EmptyFastNodeKey,
    /// The stored storage-version string does not parse as
    /// `<storage version>-<latest fast index version>`.
    #[error("fast storage version must be in the format <storage version>-<latest fast index version>")]
    InvalidFastStorageVersion,
    /// A root was saved out of sequence.
    #[error("must save consecutive versions; expected {expected}, got {got}")]
    NonConsecutiveVersion { expected: Version, got: Version },
    /// A guarded delete targeted the latest saved version.
    #[error("cannot delete latest saved version ({0})")]
    DeleteLatest(Version),
    /// A delete targeted a version that a reader still holds.
    #[error("unable to delete version {version}, it has {readers} active readers")]
    ActiveReaders { version: Version, readers: u32 },
    /// The requested version has no root record.
    #[error("version {0} does not exist")]
    VersionNotFound(Version),
    /// A version range had an empty or inverted interval.
    #[error("invalid version range [{from}, {to})")]
    InvalidVersionRange { from: Version, to: Version },
    /// An existence proof was requested for a key absent from the tree.
    #[error("cannot create existence proof for a key not in state")]
    KeyNotInState,
    /// A non-existence proof was requested for a key present in the tree.
    #[error("cannot create non-existence proof for a key in state")]
    KeyInState,
    /// A range proof had the wrong shape for conversion.
    #[error("existence proof requires a range proof with exactly one leaf, got {0}")]
    RangeProofLeaves(usize),
}
