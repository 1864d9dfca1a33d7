// Path: crates/store/src/keyformat.rs

//! Composite key codec for namespacing record kinds in the backing store.
//!
//! A format is a prefix byte plus an ordered list of field widths. Width 8
//! encodes a big-endian u64, so lexicographic key order equals tuple order;
//! other non-zero widths are fixed-size byte fields; width 0 marks the
//! variable-length tail (at most one, last).

use canopy_api::{be64, StorageError};

/// A field passed to [`KeyFormat::key`].
#[derive(Debug, Clone, Copy)]
pub enum KeyField<'a> {
    U64(u64),
    Bytes(&'a [u8]),
}

/// A field parsed back out by [`KeyFormat::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedField {
    U64(u64),
    Bytes(Vec<u8>),
}

impl ScannedField {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ScannedField::U64(v) => Some(*v),
            ScannedField::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ScannedField::U64(_) => None,
            ScannedField::Bytes(b) => Some(b),
        }
    }
}

/// Builds and parses `<prefix><fixed-size field>*<variable tail>` keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyFormat {
    prefix: u8,
    widths: &'static [usize],
    fixed_len: usize,
}

impl KeyFormat {
    pub const fn new(prefix: u8, widths: &'static [usize]) -> Self {
        let mut fixed_len = 0;
        let mut i = 0;
        while i < widths.len() {
            // width 0 is the variable tail; it must come last
            assert!(widths[i] != 0 || i == widths.len() - 1);
            fixed_len += widths[i];
            i += 1;
        }
        Self {
            prefix,
            widths,
            fixed_len,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The bare prefix, used as the lower bound of prefix scans.
    pub fn prefix_key(&self) -> Vec<u8> {
        vec![self.prefix]
    }

    /// Builds a key from leading `fields`. Trailing fields may be omitted to
    /// produce a range prefix (e.g. all orphans expiring at one version).
    pub fn key(&self, fields: &[KeyField<'_>]) -> Vec<u8> {
        assert!(
            fields.len() <= self.widths.len(),
            "key format takes at most {} fields, got {}",
            self.widths.len(),
            fields.len()
        );
        let mut out = Vec::with_capacity(1 + self.fixed_len);
        out.push(self.prefix);
        for (field, width) in fields.iter().zip(self.widths) {
            match (field, *width) {
                (KeyField::U64(v), 8) => out.extend_from_slice(&be64(*v)),
                (KeyField::Bytes(b), 0) => out.extend_from_slice(b),
                (KeyField::Bytes(b), w) => {
                    assert_eq!(b.len(), w, "fixed-width field length mismatch");
                    out.extend_from_slice(b);
                }
                (KeyField::U64(_), w) => panic!("u64 field requires width 8, layout has {w}"),
            }
        }
        out
    }

    /// Appends raw bytes straight after the prefix. This is the fast path for
    /// single-field formats (node hashes, fast-node user keys, metadata names).
    pub fn key_bytes(&self, tail: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + tail.len());
        out.push(self.prefix);
        out.extend_from_slice(tail);
        out
    }

    /// Reverses [`KeyFormat::key`], skipping the prefix byte.
    pub fn scan(&self, key: &[u8]) -> Result<Vec<ScannedField>, StorageError> {
        if key.first() != Some(&self.prefix) {
            return Err(StorageError::Decode(format!(
                "key prefix mismatch: want {:#04x}",
                self.prefix
            )));
        }
        let mut rest = &key[1..];
        let mut out = Vec::with_capacity(self.widths.len());
        for width in self.widths {
            match *width {
                0 => {
                    out.push(ScannedField::Bytes(rest.to_vec()));
                    rest = &[];
                }
                8 => {
                    if rest.len() < 8 {
                        return Err(StorageError::Decode("key too short for u64 field".into()));
                    }
                    let (head, tail) = rest.split_at(8);
                    out.push(ScannedField::U64(u64::from_be_bytes(
                        head.try_into().expect("split_at yields 8 bytes"),
                    )));
                    rest = tail;
                }
                w => {
                    if rest.len() < w {
                        return Err(StorageError::Decode(format!(
                            "key too short for {w}-byte field"
                        )));
                    }
                    let (head, tail) = rest.split_at(w);
                    out.push(ScannedField::Bytes(head.to_vec()));
                    rest = tail;
                }
            }
        }
        Ok(out)
    }
}
