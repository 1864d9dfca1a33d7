// Path: crates/store/src/encoding.rs

//! Varint primitives shared by the node codec and the proof assembler.
//!
//! Integers are zigzag-encoded signed varints; byte strings carry an
//! unsigned varint length prefix. Both match the canonical node preimage
//! format, so a `0x20` length byte precedes every 32-byte child hash.

use canopy_api::StorageError;
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(u: u64) -> i64 {
    (u >> 1) as i64 ^ -((u & 1) as i64)
}

pub(crate) fn write_varint(buf: &mut Vec<u8>, v: i64) {
    encode_varint(zigzag(v), buf);
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    encode_varint(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

pub(crate) fn varint_len(v: i64) -> usize {
    encoded_len_varint(zigzag(v))
}

pub(crate) fn bytes_len(data_len: usize) -> usize {
    encoded_len_varint(data_len as u64) + data_len
}

pub(crate) fn read_varint(buf: &mut &[u8]) -> Result<i64, StorageError> {
    let u = decode_varint(buf).map_err(|e| StorageError::Decode(e.to_string()))?;
    Ok(unzigzag(u))
}

pub(crate) fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, StorageError> {
    let len = decode_varint(buf).map_err(|e| StorageError::Decode(e.to_string()))? as usize;
    if buf.len() < len {
        return Err(StorageError::Decode(format!(
            "byte string truncated: want {len}, have {}",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head.to_vec())
}
