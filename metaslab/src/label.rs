// vim: tw=80
//! The pool label: the root of everything the allocator persists
//!
//! A label holds the pool's identity and configuration, one root per group
//! (the summary of every metaslab's space map), and the log space map's root.
//! The allocator only produces and consumes labels as byte buffers.  Storing
//! them durably, and choosing which copy to import, is the owner's job.
//!
//! ```text
//! +--------+----------+--------+-------------------------------------+
//! | magic  | checksum | length | records, in the order written       |
//! | 16 B   | 8 B BE   | 8 B BE | (bincode; pool::PoolLabel, usually) |
//! +--------+----------+--------+-------------------------------------+
//! ```
//!
//! The MetroHash64 checksum covers the length field and the records, so a
//! torn or truncated label is rejected rather than half-imported.

use byteorder::{BigEndian, ByteOrder};
use crate::{
    types::*,
    util::*
};
use divbuf::DivBufShared;
use metrohash::MetroHash64;
use serde::{de::DeserializeOwned, Serialize};
use std::{hash::{Hash, Hasher}, io};

const MAGIC: &[u8; 16] = b"Metaslab Pool\0\0\0";
const CHECKSUM_OFS: usize = MAGIC.len();
const LENGTH_OFS: usize = CHECKSUM_OFS + 8;
const HEADER_LEN: usize = LENGTH_OFS + 8;

/// Checksum a label's records, given their total length
fn label_checksum<T: AsRef<[u8]>>(len: u64, records: &[T]) -> u64 {
    let mut hasher = MetroHash64::new();
    len.to_be().hash(&mut hasher);
    checksum_sglist(records, &mut hasher);
    hasher.finish()
}

/// Reads a label's records back, in the order they were written
pub struct LabelReader {
    records: io::Cursor<Vec<u8>>
}

impl LabelReader {
    /// Decode the next record
    pub fn deserialize<T>(&mut self) -> bincode::Result<T>
        where T: DeserializeOwned
    {
        bincode::deserialize_from(&mut self.records)
    }

    /// Validate a label's header and checksum.
    ///
    /// Trailing bytes beyond the recorded length, such as padding added by
    /// the label's storage, are ignored.
    pub fn new(mut buffer: Vec<u8>) -> Result<Self> {
        if buffer.len() < HEADER_LEN || buffer[..CHECKSUM_OFS] != MAGIC[..] {
            return Err(Error::InvalidLabel);
        }
        let checksum = BigEndian::read_u64(&buffer[CHECKSUM_OFS..LENGTH_OFS]);
        let len = BigEndian::read_u64(&buffer[LENGTH_OFS..HEADER_LEN]);
        let end = usize::try_from(len).ok()
            .and_then(|l| l.checked_add(HEADER_LEN))
            .filter(|&end| end <= buffer.len())
            .ok_or(Error::InvalidLabel)?;
        if label_checksum(len, &[&buffer[HEADER_LEN..end]]) != checksum {
            tracing::warn!("label checksum mismatch");
            return Err(Error::InvalidLabel);
        }
        buffer.truncate(end);
        buffer.drain(..HEADER_LEN);
        Ok(LabelReader { records: io::Cursor::new(buffer) })
    }
}

/// Accumulates a label's records
#[derive(Clone, Debug, Default)]
pub struct LabelWriter {
    records: SGList,
}

impl LabelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.  [`LabelReader`] returns records in the same order.
    pub fn serialize<T: Serialize>(&mut self, t: &T) -> bincode::Result<()> {
        let v = bincode::serialize(t)?;
        let db = DivBufShared::from(v).try_const()
            .expect("a fresh DivBufShared has no other references");
        self.records.push(db);
        Ok(())
    }

    /// Finish the label, returning it as one buffer
    pub fn into_vec(self) -> Vec<u8> {
        let len = self.records.iter().map(|db| db.len() as u64).sum::<u64>();
        let mut label = Vec::with_capacity(HEADER_LEN + len as usize);
        label.extend_from_slice(&MAGIC[..]);
        label.resize(HEADER_LEN, 0);
        BigEndian::write_u64(&mut label[CHECKSUM_OFS..LENGTH_OFS],
                             label_checksum(len, &self.records));
        BigEndian::write_u64(&mut label[LENGTH_OFS..HEADER_LEN], len);
        for db in self.records.iter() {
            label.extend_from_slice(&db[..]);
        }
        label
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use super::*;
use pretty_assertions::assert_eq;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
struct Root {
    name: String,
    txg: TxgT,
}

fn root() -> Root {
    Root{name: "tank".to_owned(), txg: TxgT(42)}
}

fn label() -> Vec<u8> {
    let mut lw = LabelWriter::new();
    lw.serialize(&root()).unwrap();
    lw.into_vec()
}

#[test]
fn records_in_order() {
    let mut lw = LabelWriter::new();
    lw.serialize(&root()).unwrap();
    lw.serialize(&7u32).unwrap();
    let mut lr = LabelReader::new(lw.into_vec()).unwrap();
    assert_eq!(lr.deserialize::<Root>().unwrap(), root());
    assert_eq!(lr.deserialize::<u32>().unwrap(), 7);
    assert!(lr.deserialize::<u32>().is_err());
}

/// Storage may pad the label out to a whole block
#[test]
fn padding() {
    let mut buf = label();
    buf.resize(4096, 0);
    let mut lr = LabelReader::new(buf).unwrap();
    assert_eq!(lr.deserialize::<Root>().unwrap(), root());
    assert!(lr.deserialize::<u8>().is_err());
}

#[test]
fn bad_magic() {
    let mut buf = label();
    buf[0] = b'X';
    assert_eq!(LabelReader::new(buf).err(), Some(Error::InvalidLabel));
}

#[test]
fn bad_checksum() {
    let mut buf = label();
    let last = buf.len() - 1;
    buf[last] ^= 1;
    assert_eq!(LabelReader::new(buf).err(), Some(Error::InvalidLabel));
}

#[test]
fn bad_length() {
    let mut buf = label();
    BigEndian::write_u64(&mut buf[LENGTH_OFS..HEADER_LEN], u64::MAX);
    assert_eq!(LabelReader::new(buf).err(), Some(Error::InvalidLabel));
}

#[test]
fn truncated() {
    let mut buf = label();
    buf.truncate(HEADER_LEN + 2);
    assert_eq!(LabelReader::new(buf).err(), Some(Error::InvalidLabel));
    assert_eq!(LabelReader::new(vec![0u8; 4]).err(), Some(Error::InvalidLabel));
}
}
// LCOV_EXCL_STOP
