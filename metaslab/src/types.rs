// vim: tw=80
//! Common type definitions used throughout the allocator

use divbuf::DivBuf;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde::{
    ser::{Serialize, Serializer},
    de::{Deserialize, Deserializer},
    ser::SerializeTuple
};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{Add, AddAssign, Sub},
    str::FromStr,
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Identifies a durable object in the [`MetaStore`](crate::store::MetaStore).
/// Space maps and log space maps each live in their own object.
pub type ObjectT = u64;

/// Indexes a top-level device within the pool.
pub type VdevT = u16;

/// The allocator's error type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// No single contiguous extent large enough exists anywhere in the class.
    /// Retryable; the caller may gang the write or wait for frees to sync.
    #[error("No space left in the {class} class for a {size}-byte extent")]
    Exhausted { class: &'static str, size: u64 },

    /// A space map or log block failed a structural or checksum check
    #[error("Corrupt block {block} of object {object} (txg {txg:?}): {detail}")]
    Corruption {
        object: ObjectT,
        block: u64,
        txg: Option<TxgT>,
        detail: String
    },

    /// The device layer gave up on a metadata read or write
    #[error("I/O error on block {block} of object {object}: {kind}")]
    Io {
        object: ObjectT,
        block: u64,
        kind: io::ErrorKind,
    },

    /// A metaslab failed to load.  It will not be used again.
    #[error("Metaslab {id} failed to load: {source}")]
    LoadFailed {
        id: MetaslabId,
        #[source]
        source: Box<Error>
    },

    /// The metaslab previously failed to load and is unusable
    #[error("Metaslab {0} is unusable")]
    Unusable(MetaslabId),

    /// `claim` found part of the extent already allocated
    #[error("Extent {0} is not free")]
    NotFound(Extent),

    /// A previous sync failed, so the pool refuses further changes
    #[error("Pool is suspended after a fatal sync error")]
    Suspended,

    /// The label's magic, checksum, or contents don't match
    #[error("Invalid label")]
    InvalidLabel,

    /// The tunables could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An allocation request with a zero size or a non-power-of-two alignment
    #[error("Invalid allocation request: size {size}, alignment {align}")]
    InvalidRequest { size: u64, align: u64 },
}

impl Error {
    /// Construct an `Error::Io` from a device-layer error
    pub fn io(object: ObjectT, block: u64, e: io::Error) -> Self {
        Error::Io{object, block, kind: e.kind()}
    }

    /// Is this error fatal to the pool, rather than to a single request?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Exhausted{..} | Error::NotFound(_) |
                  Error::Unusable(_) | Error::InvalidRequest{..})
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corruption {
            object: 0,
            block: 0,
            txg: None,
            detail: e.to_string()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Transaction group numbers.
// 32-bits is enough for 1 per second for 100 years
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u32);

impl Add<u32> for TxgT {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u32> for TxgT {
    fn add_assign(&mut self, rhs: u32) {
        *self = TxgT(self.0 + rhs)
    }
}

impl Display for TxgT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for TxgT {
    fn from(t: u32) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u32 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Sub<u32> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        TxgT(self.0 - rhs)
    }
}

/// A contiguous run of device space, in bytes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64
}

impl Extent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Extent{offset, length}
    }

    /// One past the last byte of the extent
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Does this extent entirely contain `other`?
    pub fn contains(&self, other: &Extent) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// Do the two extents share any bytes?
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.offset, self.end())
    }
}

/// Identifies one metaslab: its top-level device and its slot on that device.
///
/// Ordering is by device, then by slot.  That ordering is used to break ties
/// between equally attractive metaslabs.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct MetaslabId {
    pub vdev: VdevT,
    pub slot: u32
}

impl MetaslabId {
    pub fn new(vdev: VdevT, slot: u32) -> Self {
        MetaslabId{vdev, slot}
    }
}

impl Display for MetaslabId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.vdev, self.slot)
    }
}

/// Data Virtual Address.
///
/// Locates an allocated extent within the pool.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, Ord,
         PartialEq, PartialOrd)]
pub struct Dva {
    pub vdev: VdevT,
    pub offset: u64,
    /// Allocated size in bytes, a multiple of the device's granularity
    pub asize: u64,
}

impl Dva {
    pub fn new(vdev: VdevT, offset: u64, asize: u64) -> Self {
        Dva {vdev, offset, asize}
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.offset, self.asize)
    }
}

impl Display for Dva {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "<{}:{:#x}:{:#x}>", self.vdev, self.offset, self.asize)
    }
}

/// Whether a space map record marks its extent allocated or free
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, IntoPrimitive, Ord,
         PartialEq, PartialOrd, Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum MapType {
    Alloc = 0,
    Free = 1
}

impl Display for MapType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            MapType::Alloc => "ALLOC".fmt(f),
            MapType::Free => "FREE".fmt(f),
        }
    }
}

/// Pool UUID type
///
/// This is just like the `Uuid` from the `uuid` crate, except that it
/// serializes as a fixed-size array instead of a slice
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    pub fn new_v4() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }

    pub fn parse_str(input: &str) -> std::result::Result<Uuid, uuid::Error> {
        uuid::Uuid::parse_str(input).map(Uuid)
    }
}

impl FromStr for Uuid {
    type Err = <uuid::Uuid as FromStr>::Err;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <[u8; 16]>::deserialize(deserializer)
        .map(|v| Uuid(uuid::Uuid::from_bytes(v)))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        let bytes = self.0.as_bytes();
        let mut tup = serializer.serialize_tuple(16)?;
        for b in bytes.iter() {
            tup.serialize_element(&b)?;
        }
        tup.end()
    }
}

// LCOV_EXCL_STOP
