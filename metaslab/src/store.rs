// vim: tw=80
//! Device-layer primitives consumed by the allocator
//!
//! Space maps and log space maps persist themselves as sequences of
//! fixed-size blocks within numbered objects.  The object store that provides
//! those blocks, and the health events of the underlying devices, are the
//! device layer's business.  This module only defines the interface, plus an
//! in-memory implementation.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io,
    num::NonZeroU8,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex
    }
};
use divbuf::DivBufShared;
use futures::{Future, future};
#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};
use crate::types::*;

/// Represents the health of a top-level device
///
/// The ordering reflects which Health is "sicker".
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// Rebuild in progress.  Not all data is present.
    Rebuilding,
    /// Administratively offline
    Offline,
    /// Being evacuated prior to removal from the pool
    Removing,
    /// Faulted.  No I/O is possible
    Faulted,
}

impl Health {
    /// May new data be allocated on a device in this state?
    pub fn is_allocatable(self) -> bool {
        matches!(self, Health::Online | Health::Degraded(_) |
                 Health::Rebuilding)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Rebuilding => "Rebuilding".fmt(f),
            Self::Offline => "Offline".fmt(f),
            Self::Removing => "Removing".fmt(f),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Boxed future for a metadata write, truncate, or free
pub type BoxVdevFut = Pin<Box<dyn Future<Output = Result<()>> + Send + Sync>>;

/// Boxed future for a metadata block read
pub type BoxReadFut = Pin<Box<dyn Future<Output = Result<IoVec>> + Send + Sync>>;

/// Stable storage for the allocator's own metadata.
///
/// An object is a sparse array of blocks, each written whole.  Writes to
/// different blocks may complete in any order, but each block write is atomic.
#[cfg_attr(test, automock)]
pub trait MetaStore: Send + Sync {
    /// Create a new, empty object and return its id.  Ids are never reused.
    fn alloc_object(&self) -> ObjectT;

    /// Destroy an object and release its storage
    fn free_object(&self, object: ObjectT) -> BoxVdevFut;

    /// Read one block of an object
    fn read_block(&self, object: ObjectT, blkid: u64) -> BoxReadFut;

    /// Discard every block of the object at or beyond `nblocks`
    fn truncate(&self, object: ObjectT, nblocks: u64) -> BoxVdevFut;

    /// Write (or overwrite) one block of an object
    fn write_block(&self, object: ObjectT, blkid: u64, buf: IoVec)
        -> BoxVdevFut;
}

#[derive(Debug, Default)]
struct Faults {
    fail_writes: bool,
    fail_reads: BTreeSet<(ObjectT, u64)>,
}

/// A `MetaStore` that lives entirely in RAM.
///
/// Useful for ephemeral pools and for tests.  It can inject faults, and it
/// survives the [`Pool`](crate::pool::Pool) that used it, so that a pool can
/// be reimported from the same store to simulate a crash or an export.
#[derive(Debug)]
pub struct MemStore {
    objects: Mutex<BTreeMap<ObjectT, BTreeMap<u64, Vec<u8>>>>,
    next_object: AtomicU64,
    faults: Mutex<Faults>,
    writes: AtomicU64,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore {
            objects: Mutex::default(),
            next_object: AtomicU64::new(1),
            faults: Mutex::default(),
            writes: AtomicU64::new(0)
        }
    }
}

impl MemStore {
    /// Number of blocks presently stored in `object`, or `None` if it doesn't
    /// exist.
    pub fn nblocks(&self, object: ObjectT) -> Option<u64> {
        self.objects.lock().unwrap()
            .get(&object)
            .map(|blocks| blocks.len() as u64)
    }

    /// Ids of every live object
    pub fn objects(&self) -> Vec<ObjectT> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Flip a bit in a stored block, so its checksum will no longer match
    pub fn corrupt(&self, object: ObjectT, blkid: u64) {
        let mut objects = self.objects.lock().unwrap();
        let block = objects.get_mut(&object)
            .and_then(|blocks| blocks.get_mut(&blkid))
            .expect("Can't corrupt a nonexistent block");
        let last = block.len() - 1;
        block[last] ^= 0x01;
    }

    /// Make subsequent reads of one block fail
    pub fn fail_read(&self, object: ObjectT, blkid: u64) {
        self.faults.lock().unwrap().fail_reads.insert((object, blkid));
    }

    /// Make all subsequent writes fail, or succeed again
    pub fn fail_writes(&self, fail: bool) {
        self.faults.lock().unwrap().fail_writes = fail;
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of block writes ever issued
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl MetaStore for MemStore {
    fn alloc_object(&self) -> ObjectT {
        let object = self.next_object.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().unwrap().insert(object, BTreeMap::new());
        object
    }

    fn free_object(&self, object: ObjectT) -> BoxVdevFut {
        let r = self.objects.lock().unwrap().remove(&object);
        debug_assert!(r.is_some(), "Double free of object {object}");
        Box::pin(future::ok(()))
    }

    fn read_block(&self, object: ObjectT, blkid: u64) -> BoxReadFut {
        if self.faults.lock().unwrap().fail_reads.contains(&(object, blkid)) {
            let e = io::Error::from(io::ErrorKind::Other);
            return Box::pin(future::err(Error::io(object, blkid, e)));
        }
        let r = self.objects.lock().unwrap()
            .get(&object)
            .and_then(|blocks| blocks.get(&blkid))
            .cloned();
        let fut = match r {
            Some(v) => {
                let dbs = DivBufShared::from(v);
                future::ok(dbs.try_const().unwrap())
            },
            None => {
                let e = io::Error::from(io::ErrorKind::UnexpectedEof);
                future::err(Error::io(object, blkid, e))
            }
        };
        Box::pin(fut)
    }

    fn truncate(&self, object: ObjectT, nblocks: u64) -> BoxVdevFut {
        if let Some(blocks) = self.objects.lock().unwrap().get_mut(&object) {
            blocks.split_off(&nblocks);
        }
        Box::pin(future::ok(()))
    }

    fn write_block(&self, object: ObjectT, blkid: u64, buf: IoVec)
        -> BoxVdevFut
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.faults.lock().unwrap().fail_writes {
            let e = io::Error::from(io::ErrorKind::Other);
            return Box::pin(future::err(Error::io(object, blkid, e)));
        }
        let mut objects = self.objects.lock().unwrap();
        let fut = match objects.get_mut(&object) {
            Some(blocks) => {
                blocks.insert(blkid, buf[..].to_vec());
                future::ok(())
            },
            None => {
                let e = io::Error::from(io::ErrorKind::NotFound);
                future::err(Error::io(object, blkid, e))
            }
        };
        Box::pin(fut)
    }
}

// LCOV_EXCL_STOP
