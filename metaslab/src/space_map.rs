// vim: tw=80
//! Durable, append-only logs of allocations and frees
//!
//! Each metaslab records every change to its free space in a space map.
//! Replaying the map, in order, into a `RangeTree` that initially holds the
//! entire metaslab reconstructs the metaslab's free space.

use crate::{
    range_tree::*,
    store::*,
    types::*,
    util::*
};
use divbuf::{DivBuf, DivBufShared};
use futures::{
    StreamExt,
    TryFutureExt,
    TryStreamExt,
    stream::{self, BoxStream, FuturesUnordered},
};
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::{
    hash::{Hash, Hasher},
    mem,
    sync::Arc,
};

/*
 * On-disk record format.  Every record is one 64-bit word.
 *
 * Data record:
 *   bit  63        0
 *   bits 16..=62   Offset from the map's start, in units of 1 << shift
 *   bit  15        MapType: 0 for ALLOC, 1 for FREE
 *   bits 0..=14    Run length minus one, in units of 1 << shift
 *
 * Marker record, written once per sync:
 *   bit  63        1
 *   bits 0..=31    txg
 */
const MARKER_BIT: u64 = 1 << 63;
const OFFSET_SHIFT: u32 = 16;
const OFFSET_MAX: u64 = (1 << 47) - 1;
const TYPE_BIT: u64 = 1 << 15;
const RUN_MASK: u64 = TYPE_BIT - 1;

/// Longest run, in units, that a single record can describe
pub const RUN_MAX: u64 = 1 << 15;

/// Records per on-disk block.  Sized so that a serialized block is 4 KiB.
pub const BLOCK_RECORDS: usize = 509;

/// Persistent summary of a space map.  Stored in the pool label.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SpaceMapPhys {
    /// Backing object
    pub object: ObjectT,
    /// Device offset described by the map's first unit
    pub start: u64,
    /// Bytes described by the map
    pub size: u64,
    /// log2 of the map's unit size
    pub shift: u8,
    /// Number of records in the map
    pub records: u64,
    /// Number of blocks used by those records
    pub nblocks: u64,
    /// Net bytes allocated by all records
    pub allocated: u64,
    /// Free-segment histogram as of the last time the owner computed one
    pub histogram: Vec<u64>,
}

/// One decoded data record
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpaceMapEntry {
    pub tag: MapType,
    pub extent: Extent,
    /// Block that held the record
    pub block: u64,
    /// Txg of the sync that wrote the record, if known
    pub txg: Option<TxgT>,
}

impl SpaceMapEntry {
    /// Apply this record to a tree of free space.
    ///
    /// Fails if the record is inconsistent with the tree: an ALLOC of space
    /// that isn't free, or a FREE of space that already is.
    pub fn apply(&self, object: ObjectT, free: &mut RangeTree) -> Result<()> {
        let consistent = match self.tag {
            MapType::Alloc => free.contains(self.extent),
            MapType::Free => !free.intersects(self.extent),
        };
        if !consistent {
            return Err(Error::Corruption {
                object,
                block: self.block,
                txg: self.txg,
                detail: format!("{} of {} is inconsistent", self.tag,
                                self.extent)
            });
        }
        match self.tag {
            MapType::Alloc => free.remove(self.extent),
            MapType::Free => free.add(self.extent),
        }
        Ok(())
    }
}

/// Persists one block of a space map.
#[derive(Debug, Deserialize, Serialize)]
struct SpaceMapBlock {
    /// MetroHash64 self-checksum.  Includes the object id and block index, to
    /// detect misdirected writes.
    checksum: u64,
    /// Index within the map of the first record in this block
    first: u64,
    records: Vec<u64>,
}

impl SpaceMapBlock {
    fn checksum(object: ObjectT, blkid: u64, first: u64, records: &[u64])
        -> u64
    {
        let mut hasher = MetroHash64::new();
        hasher.write_u64(object);
        hasher.write_u64(blkid);
        hasher.write_u64(first);
        records.hash(&mut hasher);
        hasher.finish()
    }

    fn deserialize(object: ObjectT, blkid: u64, buf: &DivBuf)
        -> Result<Self>
    {
        let corrupt = |detail: String| Error::Corruption {
            object,
            block: blkid,
            txg: None,
            detail
        };
        let smb = bincode::deserialize::<SpaceMapBlock>(&buf[..])
            .map_err(|e| corrupt(e.to_string()))?;
        if smb.records.len() > BLOCK_RECORDS {
            return Err(corrupt("overlong block".to_owned()));
        }
        let expected = Self::checksum(object, blkid, smb.first, &smb.records);
        if expected != smb.checksum {
            return Err(corrupt("checksum mismatch".to_owned()));
        }
        Ok(smb)
    }

    fn serialize(object: ObjectT, blkid: u64, first: u64, records: Vec<u64>)
        -> IoVec
    {
        debug_assert!(records.len() <= BLOCK_RECORDS);
        let checksum = Self::checksum(object, blkid, first, &records);
        let smb = SpaceMapBlock{checksum, first, records};
        let v = bincode::serialize(&smb)
            .expect("SpaceMapBlock serialization is infallible");
        DivBufShared::from(v).try_const().unwrap()
    }
}

/// Everything needed to read a space map, decoupled from the `SpaceMap`
/// itself so that no lock need be held while reading.
#[derive(Clone)]
pub struct SpaceMapReader {
    phys: SpaceMapPhys,
    store: Arc<dyn MetaStore>,
}

struct ReplayState {
    blkid: u64,
    /// Index of the next record to emit
    next: u64,
    ahead: Option<SpaceMapBlock>,
    txg: Option<TxgT>,
}

impl SpaceMapReader {
    fn decode(&self, word: u64, block: u64, txg: Option<TxgT>)
        -> Result<SpaceMapEntry>
    {
        let corrupt = |detail: String| Error::Corruption {
            object: self.phys.object,
            block,
            txg,
            detail
        };
        let units = (word >> OFFSET_SHIFT) & OFFSET_MAX;
        let run = (word & RUN_MASK) + 1;
        let tag = if word & TYPE_BIT == 0 {MapType::Alloc} else {MapType::Free};
        let offset = units << self.phys.shift;
        let length = run << self.phys.shift;
        if offset + length > self.phys.size {
            return Err(corrupt(format!("record {word:#x} out of bounds")));
        }
        let extent = Extent::new(self.phys.start + offset, length);
        Ok(SpaceMapEntry{tag, extent, block, txg})
    }

    /// Replay every record into `free`, which should initially hold whatever
    /// was free before the map's first record.
    pub async fn load_into(self, free: &mut RangeTree) -> Result<()> {
        let object = self.phys.object;
        let mut entries = self.replay();
        while let Some(entry) = entries.try_next().await? {
            entry.apply(object, free)?;
        }
        Ok(())
    }

    async fn read(store: Arc<dyn MetaStore>, object: ObjectT, blkid: u64)
        -> Result<SpaceMapBlock>
    {
        let db = store.read_block(object, blkid).await?;
        SpaceMapBlock::deserialize(object, blkid, &db)
    }

    /// Lazily read and decode the map, one block at a time.
    ///
    /// Records beyond the committed count, which an interrupted sync may
    /// have left behind, are skipped.
    pub fn replay(self) -> BoxStream<'static, Result<SpaceMapEntry>> {
        let st = ReplayState{blkid: 0, next: 0, ahead: None, txg: None};
        stream::try_unfold((self, st), |(reader, mut st)| async move {
            let phys = &reader.phys;
            if st.ahead.is_none() && st.blkid >= phys.nblocks {
                if st.next < phys.records {
                    return Err(Error::Corruption {
                        object: phys.object,
                        block: st.blkid,
                        txg: st.txg,
                        detail: format!("map ends after {} of {} records",
                                        st.next, phys.records)
                    });
                }
                return Ok(None);
            }
            let store = reader.store.clone();
            let cur_blkid;
            let cur = match st.ahead.take() {
                Some(b) => {
                    cur_blkid = st.blkid - 1;
                    b
                }
                None => {
                    cur_blkid = st.blkid;
                    st.blkid += 1;
                    Self::read(store.clone(), phys.object, cur_blkid).await?
                }
            };
            // Records that a later block overwrote don't count.
            let limit = if st.blkid < phys.nblocks {
                let nxt = Self::read(store, phys.object, st.blkid).await?;
                st.blkid += 1;
                let l = nxt.first;
                st.ahead = Some(nxt);
                l
            } else {
                phys.records
            }.min(phys.records);
            if cur.first != st.next || limit < cur.first ||
                limit - cur.first > cur.records.len() as u64
            {
                return Err(Error::Corruption {
                    object: phys.object,
                    block: cur_blkid,
                    txg: st.txg,
                    detail: format!("block starts at record {}, expected {}",
                                    cur.first, st.next)
                });
            }
            let n = (limit - cur.first) as usize;
            let mut entries = Vec::with_capacity(n);
            for &word in &cur.records[..n] {
                if word & MARKER_BIT != 0 {
                    st.txg = Some(TxgT(word as u32));
                } else {
                    entries.push(reader.decode(word, cur_blkid, st.txg));
                }
            }
            st.next = limit;
            Ok(Some((stream::iter(entries), (reader, st))))
        }).try_flatten()
        .boxed()
    }
}

/// A metaslab's durable record of allocations and frees.
pub struct SpaceMap {
    phys: SpaceMapPhys,
    store: Arc<dyn MetaStore>,
    /// Records of the partially filled final block
    tail: Vec<u64>,
    /// Block index of `tail`
    tail_blkid: u64,
    /// Has `tail` changed since it was last written?
    tail_dirty: bool,
    /// Full blocks that haven't yet been written: (blkid, first, records)
    pending: Vec<(u64, u64, Vec<u64>)>,
}

impl SpaceMap {
    /// Net allocated bytes, including records not yet flushed
    pub fn allocated(&self) -> u64 {
        self.phys.allocated
    }

    /// Append one record.  Long extents are split into multiple records.
    ///
    /// # Panics
    ///
    /// If `ext` lies outside of the map, isn't aligned to the map's units, or
    /// is a FREE of more bytes than are allocated.
    pub fn append(&mut self, tag: MapType, ext: Extent) {
        let unit = 1u64 << self.phys.shift;
        assert!(ext.length > 0 && p2_aligned(ext.offset, unit) &&
                p2_aligned(ext.length, unit),
                "Misaligned space map record {tag} {ext}");
        assert!(ext.offset >= self.phys.start &&
                ext.end() <= self.phys.start + self.phys.size,
                "Space map record {tag} {ext} out of bounds");
        match tag {
            MapType::Alloc => self.phys.allocated += ext.length,
            MapType::Free => {
                assert!(self.phys.allocated >= ext.length,
                    "Space map FREE {ext} exceeds allocated space");
                self.phys.allocated -= ext.length;
            }
        }
        let tagbit = match tag {
            MapType::Alloc => 0,
            MapType::Free => TYPE_BIT
        };
        let mut units = (ext.offset - self.phys.start) >> self.phys.shift;
        let mut remaining = ext.length >> self.phys.shift;
        while remaining > 0 {
            let run = remaining.min(RUN_MAX);
            debug_assert!(units <= OFFSET_MAX);
            self.push((units << OFFSET_SHIFT) | tagbit | (run - 1));
            units += run;
            remaining -= run;
        }
    }

    /// Append a marker identifying the txg of the records that follow
    pub fn append_marker(&mut self, txg: TxgT) {
        self.push(MARKER_BIT | u64::from(txg.0));
    }

    /// Append one record for every segment of `tree`
    pub fn append_tree(&mut self, tag: MapType, tree: &RangeTree) {
        for ext in tree.iter() {
            self.append(tag, ext);
        }
    }

    /// Rewrite the map as one ALLOC of everything, followed by a FREE of every
    /// segment of `free`.
    ///
    /// The new records go into a fresh object.  Returns the old object, which
    /// the caller must free once the new summary is durable.
    pub fn condense(&mut self, free: &RangeTree, txg: TxgT) -> ObjectT {
        let old = self.phys.object;
        let old_records = self.phys.records;
        self.phys.object = self.store.alloc_object();
        self.phys.records = 0;
        self.phys.nblocks = 0;
        self.phys.allocated = 0;
        self.tail.clear();
        self.tail_blkid = 0;
        self.tail_dirty = false;
        self.pending.clear();
        self.append_marker(txg);
        self.append(MapType::Alloc, Extent::new(self.phys.start,
                                                self.phys.size));
        self.append_tree(MapType::Free, free);
        tracing::debug!(old_object = old, new_object = self.phys.object,
            old_records, new_records = self.phys.records,
            "condensed space map");
        old
    }

    /// Create a new, empty space map for the given region of a device
    pub fn create(store: Arc<dyn MetaStore>, start: u64, size: u64, shift: u8)
        -> Self
    {
        let object = store.alloc_object();
        let phys = SpaceMapPhys {
            object,
            start,
            size,
            shift,
            records: 0,
            nblocks: 0,
            allocated: 0,
            histogram: Vec::new(),
        };
        Self::open(store, phys)
    }

    /// Write every appended record to stable storage.
    ///
    /// The returned future does not borrow the `SpaceMap`.
    pub fn flush(&mut self) -> BoxVdevFut {
        let object = self.phys.object;
        let mut blocks = mem::take(&mut self.pending);
        if self.tail_dirty {
            let first = self.phys.records - self.tail.len() as u64;
            blocks.push((self.tail_blkid, first, self.tail.clone()));
            self.tail_dirty = false;
        }
        let futs = blocks.into_iter()
            .map(|(blkid, first, records)| {
                let iovec = SpaceMapBlock::serialize(object, blkid, first,
                                                     records);
                self.store.write_block(object, blkid, iovec)
            }).collect::<FuturesUnordered<_>>();
        Box::pin(futs.try_collect::<Vec<_>>().map_ok(drop))
    }

    /// Free-segment histogram as last recorded by the owner
    pub fn histogram(&self) -> &[u64] {
        &self.phys.histogram
    }

    /// Does the map hold records that haven't been flushed?
    pub fn is_dirty(&self) -> bool {
        self.tail_dirty || !self.pending.is_empty()
    }

    /// Number of records that a condensed map describing `free` would hold
    pub fn minimal_records(&self, free: &RangeTree) -> u64 {
        let runs = |len: u64| div_roundup(len >> self.phys.shift, RUN_MAX);
        1 + runs(self.phys.size) + free.iter().map(|e| runs(e.length)).sum::<u64>()
    }

    pub fn object(&self) -> ObjectT {
        self.phys.object
    }

    /// Reopen a space map from its persisted summary.
    ///
    /// New records will start a fresh block, leaving the old final block
    /// untouched.
    pub fn open(store: Arc<dyn MetaStore>, phys: SpaceMapPhys) -> Self {
        let tail_blkid = phys.nblocks;
        SpaceMap {
            phys,
            store,
            tail: Vec::with_capacity(BLOCK_RECORDS),
            tail_blkid,
            tail_dirty: false,
            pending: Vec::new(),
        }
    }

    /// The summary to persist, describing every record appended so far.
    pub fn phys(&self) -> &SpaceMapPhys {
        &self.phys
    }

    fn push(&mut self, word: u64) {
        if self.tail.is_empty() {
            self.phys.nblocks = self.tail_blkid + 1;
        }
        self.tail.push(word);
        self.phys.records += 1;
        if self.tail.len() == BLOCK_RECORDS {
            let first = self.phys.records - BLOCK_RECORDS as u64;
            let full = mem::replace(&mut self.tail,
                                    Vec::with_capacity(BLOCK_RECORDS));
            self.pending.push((self.tail_blkid, first, full));
            self.tail_blkid += 1;
            self.tail_dirty = false;
        } else {
            self.tail_dirty = true;
        }
    }

    /// A detached reader of the map's flushed contents
    pub fn reader(&self) -> SpaceMapReader {
        debug_assert!(!self.is_dirty(), "Reading a space map with unflushed \
                      records");
        SpaceMapReader{phys: self.phys.clone(), store: self.store.clone()}
    }

    /// Number of records in the map, including unflushed ones
    pub fn records(&self) -> u64 {
        self.phys.records
    }

    pub fn set_histogram(&mut self, histogram: &Histogram) {
        self.phys.histogram = histogram.to_vec();
    }

    /// Has the map grown so large, relative to the free space it describes,
    /// that it ought to be condensed?
    pub fn should_condense(&self, free: &RangeTree, condense_pct: u64,
                           min_records: u64) -> bool
    {
        if self.phys.records <= min_records {
            return false;
        }
        let minimal = self.minimal_records(free);
        self.phys.records * 100 >= minimal * condense_pct
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use crate::store::MockMetaStore;
    use futures::future;
    use mockall::predicate::*;
    use pretty_assertions::assert_eq;
    use std::io;

    const SIZE: u64 = 1 << 27;

    fn e(offset: u64, length: u64) -> Extent {
        Extent::new(offset, length)
    }

    fn full() -> RangeTree {
        RangeTree::from_iter([e(0, SIZE)])
    }

    fn mem() -> Arc<MemStore> {
        Arc::new(MemStore::new())
    }

    async fn replay(sm: &SpaceMap) -> Vec<(MapType, Extent)> {
        sm.reader().replay()
            .map_ok(|entry| (entry.tag, entry.extent))
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty() {
        let store = mem();
        let sm = SpaceMap::create(store, 0, SIZE, 9);
        assert_eq!(replay(&sm).await, vec![]);
    }

    /// Records replay in order, and an ALLOC after a FREE of the same space
    /// leaves it allocated.
    #[tokio::test]
    async fn replay_order() {
        let store = mem();
        let mut sm = SpaceMap::create(store, 0, 1000, 0);
        sm.append(MapType::Alloc, e(0, 100));
        sm.append(MapType::Free, e(0, 100));
        sm.append(MapType::Alloc, e(50, 20));
        sm.flush().await.unwrap();
        let mut tree = RangeTree::from_iter([e(0, 1000)]);
        sm.reader().load_into(&mut tree).await.unwrap();
        assert_eq!(tree, RangeTree::from_iter([e(0, 50), e(70, 930)]));
        assert_eq!(sm.allocated(), 20);
    }

    #[tokio::test]
    async fn offset_start() {
        let store = mem();
        let mut sm = SpaceMap::create(store, 3 * SIZE, SIZE, 12);
        sm.append(MapType::Alloc, e(3 * SIZE + 8192, 4096));
        sm.flush().await.unwrap();
        assert_eq!(replay(&sm).await,
                   vec![(MapType::Alloc, e(3 * SIZE + 8192, 4096))]);
    }

    #[tokio::test]
    async fn long_run_is_split() {
        let store = mem();
        let mut sm = SpaceMap::create(store, 0, SIZE, 9);
        let len = (RUN_MAX << 9) * 2 + 512;
        sm.append(MapType::Alloc, e(0, len));
        assert_eq!(sm.records(), 3);
        sm.flush().await.unwrap();
        let mut tree = full();
        sm.reader().load_into(&mut tree).await.unwrap();
        assert_eq!(tree, RangeTree::from_iter([e(len, SIZE - len)]));
    }

    #[test]
    #[should_panic(expected = "Misaligned")]
    fn misaligned() {
        let mut sm = SpaceMap::create(mem(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(100, 512));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds() {
        let mut sm = SpaceMap::create(mem(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(SIZE - 512, 1024));
    }

    /// Many records spanning several blocks, flushed at different times
    #[tokio::test]
    async fn multiblock() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        let mut want = Vec::new();
        for i in 0..(3 * BLOCK_RECORDS as u64 + 7) {
            let ext = e(i * 1024, 512);
            sm.append(MapType::Alloc, ext);
            want.push((MapType::Alloc, ext));
            if i % 200 == 0 {
                sm.flush().await.unwrap();
            }
        }
        sm.flush().await.unwrap();
        assert_eq!(sm.phys().nblocks, 4);
        assert_eq!(store.nblocks(sm.object()), Some(4));
        assert_eq!(replay(&sm).await, want);
    }

    /// After reopening, the map continues in a new block
    #[tokio::test]
    async fn reopen() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 4096));
        sm.flush().await.unwrap();
        let phys = sm.phys().clone();
        let mut sm = SpaceMap::open(store.clone(), phys);
        sm.append(MapType::Free, e(0, 512));
        sm.flush().await.unwrap();
        assert_eq!(sm.phys().nblocks, 2);
        assert_eq!(replay(&sm).await, vec![
            (MapType::Alloc, e(0, 4096)),
            (MapType::Free, e(0, 512)),
        ]);
    }

    /// Records written after the last persisted summary are ignored, even if
    /// the map was later reopened and extended from that summary.
    #[tokio::test]
    async fn uncommitted_records() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 4096));
        sm.flush().await.unwrap();
        let committed = sm.phys().clone();
        // An interrupted sync
        sm.append(MapType::Alloc, e(8192, 4096));
        sm.flush().await.unwrap();
        // Import from the last committed summary
        let sm = SpaceMap::open(store.clone(), committed.clone());
        assert_eq!(replay(&sm).await, vec![(MapType::Alloc, e(0, 4096))]);
        // And keep going
        let mut sm = sm;
        sm.append(MapType::Alloc, e(16384, 512));
        sm.flush().await.unwrap();
        assert_eq!(replay(&sm).await, vec![
            (MapType::Alloc, e(0, 4096)),
            (MapType::Alloc, e(16384, 512)),
        ]);
    }

    #[tokio::test]
    async fn markers_supply_txg() {
        let store = mem();
        let mut sm = SpaceMap::create(store, 0, SIZE, 9);
        sm.append_marker(TxgT(41));
        sm.append(MapType::Alloc, e(0, 512));
        sm.append_marker(TxgT(42));
        sm.append(MapType::Free, e(0, 512));
        sm.flush().await.unwrap();
        let txgs = sm.reader().replay()
            .map_ok(|entry| entry.txg)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(txgs, vec![Some(TxgT(41)), Some(TxgT(42))]);
    }

    #[tokio::test]
    async fn checksum_mismatch() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 512));
        sm.flush().await.unwrap();
        store.corrupt(sm.object(), 0);
        let mut tree = full();
        let r = sm.reader().load_into(&mut tree).await;
        assert!(matches!(r, Err(Error::Corruption{block: 0, ..})));
    }

    #[tokio::test]
    async fn inconsistent_record() {
        let store = mem();
        let mut sm = SpaceMap::create(store, 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 512));
        sm.append(MapType::Alloc, e(512, 512));
        sm.flush().await.unwrap();
        // The first ALLOC conflicts with what the tree already holds
        let mut tree = RangeTree::from_iter([e(512, SIZE - 512)]);
        let e = sm.reader().load_into(&mut tree).await.unwrap_err();
        assert!(matches!(e, Error::Corruption{..}));
    }

    #[tokio::test]
    async fn read_error() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 512));
        sm.flush().await.unwrap();
        store.fail_read(sm.object(), 0);
        let mut tree = full();
        let r = sm.reader().load_into(&mut tree).await;
        assert!(matches!(r, Err(Error::Io{block: 0, ..})));
    }

    /// A write failure must be reported
    #[tokio::test]
    async fn write_error() {
        let mut store = MockMetaStore::default();
        store.expect_alloc_object()
            .once()
            .return_const(7u64);
        store.expect_write_block()
            .once()
            .with(eq(7u64), eq(0u64), always())
            .returning(|object, block, _| {
                let e = io::Error::from(io::ErrorKind::Other);
                Box::pin(future::err(Error::io(object, block, e)))
            });
        let mut sm = SpaceMap::create(Arc::new(store), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 512));
        let e = sm.flush().await.unwrap_err();
        assert_eq!(e, Error::Io{object: 7, block: 0,
                                kind: io::ErrorKind::Other});
    }

    /// Only dirty blocks get written
    #[tokio::test]
    async fn flush_writes_only_dirty() {
        let mut store = MockMetaStore::default();
        store.expect_alloc_object()
            .return_const(1u64);
        store.expect_write_block()
            .once()
            .with(eq(1u64), eq(0u64), always())
            .returning(|_, _, _| Box::pin(future::ok(())));
        let mut sm = SpaceMap::create(Arc::new(store), 0, SIZE, 9);
        sm.append(MapType::Alloc, e(0, 512));
        sm.flush().await.unwrap();
        assert!(!sm.is_dirty());
        sm.flush().await.unwrap();
    }

    #[tokio::test]
    async fn condense() {
        let store = mem();
        let mut sm = SpaceMap::create(store.clone(), 0, SIZE, 9);
        let mut free = full();
        for i in 0..1000 {
            let ext = e(i * 4096, 4096);
            sm.append(MapType::Alloc, ext);
            free.remove(ext);
            if i % 2 == 1 {
                sm.append(MapType::Free, ext);
                free.add(ext);
            }
        }
        sm.flush().await.unwrap();
        let before = sm.records();
        let old = sm.condense(&free, TxgT(9));
        sm.flush().await.unwrap();
        assert_ne!(old, sm.object());
        assert!(sm.records() < before);
        assert_eq!(sm.records(), sm.minimal_records(&free));
        assert_eq!(sm.allocated(), SIZE - free.space());
        let mut tree = full();
        sm.reader().load_into(&mut tree).await.unwrap();
        assert_eq!(tree, free);
    }

    #[test]
    fn should_condense() {
        let mut sm = SpaceMap::create(mem(), 0, SIZE, 9);
        let free = full();
        // 1 marker + 8 runs for the whole map + 8 for the free segment
        assert_eq!(sm.minimal_records(&free), 17);
        for _ in 0..20 {
            sm.append(MapType::Alloc, e(0, 512));
            sm.append(MapType::Free, e(0, 512));
        }
        assert!(sm.should_condense(&free, 200, 0));
        assert!(!sm.should_condense(&free, 300, 0));
        assert!(!sm.should_condense(&free, 200, 40));
    }
}
// LCOV_EXCL_STOP
