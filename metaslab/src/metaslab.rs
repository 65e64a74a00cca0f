// vim: tw=80
//! A fixed-size region of one top-level device, and its free space
//!
//! A metaslab's free space lives in memory only while it is loaded.  Changes
//! are staged per txg and folded into its space map (or the pool's log space
//! map) when that txg syncs.  Freed space waits out a window of `defer_txgs`
//! txgs before it may be reallocated, so that a crash can never leave live
//! data in reused space.

use crate::{
    log_space_map::LogSpaceMap,
    range_tree::*,
    space_map::*,
    store::*,
    tunables::Tunables,
    types::*,
    util::*
};
use futures_locks::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        RwLock
    }
};

/// Number of txgs whose changes may be staged at once
pub const TXG_SIZE: usize = 4;

/// Set in the weight of a loaded, not-too-fragmented metaslab
pub const WEIGHT_ACTIVE: u64 = 1 << 63;
const WEIGHT_BUCKET_SHIFT: u32 = 56;
const WEIGHT_BUCKET_MASK: u64 = 0x7f;
const WEIGHT_SPACE_MASK: u64 = (1 << WEIGHT_BUCKET_SHIFT) - 1;

/// Fragmentation penalty of free space, indexed by the size bucket of the
/// segment that holds it, starting at 512 B.
const FRAGMENTATION_TABLE: [u64; 16] = [
    100,    // 512 B
    100,    // 1 KiB
    98,     // 2 KiB
    95,     // 4 KiB
    90,     // 8 KiB
    80,     // 16 KiB
    70,     // 32 KiB
    60,     // 64 KiB
    50,     // 128 KiB
    40,     // 256 KiB
    30,     // 512 KiB
    20,     // 1 MiB
    15,     // 2 MiB
    10,     // 4 MiB
    5,      // 8 MiB
    0,      // 16 MiB and up
];
const FRAGMENTATION_BASE: usize = 9;

fn txg_idx(txg: TxgT) -> usize {
    txg.0 as usize % TXG_SIZE
}

/// Fragmentation of the free space described by a segment-size histogram, as
/// a percentage.  `None` if the histogram is empty.
pub fn fragmentation(histogram: &[u64]) -> Option<u64> {
    let mut total = 0u128;
    let mut penalty = 0u128;
    for (bucket, &count) in histogram.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let space = u128::from(count) << bucket;
        let idx = bucket.saturating_sub(FRAGMENTATION_BASE)
            .min(FRAGMENTATION_TABLE.len() - 1);
        penalty += space * u128::from(FRAGMENTATION_TABLE[idx]);
        total += space;
    }
    (total > 0).then(|| (penalty / total) as u64)
}

/// Could a metaslab of this weight hold a `size`-byte extent?
///
/// Conservative in the other direction: a `true` result does not guarantee
/// success.
pub fn may_satisfy(weight: u64, size: u64) -> bool {
    let bucket = (weight >> WEIGHT_BUCKET_SHIFT) & WEIGHT_BUCKET_MASK;
    bucket > 0 && (bucket >= 64 || size < 1 << bucket)
}

/// Lifecycle of a metaslab's in-memory free tree
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetaslabState {
    /// Never loaded, or a load failed
    Uninitialized,
    Loading,
    Loaded,
    Unloaded,
}

impl fmt::Display for MetaslabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    /// The space map is being rewritten.  No allocations may happen.
    Condensing,
}

/// Persistent summary of one metaslab.  Stored in the pool label.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MetaslabPhys {
    /// The metaslab's space map, if it has ever needed one
    pub sm: Option<SpaceMapPhys>,
    /// Log space map records for this metaslab from this txg onward have not
    /// been flushed to its space map.
    pub unflushed_txg: TxgT,
}

/// Effect of one metaslab sync on its owners' space accounting
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncDelta {
    /// Change in allocated bytes
    pub alloc: i64,
    /// Change in bytes waiting out the deferred-free window
    pub defer: i64,
    /// A space map object made obsolete by condensing.  Free it after the
    /// next label is durable.
    pub obsolete: Option<ObjectT>,
}

/// Read-only statistics
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetaslabStats {
    pub id: MetaslabId,
    pub state: MetaslabState,
    pub start: u64,
    pub size: u64,
    /// Bytes available for allocation once the deferred frees are released
    pub free: u64,
    pub allocated: u64,
    pub deferred: u64,
    pub fragmentation: Option<u64>,
    /// Largest free segment, if known
    pub max_segment: Option<u64>,
    pub weight: u64,
    pub records: u64,
}

struct Inner {
    state: MetaslabState,
    load_error: Option<Error>,
    phase: Phase,
    /// Allocatable space.  Empty unless loaded.
    free: RangeTree,
    /// Allocations staged for each open txg
    allocs: [RangeTree; TXG_SIZE],
    /// Frees staged for each open txg
    frees: [RangeTree; TXG_SIZE],
    /// Synced frees waiting out the deferred-free window, oldest first
    defer: VecDeque<RangeTree>,
    deferspace: u64,
    /// Allocated bytes as of the last sync
    allocated: u64,
    sm: Option<SpaceMap>,
    /// Changes recorded in the log space map but not in the space map
    unflushed_allocs: RangeTree,
    unflushed_frees: RangeTree,
    unflushed_txg: TxgT,
    /// Histogram of the free tree as of the last time it was loaded
    histogram: Vec<u64>,
    /// First-fit cursors, indexed by log2 of the alignment
    cursors: [u64; 64],
    /// Last txg in which anything was allocated
    access_txg: TxgT,
    synced_txg: TxgT,
}

impl Inner {
    /// Check that the free tree agrees with the space accounting
    fn check_space(&self, size: u64) -> std::result::Result<(), String> {
        let staged: u64 = self.allocs.iter().map(RangeTree::space).sum();
        let expected = size - self.allocated - self.deferspace;
        if self.free.space() + staged != expected {
            return Err(format!("free tree holds {} bytes, plus {} staged, but \
                               {} should be free",
                               self.free.space(), staged, expected));
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.state == MetaslabState::Loaded
    }

    /// Unflushed segment count, for the log space map's memory accounting
    fn unflushed(&self) -> Option<(TxgT, u64)> {
        let segs = self.unflushed_allocs.len() + self.unflushed_frees.len();
        (segs > 0).then_some((self.unflushed_txg, segs as u64))
    }
}

pub struct Metaslab {
    id: MetaslabId,
    start: u64,
    size: u64,
    /// log2 of the device's allocation granularity
    shift: u8,
    store: Arc<dyn MetaStore>,
    tunables: Arc<Tunables>,
    inner: RwLock<Inner>,
    /// Serializes load, sync, and flush
    io_lock: Mutex<()>,
    weight: AtomicU64,
}

impl Metaslab {
    /// Allocate `size` bytes at `align` alignment, staged for `txg`.
    ///
    /// Returns `None` if the metaslab isn't loaded, is condensing, or has no
    /// suitable extent.
    pub fn alloc(&self, size: u64, align: u64, txg: TxgT) -> Option<Extent> {
        debug_assert!(p2_aligned(size, 1 << self.shift));
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        if inner.phase == Phase::Condensing || !inner.is_loaded() {
            return None;
        }
        let align = align.max(1 << self.shift);
        let free_pct = inner.free.space() * 100 / self.size;
        let ext = if inner.free.max_segment() >= self.tunables.df_alloc_threshold
            && free_pct >= self.tunables.df_free_pct
        {
            let cursor = &mut inner.cursors[highbit(align) as usize];
            let ext = inner.free.find_first_fit_from(*cursor, size, size,
                                                     align);
            if let Some(e) = ext {
                *cursor = e.end();
            }
            ext
        } else {
            inner.free.find_best_fit(size, align)
        };
        match ext {
            Some(e) => {
                inner.free.remove(e);
                inner.allocs[txg_idx(txg)].add(e);
                inner.access_txg = txg;
            }
            None => {
                // Don't let this metaslab be chosen again for a request this
                // size until its free space changes.
                let w = self.weight();
                let bucket = (w >> WEIGHT_BUCKET_SHIFT) & WEIGHT_BUCKET_MASK;
                let limit = u64::from(highbit(size));
                if bucket > limit {
                    let w = (w & !(WEIGHT_BUCKET_MASK << WEIGHT_BUCKET_SHIFT))
                        | (limit << WEIGHT_BUCKET_SHIFT);
                    self.weight.store(w, Ordering::Relaxed);
                }
            }
        }
        ext
    }

    /// Claim an extent that is known to be in use, during import.
    ///
    /// Fails with `NotFound` unless the whole extent is currently free.
    pub async fn claim(&self, ext: Extent, txg: TxgT) -> Result<()> {
        loop {
            self.load().await?;
            let mut inner = self.inner.write().unwrap();
            if !inner.is_loaded() {
                // Raced with an unload
                continue;
            }
            if !inner.free.contains(ext) {
                return Err(Error::NotFound(ext));
            }
            inner.free.remove(ext);
            inner.allocs[txg_idx(txg)].add(ext);
            inner.access_txg = txg;
            return Ok(());
        }
    }

    fn compute_weight(&self, inner: &Inner) -> u64 {
        if inner.load_error.is_some() {
            return 0;
        }
        let free = if inner.is_loaded() {
            inner.free.space()
        } else {
            self.size - inner.allocated - inner.deferspace
        };
        if free == 0 {
            return 0;
        }
        let histogram: &[u64] = if inner.is_loaded() {
            &inner.free.histogram()[..]
        } else {
            &inner.histogram
        };
        let bucket = histogram.iter()
            .rposition(|&count| count > 0)
            .map(|b| b as u64)
            .unwrap_or_else(|| u64::from(highbit(free)));
        let frag = fragmentation(histogram).unwrap_or(0);
        let space = (free * (101 - frag) / 101).min(WEIGHT_SPACE_MASK);
        let mut weight = ((bucket + 1) << WEIGHT_BUCKET_SHIFT) | space;
        if inner.is_loaded() && frag <= self.tunables.fragmentation_threshold {
            weight |= WEIGHT_ACTIVE;
        }
        weight
    }

    /// Finish a load: apply the unflushed changes and the deferred frees to a
    /// tree freshly replayed from the space map.
    fn finish_load(&self, inner: &mut Inner, mut tree: RangeTree)
        -> Result<()>
    {
        let object = inner.sm.as_ref().map(SpaceMap::object).unwrap_or(0);
        let txg = inner.unflushed_txg;
        let corrupt = |detail: String| Error::Corruption {
            object,
            block: 0,
            txg: Some(txg),
            detail
        };
        for ext in inner.unflushed_allocs.iter() {
            if !tree.contains(ext) {
                return Err(corrupt(format!("unflushed ALLOC of {ext} is not \
                                           free")));
            }
            tree.remove(ext);
        }
        for ext in inner.unflushed_frees.iter() {
            if tree.intersects(ext) {
                return Err(corrupt(format!("unflushed FREE of {ext} is \
                                           already free")));
            }
            tree.add(ext);
        }
        for ext in inner.defer.iter().chain(inner.allocs.iter())
            .flat_map(RangeTree::iter)
        {
            if !tree.contains(ext) {
                return Err(corrupt(format!("staged extent {ext} is not free")));
            }
            tree.remove(ext);
        }
        inner.free = tree;
        inner.check_space(self.size).map_err(corrupt)?;
        Ok(())
    }

    /// Flush the unflushed changes to the space map.
    ///
    /// Skips the metaslab, returning `false`, if a load is in progress.
    #[tracing::instrument(skip(self, log), fields(id = %self.id))]
    pub async fn flush(&self, txg: TxgT, log: &LogSpaceMap) -> Result<bool> {
        let Ok(_guard) = self.io_lock.try_lock() else {
            tracing::debug!(id = %self.id, "skipping flush of busy metaslab");
            return Ok(false);
        };
        let fut = {
            let mut guard = self.inner.write().unwrap();
            let inner = &mut *guard;
            if inner.unflushed().is_none() {
                inner.unflushed_txg = txg;
                log.set_unflushed(self.id, None);
                return Ok(false);
            }
            let sm = self.space_map(&mut inner.sm);
            sm.append_marker(txg);
            sm.append_tree(MapType::Alloc, &inner.unflushed_allocs);
            sm.append_tree(MapType::Free, &inner.unflushed_frees);
            tracing::debug!(id = %self.id, %txg,
                allocs = inner.unflushed_allocs.len(),
                frees = inner.unflushed_frees.len(),
                "flushing metaslab");
            inner.unflushed_allocs.clear();
            inner.unflushed_frees.clear();
            inner.unflushed_txg = txg;
            log.set_unflushed(self.id, None);
            sm.flush()
        };
        fut.await?;
        Ok(true)
    }

    /// Stage a free for `txg`.  The space becomes allocatable again only after
    /// `txg` plus the deferred-free window has synced.
    ///
    /// # Panics
    ///
    /// On a double free.
    pub fn free(&self, ext: Extent, txg: TxgT) {
        self.check_bounds(ext);
        let mut inner = self.inner.write().unwrap();
        let double = inner.frees.iter()
            .chain(inner.defer.iter())
            .any(|rt| rt.intersects(ext))
            || (inner.is_loaded() && inner.free.intersects(ext));
        assert!(!double, "Double free of {ext} in metaslab {}", self.id);
        inner.frees[txg_idx(txg)].add(ext);
    }

    /// Every allocatable extent, in offset order.  `None` unless loaded.
    pub fn free_extents(&self) -> Option<Vec<Extent>> {
        let inner = self.inner.read().unwrap();
        inner.is_loaded().then(|| inner.free.iter().collect())
    }

    /// Immediately undo an allocation staged for `txg`.
    ///
    /// # Panics
    ///
    /// If `ext` was not allocated in `txg`.
    pub fn free_now(&self, ext: Extent, txg: TxgT) {
        let mut inner = self.inner.write().unwrap();
        let i = txg_idx(txg);
        assert!(inner.allocs[i].contains(ext),
            "Extent {ext} was not allocated from metaslab {} in txg {txg}",
            self.id);
        inner.allocs[i].remove(ext);
        if inner.is_loaded() {
            inner.free.add(ext);
            self.weight.store(self.compute_weight(&inner), Ordering::Relaxed);
        }
    }

    fn check_bounds(&self, ext: Extent) {
        assert!(ext.offset >= self.start && ext.end() <= self.start + self.size,
            "Extent {ext} is outside of metaslab {}", self.id);
    }

    pub fn id(&self) -> MetaslabId {
        self.id
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().unwrap().is_loaded()
    }

    /// Load the free tree, if it isn't already.
    ///
    /// Concurrent callers wait for the first to finish.  A failed load leaves
    /// the metaslab unusable.
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub async fn load(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let _guard = self.io_lock.lock().await;
        let reader = {
            let mut inner = self.inner.write().unwrap();
            if inner.is_loaded() {
                return Ok(());
            }
            if inner.load_error.is_some() {
                return Err(Error::Unusable(self.id));
            }
            inner.state = MetaslabState::Loading;
            inner.sm.as_ref().map(SpaceMap::reader)
        };
        let mut tree = RangeTree::new();
        tree.add(Extent::new(self.start, self.size));
        let r = match reader {
            Some(reader) => reader.load_into(&mut tree).await,
            None => Ok(())
        };
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        match r.and_then(|_| self.finish_load(inner, tree)) {
            Ok(()) => {
                inner.state = MetaslabState::Loaded;
                inner.histogram = inner.free.histogram().to_vec();
                inner.access_txg = inner.synced_txg + 1;
                self.weight.store(self.compute_weight(inner), Ordering::Relaxed);
                tracing::debug!(free = inner.free.space(),
                    segments = inner.free.len(), "loaded metaslab");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "metaslab load failed");
                inner.free.clear();
                inner.state = MetaslabState::Uninitialized;
                inner.load_error = Some(e.clone());
                self.weight.store(0, Ordering::Relaxed);
                Err(Error::LoadFailed{id: self.id, source: Box::new(e)})
            }
        }
    }

    /// Create a new metaslab, entirely free
    pub fn new(id: MetaslabId, start: u64, size: u64, shift: u8,
               store: Arc<dyn MetaStore>, tunables: Arc<Tunables>) -> Self
    {
        Self::open(id, start, size, shift, MetaslabPhys::default(), store,
                   tunables)
    }

    /// Reopen a metaslab from its persisted summary.
    ///
    /// Any log space map records for it must be passed to
    /// [`replay_log_record`](Self::replay_log_record) before it is used.
    pub fn open(id: MetaslabId, start: u64, size: u64, shift: u8,
                phys: MetaslabPhys, store: Arc<dyn MetaStore>,
                tunables: Arc<Tunables>) -> Self
    {
        let sm = phys.sm.map(|smp| SpaceMap::open(store.clone(), smp));
        let allocated = sm.as_ref().map(SpaceMap::allocated).unwrap_or(0);
        let histogram = sm.as_ref()
            .map(|sm| sm.histogram().to_vec())
            .unwrap_or_default();
        let inner = Inner {
            state: MetaslabState::Uninitialized,
            load_error: None,
            phase: Phase::Idle,
            free: RangeTree::new(),
            allocs: Default::default(),
            frees: Default::default(),
            defer: VecDeque::new(),
            deferspace: 0,
            allocated,
            sm,
            unflushed_allocs: RangeTree::new(),
            unflushed_frees: RangeTree::new(),
            unflushed_txg: phys.unflushed_txg,
            histogram,
            cursors: [0; 64],
            access_txg: TxgT(0),
            synced_txg: TxgT(0),
        };
        let ms = Metaslab {
            id,
            start,
            size,
            shift,
            store,
            tunables,
            inner: RwLock::new(inner),
            io_lock: Mutex::new(()),
            weight: AtomicU64::new(0),
        };
        ms.refresh_weight();
        ms
    }

    /// The summary to persist in the label
    pub fn phys(&self) -> MetaslabPhys {
        let inner = self.inner.read().unwrap();
        MetaslabPhys {
            sm: inner.sm.as_ref().map(|sm| sm.phys().clone()),
            unflushed_txg: inner.unflushed_txg,
        }
    }

    /// Recompute the weight from the current free space
    pub fn refresh_weight(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        let w = self.compute_weight(&inner);
        self.weight.store(w, Ordering::Relaxed);
        w
    }

    /// Apply one log space map record during import.
    ///
    /// Records older than the metaslab's unflushed txg are already in its space
    /// map, and are ignored.
    pub fn replay_log_record(&self, txg: TxgT, tag: MapType, ext: Extent)
        -> Result<()>
    {
        let corrupt = |detail: String| Error::Corruption {
            object: 0,
            block: 0,
            txg: Some(txg),
            detail
        };
        if ext.length == 0 || ext.offset < self.start ||
            ext.end() > self.start + self.size
        {
            return Err(corrupt(format!("log {tag} of {ext} is outside of \
                                       metaslab {}", self.id)));
        }
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        if txg < inner.unflushed_txg {
            return Ok(());
        }
        match tag {
            MapType::Alloc => {
                inner.allocated += ext.length;
                remove_xor_add(ext, &mut inner.unflushed_frees,
                               &mut inner.unflushed_allocs);
            }
            MapType::Free => {
                inner.allocated = inner.allocated.checked_sub(ext.length)
                    .ok_or_else(|| corrupt(format!("log FREE of {ext} in \
                        metaslab {} exceeds allocated space", self.id)))?;
                remove_xor_add(ext, &mut inner.unflushed_allocs,
                               &mut inner.unflushed_frees);
            }
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn space_map<'a>(&self, sm: &'a mut Option<SpaceMap>) -> &'a mut SpaceMap {
        sm.get_or_insert_with(|| {
            SpaceMap::create(self.store.clone(), self.start, self.size,
                             self.shift)
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn state(&self) -> MetaslabState {
        self.inner.read().unwrap().state
    }

    pub fn stats(&self) -> MetaslabStats {
        let inner = self.inner.read().unwrap();
        let (fragmentation, max_segment) = if inner.is_loaded() {
            (fragmentation(inner.free.histogram()),
             Some(inner.free.max_segment()))
        } else {
            (fragmentation(&inner.histogram), None)
        };
        MetaslabStats {
            id: self.id,
            state: inner.state,
            start: self.start,
            size: self.size,
            free: self.size - inner.allocated - inner.deferspace,
            allocated: inner.allocated,
            deferred: inner.deferspace,
            fragmentation,
            max_segment,
            weight: self.weight(),
            records: inner.sm.as_ref().map(SpaceMap::records).unwrap_or(0),
        }
    }

    /// Fold `txg`'s staged changes into durable storage and into the free
    /// tree.
    ///
    /// With a log space map the changes are logged; otherwise they're appended
    /// to the space map.  Either way the space map may be condensed.  An error
    /// means the changes could not be made durable, which is fatal to the
    /// pool.
    #[tracing::instrument(skip(self, log), fields(id = %self.id))]
    pub async fn sync(&self, txg: TxgT, log: Option<&LogSpaceMap>)
        -> Result<SyncDelta>
    {
        let _guard = self.io_lock.lock().await;
        let (fut, delta) = {
            let mut guard = self.inner.write().unwrap();
            let inner = &mut *guard;
            let i = txg_idx(txg);
            let allocs = mem::take(&mut inner.allocs[i]);
            let frees = mem::take(&mut inner.frees[i]);
            let mut delta = SyncDelta {
                alloc: allocs.space() as i64 - frees.space() as i64,
                ..Default::default()
            };
            inner.allocated = (inner.allocated + allocs.space())
                .checked_sub(frees.space())
                .expect("Freed more space than was allocated");

            let condense = inner.is_loaded() && inner.sm.as_ref()
                .map(|sm| sm.should_condense(&inner.free,
                    self.tunables.condense_pct,
                    self.tunables.condense_min_records))
                .unwrap_or(false);
            let mut fut = None;
            if condense {
                inner.phase = Phase::Condensing;
                // Describe the free space as of `txg`.  Space staged for
                // later txgs isn't allocated yet.
                let mut condensed = inner.free.clone();
                for ext in frees.iter()
                    .chain(inner.defer.iter().flat_map(RangeTree::iter))
                    .chain(inner.allocs.iter().flat_map(RangeTree::iter))
                {
                    condensed.add(ext);
                }
                let sm = self.space_map(&mut inner.sm);
                delta.obsolete = Some(sm.condense(&condensed, txg));
                inner.unflushed_allocs.clear();
                inner.unflushed_frees.clear();
                inner.unflushed_txg = txg + 1;
                if let Some(log) = log {
                    log.set_unflushed(self.id, None);
                }
                fut = Some(sm.flush());
            } else if let Some(log) = log {
                if !(allocs.is_empty() && frees.is_empty()) {
                    if inner.unflushed().is_none() {
                        inner.unflushed_txg = txg;
                    }
                    for ext in allocs.iter() {
                        log.record(self.id, txg, MapType::Alloc, ext);
                        remove_xor_add(ext, &mut inner.unflushed_frees,
                                       &mut inner.unflushed_allocs);
                    }
                    for ext in frees.iter() {
                        log.record(self.id, txg, MapType::Free, ext);
                        remove_xor_add(ext, &mut inner.unflushed_allocs,
                                       &mut inner.unflushed_frees);
                    }
                    if inner.unflushed().is_none() {
                        // Every unflushed change cancelled out.  Import must
                        // not replay any of them.
                        inner.unflushed_txg = txg + 1;
                    }
                    log.set_unflushed(self.id, inner.unflushed());
                }
            } else if !(allocs.is_empty() && frees.is_empty()) {
                let sm = self.space_map(&mut inner.sm);
                sm.append_marker(txg);
                sm.append_tree(MapType::Alloc, &allocs);
                sm.append_tree(MapType::Free, &frees);
                fut = Some(sm.flush());
            }

            // Rotate the deferred-free window
            if self.tunables.defer_txgs == 0 {
                if inner.is_loaded() {
                    for ext in frees.iter() {
                        inner.free.add(ext);
                    }
                }
            } else {
                let released = if inner.defer.len() >=
                    self.tunables.defer_txgs as usize
                {
                    inner.defer.pop_front()
                } else {
                    None
                };
                let mut defer_delta = frees.space() as i64;
                if let Some(released) = released {
                    defer_delta -= released.space() as i64;
                    if inner.is_loaded() {
                        for ext in released.iter() {
                            inner.free.add(ext);
                        }
                    }
                }
                inner.deferspace = (inner.deferspace as i64 + defer_delta)
                    as u64;
                inner.defer.push_back(frees);
                delta.defer = defer_delta;
            }

            if inner.is_loaded() {
                inner.histogram = inner.free.histogram().to_vec();
                if let Some(sm) = inner.sm.as_mut() {
                    sm.set_histogram(inner.free.histogram());
                }
            }
            inner.synced_txg = txg;
            (fut, delta)
        };
        let r = match fut {
            Some(fut) => fut.await,
            None => Ok(())
        };
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        inner.phase = Phase::Idle;
        if let Err(e) = r {
            tracing::error!(id = %self.id, %txg, error = %e,
                "metaslab sync failed");
            return Err(e);
        }
        if delta.obsolete.is_some() {
            tracing::info!(id = %self.id, %txg, "condensed space map");
        }
        let idle = inner.allocs.iter().all(RangeTree::is_empty);
        if inner.is_loaded() && idle &&
            txg >= inner.access_txg + self.tunables.unload_delay
        {
            tracing::debug!(id = %self.id, %txg, "unloading idle metaslab");
            Self::unload_locked(inner);
        }
        self.weight.store(self.compute_weight(inner), Ordering::Relaxed);
        Ok(delta)
    }

    /// Drop the free tree to save memory.  It will be reloaded on demand.
    pub fn unload(&self) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        if inner.is_loaded() {
            Self::unload_locked(inner);
            self.weight.store(self.compute_weight(inner), Ordering::Relaxed);
        }
    }

    fn unload_locked(inner: &mut Inner) {
        inner.histogram = inner.free.histogram().to_vec();
        inner.free.clear();
        inner.cursors = [0; 64];
        inner.state = MetaslabState::Unloaded;
    }

    /// Unflushed txg and unflushed segment count, or `None` if every change has
    /// been flushed.
    pub fn unflushed(&self) -> Option<(TxgT, u64)> {
        self.inner.read().unwrap().unflushed()
    }

    /// Allocation desirability.  Higher is better.
    ///
    /// The top bit is set for loaded metaslabs that aren't too fragmented.  The
    /// next seven bits are one more than log2 of the largest free segment, or
    /// an estimate of it.  The rest is the free space, discounted for
    /// fragmentation.
    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Metaslab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metaslab")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("size", &self.size)
            .field("weight", &format_args!("{:#x}", self.weight()))
            .finish()
    }
}

// LCOV_EXCL_STOP
