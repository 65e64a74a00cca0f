// vim: tw=80
//! All of the metaslabs of one top-level device

use atomic_enum::atomic_enum;
use crate::{
    log_space_map::LogSpaceMap,
    metaslab::*,
    metaslab_class::ClassKind,
    store::*,
    tunables::Tunables,
    types::*,
    util::*
};
use futures::{TryStreamExt, stream::FuturesUnordered};
use serde_derive::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex
    }
};

/// Whether a group may receive new allocations
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum GroupState {
    Active,
    /// The device is offline, faulted, or being removed
    Passivated,
}

/// Persistent description of one group.  Stored in the pool label.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupPhys {
    pub vdev: VdevT,
    pub class: ClassKind,
    /// Allocatable bytes on the device
    pub asize: u64,
    /// log2 of the device's allocation granularity
    pub shift: u8,
    /// log2 of the metaslab size
    pub ms_shift: u8,
    pub metaslabs: Vec<MetaslabPhys>,
}

/// Read-only statistics
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupStats {
    pub vdev: VdevT,
    pub passivated: bool,
    pub health: Health,
    pub allocatable: bool,
    pub size: u64,
    pub free: u64,
    pub allocated: u64,
    pub deferred: u64,
    pub fragmentation: Option<u64>,
    pub inflight: u64,
    pub metaslabs: Vec<MetaslabStats>,
}

/// Result of syncing every metaslab in a group
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GroupSyncDelta {
    pub alloc: i64,
    pub defer: i64,
    pub obsolete: Vec<ObjectT>,
}

/// Metaslabs ordered by weight, best first, ties going to the lowest slot
#[derive(Debug, Default)]
struct Ranking {
    set: BTreeSet<(Reverse<u64>, u32)>,
    weights: Vec<u64>,
}

impl Ranking {
    fn update(&mut self, slot: u32, weight: u64) {
        let old = self.weights[slot as usize];
        self.set.remove(&(Reverse(old), slot));
        self.set.insert((Reverse(weight), slot));
        self.weights[slot as usize] = weight;
    }
}

pub struct MetaslabGroup {
    vdev: VdevT,
    class: ClassKind,
    asize: u64,
    shift: u8,
    ms_shift: u8,
    metaslabs: Vec<Arc<Metaslab>>,
    ranking: Mutex<Ranking>,
    state: AtomicGroupState,
    health: Mutex<Health>,
    /// Computed at every sync from free capacity and fragmentation
    allocatable: AtomicBool,
    /// Bytes reserved by allocations that are not yet committed or aborted
    inflight: AtomicU64,
    tunables: Arc<Tunables>,
}

impl MetaslabGroup {
    /// Allocate `size` bytes from the best metaslab that can satisfy them.
    ///
    /// Metaslabs are tried in weight order, loading them as needed, up to
    /// `max_metaslab_attempts`.  On success the allocation is charged to the
    /// group's in-flight throttle.  Returns `Ok(None)` if no metaslab could
    /// satisfy the request.
    pub async fn alloc(&self, size: u64, align: u64, txg: TxgT)
        -> Result<Option<Dva>>
    {
        let align = align.max(1 << self.shift);
        let asize = p2_roundup(size, 1 << self.shift);
        let candidates = self.ranking.lock().unwrap().set.iter()
            .filter(|(Reverse(w), _)| may_satisfy(*w, asize))
            .take(self.tunables.max_metaslab_attempts)
            .map(|&(_, slot)| slot)
            .collect::<Vec<_>>();
        for slot in candidates {
            let ms = &self.metaslabs[slot as usize];
            if !ms.is_loaded() {
                if let Err(e) = ms.load().await {
                    tracing::warn!(vdev = self.vdev, slot, error = %e,
                        "skipping metaslab that failed to load");
                    self.rerank(slot);
                    continue;
                }
            }
            match ms.alloc(asize, align, txg) {
                Some(ext) => {
                    self.inflight.fetch_add(asize, Ordering::Relaxed);
                    return Ok(Some(Dva::new(self.vdev, ext.offset, asize)));
                }
                None => self.rerank(slot)
            }
        }
        Ok(None)
    }

    pub fn asize(&self) -> u64 {
        self.asize
    }

    /// Claim an in-use extent during import
    pub async fn claim(&self, dva: &Dva, txg: TxgT) -> Result<()> {
        let ms = self.metaslab_for(dva);
        let r = ms.claim(dva.extent(), txg).await;
        self.rerank(ms.id().slot);
        r
    }

    pub fn class(&self) -> ClassKind {
        self.class
    }

    /// Create a group for a freshly formatted device
    pub fn create(vdev: VdevT, class: ClassKind,
                  asize: u64, shift: u8, store: Arc<dyn MetaStore>,
                  tunables: Arc<Tunables>) -> Self
    {
        let ms_shift = tunables.metaslab_shift;
        let nmetaslabs = div_roundup(asize, 1 << ms_shift);
        let metaslabs = (0..nmetaslabs).map(|_| MetaslabPhys::default())
            .collect();
        let phys = GroupPhys{vdev, class, asize, shift, ms_shift, metaslabs};
        Self::open(phys, store, tunables)
    }

    /// Current fragmentation: the mean of the metaslabs' fragmentation,
    /// weighted by their free space.
    pub fn fragmentation(&self) -> Option<u64> {
        let (num, denom) = self.metaslabs.iter()
            .map(|ms| ms.stats())
            .filter_map(|s| s.fragmentation.map(|f| (f, s.free)))
            .fold((0u128, 0u128), |(n, d), (f, free)| {
                (n + u128::from(f) * u128::from(free), d + u128::from(free))
            });
        (denom > 0).then(|| (num / denom) as u64)
    }

    /// Stage a free
    pub fn free(&self, dva: &Dva, txg: TxgT) {
        self.metaslab_for(dva).free(dva.extent(), txg)
    }

    /// Undo an allocation made in the current txg
    pub fn free_now(&self, dva: &Dva, txg: TxgT) {
        let ms = self.metaslab_for(dva);
        ms.free_now(dva.extent(), txg);
        self.rerank(ms.id().slot);
    }

    /// Free bytes, counting deferred frees as not free
    pub fn free_space(&self) -> u64 {
        self.metaslabs.iter().map(|ms| ms.stats().free).sum()
    }

    /// Bytes of in-flight allocations
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// May the normal allocation policy use this group?
    pub fn is_allocatable(&self) -> bool {
        self.allocatable.load(Ordering::Relaxed)
    }

    /// Has the group reached its in-flight allocation limit?
    pub fn is_busy(&self) -> bool {
        self.inflight() >= self.tunables.group_max_inflight
    }

    pub fn is_passivated(&self) -> bool {
        self.state.load(Ordering::Relaxed) == GroupState::Passivated
    }

    pub fn metaslab(&self, slot: u32) -> Option<&Arc<Metaslab>> {
        self.metaslabs.get(slot as usize)
    }

    fn metaslab_for(&self, dva: &Dva) -> &Arc<Metaslab> {
        assert_eq!(dva.vdev, self.vdev, "DVA {dva} routed to the wrong group");
        let slot = (dva.offset >> self.ms_shift) as usize;
        assert!(slot < self.metaslabs.len() && dva.offset + dva.asize <=
                self.asize, "DVA {dva} is beyond the end of its device");
        &self.metaslabs[slot]
    }

    pub fn metaslabs(&self) -> &[Arc<Metaslab>] {
        &self.metaslabs
    }

    /// React to a change in the device's health
    pub fn on_health_change(&self, health: Health) {
        let state = if health.is_allocatable() {
            GroupState::Active
        } else {
            GroupState::Passivated
        };
        let old = std::mem::replace(&mut *self.health.lock().unwrap(), health);
        if old != health {
            tracing::info!(vdev = self.vdev, %old, new = %health,
                "device health changed");
        }
        self.state.store(state, Ordering::Relaxed);
    }

    /// Reopen a group from its persisted description.
    ///
    /// The last metaslab may be shorter than the rest.
    pub fn open(phys: GroupPhys, store: Arc<dyn MetaStore>,
                tunables: Arc<Tunables>) -> Self
    {
        let ms_size = 1u64 << phys.ms_shift;
        let metaslabs = phys.metaslabs.into_iter()
            .enumerate()
            .map(|(slot, msp)| {
                let start = slot as u64 * ms_size;
                let size = ms_size.min(phys.asize - start);
                let id = MetaslabId::new(phys.vdev, slot as u32);
                Arc::new(Metaslab::open(id, start, size, phys.shift, msp,
                                        store.clone(), tunables.clone()))
            }).collect::<Vec<_>>();
        let mut ranking = Ranking {
            set: BTreeSet::new(),
            weights: vec![0; metaslabs.len()]
        };
        for (slot, ms) in metaslabs.iter().enumerate() {
            ranking.set.insert((Reverse(0), slot as u32));
            ranking.update(slot as u32, ms.weight());
        }
        MetaslabGroup {
            vdev: phys.vdev,
            class: phys.class,
            asize: phys.asize,
            shift: phys.shift,
            ms_shift: phys.ms_shift,
            metaslabs,
            ranking: Mutex::new(ranking),
            state: AtomicGroupState::new(GroupState::Active),
            health: Mutex::new(Health::Online),
            allocatable: AtomicBool::new(true),
            inflight: AtomicU64::new(0),
            tunables,
        }
    }

    /// The description to persist in the label
    pub fn phys(&self) -> GroupPhys {
        GroupPhys {
            vdev: self.vdev,
            class: self.class,
            asize: self.asize,
            shift: self.shift,
            ms_shift: self.ms_shift,
            metaslabs: self.metaslabs.iter().map(|ms| ms.phys()).collect()
        }
    }

    /// Load the best few unloaded metaslabs, so that allocations needn't wait.
    pub async fn preload(&self) {
        let slots = self.ranking.lock().unwrap().set.iter()
            .map(|&(_, slot)| slot)
            .filter(|&slot| {
                let ms = &self.metaslabs[slot as usize];
                ms.weight() > 0 && !ms.is_loaded()
            }).take(self.tunables.preload_limit)
            .collect::<Vec<_>>();
        for slot in slots {
            let ms = &self.metaslabs[slot as usize];
            match ms.load().await {
                Ok(()) => self.rerank(slot),
                Err(e) => {
                    tracing::warn!(vdev = self.vdev, slot, error = %e,
                        "preload failed");
                    self.rerank(slot);
                }
            }
        }
    }

    /// Return in-flight bytes to the throttle
    pub fn release(&self, asize: u64) {
        let old = self.inflight.fetch_sub(asize, Ordering::Relaxed);
        debug_assert!(old >= asize, "Released more than was reserved");
    }

    /// Recompute every metaslab's weight and the group's ranking
    pub fn refresh(&self) {
        let mut ranking = self.ranking.lock().unwrap();
        for ms in self.metaslabs.iter() {
            ranking.update(ms.id().slot, ms.refresh_weight());
        }
        drop(ranking);
        self.refresh_allocatable();
    }

    fn refresh_allocatable(&self) {
        let free_pct = self.free_space() * 100 / self.asize.max(1);
        let frag = self.fragmentation().unwrap_or(0);
        let allocatable = free_pct > self.tunables.group_noalloc_threshold
            && frag <= self.tunables.group_fragmentation_threshold;
        let old = self.allocatable.swap(allocatable, Ordering::Relaxed);
        if old != allocatable {
            tracing::info!(vdev = self.vdev, allocatable, free_pct, frag,
                "group allocatability changed");
        }
    }

    fn rerank(&self, slot: u32) {
        let weight = self.metaslabs[slot as usize].weight();
        self.ranking.lock().unwrap().update(slot, weight);
    }

    pub fn stats(&self) -> GroupStats {
        let metaslabs = self.metaslabs.iter()
            .map(|ms| ms.stats())
            .collect::<Vec<_>>();
        GroupStats {
            vdev: self.vdev,
            passivated: self.is_passivated(),
            health: *self.health.lock().unwrap(),
            allocatable: self.is_allocatable(),
            size: self.asize,
            free: metaslabs.iter().map(|s| s.free).sum(),
            allocated: metaslabs.iter().map(|s| s.allocated).sum(),
            deferred: metaslabs.iter().map(|s| s.deferred).sum(),
            fragmentation: self.fragmentation(),
            inflight: self.inflight(),
            metaslabs,
        }
    }

    /// Sync every metaslab for `txg`, then rerank them.
    pub async fn sync(&self, txg: TxgT, log: Option<&LogSpaceMap>)
        -> Result<GroupSyncDelta>
    {
        let deltas = self.metaslabs.iter()
            .map(|ms| ms.sync(txg, log))
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await?;
        let mut total = GroupSyncDelta::default();
        for d in deltas {
            total.alloc += d.alloc;
            total.defer += d.defer;
            total.obsolete.extend(d.obsolete);
        }
        {
            let mut ranking = self.ranking.lock().unwrap();
            for ms in self.metaslabs.iter() {
                ranking.update(ms.id().slot, ms.weight());
            }
        }
        self.refresh_allocatable();
        Ok(total)
    }

    /// Unload every metaslab
    pub fn unload_all(&self) {
        for ms in self.metaslabs.iter() {
            ms.unload();
        }
        self.refresh();
    }

    pub fn vdev(&self) -> VdevT {
        self.vdev
    }
}

// LCOV_EXCL_STOP
