// vim: tw=80
//! All of the groups that serve one allocation purpose

use crate::{
    log_space_map::LogSpaceMap,
    metaslab_group::*,
    types::*,
};
use futures::{TryStreamExt, stream::FuturesUnordered};
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard}
};

/// What a class's space is used for
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum ClassKind {
    /// General data and metadata
    Normal,
    /// Intent log blocks, written synchronously and freed soon after
    Log,
    /// Small blocks and metadata, on faster devices
    Special,
    /// Deduplication tables
    Dedup,
}

/// Per-class allocation policy
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassPolicy {
    /// Skip groups that aren't allocatable, while any others are
    pub honor_allocatable: bool,
    /// Steer the rotor toward groups with more free space
    pub bias: bool,
}

impl ClassKind {
    pub fn name(self) -> &'static str {
        match self {
            ClassKind::Normal => "normal",
            ClassKind::Log => "log",
            ClassKind::Special => "special",
            ClassKind::Dedup => "dedup",
        }
    }

    pub fn policy(self) -> ClassPolicy {
        match self {
            ClassKind::Normal | ClassKind::Special | ClassKind::Dedup =>
                ClassPolicy{honor_allocatable: true, bias: true},
            // Log blocks are short-lived, so balance doesn't matter, and they
            // must be written somewhere even if every group is nearly full.
            ClassKind::Log => ClassPolicy{honor_allocatable: false, bias: false},
        }
    }
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// Class-wide mutable state.  Only touched under the class lock.
#[derive(Debug, Default)]
pub struct ClassCtx {
    /// Index of the group that receives the next allocation
    pub rotor: usize,
    /// Bytes allocated from the rotor group since the rotor arrived there
    pub aliquot: u64,
    /// Extra bytes the rotor group may receive before the rotor moves on
    pub bias: i64,
    /// Allocated bytes, as of the last sync
    pub alloc: u64,
    /// Bytes waiting out the deferred-free window
    pub deferred: u64,
    /// Total bytes in every group
    pub space: u64,
    /// Number of groups that are allocatable and active
    pub alloc_groups: usize,
}

/// Read-only statistics
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassStats {
    pub kind: ClassKind,
    pub space: u64,
    pub alloc: u64,
    pub deferred: u64,
    pub free: u64,
    pub fragmentation: Option<u64>,
    pub groups: Vec<GroupStats>,
}

pub struct MetaslabClass {
    kind: ClassKind,
    groups: Vec<Arc<MetaslabGroup>>,
    ctx: Mutex<ClassCtx>,
}

impl MetaslabClass {
    /// Recompute the rotor group's bias, when it arrives at `rotor`.
    ///
    /// A group with twice the class's average free space receives twice the
    /// aliquot, and so on.
    pub(crate) fn arrive(&self, ctx: &mut ClassCtx, rotor: usize,
                         aliquot: u64, bias_enabled: bool)
    {
        ctx.rotor = rotor;
        ctx.aliquot = 0;
        ctx.bias = 0;
        if bias_enabled && self.kind.policy().bias && ctx.alloc_groups > 0 {
            let mc_free = ctx.space.saturating_sub(ctx.alloc + ctx.deferred);
            let vs_free = self.groups[rotor].free_space();
            let ratio = u128::from(vs_free) * ctx.alloc_groups as u128 * 100
                / (u128::from(mc_free) + 1);
            ctx.bias = (ratio as i64 - 100) * aliquot as i64 / 100;
        }
    }

    /// Lock the class-wide context
    pub fn ctx(&self) -> MutexGuard<'_, ClassCtx> {
        self.ctx.lock().unwrap()
    }

    /// Bytes free for allocation, as of the last sync
    pub fn free_space(&self) -> u64 {
        let ctx = self.ctx();
        ctx.space.saturating_sub(ctx.alloc + ctx.deferred)
    }

    pub fn groups(&self) -> &[Arc<MetaslabGroup>] {
        &self.groups
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn new(kind: ClassKind, groups: Vec<Arc<MetaslabGroup>>) -> Self {
        let class = MetaslabClass {
            kind,
            groups,
            ctx: Mutex::new(ClassCtx::default()),
        };
        class.refresh();
        class
    }

    /// Recompute the class counters from the groups
    pub fn refresh(&self) {
        let mut ctx = self.ctx();
        ctx.space = 0;
        ctx.alloc = 0;
        ctx.deferred = 0;
        for g in self.groups.iter() {
            let stats = g.stats();
            ctx.space += stats.size;
            ctx.alloc += stats.allocated;
            ctx.deferred += stats.deferred;
        }
        ctx.alloc_groups = self.groups.iter()
            .filter(|g| g.is_allocatable() && !g.is_passivated())
            .count();
    }

    pub fn stats(&self) -> ClassStats {
        let groups = self.groups.iter()
            .map(|g| g.stats())
            .collect::<Vec<_>>();
        let (num, denom) = groups.iter()
            .filter_map(|g| g.fragmentation.map(|f| (f, g.free)))
            .fold((0u128, 0u128), |(n, d), (f, free)| {
                (n + u128::from(f) * u128::from(free), d + u128::from(free))
            });
        let ctx = self.ctx();
        ClassStats {
            kind: self.kind,
            space: ctx.space,
            alloc: ctx.alloc,
            deferred: ctx.deferred,
            free: ctx.space.saturating_sub(ctx.alloc + ctx.deferred),
            fragmentation: (denom > 0).then(|| (num / denom) as u64),
            groups,
        }
    }

    /// Sync every group in the class for `txg`.
    ///
    /// Returns the objects made obsolete, which may be freed once the next
    /// label is durable.
    #[tracing::instrument(skip(self, log), fields(class = %self.kind))]
    pub async fn sync(&self, txg: TxgT, log: Option<&LogSpaceMap>)
        -> Result<Vec<ObjectT>>
    {
        let deltas = self.groups.iter()
            .map(|g| g.sync(txg, log))
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await?;
        let mut obsolete = Vec::new();
        let mut ctx = self.ctx();
        for d in deltas {
            ctx.alloc = (ctx.alloc as i64 + d.alloc) as u64;
            ctx.deferred = (ctx.deferred as i64 + d.defer) as u64;
            obsolete.extend(d.obsolete);
        }
        ctx.alloc_groups = self.groups.iter()
            .filter(|g| g.is_allocatable() && !g.is_passivated())
            .count();
        tracing::debug!(alloc = ctx.alloc, deferred = ctx.deferred,
            alloc_groups = ctx.alloc_groups, "synced class");
        Ok(obsolete)
    }
}

// LCOV_EXCL_STOP
