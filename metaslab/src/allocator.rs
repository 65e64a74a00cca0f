// vim: tw=80
//! Choosing a group, and within it a metaslab, for each new extent

use crate::{
    metaslab_class::MetaslabClass,
    metaslab_group::MetaslabGroup,
    tunables::Tunables,
    types::*
};
use std::{fmt, sync::Arc};

/// Modifiers for [`allocate`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocFlags {
    /// Start with the group after the hinted one, rather than the hinted one
    /// itself.  Used to spread copies of one block across devices.
    pub hint_avoid: bool,
    /// Skip straight to the relaxed pass, ignoring throttles and the
    /// allocatable flags.
    pub try_hard: bool,
}

/// An allocated extent whose write has not yet been issued.
///
/// While it exists the extent counts against its group's in-flight throttle.
/// It must be disposed of with [`commit`](Self::commit) once the write is
/// issued, or with [`abort`](Self::abort) if the write is abandoned.
#[must_use = "a Reservation must be committed or aborted"]
pub struct Reservation {
    dva: Dva,
    group: Arc<MetaslabGroup>,
    txg: TxgT,
    disposed: bool,
}

impl Reservation {
    /// Abandon the allocation, returning its space immediately
    pub fn abort(mut self) {
        self.group.free_now(&self.dva, self.txg);
        self.group.release(self.dva.asize);
        self.disposed = true;
    }

    /// Keep the allocation.  It becomes durable when its txg syncs.
    pub fn commit(mut self) -> Dva {
        self.group.release(self.dva.asize);
        self.disposed = true;
        self.dva
    }

    pub fn dva(&self) -> Dva {
        self.dva
    }

    fn new(dva: Dva, group: Arc<MetaslabGroup>, txg: TxgT) -> Self {
        Reservation{dva, group, txg, disposed: false}
    }

    pub fn txg(&self) -> TxgT {
        self.txg
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("dva", &self.dva)
            .field("txg", &self.txg)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.disposed {
            // The extent stays allocated; only the throttle is released
            tracing::warn!(dva = %self.dva, txg = %self.txg,
                "Reservation dropped without commit or abort");
            self.group.release(self.dva.asize);
        }
    }
}

/// Allocate `size` bytes from `class`.
///
/// Groups are visited starting at the class rotor, or at the hinted device.
/// The first pass skips groups that are busy or, if the class's policy says
/// so, not allocatable; the second pass only skips passivated groups.  The
/// rotor moves on once its group has received its aliquot plus bias.
///
/// Fails with [`Error::Exhausted`] if no group can supply one contiguous
/// extent.  Splitting the request is the caller's business.
pub async fn allocate(class: &MetaslabClass, tunables: &Tunables, size: u64,
                      align: u64, txg: TxgT, hint: Option<VdevT>,
                      flags: AllocFlags) -> Result<Reservation>
{
    check_request(size, align)?;
    let exhausted = Error::Exhausted{class: class.kind().name(), size};
    let groups = class.groups();
    let n = groups.len();
    if n == 0 {
        return Err(exhausted);
    }
    let start = hint.and_then(|vdev| groups.iter().position(|g| g.vdev() == vdev))
        .map(|i| if flags.hint_avoid { (i + 1) % n } else { i })
        .unwrap_or_else(|| class.ctx().rotor);
    let first_pass = if flags.try_hard { 1 } else { 0 };
    for pass in first_pass..2 {
        let strict = pass == 0;
        let honor_allocatable = strict
            && class.kind().policy().honor_allocatable
            && class.ctx().alloc_groups > 0;
        for i in (0..n).map(|k| (start + k) % n) {
            let group = &groups[i];
            if group.is_passivated() ||
                (strict && group.is_busy()) ||
                (honor_allocatable && !group.is_allocatable())
            {
                continue;
            }
            if let Some(dva) = group.alloc(size, align, txg).await? {
                advance_rotor(class, tunables, i, dva.asize);
                return Ok(Reservation::new(dva, group.clone(), txg));
            }
        }
        if strict {
            tracing::debug!(class = %class.kind(), size,
                "strict pass failed; relaxing");
        }
    }
    Err(exhausted)
}

/// Charge `asize` bytes to group `i`'s aliquot
fn advance_rotor(class: &MetaslabClass, tunables: &Tunables, i: usize,
                 asize: u64)
{
    let mut ctx = class.ctx();
    if ctx.rotor != i {
        class.arrive(&mut ctx, i, tunables.aliquot, tunables.bias_enabled);
    }
    ctx.aliquot += asize;
    if ctx.aliquot as i64 >= tunables.aliquot as i64 + ctx.bias {
        let next = (i + 1) % class.groups().len();
        class.arrive(&mut ctx, next, tunables.aliquot, tunables.bias_enabled);
    }
}

/// Reject requests that no extent could satisfy
pub(crate) fn check_request(size: u64, align: u64) -> Result<()> {
    if size == 0 || !align.is_power_of_two() {
        Err(Error::InvalidRequest{size, align})
    } else {
        Ok(())
    }
}

// LCOV_EXCL_STOP
