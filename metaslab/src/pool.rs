// vim: tw=80
//! A storage pool's complete free-space state
//!
//! The `Pool` owns every class, group, and metaslab, plus the log space map.
//! It is driven by the transaction layer: allocations and frees during a txg,
//! then one [`Pool::sync`] per txg, then [`Pool::write_label`].

use crate::{
    allocator::*,
    label::*,
    log_space_map::*,
    metaslab::Metaslab,
    metaslab_class::*,
    metaslab_group::*,
    store::*,
    tunables::Tunables,
    types::*,
};
use futures::{TryFutureExt, TryStreamExt, stream::FuturesUnordered};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex
    }
};

/// Everything needed to reopen a pool.  Written by [`Pool::write_label`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolLabel {
    /// Human-readable name
    pub name: String,
    /// Pool UUID, fixed at format time
    pub uuid: Uuid,
    /// Last synced txg
    pub txg: TxgT,
    /// One per top-level device, indexed by `VdevT`
    pub groups: Vec<GroupPhys>,
    /// Present iff the pool uses a log space map
    pub log: Option<LogSpaceMapPhys>,
}

/// Describes one top-level device when creating a pool
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VdevSpec {
    pub class: ClassKind,
    /// Allocatable bytes
    pub asize: u64,
    /// log2 of the minimum allocation granularity
    pub shift: u8,
}

impl VdevSpec {
    pub fn new(class: ClassKind, asize: u64, shift: u8) -> Self {
        VdevSpec{class, asize, shift}
    }
}

/// Return value of [`Pool::status`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolStats {
    pub name: String,
    pub uuid: Uuid,
    pub txg: TxgT,
    /// The error that suspended the pool, if any
    pub suspended: Option<Error>,
    pub classes: Vec<ClassStats>,
    pub log: Option<LogSpaceMapStats>,
}

pub struct Pool {
    name: String,
    uuid: Uuid,
    store: Arc<dyn MetaStore>,
    tunables: Arc<Tunables>,
    /// Indexed by `VdevT`
    groups: Vec<Arc<MetaslabGroup>>,
    classes: BTreeMap<ClassKind, MetaslabClass>,
    log: Option<LogSpaceMap>,
    synced_txg: AtomicU32,
    /// Objects made obsolete by the last sync.  They're still referenced by
    /// the last durable label until the next one is written.
    pending_frees: Mutex<Vec<ObjectT>>,
    suspended: Mutex<Option<Error>>,
}

impl Pool {
    /// Allocate `size` bytes from the `class` class.
    ///
    /// See [`allocate`] for the policy.
    pub async fn alloc(&self, class: ClassKind, size: u64, align: u64,
                       txg: TxgT, hint: Option<VdevT>, flags: AllocFlags)
        -> Result<Reservation>
    {
        self.check_suspended()?;
        check_request(size, align)?;
        match self.classes.get(&class) {
            Some(mc) => allocate(mc, &self.tunables, size, align, txg, hint,
                                 flags).await,
            None => Err(Error::Exhausted{class: class.name(), size})
        }
    }

    /// Sort the groups into classes
    fn assemble(groups: &[Arc<MetaslabGroup>])
        -> BTreeMap<ClassKind, MetaslabClass>
    {
        let mut by_kind = BTreeMap::<ClassKind, Vec<_>>::new();
        for g in groups {
            by_kind.entry(g.class()).or_default().push(g.clone());
        }
        by_kind.into_iter()
            .map(|(kind, groups)| (kind, MetaslabClass::new(kind, groups)))
            .collect()
    }

    fn check_suspended(&self) -> Result<()> {
        if self.suspended.lock().unwrap().is_some() {
            Err(Error::Suspended)
        } else {
            Ok(())
        }
    }

    /// Mark an extent allocated during import, without going through
    /// [`alloc`](Self::alloc).
    pub async fn claim(&self, dva: &Dva, txg: TxgT) -> Result<()> {
        self.check_suspended()?;
        self.group(dva.vdev)
            .ok_or(Error::NotFound(dva.extent()))?
            .claim(dva, txg).await
    }

    pub fn class(&self, kind: ClassKind) -> Option<&MetaslabClass> {
        self.classes.get(&kind)
    }

    /// Format a new pool
    pub fn create(name: String, vdevs: &[VdevSpec], store: Arc<dyn MetaStore>,
                  tunables: Arc<Tunables>) -> Self
    {
        let groups = vdevs.iter()
            .enumerate()
            .map(|(i, spec)| {
                Arc::new(MetaslabGroup::create(i as VdevT, spec.class,
                    spec.asize, spec.shift, store.clone(), tunables.clone()))
            }).collect::<Vec<_>>();
        let log = tunables.log_spacemap.then(|| {
            LogSpaceMap::new(store.clone(), Self::count_metaslabs(&groups))
        });
        let classes = Self::assemble(&groups);
        tracing::info!(%name, ngroups = groups.len(), log = log.is_some(),
            "created pool");
        Pool {
            name,
            uuid: Uuid::new_v4(),
            store,
            tunables,
            groups,
            classes,
            log,
            synced_txg: AtomicU32::new(0),
            pending_frees: Mutex::new(Vec::new()),
            suspended: Mutex::new(None),
        }
    }

    fn count_metaslabs(groups: &[Arc<MetaslabGroup>]) -> u64 {
        groups.iter().map(|g| g.metaslabs().len() as u64).sum()
    }

    /// Stage a free.  The space becomes allocatable again once the deferred
    /// free window has passed.
    ///
    /// # Panics
    ///
    /// If `dva` doesn't belong to this pool, or is already free.
    pub fn free(&self, dva: &Dva, txg: TxgT) {
        self.group(dva.vdev)
            .unwrap_or_else(|| panic!("Freeing {dva} from unknown device"))
            .free(dva, txg)
    }

    /// Undo an allocation made in the current txg.  The space is immediately
    /// allocatable.
    pub fn free_now(&self, dva: &Dva, txg: TxgT) {
        self.group(dva.vdev)
            .unwrap_or_else(|| panic!("Freeing {dva} from unknown device"))
            .free_now(dva, txg)
    }

    pub fn group(&self, vdev: VdevT) -> Option<&Arc<MetaslabGroup>> {
        self.groups.get(vdev as usize)
    }

    pub fn groups(&self) -> &[Arc<MetaslabGroup>] {
        &self.groups
    }

    pub fn log(&self) -> Option<&LogSpaceMap> {
        self.log.as_ref()
    }

    fn metaslab(&self, id: MetaslabId) -> Option<&Arc<Metaslab>> {
        self.group(id.vdev)?.metaslab(id.slot)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// React to a device's health changing
    pub fn on_device_event(&self, vdev: VdevT, health: Health) {
        let Some(g) = self.group(vdev) else {
            tracing::warn!(vdev, %health, "event for unknown device");
            return;
        };
        g.on_health_change(health);
        if let Some(mc) = self.classes.get(&g.class()) {
            mc.refresh();
        }
    }

    /// Import a pool from its label.
    ///
    /// Replays the log space map, if any.  Corruption anywhere but in the
    /// newest log's final block fails the import.
    #[tracing::instrument(skip(store, reader, tunables))]
    pub async fn open(store: Arc<dyn MetaStore>, reader: &mut LabelReader,
                      tunables: Arc<Tunables>) -> Result<Self>
    {
        let label: PoolLabel = reader.deserialize()
            .map_err(|_| Error::InvalidLabel)?;
        let groups = label.groups.into_iter()
            .enumerate()
            .map(|(i, phys)| {
                if phys.vdev as usize != i {
                    return Err(Error::InvalidLabel);
                }
                Ok(Arc::new(MetaslabGroup::open(phys, store.clone(),
                                                tunables.clone())))
            }).collect::<Result<Vec<_>>>()?;
        let log = match label.log {
            Some(phys) => {
                let log = LogSpaceMap::open(store.clone(), phys,
                                            Self::count_metaslabs(&groups));
                log.replay(|txg, rec| {
                    groups.get(rec.id.vdev as usize)
                        .and_then(|g| g.metaslab(rec.id.slot))
                        .ok_or_else(|| Error::Corruption {
                            object: 0,
                            block: 0,
                            txg: Some(txg),
                            detail: format!("log record for unknown \
                                            metaslab {}", rec.id)
                        })?
                        .replay_log_record(txg, rec.tag, rec.extent)
                }).await?;
                for ms in groups.iter().flat_map(|g| g.metaslabs()) {
                    log.set_unflushed(ms.id(), ms.unflushed());
                }
                Some(log)
            }
            None => None
        };
        for g in groups.iter() {
            g.refresh();
        }
        let classes = Self::assemble(&groups);
        tracing::info!(name = %label.name, txg = %label.txg, "imported pool");
        Ok(Pool {
            name: label.name,
            uuid: label.uuid,
            store,
            tunables,
            groups,
            classes,
            log,
            synced_txg: AtomicU32::new(label.txg.0),
            pending_frees: Mutex::new(Vec::new()),
            suspended: Mutex::new(None),
        })
    }

    pub fn status(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            uuid: self.uuid,
            txg: self.synced_txg(),
            suspended: self.suspended.lock().unwrap().clone(),
            classes: self.classes.values()
                .map(MetaslabClass::stats)
                .collect(),
            log: self.log.as_ref().map(LogSpaceMap::stats),
        }
    }

    /// Make `txg`'s allocations and frees durable.
    ///
    /// Call once per txg, after the txg's last allocation.  Any I/O or
    /// corruption error suspends the pool.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self, txg: TxgT) -> Result<()> {
        self.check_suspended()?;
        debug_assert!(txg > self.synced_txg(),
            "txg {txg} was already synced");
        let r = self.sync_priv(txg).await;
        if let Err(e) = &r {
            if e.is_fatal() {
                tracing::error!(%txg, error = %e, "suspending pool");
                *self.suspended.lock().unwrap() = Some(e.clone());
            }
        }
        r
    }

    async fn sync_priv(&self, txg: TxgT) -> Result<()> {
        // The label that references these is now overwritten
        let pending = mem::take(&mut *self.pending_frees.lock().unwrap());
        pending.iter()
            .map(|&object| self.store.free_object(object))
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await?;

        if let Some(log) = &self.log {
            let flushed = log.flush_candidates(&self.tunables).into_iter()
                .filter_map(|id| self.metaslab(id))
                .map(|ms| ms.flush(txg, log))
                .collect::<FuturesUnordered<_>>()
                .try_collect::<Vec<_>>()
                .await?;
            tracing::debug!(flushed = flushed.iter().filter(|f| **f).count(),
                "flushed metaslabs");
        }

        let mut obsolete = self.classes.values()
            .map(|mc| mc.sync(txg, self.log.as_ref()))
            .collect::<FuturesUnordered<_>>()
            .try_concat()
            .await?;

        if let Some(log) = &self.log {
            let (fut, destroyed) = log.close_txg(txg);
            fut.await?;
            obsolete.extend(destroyed);
        }
        self.pending_frees.lock().unwrap().extend(obsolete);
        self.synced_txg.store(txg.0, Ordering::Relaxed);

        if self.tunables.preload_enabled {
            futures::future::join_all(self.groups.iter().map(|g| g.preload()))
                .await;
        }
        Ok(())
    }

    /// The most recently synced txg
    pub fn synced_txg(&self) -> TxgT {
        TxgT(self.synced_txg.load(Ordering::Relaxed))
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Drop every metaslab's free tree
    pub fn unload_all(&self) {
        for g in self.groups.iter() {
            g.unload_all();
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Serialize the pool's state as of the last sync into `labeller`.
    ///
    /// Once that label is durable, the objects made obsolete by the last sync
    /// may be freed, which the next sync will do.
    pub fn write_label(&self, labeller: &mut LabelWriter) -> Result<()> {
        let label = PoolLabel {
            name: self.name.clone(),
            uuid: self.uuid,
            txg: self.synced_txg(),
            groups: self.groups.iter().map(|g| g.phys()).collect(),
            log: self.log.as_ref().map(LogSpaceMap::phys),
        };
        labeller.serialize(&label)
            .map_err(Error::from)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("txg", &self.synced_txg())
            .finish()
    }
}

/// Import a pool from a flat label buffer, as produced by
/// [`LabelWriter::into_vec`].
pub async fn open_from_bytes(store: Arc<dyn MetaStore>, label: Vec<u8>,
                             tunables: Arc<Tunables>) -> Result<Pool>
{
    let mut reader = LabelReader::new(label)?;
    Pool::open(store, &mut reader, tunables)
        .inspect_err(|e| tracing::warn!(error = %e, "import failed"))
        .await
}

// LCOV_EXCL_STOP
