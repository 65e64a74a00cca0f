// vim: tw=80
//! The pool-wide log space map
//!
//! Writing every dirty metaslab's space map on every sync costs at least one
//! block write per metaslab.  Instead, each txg's changes for all metaslabs
//! are appended to a single log object for that txg.  Metaslabs are flushed
//! (their unflushed changes written to their own space maps) a few at a time,
//! oldest first, so that old logs become obsolete and can be destroyed.  At
//! import every surviving log is replayed, in txg order.
//!
//! The metaslabs themselves hold their unflushed changes.  This module holds
//! the logs and the bookkeeping that decides which metaslabs to flush.

use crate::{
    store::*,
    tunables::Tunables,
    types::*,
};
use divbuf::{DivBuf, DivBufShared};
use futures::{TryFutureExt, TryStreamExt, stream::FuturesUnordered};
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    hash::{Hash, Hasher},
    mem,
    sync::{Arc, Mutex},
};

/// Records per on-disk log block
pub const LOG_BLOCK_RECORDS: usize = 128;

/// Approximate memory cost of one unflushed range tree segment, in bytes
pub const UNFLUSHED_SEGMENT_COST: u64 = 64;

/// One change to one metaslab
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: MetaslabId,
    pub tag: MapType,
    pub extent: Extent,
}

/// Persistent summary of one txg's log.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogPhys {
    pub txg: TxgT,
    pub object: ObjectT,
    pub nblocks: u64,
    pub records: u64,
    /// Number of distinct metaslabs with records in this log
    pub mscount: u64,
}

/// Persistent summary of every live log.  Stored in the pool label.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogSpaceMapPhys {
    pub logs: Vec<LogPhys>,
}

#[derive(Debug, Deserialize, Serialize)]
struct LogBlock {
    /// MetroHash64 self-checksum.  Includes the object id and block index.
    checksum: u64,
    txg: TxgT,
    /// Index within the log of the first record in this block
    first: u64,
    records: Vec<LogRecord>,
}

impl LogBlock {
    fn checksum(object: ObjectT, blkid: u64, txg: TxgT, first: u64,
                records: &[LogRecord]) -> u64
    {
        let mut hasher = MetroHash64::new();
        hasher.write_u64(object);
        hasher.write_u64(blkid);
        txg.hash(&mut hasher);
        hasher.write_u64(first);
        records.hash(&mut hasher);
        hasher.finish()
    }

    fn deserialize(log: &LogPhys, blkid: u64, buf: &DivBuf) -> Result<Self> {
        let corrupt = |detail: String| Error::Corruption {
            object: log.object,
            block: blkid,
            txg: Some(log.txg),
            detail
        };
        let lb = bincode::deserialize::<LogBlock>(&buf[..])
            .map_err(|e| corrupt(e.to_string()))?;
        let expected = Self::checksum(log.object, blkid, lb.txg, lb.first,
                                      &lb.records);
        if expected != lb.checksum {
            return Err(corrupt("checksum mismatch".to_owned()));
        }
        if lb.txg != log.txg || lb.first != blkid * LOG_BLOCK_RECORDS as u64 {
            return Err(corrupt(format!("misplaced block for txg {}", lb.txg)));
        }
        Ok(lb)
    }

    fn serialize(object: ObjectT, blkid: u64, txg: TxgT,
                 records: Vec<LogRecord>) -> IoVec
    {
        let first = blkid * LOG_BLOCK_RECORDS as u64;
        let checksum = Self::checksum(object, blkid, txg, first, &records);
        let lb = LogBlock{checksum, txg, first, records};
        let v = bincode::serialize(&lb)
            .expect("LogBlock serialization is infallible");
        DivBufShared::from(v).try_const().unwrap()
    }
}

/// The log being accumulated for the syncing txg
#[derive(Debug)]
struct OpenLog {
    txg: TxgT,
    records: Vec<LogRecord>,
    mss: BTreeSet<MetaslabId>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Every live log, by txg
    logs: BTreeMap<TxgT, LogPhys>,
    open: Option<OpenLog>,
    /// Metaslabs with unflushed changes, sorted by unflushed txg
    by_flushed: BTreeSet<(TxgT, MetaslabId)>,
    /// Unflushed txg and segment count of every metaslab in `by_flushed`
    unflushed: BTreeMap<MetaslabId, (TxgT, u64)>,
    /// Sum of the segment counts in `unflushed`
    unflushed_segs: u64,
    nmetaslabs: u64,
}

/// Read-only statistics
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogSpaceMapStats {
    pub logs: usize,
    pub blocks: u64,
    pub unflushed_metaslabs: usize,
    pub unflushed_bytes: u64,
}

pub struct LogSpaceMap {
    store: Arc<dyn MetaStore>,
    inner: Mutex<Inner>,
}

impl LogSpaceMap {
    /// Maximum number of log blocks that may be live before flushing gets
    /// aggressive
    fn block_limit(nmetaslabs: u64, tunables: &Tunables) -> u64 {
        (nmetaslabs * tunables.log_block_pct / 100)
            .clamp(tunables.log_block_min, tunables.log_block_max)
    }

    /// Write out the syncing txg's log and destroy any logs that no metaslab
    /// needs anymore.
    ///
    /// Returns a future for the log writes, and the objects of destroyed logs.
    /// Those objects must not be freed until the label that stops referencing
    /// them is durable.
    pub fn close_txg(&self, txg: TxgT) -> (BoxVdevFut, Vec<ObjectT>) {
        let mut inner = self.inner.lock().unwrap();
        let futs = FuturesUnordered::new();
        if let Some(open) = inner.open.take() {
            assert_eq!(open.txg, txg, "Log for txg {} left open", open.txg);
            let object = self.store.alloc_object();
            let records = open.records.len() as u64;
            let mut nblocks = 0;
            for chunk in open.records.chunks(LOG_BLOCK_RECORDS) {
                let iovec = LogBlock::serialize(object, nblocks, txg,
                                                chunk.to_vec());
                futs.push(self.store.write_block(object, nblocks, iovec));
                nblocks += 1;
            }
            let mscount = open.mss.len() as u64;
            tracing::debug!(%txg, object, records, nblocks, mscount,
                "wrote log space map");
            inner.logs.insert(txg, LogPhys{txg, object, nblocks, records,
                                           mscount});
        }
        // Any log older than the oldest unflushed txg is obsolete
        let oldest = inner.by_flushed.iter().next()
            .map(|&(t, _)| t)
            .unwrap_or(txg + 1);
        let keep = inner.logs.split_off(&oldest);
        let obsolete = mem::replace(&mut inner.logs, keep)
            .into_values()
            .map(|log| {
                tracing::debug!(txg = %log.txg, object = log.object,
                    "destroying obsolete log space map");
                log.object
            }).collect::<Vec<_>>();
        let fut = Box::pin(futs.try_collect::<Vec<_>>().map_ok(drop));
        (fut, obsolete)
    }

    /// Choose which metaslabs to flush during the upcoming sync.
    ///
    /// Two resources are bounded.  The number of live log blocks bounds
    /// import time; flushing the metaslabs with the oldest unflushed txgs
    /// makes the oldest logs obsolete.  The memory held by unflushed range
    /// trees is bounded by flushing the metaslabs holding the most of it.
    pub fn flush_candidates(&self, tunables: &Tunables) -> Vec<MetaslabId> {
        let inner = self.inner.lock().unwrap();
        if inner.by_flushed.is_empty() {
            return Vec::new();
        }
        let nflush = Self::metaslabs_to_flush(&inner, tunables)
            .max(tunables.min_metaslabs_to_flush) as usize;
        let mut chosen = inner.by_flushed.iter()
            .take(nflush)
            .map(|&(_, id)| id)
            .collect::<Vec<_>>();
        let mut mem = inner.unflushed_segs * UNFLUSHED_SEGMENT_COST;
        for &id in &chosen {
            mem -= inner.unflushed[&id].1 * UNFLUSHED_SEGMENT_COST;
        }
        if mem > tunables.unflushed_max_mem {
            let mut by_size = inner.unflushed.iter()
                .filter(|(id, _)| !chosen.contains(id))
                .map(|(&id, &(_, segs))| (segs, id))
                .collect::<Vec<_>>();
            by_size.sort_unstable_by(|a, b| b.cmp(a));
            for (segs, id) in by_size {
                if mem <= tunables.unflushed_max_mem {
                    break;
                }
                chosen.push(id);
                mem -= segs * UNFLUSHED_SEGMENT_COST;
            }
        }
        chosen
    }

    /// Estimate how many metaslabs must be flushed this txg to keep the number
    /// of live log blocks under the limit.
    fn metaslabs_to_flush(inner: &Inner, tunables: &Tunables) -> u64 {
        let limit = Self::block_limit(inner.nmetaslabs, tunables);
        let total: u64 = inner.logs.values().map(|l| l.nblocks).sum();
        // Assume the coming txg writes as many blocks as the last one
        let incoming = inner.logs.values().next_back()
            .map(|l| l.nblocks)
            .unwrap_or(0);
        if total + incoming <= limit {
            return 0;
        }
        let excess = total + incoming - limit;
        let mut freed = 0;
        for log in inner.logs.values() {
            freed += log.nblocks;
            if freed >= excess {
                // Flushing every metaslab unflushed as of this log's txg
                // makes it, and all older logs, obsolete.
                return inner.by_flushed.range(..(log.txg + 1,
                                                 MetaslabId::default()))
                    .count() as u64;
            }
        }
        inner.by_flushed.len() as u64
    }

    pub fn new(store: Arc<dyn MetaStore>, nmetaslabs: u64) -> Self {
        let inner = Inner{nmetaslabs, ..Default::default()};
        LogSpaceMap{store, inner: Mutex::new(inner)}
    }

    /// Reopen the log space map from its persisted summary.  Call
    /// [`replay`](Self::replay) next.
    pub fn open(store: Arc<dyn MetaStore>, phys: LogSpaceMapPhys,
                nmetaslabs: u64) -> Self
    {
        let logs = phys.logs.into_iter()
            .map(|l| (l.txg, l))
            .collect();
        let inner = Inner{logs, nmetaslabs, ..Default::default()};
        LogSpaceMap{store, inner: Mutex::new(inner)}
    }

    /// The summary to persist in the label
    pub fn phys(&self) -> LogSpaceMapPhys {
        let inner = self.inner.lock().unwrap();
        LogSpaceMapPhys{logs: inner.logs.values().cloned().collect()}
    }

    /// Append one record to the syncing txg's log
    pub fn record(&self, id: MetaslabId, txg: TxgT, tag: MapType,
                  extent: Extent)
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some(open) = &inner.open {
            assert_eq!(open.txg, txg,
                "Logging txg {txg} while txg {} is open", open.txg);
        }
        let open = inner.open.get_or_insert_with(|| OpenLog {
            txg,
            records: Vec::new(),
            mss: BTreeSet::new()
        });
        open.records.push(LogRecord{id, tag, extent});
        open.mss.insert(id);
    }

    /// Replay every live log, in txg order, through `f`.
    ///
    /// A corrupt final block of the newest log is treated as the end of the
    /// log.  Corruption anywhere else is fatal.  Returns the number of records
    /// replayed.
    #[tracing::instrument(skip(self, f))]
    pub async fn replay<F>(&self, mut f: F) -> Result<u64>
        where F: FnMut(TxgT, &LogRecord) -> Result<()>
    {
        let logs = self.inner.lock().unwrap().logs.values()
            .cloned()
            .collect::<Vec<_>>();
        let mut replayed = 0;
        for (i, log) in logs.iter().enumerate() {
            let newest = i + 1 == logs.len();
            let mut remaining = log.records;
            for blkid in 0..log.nblocks {
                let trailing = newest && blkid + 1 == log.nblocks;
                let r = match self.store.read_block(log.object, blkid).await {
                    Ok(db) => LogBlock::deserialize(log, blkid, &db),
                    Err(e) => Err(e)
                };
                let lb = match r {
                    Ok(lb) => lb,
                    Err(e @ Error::Corruption{..}) if trailing => {
                        tracing::warn!(txg = %log.txg, blkid, error = %e,
                            "ignoring corrupt trailing log block");
                        break;
                    }
                    Err(e) => return Err(e)
                };
                for rec in lb.records.iter().take(remaining as usize) {
                    f(log.txg, rec)?;
                    replayed += 1;
                    remaining -= 1;
                }
            }
        }
        tracing::info!(logs = logs.len(), replayed, "replayed log space map");
        Ok(replayed)
    }

    /// Tell the log space map about a metaslab's unflushed changes.
    ///
    /// `None` means the metaslab has no unflushed changes.
    pub fn set_unflushed(&self, id: MetaslabId, unflushed: Option<(TxgT, u64)>)
    {
        let mut inner = self.inner.lock().unwrap();
        if let Some((txg, segs)) = inner.unflushed.remove(&id) {
            inner.by_flushed.remove(&(txg, id));
            inner.unflushed_segs -= segs;
        }
        if let Some((txg, segs)) = unflushed {
            inner.by_flushed.insert((txg, id));
            inner.unflushed.insert(id, (txg, segs));
            inner.unflushed_segs += segs;
        }
    }

    pub fn stats(&self) -> LogSpaceMapStats {
        let inner = self.inner.lock().unwrap();
        LogSpaceMapStats {
            logs: inner.logs.len(),
            blocks: inner.logs.values().map(|l| l.nblocks).sum(),
            unflushed_metaslabs: inner.by_flushed.len(),
            unflushed_bytes: inner.unflushed_segs * UNFLUSHED_SEGMENT_COST,
        }
    }
}

// LCOV_EXCL_STOP
