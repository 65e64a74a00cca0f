// vim: tw=80
//! Export, import, and crash recovery

use pretty_assertions::assert_eq;
use rstest::rstest;

use metaslab::{
    allocator::AllocFlags,
    metaslab_class::ClassKind,
    pool::open_from_bytes,
    store::MemStore,
    tunables::Tunables,
    Dva,
    Error,
    TxgT,
};

use super::*;

async fn alloc(pool: &Pool, size: u64, align: u64, txg: u32) -> Dva {
    t!(pool.alloc(ClassKind::Normal, size, align, TxgT(txg), None,
                  AllocFlags::default()).await).commit()
}

/// (allocated, free) for every metaslab in the pool
fn census(pool: &Pool) -> Vec<(u64, u64)> {
    pool.groups().iter()
        .flat_map(|g| g.stats().metaslabs)
        .map(|s| (s.allocated, s.free))
        .collect()
}

/// Importing an exported pool reproduces every metaslab's free space
#[rstest]
#[case(false)]
#[case(true)]
#[test_log::test(tokio::test)]
async fn export_import(#[case] log_spacemap: bool) {
    let tunables = tunables(20, log_spacemap);
    let (store, pool) = create(2, 8 << 20, tunables.clone());
    let mut live = Vec::new();
    let mut freed = Vec::new();
    for txg in 1..=10u32 {
        for i in 0..20u64 {
            let size = (i % 5 + 1) * 1024;
            live.push(alloc(&pool, size, 512, txg).await);
        }
        // Free a third of what was allocated in the previous txg
        if txg > 1 {
            for _ in 0..7 {
                let dva = live.remove(live.len() - 21);
                pool.free(&dva, TxgT(txg));
                freed.push(dva);
            }
        }
        t!(pool.sync(TxgT(txg)).await);
    }
    // Let the deferred frees drain
    for txg in 11..=12 {
        t!(pool.sync(TxgT(txg)).await);
    }
    let before = census(&pool);
    let alloc_before = pool.status().classes[0].alloc;
    assert_eq!(alloc_before, live.iter().map(|d| d.asize).sum::<u64>());

    let pool2 = t!(import(&store, label(&pool), &tunables).await);
    assert_eq!(pool2.synced_txg(), TxgT(12));
    assert_eq!(pool2.status().classes[0].alloc, alloc_before);
    assert_eq!(census(&pool2), before);
    for dva in live.iter() {
        assert_eq!(pool2.claim(dva, TxgT(13)).await,
                   Err(Error::NotFound(dva.extent())));
    }
    for dva in freed.iter() {
        t!(pool2.claim(dva, TxgT(13)).await);
    }
}

/// Importing the same label twice replays the log space map identically
#[test_log::test(tokio::test)]
async fn log_replay_is_deterministic() {
    // Never flush, so every change stays in the log
    let tunables = Tunables {
        log_block_min: 1000,
        log_block_max: 1000,
        unflushed_max_mem: u64::MAX,
        min_metaslabs_to_flush: 0,
        ..tunables(20, true)
    };
    let (store, pool) = create(2, 4 << 20, tunables.clone());
    let mut live = Vec::new();
    for txg in 1..=6u32 {
        for i in 0..12u64 {
            live.push(alloc(&pool, (i % 4 + 1) * 1024, 512, txg).await);
        }
        // Free some of the previous txg's allocations
        if txg > 1 {
            for _ in 0..5 {
                let dva = live.remove(live.len() - 13);
                pool.free(&dva, TxgT(txg));
            }
        }
        t!(pool.sync(TxgT(txg)).await);
    }
    let log = pool.status().log.unwrap();
    assert!(log.logs > 1, "{log:?}");
    assert!(log.unflushed_metaslabs > 0, "{log:?}");
    let bytes = label(&pool);

    let mut imports = Vec::new();
    for _ in 0..2 {
        let p = t!(open_from_bytes(store.clone(), bytes.clone(),
                                   Arc::new(tunables.clone())).await);
        for ms in p.groups().iter().flat_map(|g| g.metaslabs()) {
            t!(ms.load().await);
        }
        imports.push(p);
    }
    let free_extents = |p: &Pool| {
        p.groups().iter()
            .flat_map(|g| g.metaslabs())
            .map(|ms| ms.free_extents().expect("metaslab not loaded"))
            .collect::<Vec<_>>()
    };
    assert_eq!(free_extents(&imports[0]), free_extents(&imports[1]));
    assert_eq!(imports[0].status(), imports[1].status());
    assert_eq!(imports[0].status().classes[0].alloc,
               pool.status().classes[0].alloc);
    for dva in live.iter() {
        assert_eq!(imports[0].claim(dva, TxgT(7)).await,
                   Err(Error::NotFound(dva.extent())));
    }
}

/// A long-lived space map gets condensed, its old object is freed one sync
/// later, and the result still imports correctly.
#[test_log::test(tokio::test)]
async fn condense() {
    let tunables = Tunables {
        condense_min_records: 100,
        ..tunables(20, false)
    };
    let (store, pool) = create(1, 1 << 20, tunables.clone());
    let ms = pool.groups()[0].metaslabs()[0].clone();
    let mut held = Vec::new();
    let mut old = None;
    let mut txg = 1;
    while txg < 200 {
        held.push(alloc(&pool, 4096, 512, txg).await);
        if held.len() > 3 {
            pool.free(&held.remove(0), TxgT(txg));
        }
        let before = ms.phys().sm.map(|sm| sm.object);
        t!(pool.sync(TxgT(txg)).await);
        let after = ms.phys().sm.map(|sm| sm.object);
        txg += 1;
        if before.is_some() && before != after {
            old = before;
            break;
        }
    }
    let old = old.expect("never condensed");
    assert!(ms.phys().sm.unwrap().records <= 20);
    assert!(store.objects().contains(&old));
    t!(pool.sync(TxgT(txg)).await);
    assert!(!store.objects().contains(&old));
    // Let the deferred frees drain
    t!(pool.sync(TxgT(txg + 1)).await);
    t!(pool.sync(TxgT(txg + 2)).await);

    let pool2 = t!(import(&store, label(&pool), &tunables).await);
    assert_eq!(census(&pool2), census(&pool));
    for dva in held.iter() {
        assert_eq!(pool2.claim(dva, TxgT(txg + 3)).await,
                   Err(Error::NotFound(dva.extent())));
    }
}

/// After a crash, the pool imports as of its last durable label, ignoring
/// whatever later syncs wrote.
#[rstest]
#[case(false)]
#[case(true)]
#[test_log::test(tokio::test)]
async fn crash(#[case] log_spacemap: bool) {
    let tunables = tunables(20, log_spacemap);
    let (store, pool) = create(1, 4 << 20, tunables.clone());
    let a = alloc(&pool, 8192, 512, 1).await;
    t!(pool.sync(TxgT(1)).await);
    let durable = label(&pool);
    let b = alloc(&pool, 8192, 512, 2).await;
    pool.free(&a, TxgT(2));
    t!(pool.sync(TxgT(2)).await);
    // Crash before the txg 2 label is written
    drop(pool);

    let pool2 = t!(import(&store, durable, &tunables).await);
    assert_eq!(pool2.synced_txg(), TxgT(1));
    assert_eq!(pool2.status().classes[0].alloc, 8192);
    assert_eq!(pool2.claim(&a, TxgT(2)).await,
               Err(Error::NotFound(a.extent())));
    t!(pool2.claim(&b, TxgT(2)).await);
}

fn log_object(pool: &Pool) -> u64 {
    pool.log().unwrap().phys().logs[0].object
}

/// Write one log with three blocks of records
async fn three_block_log() -> (Arc<MemStore>, Pool, Tunables) {
    let tunables = tunables(24, true);
    let (store, pool) = create(1, 16 << 20, tunables.clone());
    // Aligned to twice their size, so no two allocations coalesce
    for _ in 0..300 {
        alloc(&pool, 4096, 8192, 1).await;
    }
    t!(pool.sync(TxgT(1)).await);
    assert_eq!(pool.log().unwrap().stats().blocks, 3);
    (store, pool, tunables)
}

/// A torn final log block is the end of the log.  Anything else is fatal.
#[test_log::test(tokio::test)]
async fn corrupt_log() {
    let (store, pool, tunables) = three_block_log().await;
    let object = log_object(&pool);
    let durable = label(&pool);

    store.corrupt(object, 2);
    let pool2 = t!(import(&store, durable.clone(), &tunables).await);
    assert_eq!(pool2.status().classes[0].alloc, 256 * 4096);
    drop(pool2);

    store.corrupt(object, 0);
    let e = import(&store, durable, &tunables).await.unwrap_err();
    assert!(matches!(e, Error::Corruption{object: o, block: 0, ..}
                     if o == object), "{e:?}");
}

/// A failed sync suspends the pool, but its last label still imports
#[test_log::test(tokio::test)]
async fn write_failure() {
    let tunables = tunables(20, true);
    let (store, pool) = create(1, 4 << 20, tunables.clone());
    let a = alloc(&pool, 8192, 512, 1).await;
    t!(pool.sync(TxgT(1)).await);
    let durable = label(&pool);
    alloc(&pool, 8192, 512, 2).await;
    store.fail_writes(true);
    assert!(matches!(pool.sync(TxgT(2)).await, Err(Error::Io{..})));
    assert!(pool.status().suspended.is_some());
    assert_eq!(pool.sync(TxgT(3)).await, Err(Error::Suspended));
    store.fail_writes(false);

    let pool2 = t!(import(&store, durable, &tunables).await);
    assert_eq!(pool2.status().classes[0].alloc, a.asize);
    assert_eq!(pool2.status().suspended, None);
}
