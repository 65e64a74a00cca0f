// vim: tw=80
//! Allocation policy, observed through a whole pool

use std::sync::Arc;

use futures::future;
use pretty_assertions::assert_eq;
use rstest::rstest;

use metaslab::{
    allocator::AllocFlags,
    metaslab_class::ClassKind,
    store::Health,
    tunables::Tunables,
    Dva,
    Error,
    Extent,
    TxgT,
};

use super::*;

async fn alloc(pool: &Pool, size: u64, txg: u32, hint: Option<u16>) -> Dva {
    t!(pool.alloc(ClassKind::Normal, size, 512, TxgT(txg), hint,
                  AllocFlags::default()).await).commit()
}

/// An extent freed in txg 5 isn't handed out again until txg 5 plus the
/// deferred-free window has synced.
#[rstest]
#[case(false)]
#[case(true)]
#[test_log::test(tokio::test)]
async fn deferred_free(#[case] log_spacemap: bool) {
    // Best-fit everywhere, so the freed extent would be first choice
    let tunables = Tunables {
        df_free_pct: 101,
        ..tunables(27, log_spacemap)
    };
    let (_store, pool) = create(1, 128 << 20, tunables);
    let first = alloc(&pool, 4096, 1, None).await;
    assert_eq!(first.extent(), Extent::new(0, 4096));
    for txg in 1..5 {
        t!(pool.sync(TxgT(txg)).await);
    }
    pool.free(&first, TxgT(5));
    for txg in 5..8 {
        let dva = alloc(&pool, 4096, txg, None).await;
        assert!(!dva.extent().overlaps(&first.extent()),
            "Reallocated {first} in txg {txg}");
        t!(pool.sync(TxgT(txg)).await);
    }
    let dva = alloc(&pool, 4096, 8, None).await;
    assert_eq!(dva, first);
}

/// Two equal groups split a run of equal allocations evenly
#[test_log::test(tokio::test)]
async fn rotor_balance() {
    let tunables = Tunables {
        aliquot: 4096,
        ..tunables(20, true)
    };
    let (_store, pool) = create(2, 4 << 20, tunables);
    let mut counts = [0; 2];
    for _ in 0..10 {
        let dva = alloc(&pool, 4096, 1, None).await;
        counts[dva.vdev as usize] += 1;
    }
    assert_eq!(counts, [5, 5]);
}

/// A whole device's worth of allocations fills it, and then the class is
/// exhausted
#[tokio::test]
async fn exhaustion() {
    let (_store, pool) = create(1, 2 << 20, tunables(20, true));
    let a = alloc(&pool, 1 << 20, 1, None).await;
    let b = alloc(&pool, 1 << 20, 1, None).await;
    assert_ne!(a.offset, b.offset);
    let e = pool.alloc(ClassKind::Normal, 512, 512, TxgT(1), None,
                       AllocFlags{try_hard: true, ..Default::default()})
        .await.unwrap_err();
    assert_eq!(e, Error::Exhausted{class: "normal", size: 512});
    // Freeing doesn't help until the window passes
    pool.free(&a, TxgT(2));
    for txg in 1..4 {
        t!(pool.sync(TxgT(txg)).await);
    }
    assert!(pool.alloc(ClassKind::Normal, 512, 512, TxgT(4), None,
                       AllocFlags::default()).await.is_err());
    t!(pool.sync(TxgT(4)).await);
    let c = alloc(&pool, 512, 5, None).await;
    assert!(a.extent().contains(&c.extent()));
}

/// Offline devices receive no allocations until they return
#[tokio::test]
async fn passivation() {
    let (_store, pool) = create(2, 4 << 20, tunables(20, true));
    pool.on_device_event(0, Health::Offline);
    for _ in 0..20 {
        assert_eq!(alloc(&pool, 8192, 1, Some(0)).await.vdev, 1);
    }
    pool.on_device_event(0, Health::Online);
    assert_eq!(alloc(&pool, 8192, 1, Some(0)).await.vdev, 0);
    let stats = pool.status();
    assert!(!stats.classes[0].groups[0].passivated);
    assert_eq!(stats.classes[0].groups[0].health, Health::Online);
}

/// Many concurrent writers never receive overlapping extents
#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_allocs_are_disjoint() {
    let tunables = Tunables {
        aliquot: 64 << 10,
        ..tunables(20, true)
    };
    let (_store, pool) = create(4, 4 << 20, tunables);
    let pool = Arc::new(pool);
    let tasks = (0..8u64).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut dvas = Vec::new();
            for j in 0..50u64 {
                let size = ((i * 7 + j) % 8 + 1) * 512;
                let r = pool.alloc(ClassKind::Normal, size, 512, TxgT(1),
                                   None, AllocFlags::default()).await
                    .unwrap();
                dvas.push(r.commit());
            }
            dvas
        })
    }).collect::<Vec<_>>();
    let mut dvas = future::try_join_all(tasks).await.unwrap()
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    dvas.sort();
    for pair in dvas.windows(2) {
        assert!(pair[0].vdev != pair[1].vdev ||
                pair[0].offset + pair[0].asize <= pair[1].offset,
                "{} overlaps {}", pair[0], pair[1]);
    }
    t!(pool.sync(TxgT(1)).await);
    let total: u64 = dvas.iter().map(|d| d.asize).sum();
    assert_eq!(pool.status().classes[0].alloc, total);
    assert!(pool.groups().iter().all(|g| g.inflight() == 0));
}
