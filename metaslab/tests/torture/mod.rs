// vim: tw=80
//! Random allocations, frees, syncs, and reimports, checked against a simple
//! model of which extents are live.

use std::{
    collections::{BTreeMap, VecDeque},
    env,
    str::FromStr,
    sync::Arc,
};

use pretty_assertions::assert_eq;
use rand::{Rng, RngCore, SeedableRng, thread_rng};
use rand_xorshift::XorShiftRng;
use rstest::rstest;

use metaslab::{
    allocator::AllocFlags,
    label::{LabelReader, LabelWriter},
    metaslab_class::ClassKind,
    pool::{Pool, VdevSpec},
    store::MemStore,
    tunables::Tunables,
    Dva,
    Error,
    TxgT,
};

fn test_scale() -> f64 {
    env::var("METASLAB_TORTURE_SCALE")
        .map(|s| f64::from_str(&s)
             .expect("METASLAB_TORTURE_SCALE must be a float")
         ).unwrap_or(1.0)
}

/// What the pool ought to contain
#[derive(Default)]
struct Model {
    /// Every live extent, keyed by (vdev, offset)
    live: BTreeMap<(u16, u64), Dva>,
    /// Extents freed in each of the most recent txgs, newest last
    recent_frees: VecDeque<Vec<Dva>>,
}

impl Model {
    fn allocated(&self) -> u64 {
        self.live.values().map(|d| d.asize).sum()
    }

    fn deferred(&self) -> u64 {
        self.recent_frees.iter().flatten().map(|d| d.asize).sum()
    }

    /// Record a new allocation, checking that it is really free
    fn insert(&mut self, dva: Dva) {
        let overlaps = |other: &Dva| {
            other.vdev == dva.vdev && other.extent().overlaps(&dva.extent())
        };
        if let Some((_, prev)) = self.live.range(..(dva.vdev, dva.offset))
            .next_back()
        {
            assert!(!overlaps(prev), "{dva} overlaps live {prev}");
        }
        if let Some((_, next)) = self.live.range((dva.vdev, dva.offset)..)
            .next()
        {
            assert!(!overlaps(next), "{dva} overlaps live {next}");
        }
        for freed in self.recent_frees.iter().flatten() {
            assert!(!overlaps(freed), "{dva} reuses {freed} too soon");
        }
        self.live.insert((dva.vdev, dva.offset), dva);
    }
}

async fn do_test(log_spacemap: bool, seed: Option<[u8; 16]>) {
    let ntxgs = (200.0 * test_scale()) as u32;
    let seed = seed.unwrap_or_else(|| {
        let mut seed = [0u8; 16];
        let mut seeder = thread_rng();
        seeder.fill_bytes(&mut seed);
        seed
    });
    println!("Using seed {:?}", &seed);
    // Use XorShiftRng because it's deterministic and seedable
    let mut rng = XorShiftRng::from_seed(seed);

    let tunables = Tunables {
        metaslab_shift: 20,
        log_spacemap,
        condense_min_records: 64,
        log_block_min: 8,
        unload_delay: 4,
        aliquot: 64 << 10,
        ..Default::default()
    };
    let defer_txgs = tunables.defer_txgs as usize;
    let store = Arc::new(MemStore::new());
    let vdevs = [
        VdevSpec::new(ClassKind::Normal, 6 << 20, 9),
        VdevSpec::new(ClassKind::Normal, 5 << 19, 12),
        VdevSpec::new(ClassKind::Normal, 4 << 20, 9),
    ];
    let mut pool = Pool::create("torture".to_owned(), &vdevs, store.clone(),
                                Arc::new(tunables.clone()));
    let mut model = Model::default();

    for txg in (1..=ntxgs).map(TxgT) {
        let mut freed = Vec::new();
        for _ in 0..rng.gen_range(0..40) {
            if !model.live.is_empty() && rng.gen_ratio(2, 5) {
                let i = rng.gen_range(0..model.live.len());
                let key = *model.live.keys().nth(i).unwrap();
                let dva = model.live.remove(&key).unwrap();
                pool.free(&dva, txg);
                freed.push(dva);
            } else {
                let size = rng.gen_range(1..=32) * 512;
                let hint = rng.gen_ratio(1, 4).then(|| rng.gen_range(0..3));
                match pool.alloc(ClassKind::Normal, size, 512, txg, hint,
                                 AllocFlags::default()).await
                {
                    Ok(r) if rng.gen_ratio(1, 20) => r.abort(),
                    Ok(r) => model.insert(r.commit()),
                    Err(Error::Exhausted{..}) => (),
                    Err(e) => panic!("alloc failed: {e:?}")
                }
            }
        }
        pool.sync(txg).await.unwrap();
        model.recent_frees.push_back(freed);
        if model.recent_frees.len() > defer_txgs {
            model.recent_frees.pop_front();
        }

        let stats = &pool.status().classes[0];
        assert_eq!(stats.alloc, model.allocated(), "txg {txg}");
        assert_eq!(stats.deferred, model.deferred(), "txg {txg}");

        if rng.gen_ratio(1, 25) {
            let mut lw = LabelWriter::new();
            pool.write_label(&mut lw).unwrap();
            let mut reader = LabelReader::new(lw.into_vec()).unwrap();
            pool = Pool::open(store.clone(), &mut reader,
                              Arc::new(tunables.clone())).await.unwrap();
            // Deferred frees are complete once their txgs are durable
            model.recent_frees.clear();
            assert_eq!(pool.status().classes[0].alloc, model.allocated());
        } else if rng.gen_ratio(1, 25) {
            pool.unload_all();
        }
    }
}

#[rstest]
#[case(false, None)]
#[case(true, None)]
#[test_log::test(tokio::test)]
async fn random_ops(#[case] log_spacemap: bool,
                    #[case] seed: Option<[u8; 16]>)
{
    do_test(log_spacemap, seed).await
}
