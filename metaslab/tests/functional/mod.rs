// vim: tw=80
//! Tests that drive a whole `Pool` through its public interface

use std::sync::Arc;

use metaslab::{
    label::{LabelReader, LabelWriter},
    metaslab_class::ClassKind,
    pool::{Pool, VdevSpec},
    store::MemStore,
    tunables::Tunables,
    Result,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

mod alloc;
mod import;

/// Tunables for small, quick pools
fn tunables(ms_shift: u8, log_spacemap: bool) -> Tunables {
    Tunables {
        metaslab_shift: ms_shift,
        log_spacemap,
        ..Default::default()
    }
}

/// Create a pool of `n` equal Normal-class devices
fn create(n: usize, asize: u64, tunables: Tunables) -> (Arc<MemStore>, Pool) {
    let store = Arc::new(MemStore::new());
    let vdevs = (0..n)
        .map(|_| VdevSpec::new(ClassKind::Normal, asize, 9))
        .collect::<Vec<_>>();
    let pool = Pool::create("functional".to_owned(), &vdevs, store.clone(),
                            Arc::new(tunables));
    (store, pool)
}

/// Serialize the pool's label, as the caller would after each sync
fn label(pool: &Pool) -> Vec<u8> {
    let mut lw = LabelWriter::new();
    t!(pool.write_label(&mut lw));
    lw.into_vec()
}

async fn import(store: &Arc<MemStore>, label: Vec<u8>, tunables: &Tunables)
    -> Result<Pool>
{
    let mut reader = LabelReader::new(label)?;
    Pool::open(store.clone(), &mut reader, Arc::new(tunables.clone())).await
}
