// vim: tw=80
//! Runtime-adjustable allocator policy knobs
//!
//! Every field has a default, so a configuration file need only list the
//! tunables it wants to change.

use crate::types::*;
use serde_derive::{Deserialize, Serialize};

/// Allocator tunables.
///
/// Passed explicitly to the [`Pool`](crate::pool::Pool) rather than read from
/// global state, so different pools in one process may differ.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// log2 of the metaslab size used when formatting a device
    pub metaslab_shift: u8,

    /// Number of txgs that a freed extent must wait before it may be
    /// reallocated.
    pub defer_txgs: u32,

    /// Condense a space map once it holds this percentage of the records needed
    /// to describe its free space minimally.
    pub condense_pct: u64,

    /// Never condense a space map shorter than this many records.
    pub condense_min_records: u64,

    /// The dynamic-fit block picker switches from first-fit to best-fit when
    /// the largest free segment is smaller than this many bytes...
    pub df_alloc_threshold: u64,

    /// ... or when less than this percentage of the metaslab is free.
    pub df_free_pct: u64,

    /// Metaslabs more fragmented than this percentage lose their preference
    /// for staying active.
    pub fragmentation_threshold: u64,

    /// Groups more fragmented than this percentage are not allocatable.
    pub group_fragmentation_threshold: u64,

    /// Groups with free capacity at or below this percentage are not
    /// allocatable.
    pub group_noalloc_threshold: u64,

    /// Bytes allocated from one group before the rotor moves on.
    pub aliquot: u64,

    /// Steer the rotor toward groups with more free space.
    pub bias_enabled: bool,

    /// Maximum bytes of in-flight allocations per group before it counts as
    /// busy.
    pub group_max_inflight: u64,

    /// Maximum number of metaslabs to try in one group per allocation.
    pub max_metaslab_attempts: usize,

    /// Unload a metaslab this many txgs after its last allocation.
    pub unload_delay: u32,

    /// Load the best few metaslabs of each group in the background.
    pub preload_enabled: bool,

    /// Number of metaslabs per group to keep preloaded.
    pub preload_limit: usize,

    /// Route metaslab changes through the pool-wide log space map.
    pub log_spacemap: bool,

    /// The log block limit is this percentage of the metaslab count...
    pub log_block_pct: u64,

    /// ... but no less than this many blocks...
    pub log_block_min: u64,

    /// ... and no more than this many.
    pub log_block_max: u64,

    /// Flush metaslabs once their unflushed changes consume this many bytes
    /// of memory.
    pub unflushed_max_mem: u64,

    /// Flush at least this many metaslabs every txg that has any unflushed.
    pub min_metaslabs_to_flush: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            metaslab_shift: 29,
            defer_txgs: 2,
            condense_pct: 200,
            condense_min_records: 4 * crate::space_map::BLOCK_RECORDS as u64,
            df_alloc_threshold: 128 << 10,
            df_free_pct: 4,
            fragmentation_threshold: 70,
            group_fragmentation_threshold: 95,
            group_noalloc_threshold: 0,
            aliquot: 512 << 10,
            bias_enabled: true,
            group_max_inflight: 64 << 20,
            max_metaslab_attempts: 16,
            unload_delay: 8,
            preload_enabled: false,
            preload_limit: 3,
            log_spacemap: true,
            log_block_pct: 400,
            log_block_min: 1000,
            log_block_max: 1 << 18,
            unflushed_max_mem: 1 << 30,
            min_metaslabs_to_flush: 1,
        }
    }
}

impl Tunables {
    /// Parse tunables from a YAML document.  Missing fields take defaults.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let t: Tunables = serde_yaml_ng::from_str(s)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        t.validate()?;
        Ok(t)
    }

    fn validate(&self) -> Result<()> {
        if !(20..=40).contains(&self.metaslab_shift) {
            return Err(Error::InvalidConfig(format!(
                "metaslab_shift {} out of range", self.metaslab_shift)));
        }
        if self.condense_pct < 100 {
            return Err(Error::InvalidConfig(
                "condense_pct must be at least 100".to_owned()));
        }
        if self.max_metaslab_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_metaslab_attempts must be nonzero".to_owned()));
        }
        if self.log_block_min > self.log_block_max {
            return Err(Error::InvalidConfig(
                "log_block_min exceeds log_block_max".to_owned()));
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
