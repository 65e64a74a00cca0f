// vim: tw=80
//! Free-space management for a copy-on-write storage pool
//!
//! Each top-level device is carved into fixed-size metaslabs.  A metaslab
//! tracks its free space in memory as a [`RangeTree`](range_tree::RangeTree)
//! and on disk as a [`SpaceMap`](space_map::SpaceMap), optionally fronted by
//! the pool-wide [`LogSpaceMap`](log_space_map::LogSpaceMap).  Metaslabs are
//! grouped per device into a [`MetaslabGroup`](metaslab_group::MetaslabGroup),
//! and groups per purpose into a [`MetaslabClass`](metaslab_class::MetaslabClass).
//! The [`Pool`](pool::Pool) ties them together.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Metaslab, MetaslabGroup, etc. are what they are.
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod label;
pub mod log_space_map;
pub mod metaslab;
pub mod metaslab_class;
pub mod metaslab_group;
pub mod pool;
pub mod range_tree;
pub mod space_map;
pub mod store;
pub mod tunables;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
