//! Variable-length extent (VLE) index: on-disk records and the extent
//! resolver built on them.

pub mod index;
pub mod map;

pub use index::{ClusterType, IndexRecord};
pub use map::{MapBlocks, Resolver, MAP_MAPPED, MAP_ZIPPED};
