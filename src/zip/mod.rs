//! Compressed-cluster pipeline: workgroups, their registry and ownership
//! chains, the per-request work builder, submission and decompression.

pub mod builder;
pub mod frontend;
pub mod inplace;
pub mod pagevec;
pub mod reclaim;
pub mod registry;
pub mod submit;
pub mod tagptr;
pub mod unzip;
pub mod workgroup;

pub use builder::{Role, WorkBuilder};
pub use frontend::{read_page, read_pages, Frontend, ReadOutcome};
pub use inplace::InplaceStrategy;
pub use pagevec::PageType;
pub use reclaim::{migrate_cached_page, shrink_workstation, try_to_free_all_cached_pages, try_to_free_cached_page};
pub use registry::{Registry, WorkgroupHandle};
pub use submit::submit_and_unzip;
pub use tagptr::ChainLink;
pub use workgroup::{Format, Workgroup};
