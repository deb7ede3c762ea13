// zvle: decompression engine for VLE-indexed read-only compressed images

pub mod blockdev;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod page;
pub mod pagecache;
pub mod pagepool;
pub mod sb;
pub mod stats;
pub mod vle;
pub mod workqueue;
pub mod zip;

pub const ZVLE_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version_string() -> &'static str {
    ZVLE_VERSION_STRING
}

// ── Top-level re-exports ──────────────────────────────────────────────────────
pub use config::{CacheStrategy, Config};
pub use error::{Result, ZipError};
pub use page::{Mapping, Page, PageFrame};
pub use sb::{Geometry, Inode, Superblock};
pub use zip::{read_page, read_pages, ReadOutcome};
