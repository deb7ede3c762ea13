// config.rs: compile-time constants and runtime tunables of the decompression engine.
//
// Constants that size on-disk structures or inline arrays are fixed at compile
// time.  Everything a deployment may want to tune (managed-cache strategy,
// synchronous-decompression threshold, worker count) lives in `Config`, a
// value type with builder-style setters.  Environment overrides are parsed by
// `*_from(Option<&str>)` helpers so the conversion logic is unit-testable
// without touching the process environment.

use tracing::warn;

use crate::zip::inplace::InplaceStrategy;

// Page geometry.  Filesystem blocks and memory pages share one size.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const BLOCK_SIZE: usize = PAGE_SIZE;

// Number of pagevec entries stored inline in every work before overflow
// segments are needed.
pub const INLINE_PAGEVECS: usize = 3;

// Page-pointer arrays up to this many entries stay on the stack while a
// workgroup is decompressed; larger ones move to the heap.
pub const VMAP_ONSTACK_PAGES: usize = 96;

// Upper bound on pages in one raw read request.
pub const MAX_BIO_PAGES: usize = 256;

// Largest supported physical cluster, in pages (cluster_bits - PAGE_SHIFT <= 4).
pub const CLUSTER_MAX_PAGES: usize = 16;

// `read_pages` batches at most this long decompress on the caller's thread.
pub const DEFAULT_MAX_SYNC_DECOMPRESS_PAGES: usize = 3;

/// How aggressively compressed pages are kept in the managed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Compressed data always lands in per-request staging pages.
    Disabled,
    /// Reserve managed pages for the first extent of every request.
    #[default]
    Readahead,
    /// Also reserve managed pages for extents that begin before the
    /// request's first page.
    Readaround,
}

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_strategy: CacheStrategy,
    pub inplace: InplaceStrategy,
    pub max_sync_decompress_pages: usize,
    pub max_bio_pages: usize,
    pub nr_workers: usize,
    /// Accept cluster type 3 as the compatibility extension variant.
    pub huawei_compat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_strategy: CacheStrategy::default(),
            inplace: InplaceStrategy::default(),
            max_sync_decompress_pages: DEFAULT_MAX_SYNC_DECOMPRESS_PAGES,
            max_bio_pages: MAX_BIO_PAGES,
            nr_workers: default_nr_workers(),
            huawei_compat: false,
        }
    }
}

impl Config {
    /// Defaults with `ZVLE_WORKERS` and `ZVLE_MAX_SYNC_PAGES` applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(n) = workers_from(std::env::var("ZVLE_WORKERS").ok().as_deref()) {
            config.nr_workers = n;
        }
        if let Some(n) = max_sync_pages_from(std::env::var("ZVLE_MAX_SYNC_PAGES").ok().as_deref()) {
            config.max_sync_decompress_pages = n;
        }
        config
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_inplace(mut self, inplace: InplaceStrategy) -> Self {
        self.inplace = inplace;
        self
    }

    pub fn with_max_sync_decompress_pages(mut self, pages: usize) -> Self {
        self.max_sync_decompress_pages = pages;
        self
    }

    /// Clamped to `1..=MAX_BIO_PAGES`.
    pub fn with_max_bio_pages(mut self, pages: usize) -> Self {
        self.max_bio_pages = pages.clamp(1, MAX_BIO_PAGES);
        self
    }

    /// Zero selects the default worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.nr_workers = if workers == 0 { default_nr_workers() } else { workers };
        self
    }

    pub fn with_huawei_compat(mut self, enabled: bool) -> Self {
        self.huawei_compat = enabled;
        self
    }

    /// Whether a `read_pages` batch of `nr_pages` may decompress on the
    /// caller's thread.
    pub fn should_decompress_synchronously(&self, nr_pages: usize) -> bool {
        nr_pages <= self.max_sync_decompress_pages
    }
}

/// Background decompression threads: a quarter more than the online CPUs.
/// Fewer threads keep scheduling latency low for this CPU-bound work.
pub fn default_nr_workers() -> usize {
    let cpus = num_cpus::get().max(1);
    cpus + cpus / 4
}

fn parse_count(name: &str, env_val: Option<&str>) -> Option<usize> {
    let raw = env_val?;
    match raw.trim().parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring environment variable {}={}: not a valid unsigned value", name, raw);
            None
        }
    }
}

/// Testable core of the `ZVLE_WORKERS` override.  Zero is rejected.
pub fn workers_from(env_val: Option<&str>) -> Option<usize> {
    parse_count("ZVLE_WORKERS", env_val).filter(|&n| n > 0)
}

/// Testable core of the `ZVLE_MAX_SYNC_PAGES` override.
pub fn max_sync_pages_from(env_val: Option<&str>) -> Option<usize> {
    parse_count("ZVLE_MAX_SYNC_PAGES", env_val)
}
