//! E2E Test Suite 02: Batched reads
//!
//! Drives `read_pages` over whole files:
//! - every batch size from one page to the whole file
//! - foreground and background decompression
//! - raw read merging across adjacent clusters and the per-request cap
//! - cache strategies deciding which compressed pages stay managed
//! - counters after a full pass

#[path = "../tests/support/mod.rs"]
mod support;

use zvle::blockdev::Completion;
use zvle::zip::InplaceStrategy;
use zvle::{CacheStrategy, Mapping};

use support::{assert_page, build, text, ExtentSpec, Image};

fn unaligned() -> Image {
    build(
        &text(40_000, 21),
        &[
            ExtentSpec::lz4(4500),
            ExtentSpec::lz4(9100),
            ExtentSpec::plain(4096),
            ExtentSpec::lz4(11_000),
            ExtentSpec::lz4(8000),
            ExtentSpec::lz4(3304),
        ],
        12,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: every batch size
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_every_batch_size() {
    let image = unaligned();
    let nr = image.nr_pages();
    for batch in 1..=nr {
        let m = support::mount(&image, support::config(), Completion::Threaded);
        m.read_all_checked(&image, batch);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: foreground threshold
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_sync_threshold_variants() {
    let image = unaligned();
    for max_sync in [0, 1, 3, 64] {
        let config = support::config().with_max_sync_decompress_pages(max_sync);
        let m = support::mount(&image, config, Completion::Threaded);
        m.read_all_checked(&image, 4);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: adjacent clusters share one raw read
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_adjacent_clusters_merge() {
    let image = build(&text(8 * 4096, 5), &support::uniform(8, 4096), 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    let (pages, outcome) = m.read_range(0..8);
    assert_eq!(outcome, zvle::ReadOutcome { bios: 1, failed: 0 });
    for page in &pages {
        assert_page(&image, page);
    }
    let first = image.extents[0].pblk;
    assert!(m.dev.request_log().contains(&(first, 8)));
}

#[test]
fn test_raw_reads_respect_cap() {
    let image = build(&text(8 * 4096, 5), &support::uniform(8, 4096), 12);
    let config = support::config().with_max_bio_pages(3);
    let m = support::mount(&image, config, Completion::Inline);
    let (pages, outcome) = m.read_range(0..8);
    assert_eq!(outcome.bios, 3);
    assert_eq!(outcome.failed, 0);
    for page in &pages {
        assert_page(&image, page);
    }
    assert_eq!(m.sb.stats.snapshot().pages_submitted, 8);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: cache strategies
// ─────────────────────────────────────────────────────────────────────────────

fn managed_after_reading(cache: CacheStrategy, range: std::ops::Range<u64>) -> usize {
    let image = build(
        &text(14_000, 0),
        &[ExtentSpec::lz4(6000), ExtentSpec::lz4(5000), ExtentSpec::lz4(3000)],
        12,
    );
    let config = support::config().with_cache_strategy(cache);
    let m = support::mount(&image, config, Completion::Inline);
    let (pages, outcome) = m.read_range(range);
    assert_eq!(outcome.failed, 0);
    for page in &pages {
        assert_page(&image, page);
    }
    m.sb.managed.count(Mapping::Managed)
}

#[test]
fn test_cache_strategy_selects_managed_pages() {
    // Page 1 straddles extent 0 (starting before the request) and extent 1.
    assert_eq!(managed_after_reading(CacheStrategy::Disabled, 1..2), 0);
    assert_eq!(managed_after_reading(CacheStrategy::Readahead, 1..2), 1);
    assert_eq!(managed_after_reading(CacheStrategy::Readaround, 1..2), 2);
}

#[test]
fn test_warm_cache_serves_second_pass() {
    let image = build(&text(6 * 4096, 8), &support::uniform(6, 4096), 12);
    let config = support::config()
        .with_cache_strategy(CacheStrategy::Readahead)
        .with_inplace(InplaceStrategy::Disabled);
    let m = support::mount(&image, config, Completion::Inline);
    // One page per request: every cluster is the first of its request.
    m.read_all_checked(&image, 1);
    assert_eq!(m.sb.managed.count(Mapping::Managed), 6);

    let before = m.sb.stats.snapshot().bios_submitted;
    m.read_all_checked(&image, 6);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, before);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: counters
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_counters_after_full_pass() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.read_all_checked(&image, 3);
    m.sb.workqueue.flush();
    let stats = m.sb.stats.snapshot();
    assert_eq!(stats.workgroups_created, image.extents.len() as u64);
    assert_eq!(stats.unzip_errors, 0);
    assert!(stats.unzip_passes >= image.extents.len() as u64);
    assert!(stats.bios_submitted >= 1);
    assert!(stats.to_string().contains("unzip_err=0"));
}
