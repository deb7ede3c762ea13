//! E2E Test Suite 03: Concurrent readers
//!
//! Many requests racing over the same clusters:
//! - readers of different pages of one cluster share a single raw read
//! - readers of the same page all see the right bytes, even when they
//!   attach to the same pending work
//! - mixed batch sizes and directions over a whole file
//! - every workgroup ends idle, unchained and singly referenced

#[path = "../tests/support/mod.rs"]
mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use zvle::blockdev::Completion;
use zvle::zip::{ChainLink, InplaceStrategy};
use zvle::CacheStrategy;

use support::{assert_page, build, text, ExtentSpec, Image, Mounted};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn assert_all_idle(m: &Mounted) {
    m.sb.workqueue.flush();
    for grp in m.sb.registry.snapshot() {
        assert_eq!(grp.refcount(), 1, "workgroup {} still referenced", grp.index);
        assert_eq!(grp.next.load(), ChainLink::Nil, "workgroup {} still chained", grp.index);
        assert!(grp.work.lock().pagevec.is_empty());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: two pages of one cluster, one raw read
// ─────────────────────────────────────────────────────────────────────────────

/// Read `indices` of `image` on concurrent threads against a gated device,
/// releasing raw reads only once every page sits in the first workgroup.
fn read_gated(image: Image, indices: &[u64]) -> Arc<Mounted> {
    let config = support::config()
        .with_cache_strategy(CacheStrategy::Disabled)
        .with_inplace(InplaceStrategy::Disabled);
    let m = Arc::new(support::mount_gated(&image, config));
    let image = Arc::new(image);

    let readers: Vec<_> = indices
        .iter()
        .map(|&index| {
            let (m, image) = (Arc::clone(&m), Arc::clone(&image));
            thread::spawn(move || {
                let (page, res) = m.read_one(index);
                res.unwrap();
                assert_page(&image, &page);
            })
        })
        .collect();

    let key = image.extents[0].pblk;
    wait_until("every page to attach", || match m.sb.registry.find(key) {
        Some(grp) => {
            let attached = grp.work.try_lock().map_or(0, |w| w.pagevec.len());
            m.sb.registry.put(&grp);
            attached == indices.len()
        }
        None => false,
    });

    while !readers.iter().all(|r| r.is_finished()) {
        m.dev.release();
        thread::sleep(Duration::from_millis(1));
    }
    for r in readers {
        r.join().unwrap();
    }
    m
}

#[test]
fn test_joiner_rides_on_pending_io() {
    let image = build(&text(8192, 0), &[ExtentSpec::lz4(8192)], 12);
    let m = read_gated(image, &[0, 1]);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 1);
    assert_eq!(m.sb.stats.snapshot().workgroups_created, 1);
    assert_all_idle(&m);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: many readers of the same page
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_same_page_many_readers() {
    let image = Arc::new(build(&text(3 * 4096, 1), &support::uniform(3, 4096), 12));
    let m = Arc::new(support::mount(&image, support::config(), Completion::Threaded));

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let (m, image) = (Arc::clone(&m), Arc::clone(&image));
            thread::spawn(move || {
                for _ in 0..50 {
                    let (page, res) = m.read_one(1);
                    res.unwrap();
                    assert_page(&image, &page);
                }
            })
        })
        .collect();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(m.sb.stats.snapshot().workgroups_created, 1);
    assert_all_idle(&m);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: whole-file readers with mixed batches
// ─────────────────────────────────────────────────────────────────────────────

fn big_file() -> Image {
    let mut specs = Vec::new();
    let mut total = 0;
    for k in 0..24 {
        let len = 4096 + (k * 1237) % 6000;
        specs.push(ExtentSpec::lz4(len));
        total += len;
    }
    build(&text(total, 13), &specs, 12)
}

fn stress(config: zvle::Config, mode: Completion) {
    let image = Arc::new(big_file());
    let m = Arc::new(support::mount(&image, config, mode));
    let nr = image.nr_pages();

    let readers: Vec<_> = (0..8u64)
        .map(|t| {
            let (m, image) = (Arc::clone(&m), Arc::clone(&image));
            thread::spawn(move || {
                let batch = [1, 2, 3, 5, 8, 13, 32, 64][t as usize];
                for round in 0..4u64 {
                    let starts: Vec<u64> = (0..nr).step_by(batch as usize).collect();
                    let order: Box<dyn Iterator<Item = &u64>> = if (t + round) % 2 == 0 {
                        Box::new(starts.iter())
                    } else {
                        Box::new(starts.iter().rev())
                    };
                    for &start in order {
                        let end = (start + batch).min(nr);
                        let (pages, outcome) = m.read_range(start..end);
                        assert_eq!(outcome.failed, 0, "reader {t} pages {start}..{end}");
                        for page in &pages {
                            assert_page(&image, page);
                        }
                    }
                }
            })
        })
        .collect();
    for r in readers {
        r.join().unwrap();
    }
    assert_all_idle(&m);
}

#[test]
fn test_stress_default_threaded() {
    stress(support::config(), Completion::Threaded);
}

#[test]
fn test_stress_default_inline() {
    stress(support::config(), Completion::Inline);
}

#[test]
fn test_stress_no_cache_no_inplace() {
    let config = support::config()
        .with_cache_strategy(CacheStrategy::Disabled)
        .with_inplace(InplaceStrategy::Disabled);
    stress(config, Completion::Threaded);
}

#[test]
fn test_stress_readaround_single_worker() {
    let config = support::config()
        .with_cache_strategy(CacheStrategy::Readaround)
        .with_workers(1)
        .with_max_bio_pages(2);
    stress(config, Completion::Threaded);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4-5: one page attached by two readers before its cluster is read
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_same_page_attached_twice_to_pending_work() {
    let image = build(&text(8192, 4), &[ExtentSpec::lz4(8192)], 12);
    let m = read_gated(image, &[1, 1]);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 1);
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 0);
    assert_all_idle(&m);
}

#[test]
fn test_same_page_attached_twice_across_extents() {
    // Page 1 straddles both extents, so each reader joins two workgroups.
    let image = build(&text(14_000, 6), &[ExtentSpec::lz4(6000), ExtentSpec::lz4(8000)], 12);
    let m = read_gated(image, &[1, 1]);
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 0);
    assert_all_idle(&m);
}
