//! E2E Test Suite 04: Reclaim under load
//!
//! Readers keep the workstation busy while another thread shrinks it,
//! releases single managed pages and migrates them:
//! - every page a reader gets back is intact
//! - reclaim only ever touches idle workgroups
//! - a final cleanup leaves neither workgroups nor managed pages behind

#[path = "../tests/support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use zvle::blockdev::Completion;
use zvle::pagecache::{MemPageCache, PageCache};
use zvle::zip::{migrate_cached_page, shrink_workstation, try_to_free_cached_page};
use zvle::{CacheStrategy, Mapping, PageFrame, ZipError};

use support::{assert_page, build, text, ExtentSpec, Image, Mounted};

fn file() -> Image {
    let specs: Vec<ExtentSpec> = (0..12).map(|k| ExtentSpec::lz4(4096 + (k * 977) % 5000)).collect();
    let size = specs.iter().map(|s| s.len).sum();
    build(&text(size, 11), &specs, 12)
}

fn readers(m: &Arc<Mounted>, image: &Arc<Image>, rounds: usize) -> Vec<thread::JoinHandle<()>> {
    (0..4u64)
        .map(|t| {
            let (m, image) = (Arc::clone(m), Arc::clone(image));
            thread::spawn(move || {
                let nr = image.nr_pages();
                for round in 0..rounds {
                    let batch = 1 + (t + round as u64) % 4;
                    let mut start = (t * 3 + round as u64) % nr;
                    let mut done = 0;
                    while done < nr {
                        let end = (start + batch).min(nr);
                        let (pages, outcome) = m.read_range(start..end);
                        assert_eq!(outcome.failed, 0);
                        for page in &pages {
                            assert_page(&image, page);
                        }
                        done += end - start;
                        start = if end == nr { 0 } else { end };
                    }
                }
            })
        })
        .collect()
}

/// Tolerated outcomes of a reclaim step racing a reader.
fn transient(res: zvle::Result<()>) {
    match res {
        Ok(()) | Err(ZipError::Busy) | Err(ZipError::StaleHandle) => {}
        Err(e) => panic!("unexpected reclaim error: {e}"),
    }
}

fn reclaimer(m: &Arc<Mounted>, cache: &Arc<MemPageCache>, stop: &Arc<AtomicBool>) -> thread::JoinHandle<usize> {
    let (m, cache, stop) = (Arc::clone(m), Arc::clone(cache), Arc::clone(stop));
    thread::spawn(move || {
        let mut passes = 0;
        while !stop.load(Ordering::Acquire) {
            match passes % 3 {
                0 => {
                    shrink_workstation(&m.sb, 2, false);
                }
                1 => {
                    for page in cache.pages_of(Mapping::Managed) {
                        try_to_free_cached_page(&m.sb, &page);
                    }
                }
                _ => {
                    for old in cache.pages_of(Mapping::Managed) {
                        let new = PageFrame::alloc().unwrap();
                        transient(migrate_cached_page(&m.sb, &old, &new));
                    }
                }
            }
            passes += 1;
            thread::yield_now();
        }
        passes
    })
}

fn mount_with_cache(image: &Image, strategy: CacheStrategy, mode: Completion) -> (Arc<Mounted>, Arc<MemPageCache>) {
    let cache = Arc::new(MemPageCache::new());
    let config = support::config().with_cache_strategy(strategy);
    let m = support::mount_with_cache(image, config, mode, cache.clone());
    (Arc::new(m), cache)
}

fn run(strategy: CacheStrategy, mode: Completion) {
    let image = Arc::new(file());
    let (m, cache) = mount_with_cache(&image, strategy, mode);
    let stop = Arc::new(AtomicBool::new(false));

    let reclaim = reclaimer(&m, &cache, &stop);
    for r in readers(&m, &image, 6) {
        r.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    assert!(reclaim.join().unwrap() > 0);

    m.sb.workqueue.flush();
    let live = m.sb.registry.len();
    assert_eq!(shrink_workstation(&m.sb, 0, true), live);
    assert!(m.sb.registry.is_empty());
    assert_eq!(cache.count(Mapping::Managed), 0);

    // The file still reads back in full afterwards.
    m.read_all_checked(&image, 5);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1-3: readers against a reclaimer, per cache strategy
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_reclaim_under_load_readaround() {
    run(CacheStrategy::Readaround, Completion::Threaded);
}

#[test]
fn test_reclaim_under_load_readahead() {
    run(CacheStrategy::Readahead, Completion::Threaded);
}

#[test]
fn test_reclaim_under_load_inline_completion() {
    run(CacheStrategy::Readaround, Completion::Inline);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: a group retired while a reader still holds it
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_retired_group_is_rebuilt_on_next_read() {
    let image = file();
    let (m, _cache) = mount_with_cache(&image, CacheStrategy::Readaround, Completion::Inline);
    m.read_all_checked(&image, 3);

    let key = image.extents[4].pblk;
    let held = m.sb.registry.find(key).unwrap();
    let before = m.sb.registry.len();
    // Everything but the held group goes.
    assert_eq!(shrink_workstation(&m.sb, 0, true), before - 1);
    m.sb.registry.put(&held);
    assert_eq!(shrink_workstation(&m.sb, 0, true), 1);

    let created = m.sb.stats.snapshot().workgroups_created;
    m.read_all_checked(&image, 64);
    assert_eq!(m.sb.stats.snapshot().workgroups_created, created + image.extents.len() as u64);
}
