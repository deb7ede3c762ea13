//! E2E Test Suite 01: Single-page reads
//!
//! Reads files page by page through `read_page` and checks every byte:
//! - extents aligned and unaligned to cluster and page boundaries
//! - PLAIN and LZ4 extents in one file
//! - clusters of one, two and four pages
//! - tiny and empty files
//! - inline and threaded block devices
//! - pages visited in scattered order

#[path = "../tests/support/mod.rs"]
mod support;

use zvle::blockdev::Completion;
use zvle::PageFrame;

use support::{assert_page, build, text, ExtentSpec, Image};

fn read_every_page(image: &Image, mode: Completion, order: impl Iterator<Item = u64>) {
    let m = support::mount(image, support::config(), mode);
    for index in order {
        let (page, res) = m.read_one(index);
        res.unwrap_or_else(|e| panic!("page {index}: {e}"));
        assert_page(image, &page);
    }
}

fn layouts() -> Vec<(&'static str, Image)> {
    vec![
        ("aligned", build(&text(6 * 4096, 0), &support::uniform(6, 4096), 12)),
        (
            "unaligned",
            build(
                &text(27_345, 1),
                &[
                    ExtentSpec::lz4(5000),
                    ExtentSpec::lz4(7777),
                    ExtentSpec::lz4(4096),
                    ExtentSpec::lz4(10_001),
                    ExtentSpec::lz4(471),
                ],
                12,
            ),
        ),
        (
            "mixed",
            build(
                &text(21_000, 2),
                &[
                    ExtentSpec::lz4(6100),
                    ExtentSpec::plain(4096),
                    ExtentSpec::lz4(8000),
                    ExtentSpec::plain(2804),
                ],
                12,
            ),
        ),
        (
            "two-page clusters",
            build(&text(40_000, 3), &[ExtentSpec::lz4(9000), ExtentSpec::lz4(20_000), ExtentSpec::lz4(11_000)], 13),
        ),
        (
            "four-page clusters",
            build(&text(50_000, 4), &[ExtentSpec::lz4(17_000), ExtentSpec::lz4(33_000)], 14),
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: every layout, ascending, inline completion
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_layouts_ascending_inline() {
    for (name, image) in layouts() {
        eprintln!("layout: {name}");
        read_every_page(&image, Completion::Inline, 0..image.nr_pages());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: every layout, descending, threaded completion
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_layouts_descending_threaded() {
    for (name, image) in layouts() {
        eprintln!("layout: {name}");
        read_every_page(&image, Completion::Threaded, (0..image.nr_pages()).rev());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: scattered order
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_scattered_order() {
    let (_, image) = layouts().swap_remove(1);
    let nr = image.nr_pages();
    // 5 is coprime with the page count, so this visits every page once.
    assert_eq!(nr, 7);
    read_every_page(&image, Completion::Threaded, (0..nr).map(|i| (i * 5 + 3) % nr));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: tiny and empty files
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_tiny_file() {
    let image = build(&text(100, 0), &[ExtentSpec::lz4(100)], 12);
    read_every_page(&image, Completion::Inline, 0..1);
}

#[test]
fn test_tiny_plain_file() {
    let image = build(&text(100, 0), &[ExtentSpec::plain(100)], 12);
    read_every_page(&image, Completion::Inline, 0..1);
}

#[test]
fn test_empty_file_reads_zeroes() {
    let image = build(&[], &[], 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    let page = PageFrame::new_file_page(support::image::NID, 0).unwrap();
    zvle::read_page(&m.sb, &m.inode, &page).unwrap();
    assert!(page.is_uptodate());
    assert!(page.to_vec().iter().all(|&b| b == 0));
    assert!(m.sb.registry.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: repeated reads reuse the registered workgroups
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_repeated_reads_reuse_workgroups() {
    let (_, image) = layouts().swap_remove(0);
    let m = support::mount(&image, support::config(), Completion::Inline);
    for _ in 0..3 {
        for index in 0..image.nr_pages() {
            let (page, res) = m.read_one(index);
            res.unwrap();
            assert_page(&image, &page);
        }
    }
    let stats = m.sb.stats.snapshot();
    assert_eq!(stats.workgroups_created, 6);
    assert_eq!(m.sb.registry.len(), 6);
    for grp in m.sb.registry.snapshot() {
        assert_eq!(grp.refcount(), 1, "workgroup {} still referenced", grp.index);
        assert_eq!(grp.next.load(), zvle::zip::ChainLink::Nil);
    }
}
