//! E2E Test Suite 05: Error handling
//!
//! Failures stay confined to the pages they concern:
//! - a failed raw read fails exactly the pages decoded from it
//! - a device that recovers serves the same pages on the next read
//! - corrupt index records fail the page with `CorruptMetadata`
//! - undecodable or short compressed data fails the workgroup's pages only
//! - reads beyond the end of the device surface as I/O errors

#[path = "../tests/support/mod.rs"]
mod support;

use zvle::blockdev::Completion;
use zvle::vle::IndexRecord;
use zvle::ZipError;

use support::{assert_page, build, text, ExtentSpec, Image};

fn four_clusters() -> Image {
    build(&text(4 * 4096, 5), &support::uniform(4, 4096), 12)
}

fn assert_failed(page: &zvle::Page) {
    let index = page.index();
    assert!(!page.is_locked(), "page {index} still locked");
    assert!(page.has_error(), "page {index} should have failed");
    assert!(!page.is_uptodate(), "page {index} should not be uptodate");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1-3: injected device faults
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_fault_is_isolated_to_its_bio() {
    let image = four_clusters();
    let m = support::mount(&image, support::config().with_max_bio_pages(1), Completion::Threaded);
    m.dev.inject_fault(image.extents[2].pblk);

    let (pages, outcome) = m.read_range(0..4);
    assert_eq!(outcome.bios, 4);
    assert_eq!(outcome.failed, 1);
    for page in &pages {
        if page.index() == 2 {
            assert_failed(page);
        } else {
            assert_page(&image, page);
        }
    }
    m.sb.workqueue.flush();
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 1);
}

#[test]
fn test_fault_in_merged_bio_fails_every_page() {
    let image = four_clusters();
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.dev.inject_fault(image.extents[1].pblk);

    let (pages, outcome) = m.read_range(0..4);
    assert_eq!(outcome, zvle::ReadOutcome { bios: 1, failed: 4 });
    for page in &pages {
        assert_failed(page);
    }
    m.sb.workqueue.flush();
    assert!(m.sb.stats.snapshot().to_string().contains("unzip_err=4"));
}

#[test]
fn test_recovered_device_serves_pages_again() {
    let image = four_clusters();
    for sync_pages in [0, 64] {
        let config = support::config().with_max_sync_decompress_pages(sync_pages);
        let m = support::mount(&image, config, Completion::Threaded);
        m.dev.inject_fault(image.extents[3].pblk);
        let (_, outcome) = m.read_range(0..4);
        assert!(outcome.failed > 0);

        m.dev.clear_faults();
        m.read_all_checked(&image, 4);
        m.sb.workqueue.flush();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4-6: corrupt index records
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_corrupt_record_fails_read_page() {
    let mut image = four_clusters();
    image.set_record(1, IndexRecord::nonhead(0, 0));
    let m = support::mount(&image, support::config(), Completion::Inline);

    let (page, res) = m.read_one(1);
    assert!(matches!(res, Err(ZipError::CorruptMetadata { nid: 1, lcn: 1, .. })), "{res:?}");
    assert_failed(&page);

    // Neighbours are unaffected.
    for index in [0, 2, 3] {
        let (page, res) = m.read_one(index);
        res.unwrap();
        assert_page(&image, &page);
    }
}

#[test]
fn test_corrupt_record_in_batch_fails_one_page() {
    let mut image = four_clusters();
    image.set_record(2, IndexRecord::nonhead(7, 0));
    let m = support::mount(&image, support::config(), Completion::Threaded);

    let (pages, outcome) = m.read_range(0..4);
    assert_eq!(outcome.failed, 1);
    for page in &pages {
        if page.index() == 2 {
            assert_failed(page);
        } else {
            assert_page(&image, page);
        }
    }
}

#[test]
fn test_compat_record_needs_mount_option() {
    let mut image = build(&text(8192, 2), &[ExtentSpec::lz4(8192)], 12);
    image.set_record(1, IndexRecord::huawei_compat(4096, 0, 0));

    let m = support::mount(&image, support::config(), Completion::Inline);
    let (page, res) = m.read_one(1);
    assert!(matches!(res, Err(ZipError::CorruptMetadata { lcn: 1, .. })), "{res:?}");
    assert_failed(&page);

    let m = support::mount(&image, support::config().with_huawei_compat(true), Completion::Inline);
    m.read_all_checked(&image, 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7-9: bad compressed data and a short device
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_undecodable_cluster_fails_its_pages() {
    let image = build(&text(3 * 4096, 8), &support::uniform(3, 4096), 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.dev.write_blocks(image.extents[1].pblk, &[0xFF; 4096]);

    let (pages, outcome) = m.read_range(0..3);
    assert_eq!(outcome.failed, 1);
    assert_failed(&pages[1]);
    assert_page(&image, &pages[0]);
    assert_page(&image, &pages[2]);
    m.sb.workqueue.flush();
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 1);
}

/// A literal-only LZ4 block filling exactly one 4 KiB cluster.  It decodes
/// cleanly but to fewer bytes than the cluster's extent.
fn short_cluster() -> Vec<u8> {
    let literals = 4096 - 17;
    let mut block = vec![0xF0];
    let mut rest = literals - 15;
    while rest >= 255 {
        block.push(255);
        rest -= 255;
    }
    block.push(rest as u8);
    block.extend(text(literals, 9));
    assert_eq!(block.len(), 4096);
    block
}

#[test]
fn test_short_decode_fails_its_pages() {
    let image = build(&text(8192, 8), &[ExtentSpec::lz4(8192)], 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.dev.write_blocks(image.extents[0].pblk, &short_cluster());

    let (pages, outcome) = m.read_range(0..2);
    assert_eq!(outcome.failed, 2);
    for page in &pages {
        assert_failed(page);
    }
    m.sb.workqueue.flush();
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 1);
}

#[test]
fn test_truncated_device_fails_tail() {
    let mut image = four_clusters();
    let cut = image.extents[3].pblk as usize * 4096;
    image.bytes.truncate(cut);
    let m = support::mount(&image, support::config().with_max_bio_pages(1), Completion::Inline);

    let (page, res) = m.read_one(3);
    assert!(matches!(res, Err(ZipError::PageFailed { nid: 1, index: 3 })), "{res:?}");
    assert_failed(&page);
    for index in 0..3 {
        let (page, res) = m.read_one(index);
        res.unwrap();
        assert_page(&image, &page);
    }
}
