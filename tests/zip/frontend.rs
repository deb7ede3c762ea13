// Read entry points over fixture images.
//
// Coverage:
//   - single pages inside an extent and across an extent boundary
//   - batches on the caller's thread and on the work queue
//   - pages past end-of-file and a last extent stored only up to it
//   - an extent claiming another extent's cluster at a different offset
//   - PLAIN extents and multi-page clusters
//   - every cache and in-place strategy combination
//   - managed pages serve repeat reads without I/O
//   - a compressed slot left without a page after allocation failure

use zvle::blockdev::Completion;
use zvle::pagepool::PagePool;
use zvle::vle::IndexRecord;
use zvle::zip::{ChainLink, Frontend, InplaceStrategy};
use zvle::{CacheStrategy, Mapping, PageFrame, ZipError};

use crate::support::{self, assert_page, build, text, ExtentSpec, Image};

fn unaligned() -> Image {
    let specs = [ExtentSpec::lz4(6000), ExtentSpec::lz4(5000), ExtentSpec::lz4(3000)];
    build(&text(14_000, 0), &specs, 12)
}

#[test]
fn read_page_inside_extent() {
    let image = build(&text(3 * 4096, 0), &support::uniform(3, 4096), 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    let (page, res) = m.read_one(1);
    res.unwrap();
    assert_page(&image, &page);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 1);
}

#[test]
fn read_page_across_extent_boundary() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    // Page 1 holds bytes 4096..8192; extent 1 starts at 6000.
    let (page, res) = m.read_one(1);
    res.unwrap();
    assert_page(&image, &page);
    // Both physical clusters are adjacent, so one raw read covers them.
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 1);
    assert_eq!(m.sb.registry.len(), 2);
}

#[test]
fn page_past_eof_is_zeroed() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    let page = PageFrame::new_file_page(support::image::NID, 9).unwrap();
    page.write().fill(0xAA);
    zvle::read_page(&m.sb, &m.inode, &page).unwrap();
    assert!(page.is_uptodate());
    assert!(page.to_vec().iter().all(|&b| b == 0));
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 0);
}

#[test]
fn last_page_is_zero_filled_after_eof() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    let (page, res) = m.read_one(3);
    res.unwrap();
    assert_page(&image, &page);
    assert!(page.to_vec()[14_000 - 3 * 4096..].iter().all(|&b| b == 0));
}

#[test]
fn last_extent_stored_up_to_eof_decodes() {
    let image = unaligned();
    let last = image.extents[2];
    let mut stored = support::lz4enc::compress(&image.content[last.la as usize..]);
    stored.resize(4096, 0);
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.dev.write_blocks(last.pblk, &stored);

    for index in 2..4 {
        let (page, res) = m.read_one(index);
        res.unwrap();
        assert_page(&image, &page);
    }
    m.sb.workqueue.flush();
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 0);
}

#[test]
fn extent_rejoining_group_at_other_offset_is_corrupt() {
    let mut image = unaligned();
    // Extent 1 claims extent 0's physical cluster at page offset 1904.
    image.set_record(1, IndexRecord::head(1904, image.extents[0].pblk as u32));
    let m = support::mount(&image, support::config(), Completion::Inline);

    let (page, res) = m.read_one(0);
    res.unwrap();
    assert_page(&image, &page);

    let (page, res) = m.read_one(1);
    assert!(matches!(res, Err(ZipError::CorruptMetadata { nid: 1, lcn: 1, .. })), "{res:?}");
    assert!(page.has_error());
    assert!(!page.is_locked());

    // The lookup that hit the mismatch gave its reference back.
    let grp = m.sb.registry.find(image.extents[0].pblk).unwrap();
    assert_eq!(grp.refcount(), 2);
    m.sb.registry.put(&grp);
}

#[test]
fn small_batch_reads_in_foreground() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Threaded);
    let (pages, outcome) = m.read_range(0..3);
    assert_eq!(outcome.failed, 0);
    for page in &pages {
        assert_page(&image, page);
    }
}

#[test]
fn large_batch_reads_in_background() {
    let content = text(20 * 4096, 3);
    let image = build(&content, &support::uniform(10, 2 * 4096), 12);
    let m = support::mount(&image, support::config(), Completion::Threaded);
    let (pages, outcome) = m.read_range(0..20);
    assert_eq!(outcome.failed, 0);
    for page in &pages {
        assert_page(&image, page);
    }
}

#[test]
fn readahead_batch_is_not_synchronous() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    let pages = support::file_pages(0..2);
    pages[0].set_readahead();
    let outcome = zvle::read_pages(&m.sb, &m.inode, &pages);
    assert_eq!(outcome.failed, 0);
    for page in &pages {
        assert_page(&image, page);
    }
}

#[test]
fn empty_batch_does_nothing() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    assert_eq!(zvle::read_pages(&m.sb, &m.inode, &[]), zvle::ReadOutcome::default());
}

#[test]
fn plain_and_compressed_extents_mix() {
    let specs = [
        ExtentSpec::plain(4096),
        ExtentSpec::lz4(9000),
        ExtentSpec::plain(4096),
        ExtentSpec::lz4(2000),
    ];
    let image = build(&text(19_192, 11), &specs, 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    m.read_all_checked(&image, 2);
}

#[test]
fn multi_page_clusters() {
    let specs = [ExtentSpec::lz4(8192), ExtentSpec::lz4(12_000), ExtentSpec::lz4(9000)];
    let image = build(&text(29_192, 5), &specs, 13);
    let m = support::mount(&image, support::config(), Completion::Threaded);
    m.read_all_checked(&image, 3);
    m.read_all_checked(&image, 8);
}

#[test]
fn every_strategy_reads_the_same_bytes() {
    let image = unaligned();
    for cache in [CacheStrategy::Disabled, CacheStrategy::Readahead, CacheStrategy::Readaround] {
        for inplace in [InplaceStrategy::Reuse, InplaceStrategy::CompressedOnly, InplaceStrategy::Disabled] {
            let config = support::config().with_cache_strategy(cache).with_inplace(inplace);
            let m = support::mount(&image, config, Completion::Inline);
            m.read_all_checked(&image, 1);
            m.read_all_checked(&image, 4);
        }
    }
}

#[test]
fn disabled_cache_keeps_no_managed_pages() {
    let image = unaligned();
    let config = support::config().with_cache_strategy(CacheStrategy::Disabled);
    let m = support::mount(&image, config, Completion::Inline);
    m.read_all_checked(&image, 4);
    assert_eq!(m.sb.managed.count(Mapping::Managed), 0);
}

#[test]
fn cached_cluster_needs_no_io() {
    let image = build(&text(3 * 4096, 0), &support::uniform(3, 4096), 12);
    let m = support::mount(&image, support::config(), Completion::Inline);
    let (first, res) = m.read_one(2);
    res.unwrap();
    assert_page(&image, &first);
    assert_eq!(m.sb.managed.count(Mapping::Managed), 1);

    let (again, res) = m.read_one(2);
    res.unwrap();
    assert_page(&image, &again);
    assert_eq!(m.sb.stats.snapshot().bios_submitted, 1);
}

#[test]
fn frontend_owns_the_chain_it_builds() {
    let image = unaligned();
    let m = support::mount(&image, support::config(), Completion::Inline);
    let mut pool = PagePool::new();
    let mut frontend = Frontend::new(&m.sb, &m.inode);
    assert_eq!(frontend.owned_head(), ChainLink::Tail);

    let page = PageFrame::new_file_page(support::image::NID, 1).unwrap();
    frontend.attach_page(&page, &mut pool).unwrap();
    assert!(matches!(frontend.owned_head(), ChainLink::Linked(_)));
    // Two parts are still pending, one per workgroup.
    assert!(page.is_locked());
    assert_eq!(page.online_pending(), 2);

    assert_eq!(frontend.finish(&mut pool, true), 1);
    page.wait_unlocked();
    assert_page(&image, &page);
}

#[test]
fn slot_without_page_stays_locked_until_unzip() {
    // One two-page cluster: the pool can back its first slot only.
    let image = build(&text(8192, 3), &[ExtentSpec::lz4(8192)], 13);
    let config = support::config()
        .with_cache_strategy(CacheStrategy::Disabled)
        .with_inplace(InplaceStrategy::Disabled);
    let m = support::mount_gated(&image, config);
    let key = image.extents[0].pblk;

    let mut pool = PagePool::with_alloc_budget(1);
    let mut frontend = Frontend::new(&m.sb, &m.inode);
    let page = PageFrame::new_file_page(support::image::NID, 0).unwrap();
    frontend.attach_page(&page, &mut pool).unwrap();
    assert_eq!(frontend.finish(&mut pool, false), 1);

    // While the first block is in flight the second slot refuses any page.
    let grp = m.sb.registry.find(key).unwrap();
    assert!(grp.compressed_pages[1].is_locked());
    let spare = PageFrame::new_file_page(support::image::NID, 1).unwrap();
    assert!(grp.compressed_pages[1].try_install(spare, false).is_err());
    m.sb.registry.put(&grp);

    while page.is_locked() {
        m.dev.release();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(page.has_error());
    m.sb.workqueue.flush();
    assert_eq!(m.sb.stats.snapshot().unzip_errors, 1);

    let grp = m.sb.registry.find(key).unwrap();
    assert!(grp.compressed_pages.iter().all(|slot| slot.is_empty()));
    m.sb.registry.put(&grp);

    std::thread::scope(|s| {
        let reader = s.spawn(|| m.read_one(0));
        while !reader.is_finished() {
            m.dev.release();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (page, res) = reader.join().unwrap();
        res.unwrap();
        assert_page(&image, &page);
    });
}
