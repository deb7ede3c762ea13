//! Shared fixtures for integration and end-to-end tests.
#![allow(dead_code)]

pub mod image;
pub mod lz4enc;

use std::sync::Arc;

use zvle::blockdev::{Completion, MemDevice};
use zvle::pagecache::MemPageCache;
use zvle::{Config, Geometry, Inode, Page, PageFrame, ReadOutcome, Superblock};

pub use image::{build, text, uniform, ExtentSpec, Image, Kind};

pub struct Mounted {
    pub sb: Arc<Superblock>,
    pub dev: Arc<MemDevice>,
    pub inode: Inode,
}

/// Mount `image` on an in-memory device completing as `mode`.
pub fn mount(image: &Image, config: Config, mode: Completion) -> Mounted {
    mount_with_cache(image, config, mode, Arc::new(MemPageCache::new()))
}

/// Like [`mount`] with a managed cache the test keeps a handle to.
pub fn mount_with_cache(image: &Image, config: Config, mode: Completion, cache: Arc<MemPageCache>) -> Mounted {
    let dev = Arc::new(MemDevice::new(image.bytes.clone(), mode));
    let geometry = Geometry::new(image::META_BLKADDR, image.cluster_bits).unwrap();
    let sb = Superblock::with_cache(dev.clone(), geometry, config, cache).unwrap();
    let inode = sb.read_inode(image::NID).unwrap();
    assert_eq!(inode, image.inode);
    Mounted { sb, dev, inode }
}

/// Mount `image` on a gated device that holds data reads until released;
/// metadata reads complete inline.
pub fn mount_gated(image: &Image, config: Config) -> Mounted {
    let dev = Arc::new(MemDevice::new(image.bytes.clone(), Completion::Gated));
    dev.gate_from(image.extents[0].pblk);
    let geometry = Geometry::new(image::META_BLKADDR, image.cluster_bits).unwrap();
    let sb = Superblock::new(dev.clone(), geometry, config).unwrap();
    let inode = sb.read_inode(image::NID).unwrap();
    Mounted { sb, dev, inode }
}

/// Two-worker config so tests do not depend on the host's CPU count.
pub fn config() -> Config {
    Config::default().with_workers(2)
}

pub fn file_pages(range: std::ops::Range<u64>) -> Vec<Page> {
    range.map(|i| PageFrame::new_file_page(image::NID, i).unwrap()).collect()
}

impl Mounted {
    pub fn read_range(&self, range: std::ops::Range<u64>) -> (Vec<Page>, ReadOutcome) {
        let pages = file_pages(range);
        let outcome = zvle::read_pages(&self.sb, &self.inode, &pages);
        (pages, outcome)
    }

    pub fn read_one(&self, index: u64) -> (Page, zvle::Result<()>) {
        let page = PageFrame::new_file_page(image::NID, index).unwrap();
        let res = zvle::read_page(&self.sb, &self.inode, &page);
        (page, res)
    }

    /// Read every page of the file in batches of `batch` and check contents.
    pub fn read_all_checked(&self, image: &Image, batch: u64) {
        let nr = image.nr_pages();
        let mut start = 0;
        while start < nr {
            let end = (start + batch).min(nr);
            let (pages, outcome) = self.read_range(start..end);
            assert_eq!(outcome.failed, 0, "pages {start}..{end} failed");
            for page in &pages {
                assert_page(image, page);
            }
            start = end;
        }
    }
}

pub fn assert_page(image: &Image, page: &Page) {
    assert!(!page.is_locked(), "page {} still locked", page.index());
    assert!(!page.has_error(), "page {} has error", page.index());
    assert!(page.is_uptodate(), "page {} not uptodate", page.index());
    assert!(page.to_vec() == image.page(page.index()), "page {} content mismatch", page.index());
}
