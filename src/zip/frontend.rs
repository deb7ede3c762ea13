//! Read entry points.
//!
//! A [`Frontend`] carries one request across the pages it reads: the extent
//! last resolved, the work builder attached to it, and the head of the chain
//! of workgroups the request owns.  Each page is walked from its end towards
//! its start, one extent part at a time, so a page straddling two extents is
//! attached to both workgroups.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{CacheStrategy, PAGE_SIZE};
use crate::error::{Result, ZipError};
use crate::page::Page;
use crate::pagepool::PagePool;
use crate::sb::{Inode, Superblock};
use crate::vle::{MapBlocks, Resolver};
use crate::zip::builder::WorkBuilder;
use crate::zip::pagevec::PageType;
use crate::zip::submit::submit_and_unzip;
use crate::zip::tagptr::ChainLink;

/// Result of a batch read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Raw read requests issued for compressed data.
    pub bios: usize,
    /// Pages that completed with their error flag set.
    pub failed: usize,
}

pub struct Frontend<'a> {
    sb: &'a Arc<Superblock>,
    inode: &'a Inode,
    resolver: Resolver<'a>,
    map: MapBlocks,
    builder: WorkBuilder,
    owned_head: ChainLink,
    /// Still on the first extent of the request.
    initial: bool,
    /// Logical start of the request; extents before it are read-around.
    cachedzone_la: u64,
}

impl<'a> Frontend<'a> {
    pub fn new(sb: &'a Arc<Superblock>, inode: &'a Inode) -> Self {
        Frontend {
            sb,
            inode,
            resolver: Resolver::new(sb, inode),
            map: MapBlocks::default(),
            builder: WorkBuilder::new(),
            owned_head: ChainLink::Tail,
            initial: true,
            cachedzone_la: 0,
        }
    }

    pub fn owned_head(&self) -> ChainLink {
        self.owned_head
    }

    fn should_reserve(&self) -> bool {
        match self.sb.config.cache_strategy {
            CacheStrategy::Disabled => false,
            CacheStrategy::Readahead => self.initial,
            CacheStrategy::Readaround => self.initial || self.map.m_la < self.cachedzone_la,
        }
    }

    /// Attach every part of `page` to its workgroup.  The page is locked and
    /// becomes complete once each attached workgroup has decompressed into
    /// it.  Errors flag the page; it is still completed.
    pub fn attach_page(&mut self, page: &Page, pool: &mut PagePool) -> Result<()> {
        page.online_init();
        let res = self.attach_parts(page, pool);
        if let Err(e) = &res {
            warn!(nid = self.inode.nid, index = page.index(), error = %e, "failed to attach page");
            page.set_error();
        }
        page.online_endio();
        res
    }

    fn attach_parts(&mut self, page: &Page, pool: &mut PagePool) -> Result<()> {
        let offset = page.index() * PAGE_SIZE as u64;
        let mut tight = self.builder.is_weak_followed();
        let mut parts = 0u32;
        let mut end = PAGE_SIZE;

        loop {
            let cur = end - 1;
            let pos = offset + cur as u64;
            let need_begin = if self.map.contains(pos) {
                !self.builder.has_work()
            } else {
                if self.builder.end(self.sb) {
                    self.initial = false;
                }
                self.map = self.resolver.resolve(pos)?;
                true
            };

            if need_begin && self.map.is_mapped() {
                // Bytes past EOF are never decoded.
                let mut extent = self.map;
                let to_eof = self.inode.size.saturating_sub(extent.m_la);
                let at_eof = extent.m_llen >= to_eof;
                extent.m_llen = extent.m_llen.min(to_eof);
                self.builder
                    .begin(self.sb, &extent, &mut self.owned_head)
                    .map_err(|e| e.with_nid(self.inode.nid))?;
                if let Some(work) = self.builder.work_mut() {
                    work.at_eof |= at_eof;
                }
                if self.sb.config.cache_strategy != CacheStrategy::Disabled {
                    let reserve = self.should_reserve();
                    self.builder.scan_cachepages(self.sb, reserve, pool);
                }
                tight &= self.builder.is_weak_followed();
            }

            // Start of this part within the page.
            let cur = end - ((offset + end as u64 - self.map.m_la).min(end as u64) as usize);

            if !self.map.is_mapped() {
                page.zero_range(cur, end);
            } else {
                let ty = if cur != 0 {
                    PageType::Head
                } else if parts == 0 || tight {
                    PageType::Exclusive
                } else {
                    PageType::TailShared
                };
                if cur != 0 {
                    tight &= self.builder.is_followed();
                }
                if parts >= 2 {
                    let lcn = pos >> self.sb.geometry.cluster_bits;
                    return Err(ZipError::corrupt(self.inode.nid, lcn, "page split into more than two extents"));
                }

                self.add_page(page, ty, pool)?;
                parts += 1;

                let index = (page.index() - self.map.m_la / PAGE_SIZE as u64) as usize;
                page.online_fixup(index, true);
                if let Some(work) = self.builder.work_mut() {
                    work.nr_pages = work.nr_pages.max(index + 1);
                }
                trace!(index = page.index(), ?ty, part = index, "attached page part");
            }

            // Shrink the extent so the remainder of the page resolves again.
            self.map.m_llen = offset + cur as u64 - self.map.m_la;
            end = cur;
            if end == 0 {
                break;
            }
        }
        Ok(())
    }

    fn add_page(&mut self, page: &Page, ty: PageType, pool: &mut PagePool) -> Result<()> {
        loop {
            match self.builder.add_page(page, ty) {
                Err(ZipError::PagevecFull) => {
                    let carrier = pool.alloc_staging()?;
                    self.builder.add_page(&carrier, PageType::Exclusive)?;
                }
                other => return other,
            }
        }
    }

    /// End the current work and submit the owned chain.
    pub fn finish(mut self, pool: &mut PagePool, sync: bool) -> usize {
        self.builder.end(self.sb);
        submit_and_unzip(self.sb, self.owned_head, pool, sync)
    }
}

/// Read one page of `inode`.  `page` must be locked; it is unlocked with its
/// uptodate or error flag settled before this returns.  The error of the
/// attach step, if any, is returned as well.
pub fn read_page(sb: &Arc<Superblock>, inode: &Inode, page: &Page) -> Result<()> {
    let mut pool = PagePool::new();
    let mut frontend = Frontend::new(sb, inode);
    frontend.cachedzone_la = page.index() * PAGE_SIZE as u64;

    let res = frontend.attach_page(page, &mut pool);
    // The chain is submitted even after an error: other readers may already
    // depend on workgroups this request owns.
    let bios = frontend.finish(&mut pool, true);
    page.wait_unlocked();
    debug!(nid = inode.nid, index = page.index(), bios, uptodate = page.is_uptodate(), "read_page done");
    res?;
    if page.has_error() {
        return Err(ZipError::PageFailed { nid: inode.nid, index: page.index() });
    }
    Ok(())
}

/// Read a batch of locked pages of `inode`, given in ascending index order.
/// Small batches that are not readahead decompress on the caller's thread;
/// others use the work queue.  Returns after every page has completed.
pub fn read_pages(sb: &Arc<Superblock>, inode: &Inode, pages: &[Page]) -> ReadOutcome {
    let Some(first) = pages.first() else {
        return ReadOutcome::default();
    };
    let sync = sb.config.should_decompress_synchronously(pages.len()) && !first.is_readahead();

    let mut pool = PagePool::new();
    let mut frontend = Frontend::new(sb, inode);
    frontend.cachedzone_la = first.index() * PAGE_SIZE as u64;

    for page in pages.iter().rev() {
        // Failures are already flagged on the page.
        let _ = frontend.attach_page(page, &mut pool);
    }
    let bios = frontend.finish(&mut pool, sync);

    let mut failed = 0;
    for page in pages {
        page.wait_unlocked();
        if page.has_error() {
            failed += 1;
        }
    }
    debug!(nid = inode.nid, nr_pages = pages.len(), bios, failed, sync, "read_pages done");
    ReadOutcome { bios, failed }
}
