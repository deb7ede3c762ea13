//! Decompression pass over a closed chain.
//!
//! For every workgroup: collect its output pages into a dense array indexed
//! by logical page, gather the compressed blocks into one contiguous source,
//! decode into a zeroed output window and scatter only the extent's bytes
//! back into the pages.  Bytes of a page outside the extent are left alone,
//! because a neighbouring workgroup may own them; past end-of-file they are
//! zero-filled.  Afterwards the work is
//! reset, the chain link returns to `Nil` and the request's reference is
//! dropped.

use std::sync::Arc;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, error, trace, warn};

use crate::codec::{Codec, Lz4};
use crate::config::{CLUSTER_MAX_PAGES, PAGE_SIZE, VMAP_ONSTACK_PAGES};
use crate::error::{Result, ZipError};
use crate::page::Page;
use crate::pagepool::PagePool;
use crate::sb::Superblock;
use crate::stats::Stats;
use crate::zip::pagevec::PageType;
use crate::zip::tagptr::ChainLink;
use crate::zip::workgroup::{Format, Workgroup};

/// Decompress every workgroup of the chain starting at `head`.  A failure
/// in one workgroup only fails that workgroup's pages.
pub(crate) fn unzip_all(sb: &Superblock, head: ChainLink, pool: &mut PagePool) {
    let mut owned = head;
    while owned != ChainLink::TailClosed {
        let Some(handle) = owned.handle() else {
            error!(link = ?owned, "unzip chain ended without a tail marker");
            break;
        };
        let grp = match sb.registry.get(handle) {
            Ok(grp) => grp,
            Err(e) => {
                error!(?handle, error = %e, "queued workgroup vanished from the registry");
                break;
            }
        };
        // Read before `unzip` resets the link.
        owned = grp.next.load();

        Stats::bump(&sb.stats.unzip_passes);
        if let Err(e) = unzip(sb, &grp, pool) {
            Stats::bump(&sb.stats.unzip_errors);
            warn!(key = grp.index, error = %e, "workgroup decompression failed");
        }
        sb.registry.put(&grp);
    }
}

/// Output pages of one workgroup, dense by logical page.  A page attached
/// by several concurrent readers lands once in `pages` and again in
/// `doubles`; every copy receives the same bytes and completion.
struct OutputPages {
    pages: SmallVec<[Option<Page>; VMAP_ONSTACK_PAGES]>,
    doubles: SmallVec<[(usize, Page); 2]>,
}

impl OutputPages {
    fn new(nr_pages: usize) -> Self {
        OutputPages { pages: smallvec![None; nr_pages], doubles: SmallVec::new() }
    }

    /// Place `page` at `pagenr`, failing it immediately if `pagenr` is out of
    /// range or the very same page is already there.
    fn place(&mut self, pagenr: usize, page: Page, key: u64) -> Result<()> {
        match self.pages.get_mut(pagenr) {
            Some(entry @ None) => {
                *entry = Some(page);
                Ok(())
            }
            Some(Some(held)) if !Arc::ptr_eq(held, &page) => {
                trace!(key, pagenr, "output page attached by another reader too");
                self.doubles.push((pagenr, page));
                Ok(())
            }
            _ => {
                page.set_error();
                page.online_endio();
                Err(ZipError::corrupt(0, key, "output page attached twice or out of range"))
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &Page)> {
        let placed = self.pages.iter().enumerate().filter_map(|(i, p)| p.as_ref().map(|p| (i, p)));
        placed.chain(self.doubles.iter().map(|(i, p)| (*i, p)))
    }

    fn complete(self, failed: bool) {
        let doubles = self.doubles.into_iter().map(|(_, p)| p);
        for page in self.pages.into_iter().flatten().chain(doubles) {
            if failed {
                page.set_error();
            }
            page.online_endio();
        }
    }
}

fn unzip(sb: &Superblock, grp: &Workgroup, pool: &mut PagePool) -> Result<()> {
    let mut work = grp.work.lock();
    let nr_pages = work.nr_pages;
    let pageofs = work.pageofs as usize;
    let at_eof = work.at_eof;
    let mut err: Option<ZipError> = None;

    let mut pages = OutputPages::new(nr_pages);
    for (page, ty) in work.pagevec.drain() {
        if pool.gather_if_staging(&page) {
            continue;
        }
        let pagenr = if ty == PageType::Head { 0 } else { page.online_index() };
        if let Err(e) = pages.place(pagenr, page, grp.index) {
            err.get_or_insert(e);
        }
    }

    // Move the compressed pages out; managed ones go back afterwards.
    let compressed: SmallVec<[Option<Page>; CLUSTER_MAX_PAGES]> =
        grp.compressed_pages.iter().map(|slot| slot.take()).collect();
    for (i, entry) in compressed.iter().enumerate() {
        let Some(page) = entry else {
            err.get_or_insert(ZipError::ResourceExhausted("compressed page"));
            trace!(key = grp.index, slot = i, "compressed slot never filled");
            continue;
        };
        if page.is_staging() {
            if page.has_error() {
                err.get_or_insert(io_failed());
            }
        } else if page.is_managed() {
            if !page.is_uptodate() {
                err.get_or_insert(io_failed());
            }
        } else {
            // A file page that doubled as compressed storage.
            if page.has_error() {
                err.get_or_insert(io_failed());
            }
            if let Err(e) = pages.place(page.online_index(), Page::clone(page), grp.index) {
                err.get_or_insert(e);
            }
        }
    }

    if err.is_none() && nr_pages > 0 {
        if let Err(e) = decompress_into(grp, &compressed, &pages, pageofs, at_eof, nr_pages) {
            err = Some(e);
        }
    }

    for (slot, entry) in grp.compressed_pages.iter().zip(compressed) {
        let Some(page) = entry else { continue };
        if page.is_managed() {
            slot.store(page, false);
        } else {
            pool.gather_if_staging(&page);
        }
    }

    pages.complete(err.is_some());

    work.nr_pages = 0;
    // Joiners lock the work before claiming, so the link must reopen while
    // the lock is still held.
    grp.next.store(ChainLink::Nil);
    drop(work);

    match err {
        Some(e) => Err(e),
        None => {
            debug!(key = grp.index, nr_pages, "workgroup decompressed");
            Ok(())
        }
    }
}

fn io_failed() -> ZipError {
    ZipError::Io(std::io::Error::new(std::io::ErrorKind::Other, "compressed block read failed"))
}

fn decompress_into(
    grp: &Workgroup,
    compressed: &[Option<Page>],
    pages: &OutputPages,
    pageofs: usize,
    at_eof: bool,
    nr_pages: usize,
) -> Result<()> {
    let outlen = nr_pages * PAGE_SIZE;
    let llen = (outlen - pageofs).min(grp.llen() as usize);

    let mut src = Vec::new();
    src.try_reserve_exact(compressed.len() * PAGE_SIZE)
        .map_err(|_| ZipError::ResourceExhausted("compressed window"))?;
    for page in compressed.iter().flatten() {
        src.extend_from_slice(&page.read());
    }

    let mut dst = Vec::new();
    dst.try_reserve_exact(outlen)
        .map_err(|_| ZipError::ResourceExhausted("output window"))?;
    dst.resize(outlen, 0u8);

    match grp.format {
        Format::Plain => {
            let n = llen.min(src.len());
            dst[pageofs..pageofs + n].copy_from_slice(&src[..n]);
        }
        Format::Lz4 => {
            let n = Lz4.decompress(&src, &mut dst[pageofs..], llen)?;
            if n < llen {
                trace!(key = grp.index, n, llen, "compressed cluster ran out early");
                return Err(ZipError::corrupt(0, grp.index, "compressed cluster decodes short"));
            }
        }
    }

    // Nothing else owns bytes past EOF.
    let end = if at_eof { outlen } else { pageofs + llen };
    for (i, page) in pages.iter() {
        let from = (i * PAGE_SIZE).max(pageofs);
        let to = ((i + 1) * PAGE_SIZE).min(end);
        if from < to {
            page.copy_in(from - i * PAGE_SIZE, &dst[from..to]);
        }
    }
    Ok(())
}
