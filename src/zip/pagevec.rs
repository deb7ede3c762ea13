//! Per-work page vector.
//!
//! Entries are `(page, type)` pairs.  The first [`INLINE_PAGEVECS`] entries
//! fit inline in the work.  Every further segment of [`PAGEVEC_PER_PAGE`]
//! entries is accounted to a carrier page: the first EXCLUSIVE page enqueued
//! while no carrier is reserved becomes the carrier of the next segment.
//! Without a carrier the last entry of a segment is reserved for an
//! EXCLUSIVE page, so a non-exclusive enqueue there fails with
//! [`ZipError::PagevecFull`] and the caller must enqueue a staging page first.

use smallvec::SmallVec;

use crate::config::{INLINE_PAGEVECS, PAGE_SIZE};
use crate::error::{Result, ZipError};
use crate::page::Page;

pub const PAGEVEC_PER_PAGE: usize = PAGE_SIZE / std::mem::size_of::<usize>();

/// Role of a page in a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Owned solely by this work; may also serve as scratch or carrier.
    Exclusive,
    /// First page of the extent; its leading part belongs to another work.
    Head,
    /// Also referenced by a neighbouring work that may still be running.
    TailShared,
}

pub struct Pagevec {
    entries: SmallVec<[(Page, PageType); INLINE_PAGEVECS]>,
    /// Capacity of the current segment.
    nr: usize,
    /// Next free entry in the current segment.
    index: usize,
    /// Carrier of the next segment, once reserved.
    next: Option<Page>,
}

impl Default for Pagevec {
    fn default() -> Self {
        Self::new()
    }
}

impl Pagevec {
    pub fn new() -> Self {
        Pagevec { entries: SmallVec::new(), nr: INLINE_PAGEVECS, index: 0, next: None }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `page`.  Returns `true` when the page was taken as the carrier
    /// of the next segment.
    pub fn enqueue(&mut self, page: Page, ty: PageType) -> Result<bool> {
        if self.next.is_none() && ty != PageType::Exclusive && self.index + 1 == self.nr {
            return Err(ZipError::PagevecFull);
        }
        if self.index >= self.nr {
            self.page_down();
        }
        let occupied = ty == PageType::Exclusive && self.next.is_none();
        if occupied {
            self.next = Some(Page::clone(&page));
        }
        self.entries.push((page, ty));
        self.index += 1;
        Ok(occupied)
    }

    fn page_down(&mut self) {
        debug_assert!(self.next.is_some(), "pagevec segment full without a carrier");
        self.next = None;
        self.nr = PAGEVEC_PER_PAGE;
        self.index = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Page, PageType)> {
        self.entries.iter()
    }

    /// Move every entry out and reset to the empty state.
    pub fn drain(&mut self) -> SmallVec<[(Page, PageType); INLINE_PAGEVECS]> {
        self.nr = INLINE_PAGEVECS;
        self.index = 0;
        self.next = None;
        std::mem::take(&mut self.entries)
    }
}

impl std::fmt::Debug for Pagevec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pagevec")
            .field("len", &self.entries.len())
            .field("segment", &(self.index, self.nr))
            .field("carrier", &self.next.is_some())
            .finish()
    }
}
