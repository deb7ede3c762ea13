//! Per-request pool of recyclable pages.
//!
//! Staging pages (temporary homes for compressed data, pagevec carriers) are
//! drawn from a [`PagePool`] first and only then from the allocator.  When a
//! request finishes with them they are gathered back into the pool, so a
//! batch read touches the allocator once per concurrently live staging page
//! rather than once per use.  A pool may also cap how many pages it draws
//! from the allocator, for callers running under a memory budget.

use crate::error::{Result, ZipError};
use crate::page::{Mapping, Page, PageFrame};

#[derive(Default)]
pub struct PagePool {
    pages: Vec<Page>,
    /// Fresh allocations left, if capped.
    budget: Option<usize>,
}

impl PagePool {
    pub fn new() -> Self {
        PagePool { pages: Vec::new(), budget: None }
    }

    /// A pool that allocates at most `budget` fresh pages over its lifetime.
    pub fn with_alloc_budget(budget: usize) -> Self {
        PagePool { pages: Vec::new(), budget: Some(budget) }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Return `page` to the pool for reuse.
    pub fn put(&mut self, page: Page) {
        self.pages.push(page);
    }

    /// Take a reinitialised page from the pool, or allocate a fresh one.
    pub fn alloc(&mut self) -> Result<Page> {
        match self.pages.pop() {
            Some(page) => {
                page.reinit();
                Ok(page)
            }
            None => {
                if let Some(left) = &mut self.budget {
                    if *left == 0 {
                        return Err(ZipError::ResourceExhausted("page"));
                    }
                    *left -= 1;
                }
                PageFrame::alloc()
            }
        }
    }

    /// A page tagged as staging, i.e. owned by the current request only.
    pub fn alloc_staging(&mut self) -> Result<Page> {
        let page = self.alloc()?;
        page.set_mapping(Mapping::Staging);
        Ok(page)
    }

    /// If `page` is a staging page, move it into the pool and return `true`.
    pub fn gather_if_staging(&mut self, page: &Page) -> bool {
        if !page.is_staging() {
            return false;
        }
        self.pages.push(Page::clone(page));
        true
    }

    /// Release every pooled page back to the allocator.
    pub fn drain(&mut self) {
        self.pages.clear();
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool").field("pages", &self.pages.len()).finish()
    }
}
