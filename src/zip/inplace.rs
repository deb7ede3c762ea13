//! In-place reuse of exclusive output pages as compressed-data storage.
//!
//! When a request owns a workgroup's scheduling and a page it is about to
//! attach is exclusively its own, the page can double as the read buffer for
//! one physical block instead of a separate staging page.  The compressed
//! data is copied out before any output is written, so a reused page never
//! feeds the decoder bytes it has already overwritten.

use crate::page::Page;
use crate::zip::tagptr::CompressedSlot;
use crate::zip::workgroup::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InplaceStrategy {
    /// Reuse pages for every workgroup format.
    #[default]
    Reuse,
    /// Reuse pages only for compressed workgroups.
    CompressedOnly,
    /// Always read compressed data into dedicated pages.
    Disabled,
}

impl InplaceStrategy {
    pub fn admits(self, format: Format) -> bool {
        match self {
            InplaceStrategy::Reuse => true,
            InplaceStrategy::CompressedOnly => format == Format::Lz4,
            InplaceStrategy::Disabled => false,
        }
    }

    /// Park `page` in the first empty slot at or after `*cursor`, advancing
    /// the cursor past every slot examined.
    pub fn try_reuse(self, format: Format, slots: &[CompressedSlot], cursor: &mut usize, page: &Page) -> bool {
        if !self.admits(format) {
            return false;
        }
        while *cursor < slots.len() {
            let slot = &slots[*cursor];
            *cursor += 1;
            if slot.try_install(Page::clone(page), false).is_ok() {
                return true;
            }
        }
        false
    }
}
