//! Bulk transfer descriptors.
//!
//! A descriptor is owned by the caller for one bulk RPC. It carries the
//! caller's data fragments and, between `get_pages` and `put_pages`, the
//! pool pages used to stage the encrypted or checksummed copy.

use crate::error::{SecError, SecResult};
use crate::page::Page;

/// The active byte range of one caller page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFragment {
    page: Page,
    offset: usize,
    len: usize,
}

impl BulkFragment {
    /// A fragment covering `len` bytes of `page` starting at `offset`.
    pub fn new(page: Page, offset: usize, len: usize) -> SecResult<Self> {
        match offset.checked_add(len) {
            Some(end) if end <= page.len() => Ok(Self { page, offset, len }),
            _ => Err(SecError::InvalidFragment {
                offset,
                len,
                page_size: page.len(),
            }),
        }
    }

    /// A fragment covering the whole page.
    pub fn whole(page: Page) -> Self {
        let len = page.len();
        Self {
            page,
            offset: 0,
            len,
        }
    }

    /// Offset of the active range.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the active range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the active range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The active bytes.
    pub fn data(&self) -> &[u8] {
        &self.page[self.offset..self.offset + self.len]
    }

    /// The active bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.page[self.offset..self.offset + self.len]
    }

    /// The whole backing page.
    pub fn page(&self) -> &Page {
        &self.page
    }
}

/// One bulk transfer's page requirements and the pool pages attached to it.
#[derive(Debug, Default)]
pub struct BulkDesc {
    iov_count: usize,
    fragments: Vec<BulkFragment>,
    enc_pages: Option<Vec<Page>>,
}

impl BulkDesc {
    /// A descriptor that will need `iov_count` pool pages and carries no data yet.
    pub fn new(iov_count: usize) -> Self {
        Self {
            iov_count,
            fragments: Vec::new(),
            enc_pages: None,
        }
    }

    /// A descriptor over `fragments`, needing one pool page per fragment.
    pub fn with_fragments(fragments: Vec<BulkFragment>) -> Self {
        Self {
            iov_count: fragments.len(),
            fragments,
            enc_pages: None,
        }
    }

    /// Number of pool pages this transfer needs.
    pub fn iov_count(&self) -> usize {
        self.iov_count
    }

    /// The caller's data fragments.
    pub fn fragments(&self) -> &[BulkFragment] {
        &self.fragments
    }

    /// The caller's data fragments, mutably.
    pub fn fragments_mut(&mut self) -> &mut [BulkFragment] {
        &mut self.fragments
    }

    /// Returns `true` while pool pages are attached.
    pub fn holds_pages(&self) -> bool {
        self.enc_pages.is_some()
    }

    /// Number of pool pages currently attached.
    pub fn held_pages(&self) -> usize {
        self.enc_pages.as_ref().map_or(0, Vec::len)
    }

    /// The attached pool pages.
    pub fn enc_pages(&self) -> Option<&[Page]> {
        self.enc_pages.as_deref()
    }

    /// The attached pool pages, mutably.
    pub fn enc_pages_mut(&mut self) -> Option<&mut [Page]> {
        self.enc_pages.as_deref_mut()
    }

    pub(crate) fn attach(&mut self, pages: Vec<Page>) {
        debug_assert!(self.enc_pages.is_none());
        self.enc_pages = Some(pages);
    }

    pub(crate) fn detach(&mut self) -> Option<Vec<Page>> {
        self.enc_pages.take()
    }
}
