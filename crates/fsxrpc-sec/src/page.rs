//! Fixed-size pages and the allocator the pool grows from.

use std::ops::{Deref, DerefMut};

/// One fixed-size, heap-backed page.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// A zero-filled page of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Fallible variant of [`Page::zeroed`].
    pub fn try_zeroed(size: usize) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).ok()?;
        data.resize(size, 0);
        Some(Self {
            data: data.into_boxed_slice(),
        })
    }

    /// Page size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for a zero-sized page.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The page contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The page contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl From<Vec<u8>> for Page {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("len", &self.data.len()).finish()
    }
}

/// Source of backing pages for pool growth.
///
/// Returning `None` makes the whole grow attempt roll back.
pub trait PageAllocator: Send + Sync {
    /// Allocates one page of `page_size` bytes.
    fn alloc_page(&self, page_size: usize) -> Option<Page>;
}

/// Allocates pages from the process heap without aborting on exhaustion.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPageAllocator;

impl PageAllocator for HeapPageAllocator {
    fn alloc_page(&self, page_size: usize) -> Option<Page> {
        Page::try_zeroed(page_size)
    }
}
