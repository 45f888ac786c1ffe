//! Memory Management.
//!
//! This module implements physical memory for the kernel. The core
//! abstraction is the [`Page`], which represents a single physical frame.
//!
//! Memory allocation and deallocation is tied to Rust's ownership system: a
//! page is allocated from a [`FrameAllocator`] and lives as long as some
//! [`Page`] handle refers to it. Every mapping in a page table owns one
//! handle, so the number of handles is the number of mappings plus the
//! kernel's own temporary references. Once the last handle is dropped the
//! frame returns to the allocator.
pub mod page_table;

use crate::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
    spinlock::SpinLock,
};
use std::sync::Arc;

struct FrameState {
    next: usize,
    free: Vec<usize>,
    in_use: usize,
}

/// A bounded allocator of physical frames.
///
/// Frame numbers start at 1, so no page ever lives at [`Pa::ZERO`]. Freed
/// frames are recycled before new ones are carved out.
pub struct FrameAllocator {
    state: SpinLock<FrameState>,
    limit: usize,
}

impl FrameAllocator {
    /// Creates an allocator that hands out at most `limit` frames at a time.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(FrameState {
                next: 1,
                free: Vec::new(),
                in_use: 0,
            }),
            limit,
        })
    }

    /// Allocate a new zero-filled page.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] when the limit is reached.
    pub fn alloc(self: &Arc<Self>) -> Result<Page, KernelError> {
        let mut state = self.state.lock();
        if state.in_use >= self.limit {
            state.unlock();
            return Err(KernelError::NoMemory);
        }
        let frame = match state.free.pop() {
            Some(frame) => frame,
            None => {
                state.next += 1;
                state.next - 1
            }
        };
        state.in_use += 1;
        state.unlock();

        Ok(Page {
            inner: Arc::new(PageInner {
                pa: Pa::new(frame << PAGE_SHIFT).ok_or(KernelError::NoMemory)?,
                data: SpinLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
                allocator: self.clone(),
            }),
        })
    }

    /// Number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        let in_use = state.in_use;
        state.unlock();
        in_use
    }

    fn release(&self, frame: usize) {
        let mut state = self.state.lock();
        state.free.push(frame);
        state.in_use -= 1;
        state.unlock();
    }
}

struct PageInner {
    pa: Pa,
    data: SpinLock<Box<[u8]>>,
    allocator: Arc<FrameAllocator>,
}

impl Drop for PageInner {
    fn drop(&mut self) {
        self.allocator.release(self.pa.frame());
    }
}

/// A representation of a memory page.
///
/// The [`Page`] struct encapsulates a single memory page, providing methods to
/// access and manipulate the underlying page's contents.
///
/// This page internally holds the reference counts. This counter increases on a
/// calling of [`Page::clone`], and decreases when the page instance is dropped.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

impl Page {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.inner.pa
    }

    /// Number of live handles of this page.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    /// Panics if the range crosses the end of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.inner.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        data.unlock();
    }

    /// Copies `buf` into the page starting at `offset`.
    ///
    /// # Panics
    /// Panics if the range crosses the end of the page.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.inner.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
        data.unlock();
    }

    /// Returns `true` if both handles refer to the same frame.
    pub fn ptr_eq(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("pa", &self.pa())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
