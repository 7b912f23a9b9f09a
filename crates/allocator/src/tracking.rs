//! Allocation-tracking decorator.
//!
//! [`Tracking`] wraps any [`Allocator`] and records every live handle so that
//! leaks can be attributed at shutdown. Release is O(live allocations), which
//! is only acceptable in diagnostic builds.

use alloc::vec::Vec;
use core::{cell::RefCell, ptr::NonNull};

use crate::{
    Allocator, AllocatorKind, MemoryError,
    error::{CorruptPoolSnafu, report_violation},
    heap::{HeapAllocator, HeapStats},
};

/// An allocator that remembers every handle it has handed out.
#[derive(Debug)]
pub struct Tracking<A> {
    inner: A,
    live: RefCell<Vec<NonNull<u8>>>,
}

impl<A> Tracking<A> {
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            live: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> A {
        self.inner
    }

    /// Number of handles allocated and not yet released.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    /// Handles allocated and not yet released, oldest first unless some were
    /// released out of order.
    #[must_use]
    pub fn live_allocations(&self) -> Vec<NonNull<u8>> {
        self.live.borrow().clone()
    }

    fn forget(&self, ptr: NonNull<u8>) {
        let mut live = self.live.borrow_mut();
        if let Some(index) = live.iter().position(|&p| p == ptr) {
            live.swap_remove(index);
        }
    }
}

impl Tracking<HeapAllocator> {
    /// Creates a tracked heap of `size` bytes.
    pub fn init(size: usize) -> Result<Self, MemoryError> {
        HeapAllocator::init(size).map(Self::new)
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.stats()
    }

    /// Checks the pool and that every recorded handle is a live block.
    pub fn validate(&self) -> Result<(), MemoryError> {
        self.inner.validate()?;
        if self.live_count() != self.inner.allocation_count() {
            return CorruptPoolSnafu {
                reason: "tracked handles disagree with the pool",
            }
            .fail()
            .inspect_err(report_violation);
        }
        Ok(())
    }

    /// Logs every leaked handle, then runs the heap's own leak check.
    pub fn shutdown(self) -> Result<HeapStats, MemoryError> {
        for &ptr in self.live.borrow().iter() {
            let size = unsafe { self.inner.block_size(ptr) };
            tracing::error!(address = ptr.as_ptr().addr(), size, "leaked allocation");
        }
        self.inner.shutdown()
    }
}

impl<A> Allocator for Tracking<A>
where
    A: Allocator,
{
    fn kind(&self) -> AllocatorKind {
        self.inner.kind()
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = self.inner.allocate(size, align)?;
        self.live.borrow_mut().push(ptr);
        Ok(ptr)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let moved = unsafe { self.inner.reallocate(ptr, size)? };
        if moved != ptr {
            self.forget(ptr);
            self.live.borrow_mut().push(moved);
        }
        Ok(moved)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        unsafe { self.inner.deallocate(ptr)? };
        self.forget(ptr);
        Ok(())
    }
}
