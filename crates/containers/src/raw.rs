use core::{
    mem,
    ptr::{self, NonNull},
};

use allocator::{
    Allocator, BLOCK_ALIGN, MemoryError,
    error::{SizeOverflowSnafu, report_violation},
};
use snafu::OptionExt as _;

/// Storage for `cap` elements of `T` obtained from, and returned to, `alloc`.
///
/// The buffer never reads or drops its elements; the containers on top track
/// which prefix is initialized.
pub(crate) struct RawBuf<T, A>
where
    A: Allocator,
{
    ptr: NonNull<T>,
    cap: usize,
    align: usize,
    alloc: A,
}

impl<T, A> RawBuf<T, A>
where
    A: Allocator,
{
    /// Allocates room for `cap` elements aligned to at least `align`.
    pub(crate) fn allocate(alloc: A, cap: usize, align: usize) -> Result<Self, MemoryError> {
        let align = align.max(align_of::<T>());
        let ptr = Self::acquire(&alloc, cap, align)?;
        Ok(Self {
            ptr,
            cap,
            align,
            alloc,
        })
    }

    fn byte_size(cap: usize) -> Result<usize, MemoryError> {
        cap.checked_mul(size_of::<T>())
            .context(SizeOverflowSnafu {
                count: cap,
                element_size: size_of::<T>(),
            })
            .inspect_err(report_violation)
    }

    fn acquire(alloc: &A, cap: usize, align: usize) -> Result<NonNull<T>, MemoryError> {
        let size = Self::byte_size(cap)?;
        Ok(alloc.allocate(size, align)?.cast())
    }

    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Moves the first `len` elements into a fresh block of `cap` elements
    /// and releases the old block.
    pub(crate) fn relocate(&mut self, cap: usize, len: usize) -> Result<(), MemoryError> {
        debug_assert!(len <= cap && len <= self.cap);
        let ptr = Self::acquire(&self.alloc, cap, self.align)?;
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), ptr.as_ptr(), len) };
        let old = mem::replace(&mut self.ptr, ptr);
        self.cap = cap;
        unsafe { self.alloc.deallocate(old.cast()) }
    }

    /// Changes the capacity to `cap`, keeping the first `len` elements.
    ///
    /// Heap blocks are resized through `reallocate`, which may grow in place.
    /// Arena blocks, and heap blocks whose alignment `reallocate` would not
    /// preserve, are relocated.
    pub(crate) fn resize(&mut self, cap: usize, len: usize) -> Result<(), MemoryError> {
        if !self.alloc.kind().is_heap() || self.align > BLOCK_ALIGN {
            return self.relocate(cap, len);
        }
        let size = Self::byte_size(cap)?;
        let ptr = unsafe { self.alloc.reallocate(self.ptr.cast(), size)? };
        self.ptr = ptr.cast();
        self.cap = cap;
        Ok(())
    }

    /// Pointer to slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must be at most the capacity.
    pub(crate) unsafe fn slot(&self, index: usize) -> *mut T {
        debug_assert!(index <= self.cap);
        unsafe { self.ptr.as_ptr().add(index) }
    }

    /// # Safety
    ///
    /// The first `len` slots must be initialized.
    pub(crate) unsafe fn as_slice(&self, len: usize) -> &[T] {
        debug_assert!(len <= self.cap);
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// # Safety
    ///
    /// The first `len` slots must be initialized.
    pub(crate) unsafe fn as_mut_slice(&mut self, len: usize) -> &mut [T] {
        debug_assert!(len <= self.cap);
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }
}

impl<T, A> Drop for RawBuf<T, A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        // Failures were already reported by the allocator.
        let _ = unsafe { self.alloc.deallocate(self.ptr.cast()) };
    }
}
