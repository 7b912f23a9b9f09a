//! Allocation strategies for the Sol memory subsystem.
//!
//! This crate provides the two allocators every other component obtains its
//! memory from, plus the capability they share:
//!
//! # Available Allocators
//!
//! ## [`HeapAllocator`](heap::HeapAllocator)
//!
//! A general-purpose allocator over one fixed block acquired from the system
//! allocator. Free blocks are kept in segregated free lists indexed by a
//! two-level size class (TLSF), so allocation and release are O(1) with
//! bounded fragmentation. Best suited for:
//!
//! - Long-lived objects that are freed individually
//! - Storage that needs to be resized in place
//!
//! The heap keeps an exact count of live bytes and refuses to shut down
//! cleanly while any allocation is still outstanding.
//!
//! ## [`LinearAllocator`](linear::LinearAllocator)
//!
//! A bump-pointer arena over one fixed buffer. Best suited for:
//!
//! - Scratch data with a clear scope (a frame, a parse pass)
//! - Many small allocations that die together
//!
//! Individual frees are no-ops; memory comes back in bulk through
//! [`free`](linear::LinearAllocator::free) or in LIFO order through
//! [`cut`](linear::LinearAllocator::cut).
//!
//! # Usage Examples
//!
//! ```rust
//! use allocator::{Allocator as _, heap::HeapAllocator, linear::LinearAllocator};
//!
//! let heap = HeapAllocator::init(64 * 1024).unwrap();
//! let ptr = heap.allocate(128, 1).unwrap();
//! assert!(heap.allocated() >= 128);
//! unsafe { heap.deallocate(ptr).unwrap() };
//! heap.shutdown().unwrap();
//!
//! let scratch = LinearAllocator::init(1024).unwrap();
//! let _a = scratch.allocate(40, 8).unwrap();
//! assert_eq!(scratch.used(), 40);
//! ```
//!
//! # Thread Safety
//!
//! The allocators are `Send` but not `Sync`. All bookkeeping lives in
//! `Cell`/`RefCell`, so one instance can be shared by reference between many
//! containers on the same thread, while sharing across threads requires
//! external synchronization.
//!
//! # Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Overhead | Best Use Case |
//! |-----------|------------|--------------|----------|---------------|
//! | `HeapAllocator` | O(1) | O(1) | 16 bytes/block | Individually freed objects |
//! | `LinearAllocator` | O(1) | no-op | alignment padding | Scratch memory |

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use core::ptr::NonNull;

use derive_more::{Display, IsVariant};

pub use self::error::MemoryError;
use self::linear::LinearAllocator;

pub mod error;
pub mod heap;
pub mod linear;
mod tlsf;
pub mod tracking;

/// Alignment every heap block satisfies without extra padding.
///
/// Requests aligned to at most this value take the heap's fast path, and
/// [`Allocator::reallocate`] only preserves alignments up to this value.
pub const BLOCK_ALIGN: usize = tlsf::ALIGN_SIZE;

/// Which allocation strategy backs an [`Allocator`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IsVariant)]
pub enum AllocatorKind {
    /// Pooled heap: individual frees and in-place resizing.
    #[display("heap")]
    Heap,
    /// Arena: bump allocation, bulk reclamation only.
    #[display("linear")]
    Linear,
}

/// The capability shared by every allocation strategy.
///
/// Methods take `&self` so several containers can be bound to one allocator
/// at the same time. Handles are raw [`NonNull<u8>`] pointers; the containers
/// crate wraps them in owned buffers.
pub trait Allocator {
    /// Strategy backing this allocator.
    fn kind(&self) -> AllocatorKind;

    /// Allocates at least `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two; `1` means no special alignment.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Resizes the allocation at `ptr` to at least `size` bytes.
    ///
    /// Content up to the smaller of the old and new sizes is preserved. The
    /// returned handle may differ from `ptr`, in which case `ptr` is no longer
    /// valid. Alignment beyond [`BLOCK_ALIGN`] is not preserved.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation obtained from this allocator.
    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Releases the allocation at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation obtained from this allocator and must
    /// not be used afterwards. Releasing it twice is undefined behavior.
    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError>;
}

impl<A> Allocator for &A
where
    A: Allocator + ?Sized,
{
    fn kind(&self) -> AllocatorKind {
        (**self).kind()
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        (**self).allocate(size, align)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        unsafe { (**self).reallocate(ptr, size) }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        unsafe { (**self).deallocate(ptr) }
    }
}

/// A borrowed allocator chosen once from the closed set of strategies.
///
/// `H` is the heap flavor, either a plain
/// [`HeapAllocator`](heap::HeapAllocator) or a
/// [`Tracking`](tracking::Tracking) decorated one.
#[derive(Debug)]
pub enum AllocatorRef<'a, H: ?Sized = heap::HeapAllocator> {
    Heap(&'a H),
    Linear(&'a LinearAllocator),
}

impl<H: ?Sized> Clone for AllocatorRef<'_, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: ?Sized> Copy for AllocatorRef<'_, H> {}

impl<'a, H: ?Sized> From<&'a LinearAllocator> for AllocatorRef<'a, H> {
    fn from(linear: &'a LinearAllocator) -> Self {
        Self::Linear(linear)
    }
}

impl<H> Allocator for AllocatorRef<'_, H>
where
    H: Allocator + ?Sized,
{
    fn kind(&self) -> AllocatorKind {
        match self {
            Self::Heap(heap) => heap.kind(),
            Self::Linear(linear) => linear.kind(),
        }
    }

    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        match self {
            Self::Heap(heap) => heap.allocate(size, align),
            Self::Linear(linear) => linear.allocate(size, align),
        }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        unsafe {
            match self {
                Self::Heap(heap) => heap.reallocate(ptr, size),
                Self::Linear(linear) => linear.reallocate(ptr, size),
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        unsafe {
            match self {
                Self::Heap(heap) => heap.deallocate(ptr),
                Self::Linear(linear) => linear.deallocate(ptr),
            }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapAllocator;

    #[test]
    fn test_allocator_ref_dispatch() {
        let heap = HeapAllocator::init(4096).unwrap();
        let scratch = LinearAllocator::init(256).unwrap();

        let to_heap: AllocatorRef<'_> = AllocatorRef::Heap(&heap);
        let to_scratch: AllocatorRef<'_> = AllocatorRef::from(&scratch);
        assert!(to_heap.kind().is_heap());
        assert!(to_scratch.kind().is_linear());

        let ptr = to_heap.allocate(32, 1).unwrap();
        assert!(heap.allocated() >= 32);
        unsafe { to_heap.deallocate(ptr).unwrap() };
        assert_eq!(heap.allocated(), 0);

        let _ = to_scratch.allocate(32, 1).unwrap();
        assert_eq!(scratch.used(), 32);

        heap.shutdown().unwrap();
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(AllocatorKind::Heap.to_string(), "heap");
        assert_eq!(AllocatorKind::Linear.to_string(), "linear");
    }
}
