//! General-purpose pooled heap.
//!
//! [`HeapAllocator`] acquires one block from the system allocator at
//! [`init`](HeapAllocator::init) and serves every request from it through a
//! TLSF pool. It never grows: a request the pool cannot satisfy fails with
//! [`MemoryError::ExhaustedPool`].
//!
//! The allocator keeps `allocated`, the sum of the actual block sizes of all
//! live allocations. Blocks are rounded up to 16 bytes, so `allocated` may
//! exceed the sum of requested sizes. [`shutdown`](HeapAllocator::shutdown)
//! treats a non-zero `allocated` as a defect and reports every live block.

use core::{
    cell::{Cell, RefCell},
    fmt,
    ptr::NonNull,
};

use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator, AllocatorKind,
    error::{
        CorruptPoolSnafu, ExhaustedPoolSnafu, ForeignPointerSnafu, InvalidAlignmentSnafu,
        InvalidRegionSizeSnafu, MemoryError, RegionAcquisitionSnafu, UnreleasedMemorySnafu,
        report_violation,
    },
    tlsf::{POOL_SIZE_MAX, POOL_SIZE_MIN, Pool},
};

/// Snapshot of the heap produced by walking the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes requested at `init`.
    pub total_bytes: usize,
    /// Sum of the payload sizes of used blocks.
    pub allocated_bytes: usize,
    /// Sum of the payload sizes of free blocks.
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Largest free block payload.
    ///
    /// Size-class rounding means a request of exactly this size can still
    /// fail.
    pub largest_free_block: usize,
}

/// A pooled heap over one fixed block.
///
/// # Examples
///
/// ```
/// use allocator::{Allocator as _, heap::HeapAllocator};
///
/// let heap = HeapAllocator::init(4096).unwrap();
/// let ptr = heap.allocate(100, 1).unwrap();
/// assert_eq!(heap.allocated(), 112);
///
/// let ptr = unsafe { heap.reallocate(ptr, 400).unwrap() };
/// assert_eq!(heap.allocated(), 400);
///
/// unsafe { heap.deallocate(ptr).unwrap() };
/// heap.shutdown().unwrap();
/// ```
pub struct HeapAllocator {
    pool: RefCell<Pool>,
    limit: usize,
    allocated: Cell<usize>,
    allocation_count: Cell<usize>,
}

impl fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("limit", &self.limit)
            .field("allocated", &self.allocated.get())
            .field("allocation_count", &self.allocation_count.get())
            .finish_non_exhaustive()
    }
}

impl HeapAllocator {
    /// Acquires a block of `size` bytes and builds the pool over it.
    pub fn init(size: usize) -> Result<Self, MemoryError> {
        Self::try_init(size).inspect_err(report_violation)
    }

    fn try_init(size: usize) -> Result<Self, MemoryError> {
        ensure!(
            (POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&size),
            InvalidRegionSizeSnafu {
                size,
                min: POOL_SIZE_MIN,
                max: POOL_SIZE_MAX,
            }
        );
        let pool = Pool::new(size).context(RegionAcquisitionSnafu { size })?;
        tracing::info!(size, "heap allocator created");
        Ok(Self {
            pool: RefCell::new(pool),
            limit: size,
            allocated: Cell::new(0),
            allocation_count: Cell::new(0),
        })
    }

    /// Bytes requested at `init`.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Live bytes: the sum of the actual sizes of all live blocks.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.get()
    }

    /// Actual size of the block granted for `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    #[must_use]
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.pool.borrow().block_size(ptr) }
    }

    /// Walks the pool and summarizes used and free blocks.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let walk = self.pool.borrow().walk();
        HeapStats {
            total_bytes: self.limit,
            allocated_bytes: walk.used_bytes,
            free_bytes: walk.free_bytes,
            used_blocks: walk.used_blocks,
            free_blocks: walk.free_blocks,
            largest_free_block: walk.largest_free,
        }
    }

    /// Checks the pool structure and the live-byte accounting.
    pub fn validate(&self) -> Result<(), MemoryError> {
        self.try_validate().inspect_err(report_violation)
    }

    fn try_validate(&self) -> Result<(), MemoryError> {
        let pool = self.pool.borrow();
        if let Err(reason) = pool.check() {
            return CorruptPoolSnafu { reason }.fail();
        }
        let walk = pool.walk();
        ensure!(
            walk.used_bytes == self.allocated.get(),
            CorruptPoolSnafu {
                reason: "live-byte accounting disagrees with the pool"
            }
        );
        ensure!(
            walk.used_blocks == self.allocation_count.get(),
            CorruptPoolSnafu {
                reason: "allocation count disagrees with the pool"
            }
        );
        Ok(())
    }

    /// Calls `f` with the handle and actual size of every live block.
    pub fn for_each_live(&self, mut f: impl FnMut(NonNull<u8>, usize)) {
        self.pool.borrow().for_each_block(|ptr, size, is_free| {
            if !is_free {
                f(ptr, size);
            }
        });
    }

    /// Tears the heap down, releasing its block.
    ///
    /// Fails with [`MemoryError::UnreleasedMemory`] if any allocation is still
    /// live; each live block is logged first. The block is released either
    /// way.
    pub fn shutdown(self) -> Result<HeapStats, MemoryError> {
        self.try_shutdown().inspect_err(report_violation)
    }

    fn try_shutdown(self) -> Result<HeapStats, MemoryError> {
        let stats = self.stats();
        if stats.allocated_bytes != 0 || self.allocated() != 0 {
            tracing::error!(
                allocated = self.allocated(),
                total = stats.total_bytes,
                live = stats.used_blocks,
                "heap allocator shut down with live allocations"
            );
            self.for_each_live(|ptr, size| {
                tracing::error!(address = ptr.as_ptr().addr(), size, "unreleased block");
            });
            let allocated = self.allocated();
            self.allocated.set(0);
            return UnreleasedMemorySnafu {
                allocated,
                total: stats.total_bytes,
                live: stats.used_blocks,
            }
            .fail();
        }
        tracing::info!(total = stats.total_bytes, "heap allocator shut down, all memory free");
        Ok(stats)
    }

    fn check_live(pool: &Pool, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        ensure!(
            pool.contains(ptr.as_ptr()) && unsafe { pool.is_used(ptr) },
            ForeignPointerSnafu {
                address: ptr.as_ptr().addr()
            }
        );
        Ok(())
    }

    fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        ensure!(align.is_power_of_two(), InvalidAlignmentSnafu { align });
        let mut pool = self.pool.borrow_mut();
        let ptr = pool.malloc(size, align).context(ExhaustedPoolSnafu {
            requested: size,
            allocated: self.allocated.get(),
            limit: self.limit,
        })?;
        let actual = unsafe { pool.block_size(ptr) };
        self.allocated.set(self.allocated.get() + actual);
        self.allocation_count.set(self.allocation_count.get() + 1);
        tracing::trace!(size, align, actual, "heap allocate");
        Ok(ptr)
    }

    unsafe fn try_reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let mut pool = self.pool.borrow_mut();
        Self::check_live(&pool, ptr)?;
        let old = unsafe { pool.block_size(ptr) };
        let moved = unsafe { pool.realloc(ptr, size) }.context(ExhaustedPoolSnafu {
            requested: size,
            allocated: self.allocated.get(),
            limit: self.limit,
        })?;
        let new = unsafe { pool.block_size(moved) };
        self.allocated.set(self.allocated.get() - old + new);
        tracing::trace!(size, old, new, moved = moved != ptr, "heap reallocate");
        Ok(moved)
    }

    unsafe fn try_deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        let mut pool = self.pool.borrow_mut();
        Self::check_live(&pool, ptr)?;
        let actual = unsafe { pool.block_size(ptr) };
        unsafe { pool.free(ptr) };
        self.allocated.set(self.allocated.get() - actual);
        self.allocation_count.set(self.allocation_count.get() - 1);
        tracing::trace!(actual, "heap deallocate");
        Ok(())
    }
}

impl Allocator for HeapAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Heap
    }

    /// Allocates from the pool.
    ///
    /// Alignments up to [`BLOCK_ALIGN`](crate::BLOCK_ALIGN), including `1`,
    /// take the fast path; larger ones reserve room for a leading gap.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        self.try_allocate(size, align).inspect_err(report_violation)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, MemoryError> {
        unsafe { self.try_reallocate(ptr, size) }.inspect_err(report_violation)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        unsafe { self.try_deallocate(ptr) }.inspect_err(report_violation)
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        if self.allocated.get() != 0 {
            tracing::warn!(
                allocated = self.allocated.get(),
                "heap allocator dropped with live allocations"
            );
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use proptest::prelude::*;

    use super::*;

    fn with_test_heap<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&HeapAllocator),
    {
        let heap = HeapAllocator::init(size).unwrap();
        test_fn(&heap);
        heap.validate().unwrap();
        heap.shutdown().unwrap();
    }

    #[test]
    fn test_basic_allocation() {
        with_test_heap(1024, |heap| unsafe {
            let ptr = heap.allocate(64, 1).unwrap();
            assert_eq!(heap.allocated(), 64);
            assert_eq!(heap.allocation_count(), 1);
            heap.deallocate(ptr).unwrap();
            assert_eq!(heap.allocated(), 0);
        });
    }

    #[test]
    fn test_accounting_uses_actual_block_size() {
        with_test_heap(1024, |heap| unsafe {
            let ptr = heap.allocate(1, 1).unwrap();
            assert_eq!(heap.block_size(ptr), 16);
            assert_eq!(heap.allocated(), 16);
            let zero = heap.allocate(0, 1).unwrap();
            assert_eq!(heap.allocated(), 32);
            heap.deallocate(ptr).unwrap();
            heap.deallocate(zero).unwrap();
        });
    }

    #[test]
    fn test_aligned_allocation() {
        with_test_heap(8192, |heap| unsafe {
            let ptr = heap.allocate(64, 256).unwrap();
            assert_eq!(ptr.as_ptr().addr() % 256, 0);
            heap.validate().unwrap();
            heap.deallocate(ptr).unwrap();
        });
    }

    #[test]
    fn test_invalid_alignment() {
        with_test_heap(1024, |heap| {
            let err = heap.allocate(64, 3).unwrap_err();
            assert!(matches!(err, MemoryError::InvalidAlignment { align: 3, .. }));
            assert_eq!(heap.allocated(), 0);
        });
    }

    #[test]
    fn test_exhausted_pool() {
        with_test_heap(256, |heap| {
            let err = heap.allocate(1024, 1).unwrap_err();
            assert!(matches!(
                err,
                MemoryError::ExhaustedPool {
                    requested: 1024,
                    limit: 256,
                    ..
                }
            ));
            assert_eq!(heap.allocated(), 0);
        });
    }

    #[test]
    fn test_reallocate_preserves_content_and_accounting() {
        with_test_heap(4096, |heap| unsafe {
            let ptr = heap.allocate(16, 1).unwrap();
            let blocker = heap.allocate(16, 1).unwrap();
            for i in 0..16 {
                ptr.as_ptr().add(i).write(u8::try_from(i).unwrap());
            }

            let moved = heap.reallocate(ptr, 500).unwrap();
            assert_ne!(moved, ptr);
            for i in 0..16 {
                assert_eq!(moved.as_ptr().add(i).read(), u8::try_from(i).unwrap());
            }
            assert_eq!(heap.allocated(), 512 + 16);
            assert_eq!(heap.allocation_count(), 2);
            heap.validate().unwrap();

            let shrunk = heap.reallocate(moved, 100).unwrap();
            assert_eq!(shrunk, moved);
            assert_eq!(heap.allocated(), 112 + 16);

            heap.deallocate(shrunk).unwrap();
            heap.deallocate(blocker).unwrap();
        });
    }

    #[test]
    fn test_double_free_is_rejected() {
        with_test_heap(1024, |heap| unsafe {
            let ptr = heap.allocate(64, 1).unwrap();
            let keep = heap.allocate(64, 1).unwrap();
            heap.deallocate(ptr).unwrap();
            let err = heap.deallocate(ptr).unwrap_err();
            assert!(matches!(err, MemoryError::ForeignPointer { .. }));
            heap.deallocate(keep).unwrap();
        });
    }

    #[test]
    fn test_foreign_pointer_is_rejected() {
        with_test_heap(1024, |heap| unsafe {
            let mut outside = 0_u64;
            let ptr = NonNull::from(&mut outside).cast::<u8>();
            let err = heap.deallocate(ptr).unwrap_err();
            assert!(matches!(err, MemoryError::ForeignPointer { .. }));
            let err = heap.reallocate(ptr, 32).unwrap_err();
            assert!(matches!(err, MemoryError::ForeignPointer { .. }));
        });
    }

    #[test]
    fn test_init_rejects_tiny_region() {
        let err = HeapAllocator::init(8).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidRegionSize { size: 8, .. }));
    }

    #[test]
    fn test_shutdown_reports_unreleased_memory() {
        let heap = HeapAllocator::init(1024).unwrap();
        let _leak = heap.allocate(100, 1).unwrap();
        let _leak2 = heap.allocate(10, 1).unwrap();
        let err = heap.shutdown().unwrap_err();
        assert!(matches!(
            err,
            MemoryError::UnreleasedMemory {
                allocated: 128,
                total: 1024,
                live: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_shutdown_after_full_release() {
        let heap = HeapAllocator::init(64 * 1024).unwrap();
        let ptrs = (1..=50)
            .map(|i| heap.allocate(i * 13, 1 << (i % 6)).unwrap())
            .collect::<Vec<_>>();
        for ptr in ptrs.into_iter().rev() {
            unsafe { heap.deallocate(ptr).unwrap() };
        }
        let stats = heap.shutdown().unwrap();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn test_stats() {
        with_test_heap(2048, |heap| unsafe {
            let a = heap.allocate(100, 1).unwrap();
            let stats = heap.stats();
            assert_eq!(stats.total_bytes, 2048);
            assert_eq!(stats.allocated_bytes, 112);
            assert_eq!(stats.used_blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.largest_free_block, stats.free_bytes);

            let mut live = Vec::new();
            heap.for_each_live(|ptr, size| live.push((ptr, size)));
            assert_eq!(live, [(a, 112)]);
            heap.deallocate(a).unwrap();
        });
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate { size: usize, align_log2: u32 },
        Reallocate { slot: usize, size: usize },
        Deallocate { slot: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..600_usize, 0..8_u32).prop_map(|(size, align_log2)| Op::Allocate { size, align_log2 }),
            (any::<usize>(), 0..900_usize).prop_map(|(slot, size)| Op::Reallocate { slot, size }),
            any::<usize>().prop_map(|slot| Op::Deallocate { slot }),
        ]
    }

    proptest! {
        #[test]
        fn test_accounting_matches_live_blocks(ops in proptest::collection::vec(op_strategy(), 1..80)) {
            let heap = HeapAllocator::init(16 * 1024).unwrap();
            let mut live: Vec<NonNull<u8>> = Vec::new();
            for op in ops {
                match op {
                    Op::Allocate { size, align_log2 } => {
                        if let Ok(ptr) = heap.allocate(size, 1 << align_log2) {
                            prop_assert_eq!(ptr.as_ptr().addr() % (1 << align_log2), 0);
                            live.push(ptr);
                        }
                    }
                    Op::Reallocate { slot, size } if !live.is_empty() => {
                        let slot = slot % live.len();
                        if let Ok(ptr) = unsafe { heap.reallocate(live[slot], size) } {
                            live[slot] = ptr;
                        }
                    }
                    Op::Deallocate { slot } if !live.is_empty() => {
                        let ptr = live.swap_remove(slot % live.len());
                        unsafe { heap.deallocate(ptr).unwrap() };
                    }
                    Op::Reallocate { .. } | Op::Deallocate { .. } => {}
                }
                let expected: usize = live.iter().map(|&ptr| unsafe { heap.block_size(ptr) }).sum();
                prop_assert_eq!(heap.allocated(), expected);
                prop_assert_eq!(heap.allocation_count(), live.len());
                prop_assert!(heap.validate().is_ok());
            }
            for ptr in live {
                unsafe { heap.deallocate(ptr).unwrap() };
            }
            prop_assert_eq!(heap.allocated(), 0);
            prop_assert!(heap.shutdown().is_ok());
        }
    }
}
