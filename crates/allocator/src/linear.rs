//! Bump-pointer arena.
//!
//! [`LinearAllocator`] hands out memory by advancing a cursor through one
//! fixed buffer. Individual allocations are never released; the arena is
//! reclaimed in bulk with [`free`](LinearAllocator::free) or rolled back in
//! LIFO order with [`cut`](LinearAllocator::cut).
//!
//! `free` and `cut` take `&mut self`, so every container bound to the arena
//! must be gone before the cursor can move backwards.

use alloc::alloc::{alloc, dealloc};
use core::{alloc::Layout, cell::Cell, fmt, ptr::NonNull};

use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator, AllocatorKind,
    error::{
        CapacityExceededSnafu, CutUnderflowSnafu, InvalidAlignmentSnafu, InvalidRegionSizeSnafu,
        MemoryError, RegionAcquisitionSnafu, UnsupportedSnafu, report_violation,
    },
};

/// Alignment of the arena's base address.
const BASE_ALIGN: usize = 16;

/// A fixed-size bump allocator.
///
/// # Examples
///
/// ```
/// use allocator::{Allocator as _, linear::LinearAllocator};
///
/// let mut scratch = LinearAllocator::init(64).unwrap();
/// scratch.allocate(40, 1).unwrap();
/// scratch.allocate(40, 1).unwrap_err();
///
/// scratch.cut(40).unwrap();
/// assert_eq!(scratch.used(), 0);
/// scratch.kill();
/// ```
pub struct LinearAllocator {
    mem: NonNull<u8>,
    layout: Layout,
    alloced: Cell<usize>,
    high_water: Cell<usize>,
}

// The arena exclusively owns its buffer.
unsafe impl Send for LinearAllocator {}

impl fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("high_water", &self.high_water())
            .finish_non_exhaustive()
    }
}

impl LinearAllocator {
    /// Acquires a buffer of `size` bytes with the cursor at 0.
    pub fn init(size: usize) -> Result<Self, MemoryError> {
        Self::try_init(size).inspect_err(report_violation)
    }

    fn try_init(size: usize) -> Result<Self, MemoryError> {
        let max = isize::MAX.unsigned_abs() - (BASE_ALIGN - 1);
        ensure!(
            (1..=max).contains(&size),
            InvalidRegionSizeSnafu { size, min: 1_usize, max }
        );
        let layout = Layout::from_size_align(size, BASE_ALIGN)
            .ok()
            .context(InvalidRegionSizeSnafu { size, min: 1_usize, max })?;
        let mem = NonNull::new(unsafe { alloc(layout) }).context(RegionAcquisitionSnafu { size })?;
        tracing::info!(size, "linear allocator created");
        Ok(Self {
            mem,
            layout,
            alloced: Cell::new(0),
            high_water: Cell::new(0),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Current cursor position in bytes, padding included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.alloced.get()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Highest cursor position reached since `init`.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.get()
    }

    /// Rolls the cursor back by exactly `amount` bytes.
    ///
    /// The caller is responsible for `amount` matching the most recent
    /// allocations, padding included.
    pub fn cut(&mut self, amount: usize) -> Result<(), MemoryError> {
        let used = self.used();
        let rest = used
            .checked_sub(amount)
            .context(CutUnderflowSnafu { amount, used })
            .inspect_err(report_violation)?;
        self.alloced.set(rest);
        tracing::debug!(amount, used = rest, "linear allocator cut");
        Ok(())
    }

    /// Resets the cursor to 0.
    ///
    /// The buffer is kept and its content is not cleared.
    pub fn free(&mut self) {
        tracing::debug!(used = self.used(), "linear allocator reset");
        self.alloced.set(0);
    }

    /// Releases the buffer.
    pub fn kill(self) {
        tracing::info!(
            capacity = self.capacity(),
            high_water = self.high_water(),
            "linear allocator released"
        );
    }

    fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        ensure!(align.is_power_of_two(), InvalidAlignmentSnafu { align });
        let used = self.used();
        let capacity = self.capacity();
        let cursor = self.mem.as_ptr().addr() + used;
        let pad = cursor.next_multiple_of(align) - cursor;
        let end = used
            .checked_add(pad)
            .and_then(|n| n.checked_add(size))
            .filter(|&end| end <= capacity)
            .context(CapacityExceededSnafu {
                requested: size,
                used,
                capacity,
            })?;
        self.alloced.set(end);
        self.high_water.set(self.high_water.get().max(end));
        tracing::trace!(size, align, pad, used = end, "linear allocate");
        Ok(unsafe { self.mem.add(used + pad) })
    }
}

impl Allocator for LinearAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Linear
    }

    /// Bumps the cursor by `size` plus the padding that aligns the returned
    /// address to `align`.
    ///
    /// On failure the cursor is left untouched.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        self.try_allocate(size, align).inspect_err(report_violation)
    }

    /// Arena allocations cannot be resized.
    unsafe fn reallocate(&self, _ptr: NonNull<u8>, _size: usize) -> Result<NonNull<u8>, MemoryError> {
        UnsupportedSnafu {
            operation: "reallocate",
            kind: AllocatorKind::Linear,
        }
        .fail()
        .inspect_err(report_violation)
    }

    /// No-op: the arena is only reclaimed in bulk.
    unsafe fn deallocate(&self, _ptr: NonNull<u8>) -> Result<(), MemoryError> {
        Ok(())
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.mem.as_ptr(), self.layout) };
    }
}
