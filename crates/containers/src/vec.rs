//! Auto-growing vector.

use core::{
    fmt,
    ops::{Index, IndexMut},
    slice,
};

use allocator::{
    Allocator, MemoryError,
    error::{InvalidGrowthSnafu, OutOfBoundsSnafu, SizeOverflowSnafu, report, report_violation},
};
use snafu::{OptionExt as _, ensure};

use crate::raw::RawBuf;

/// Capacity used when a vector is created with capacity 0.
const MIN_CAPACITY: usize = 2;

fn check_factor(factor: usize) -> Result<(), MemoryError> {
    ensure!(factor >= 2, InvalidGrowthSnafu { factor });
    Ok(())
}

/// A vector that doubles its capacity when full.
///
/// Growth keeps every element in order. On a heap the block is resized
/// through `reallocate`, which may grow it in place; on an arena a larger
/// block is taken and the elements are copied forward. Either way the
/// contents after growth are the same.
///
/// # Examples
///
/// ```
/// use allocator::linear::LinearAllocator;
/// use containers::Vec;
///
/// let scratch = LinearAllocator::init(256).unwrap();
/// let mut v = Vec::<u16, _>::init(&scratch, 0, 1).unwrap();
/// for i in 0..5 {
///     v.push(i).unwrap();
/// }
/// assert_eq!(v.as_slice(), [0, 1, 2, 3, 4]);
/// assert_eq!(v.capacity(), 8);
/// ```
pub struct Vec<T, A>
where
    A: Allocator,
{
    buf: RawBuf<T, A>,
    len: usize,
}

impl<T, A> Vec<T, A>
where
    T: Copy,
    A: Allocator,
{
    /// Allocates room for `capacity` elements from `alloc`.
    ///
    /// A capacity of 0 is raised to two elements. The storage is aligned to
    /// the larger of `alignment` and the natural alignment of `T`, and keeps
    /// that alignment across growth.
    pub fn init(alloc: A, capacity: usize, alignment: usize) -> Result<Self, MemoryError> {
        let capacity = if capacity == 0 { MIN_CAPACITY } else { capacity };
        let buf = RawBuf::allocate(alloc, capacity, alignment)?;
        Ok(Self { buf, len: 0 })
    }

    /// Number of elements pushed and not popped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the current block holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        self.buf.allocator()
    }

    /// Appends `value`, doubling the capacity first if the vector is full.
    ///
    /// On failure the vector is left unchanged.
    pub fn push(&mut self, value: T) -> Result<(), MemoryError> {
        if self.len == self.capacity() {
            self.grow_by(2)?;
        }
        debug_assert!(self.len < self.capacity());
        unsafe { self.buf.slot(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Removes the last element, or returns `None` if the vector is empty.
    pub fn pop(&mut self) -> Option<T> {
        self.len = self.len.checked_sub(1)?;
        Some(unsafe { self.buf.slot(self.len).read() })
    }

    /// Multiplies the capacity by `factor`.
    ///
    /// A vector emptied by `resize(0)` grows to two elements.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidGrowth`] if `factor` is below 2, and
    /// [`MemoryError::SizeOverflow`] if the new capacity does not fit.
    pub fn grow_by(&mut self, factor: usize) -> Result<(), MemoryError> {
        check_factor(factor).inspect_err(report_violation)?;
        let old = self.capacity();
        let capacity = old
            .checked_mul(factor)
            .context(SizeOverflowSnafu {
                count: old,
                element_size: factor,
            })
            .inspect_err(report_violation)?
            .max(MIN_CAPACITY);
        self.buf.resize(capacity, self.len)?;
        tracing::debug!(old, capacity, len = self.len, "vec grown");
        Ok(())
    }

    /// Sets the capacity to exactly `capacity`, dropping elements past it.
    pub fn resize(&mut self, capacity: usize) -> Result<(), MemoryError> {
        let len = self.len.min(capacity);
        self.buf.resize(capacity, len)?;
        self.len = len;
        Ok(())
    }

    /// Fills every unused slot with `value`, leaving the vector full.
    pub fn fill(&mut self, value: T) {
        for index in self.len..self.capacity() {
            unsafe { self.buf.slot(index).write(value) };
        }
        self.len = self.capacity();
    }

    /// Forgets every element, keeping the storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Releases the storage.
    pub fn kill(self) {}

    fn ensure_index(&self, index: usize) -> Result<(), MemoryError> {
        ensure!(index < self.len, OutOfBoundsSnafu { index, len: self.len });
        Ok(())
    }

    /// Element `index`, or [`MemoryError::OutOfBounds`] past the length.
    pub fn get(&self, index: usize) -> Result<&T, MemoryError> {
        self.ensure_index(index).inspect_err(report_violation)?;
        Ok(&self.as_slice()[index])
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut T, MemoryError> {
        self.ensure_index(index).inspect_err(report_violation)?;
        Ok(&mut self.as_mut_slice()[index])
    }

    /// The pushed elements, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        unsafe { self.buf.as_slice(self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { self.buf.as_mut_slice(self.len) }
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T, A> Index<usize> for Vec<T, A>
where
    T: Copy,
    A: Allocator,
{
    type Output = T;

    /// # Panics
    ///
    /// Panics with a violation report if `index` is out of bounds.
    #[track_caller]
    fn index(&self, index: usize) -> &T {
        self.get(index).unwrap_or_else(|err| report(&err))
    }
}

impl<T, A> IndexMut<usize> for Vec<T, A>
where
    T: Copy,
    A: Allocator,
{
    #[track_caller]
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.get_mut(index).unwrap_or_else(|err| report(&err))
    }
}

impl<'a, T, A> IntoIterator for &'a Vec<T, A>
where
    T: Copy,
    A: Allocator,
{
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, A> fmt::Debug for Vec<T, A>
where
    T: Copy + fmt::Debug,
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vec")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("items", &self.as_slice())
            .finish()
    }
}
