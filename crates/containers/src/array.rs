//! Fixed-capacity array.

use core::{
    fmt,
    ops::{Index, IndexMut},
    slice,
};

use allocator::{
    Allocator, MemoryError,
    error::{CapacityExceededSnafu, OutOfBoundsSnafu, report, report_violation},
};
use snafu::ensure;

use crate::raw::RawBuf;

/// An array of at most `capacity` elements, allocated once at `init`.
///
/// The array never grows. Pushing past the capacity fails with
/// [`MemoryError::CapacityExceeded`].
///
/// # Examples
///
/// ```
/// use allocator::heap::HeapAllocator;
/// use containers::Array;
///
/// let heap = HeapAllocator::init(4096).unwrap();
/// let mut ids = Array::<u32, _>::init(&heap, 3, 1).unwrap();
/// ids.copy_here(&[1, 2, 3]).unwrap();
/// ids.push(4).unwrap_err();
/// assert_eq!(ids.pop(), Some(3));
/// ```
pub struct Array<T, A>
where
    A: Allocator,
{
    buf: RawBuf<T, A>,
    len: usize,
}

impl<T, A> Array<T, A>
where
    T: Copy,
    A: Allocator,
{
    /// Allocates exactly `capacity` elements from `alloc`.
    ///
    /// The storage is aligned to the larger of `alignment` and the natural
    /// alignment of `T`.
    pub fn init(alloc: A, capacity: usize, alignment: usize) -> Result<Self, MemoryError> {
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

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        self.buf.allocator()
    }

    /// Forgets every element, keeping the storage.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    fn ensure_room(&self, count: usize) -> Result<(), MemoryError> {
        ensure!(
            count <= self.capacity() - self.len,
            CapacityExceededSnafu {
                requested: count,
                used: self.len,
                capacity: self.capacity(),
            }
        );
        Ok(())
    }

    fn ensure_index(&self, index: usize) -> Result<(), MemoryError> {
        ensure!(index < self.len, OutOfBoundsSnafu { index, len: self.len });
        Ok(())
    }

    /// Appends `value`.
    ///
    /// # Errors
    ///
    /// [`MemoryError::CapacityExceeded`] if the array is full.
    pub fn push(&mut self, value: T) -> Result<(), MemoryError> {
        self.ensure_room(1).inspect_err(report_violation)?;
        unsafe { self.buf.slot(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Removes the last element, or returns `None` if the array is empty.
    pub fn pop(&mut self) -> Option<T> {
        self.len = self.len.checked_sub(1)?;
        Some(unsafe { self.buf.slot(self.len).read() })
    }

    /// Exchanges element `index` with the last element.
    pub fn swap_last(&mut self, index: usize) -> Result<(), MemoryError> {
        self.ensure_index(index).inspect_err(report_violation)?;
        let last = self.len - 1;
        self.as_mut_slice().swap(index, last);
        Ok(())
    }

    /// Appends all of `data`.
    ///
    /// Nothing is copied if the remaining capacity is insufficient.
    pub fn copy_here(&mut self, data: &[T]) -> Result<(), MemoryError> {
        self.ensure_room(data.len()).inspect_err(report_violation)?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.buf.slot(self.len), data.len());
        }
        self.len += data.len();
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

    #[must_use]
    /// The pushed elements, in order.
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

impl<T, A> Index<usize> for Array<T, A>
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

impl<T, A> IndexMut<usize> for Array<T, A>
where
    T: Copy,
    A: Allocator,
{
    #[track_caller]
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.get_mut(index).unwrap_or_else(|err| report(&err))
    }
}

impl<'a, T, A> IntoIterator for &'a Array<T, A>
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

impl<T, A> fmt::Debug for Array<T, A>
where
    T: Copy + fmt::Debug,
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
