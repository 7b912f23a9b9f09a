//! NUL-terminated byte strings and non-owning views into them.
//!
//! A [`StringBuffer`] of capacity `cap` owns `cap + 1` bytes; the extra byte
//! holds the terminator. After every mutating operation the byte at `len` is
//! `0`, so [`StringBuffer::c_str`] never has to copy.

use core::{ffi::CStr, fmt, str::Utf8Error};

use allocator::{
    Allocator, MemoryError,
    error::{InvalidRangeSnafu, OutOfBoundsSnafu, SizeOverflowSnafu, report_violation},
};
use bstr::BStr;
use snafu::{OptionExt as _, ensure};

use crate::raw::RawBuf;

/// Length of `text` up to its first NUL byte, or all of it.
fn measure(text: &[u8]) -> usize {
    text.iter().position(|&b| b == 0).unwrap_or(text.len())
}

/// A growable, NUL-terminated byte string bound to one allocator.
///
/// # Examples
///
/// ```
/// use allocator::heap::HeapAllocator;
/// use containers::StringBuffer;
///
/// let heap = HeapAllocator::init(4096).unwrap();
/// let mut s = StringBuffer::init(&heap, 5).unwrap();
/// s.copy_here(b"hello", 5).unwrap();
/// s.push(b" world").unwrap();
/// assert_eq!(s.as_bytes_with_nul(), b"hello world\0");
/// assert_eq!(s.view(1, 3).unwrap().as_bytes(), b"el");
/// ```
pub struct StringBuffer<A>
where
    A: Allocator,
{
    buf: RawBuf<u8, A>,
    len: usize,
}

impl<A> StringBuffer<A>
where
    A: Allocator,
{
    /// Allocates room for `size` bytes plus the terminator.
    pub fn init(alloc: A, size: usize) -> Result<Self, MemoryError> {
        let bytes = size
            .checked_add(1)
            .context(SizeOverflowSnafu {
                count: size,
                element_size: 1_usize,
            })
            .inspect_err(report_violation)?;
        let buf = RawBuf::allocate(alloc, bytes, 1)?;
        let mut this = Self { buf, len: 0 };
        this.terminate();
        Ok(this)
    }

    /// Allocates a buffer holding exactly `text`, measured up to its first
    /// NUL.
    pub fn with_text(alloc: A, text: &[u8]) -> Result<Self, MemoryError> {
        let text = &text[..measure(text)];
        let mut this = Self::init(alloc, text.len())?;
        this.assign(text)?;
        Ok(this)
    }

    /// Length in bytes, terminator excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable capacity in bytes, terminator excluded.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity() - 1
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        self.buf.allocator()
    }

    fn terminate(&mut self) {
        unsafe { self.buf.slot(self.len).write(0) };
    }

    /// Overwrites the content with the first `size` bytes of `text`.
    ///
    /// A `size` of 0 takes `text` up to its first NUL. The previous content
    /// is replaced, so the deficit is measured against the full capacity
    /// rather than the room left after `len`; the buffer grows by exactly
    /// that deficit.
    ///
    /// # Errors
    ///
    /// [`MemoryError::OutOfBounds`] if `size` exceeds `text`.
    pub fn copy_here(&mut self, text: &[u8], size: usize) -> Result<(), MemoryError> {
        let size = if size == 0 { measure(text) } else { size };
        let text = text
            .get(..size)
            .context(OutOfBoundsSnafu {
                index: size,
                len: text.len(),
            })
            .inspect_err(report_violation)?;
        self.assign(text)
    }

    /// Overwrites the content with `text`, growing like
    /// [`copy_here`](Self::copy_here).
    pub fn copy_str(&mut self, text: &str) -> Result<(), MemoryError> {
        self.assign(text.as_bytes())
    }

    fn assign(&mut self, text: &[u8]) -> Result<(), MemoryError> {
        if text.len() > self.capacity() {
            self.grow(text.len() - self.capacity())?;
        }
        unsafe { core::ptr::copy_nonoverlapping(text.as_ptr(), self.buf.as_ptr(), text.len()) };
        self.len = text.len();
        self.terminate();
        Ok(())
    }

    /// Appends `text` up to its first NUL, growing by exactly the deficit if
    /// needed.
    pub fn push(&mut self, text: &[u8]) -> Result<(), MemoryError> {
        self.append(&text[..measure(text)])
    }

    /// Appends all of `text`.
    pub fn push_str(&mut self, text: &str) -> Result<(), MemoryError> {
        self.append(text.as_bytes())
    }

    fn append(&mut self, text: &[u8]) -> Result<(), MemoryError> {
        let room = self.capacity() - self.len;
        if text.len() > room {
            self.grow(text.len() - room)?;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(text.as_ptr(), self.buf.slot(self.len), text.len());
        }
        self.len += text.len();
        self.terminate();
        Ok(())
    }

    /// Increases the capacity by `extra` bytes.
    ///
    /// A heap-bound buffer is resized through `reallocate`; an arena-bound one
    /// is copied into a fresh, larger block.
    pub fn grow(&mut self, extra: usize) -> Result<(), MemoryError> {
        let old = self.capacity();
        let bytes = self
            .buf
            .capacity()
            .checked_add(extra)
            .context(SizeOverflowSnafu {
                count: extra,
                element_size: 1_usize,
            })
            .inspect_err(report_violation)?;
        self.buf.resize(bytes, self.len + 1)?;
        tracing::debug!(old, capacity = self.capacity(), "string buffer grown");
        Ok(())
    }

    /// Empties the buffer, keeping its capacity.
    pub fn clear(&mut self) {
        self.len = 0;
        self.terminate();
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { self.buf.as_slice(self.len) }
    }

    /// Content followed by the terminator.
    #[must_use]
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        unsafe { self.buf.as_slice(self.len + 1) }
    }

    /// The content as UTF-8, or the decoding error.
    pub fn as_str(&self) -> Result<&str, Utf8Error> {
        core::str::from_utf8(self.as_bytes())
    }

    /// The content as a C string, cut at the first NUL if the content holds
    /// one.
    #[must_use]
    pub fn c_str(&self) -> &CStr {
        CStr::from_bytes_until_nul(self.as_bytes_with_nul()).unwrap_or_default()
    }

    /// A window over `start..end` that borrows the buffer.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidRange`] if `start > end`, and
    /// [`MemoryError::OutOfBounds`] if `end` is past the length.
    pub fn view(&self, start: usize, end: usize) -> Result<StringView<'_>, MemoryError> {
        self.check_range(start, end).inspect_err(report_violation)?;
        Ok(StringView {
            bytes: self.as_bytes(),
            start,
            end,
        })
    }

    fn check_range(&self, start: usize, end: usize) -> Result<(), MemoryError> {
        ensure!(start <= end, InvalidRangeSnafu { start, end });
        ensure!(end <= self.len, OutOfBoundsSnafu { index: end, len: self.len });
        Ok(())
    }

    /// Releases the storage.
    ///
    /// For an arena-bound buffer this is a no-op; the arena reclaims it.
    pub fn kill(self) {}
}

impl<A> fmt::Write for StringBuffer<A>
where
    A: Allocator,
{
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s).or(Err(fmt::Error))
    }
}

impl<A> fmt::Display for StringBuffer<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(BStr::new(self.as_bytes()), f)
    }
}

impl<A> fmt::Debug for StringBuffer<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(BStr::new(self.as_bytes()), f)
    }
}

/// A non-owning window into a [`StringBuffer`].
///
/// Offsets are relative to the start of the buffer. The view is not
/// NUL-terminated.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StringView<'s> {
    bytes: &'s [u8],
    start: usize,
    end: usize,
}

impl<'s> StringView<'s> {
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn as_bytes(&self) -> &'s [u8] {
        &self.bytes[self.start..self.end]
    }

    pub fn as_str(&self) -> Result<&'s str, Utf8Error> {
        core::str::from_utf8(self.as_bytes())
    }

    /// Overwrites `target` with the viewed bytes.
    pub fn copy_to<A>(&self, target: &mut StringBuffer<A>) -> Result<(), MemoryError>
    where
        A: Allocator,
    {
        target.assign(self.as_bytes())
    }
}

impl fmt::Display for StringView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(BStr::new(self.as_bytes()), f)
    }
}

impl fmt::Debug for StringView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringView")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("bytes", &BStr::new(self.as_bytes()))
            .finish()
    }
}
