//! Growable containers bound to an [`Allocator`](allocator::Allocator).
//!
//! Every container takes its allocator by value at construction: a shared
//! reference such as `&HeapAllocator` or an
//! [`AllocatorRef`](allocator::AllocatorRef). The borrow ties the container's
//! lifetime to the allocator's, and the storage is returned to the allocator
//! when the container is dropped. Returning storage to an arena is a no-op.
//!
//! | Container | Growth | Element type |
//! |-----------|--------|--------------|
//! | [`Array`] | never; overflow is [`CapacityExceeded`](allocator::MemoryError::CapacityExceeded) | `T: Copy` |
//! | [`Vec`] | doubling, or by an explicit factor | `T: Copy` |
//! | [`StringBuffer`] | by the exact deficit | NUL-terminated bytes |
//!
//! Indexing with `[]` reports an out-of-bounds access as a critical violation
//! and panics; `get` returns the error instead.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    array::Array,
    string::{StringBuffer, StringView},
    vec::Vec,
};

mod array;
mod raw;
mod string;
mod vec;
