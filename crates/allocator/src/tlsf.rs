//! Two-level segregated fit (TLSF) pool.
//!
//! The pool manages one contiguous region obtained from the system allocator.
//! Every block, free or used, starts with a [`BlockHeader`] holding a pointer
//! to the physically previous block and the payload size. The two lowest
//! bits of the size word carry [`BlockFlags`].
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────┬──────────────────────────┬─────────┬──────────┐
//! │ BlockHeader (16 bytes)     │ payload (size bytes)     │ next... │ sentinel │
//! │ ┌───────────┬────────────┐ │ ┌──────────┬───────────┐ │         │ size = 0 │
//! │ │ prev_phys │ size|flags │ │ │ next_free│ prev_free │ │         │          │
//! │ └───────────┴────────────┘ │ └──────────┴───────────┘ │         │          │
//! └────────────────────────────┴──────────────────────────┴─────────┴──────────┘
//!                                 (free blocks only)
//! ```
//!
//! Free blocks are threaded through doubly linked lists stored in their
//! payload. Lists are indexed by a first-level class (power of two) and a
//! second-level class (linear subdivision of that power of two). Two bitmaps
//! record which lists are non-empty so a suitable list is found with two
//! bit scans.
//!
//! Adjacent free blocks are always merged, so the physical chain never holds
//! two free blocks in a row.

#![expect(clippy::cast_ptr_alignment)]

use alloc::alloc::{alloc, dealloc};
use core::{
    alloc::Layout,
    ptr::{self, NonNull},
};

use bitflags::bitflags;

const ALIGN_SIZE_LOG2: u32 = 4;
/// Granularity of block sizes and alignment of every payload.
pub(crate) const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

const SL_INDEX_COUNT_LOG2: u32 = 4;
const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

const FL_INDEX_MAX: u32 = if usize::BITS >= 64 { 32 } else { 30 };
const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;
const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Smallest payload: room for the free-list links.
pub(crate) const BLOCK_SIZE_MIN: usize = size_of::<FreeLinks>();
/// Payload sizes must stay strictly below this bound.
pub(crate) const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;
/// Smallest region that holds one minimal block plus the sentinel.
pub(crate) const POOL_SIZE_MIN: usize = 2 * HEADER_SIZE + BLOCK_SIZE_MIN;
/// Largest region whose single initial block is still indexable.
pub(crate) const POOL_SIZE_MAX: usize = BLOCK_SIZE_MAX - ALIGN_SIZE + 2 * HEADER_SIZE;

const _: () = assert!(HEADER_SIZE == ALIGN_SIZE);
const _: () = assert!(BLOCK_SIZE_MIN.is_power_of_two() && BLOCK_SIZE_MIN <= ALIGN_SIZE);
const _: () = assert!(FL_INDEX_COUNT <= u32::BITS as usize);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: usize {
        const FREE = 1 << 0;
        const PREV_FREE = 1 << 1;
    }
}

const FLAGS_MASK: usize = BlockFlags::all().bits();

#[repr(C)]
struct BlockHeader {
    /// Physically previous block; only meaningful while that block is free.
    prev_phys: *mut Self,
    /// Payload size in bytes, with [`BlockFlags`] in the low bits.
    size: usize,
}

#[repr(C)]
struct FreeLinks {
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

impl BlockHeader {
    /// Writes a fresh header with no flags set.
    ///
    /// # Safety
    ///
    /// `block` must point to at least `HEADER_SIZE` writable bytes aligned to
    /// `ALIGN_SIZE`.
    unsafe fn write(block: *mut Self, prev_phys: *mut Self, size: usize) {
        debug_assert!(size & FLAGS_MASK == 0);
        unsafe { block.write(Self { prev_phys, size }) }
    }

    unsafe fn size(block: *mut Self) -> usize {
        unsafe { (*block).size & !FLAGS_MASK }
    }

    unsafe fn set_size(block: *mut Self, size: usize) {
        debug_assert!(size & FLAGS_MASK == 0);
        unsafe { (*block).size = size | ((*block).size & FLAGS_MASK) }
    }

    unsafe fn flags(block: *mut Self) -> BlockFlags {
        unsafe { BlockFlags::from_bits_truncate((*block).size) }
    }

    unsafe fn set_flag(block: *mut Self, flag: BlockFlags, value: bool) {
        unsafe {
            if value {
                (*block).size |= flag.bits();
            } else {
                (*block).size &= !flag.bits();
            }
        }
    }

    unsafe fn is_free(block: *mut Self) -> bool {
        unsafe { Self::flags(block).contains(BlockFlags::FREE) }
    }

    unsafe fn is_prev_free(block: *mut Self) -> bool {
        unsafe { Self::flags(block).contains(BlockFlags::PREV_FREE) }
    }

    /// The sentinel closing the pool is the only block with a zero size.
    unsafe fn is_last(block: *mut Self) -> bool {
        unsafe { Self::size(block) == 0 }
    }

    unsafe fn payload(block: *mut Self) -> *mut u8 {
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    unsafe fn from_payload(ptr: *mut u8) -> *mut Self {
        unsafe { ptr.sub(HEADER_SIZE).cast() }
    }

    unsafe fn links(block: *mut Self) -> *mut FreeLinks {
        unsafe { Self::payload(block).cast() }
    }

    unsafe fn next_phys(block: *mut Self) -> *mut Self {
        assert!(!block.is_null(), "Block must not be null");
        unsafe {
            debug_assert!(!Self::is_last(block));
            Self::payload(block).add(Self::size(block)).cast()
        }
    }

    /// Points the next physical block back at `block` and returns it.
    unsafe fn link_next(block: *mut Self) -> *mut Self {
        unsafe {
            let next = Self::next_phys(block);
            (*next).prev_phys = block;
            next
        }
    }

    unsafe fn mark_free(block: *mut Self) {
        unsafe {
            let next = Self::link_next(block);
            Self::set_flag(next, BlockFlags::PREV_FREE, true);
            Self::set_flag(block, BlockFlags::FREE, true);
        }
    }

    unsafe fn mark_used(block: *mut Self) {
        unsafe {
            let next = Self::next_phys(block);
            Self::set_flag(next, BlockFlags::PREV_FREE, false);
            Self::set_flag(block, BlockFlags::FREE, false);
        }
    }

    unsafe fn can_split(block: *mut Self, size: usize) -> bool {
        unsafe { Self::size(block) >= HEADER_SIZE + BLOCK_SIZE_MIN + size }
    }

    /// Cuts `block` down to `size` payload bytes and returns the free
    /// remainder that now follows it.
    ///
    /// The remainder is marked free; its `PREV_FREE` flag is left clear.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block with `can_split(block, size)` holding,
    /// and `size` must be a multiple of `ALIGN_SIZE`.
    unsafe fn split(block: *mut Self, size: usize) -> *mut Self {
        unsafe {
            debug_assert!(Self::can_split(block, size));
            let remaining = Self::payload(block).add(size).cast::<Self>();
            let remaining_size = Self::size(block) - (size + HEADER_SIZE);
            Self::write(remaining, block, remaining_size);
            Self::set_size(block, size);
            Self::mark_free(remaining);
            remaining
        }
    }

    /// Merges `block` into the physically preceding `prev`.
    unsafe fn absorb(prev: *mut Self, block: *mut Self) {
        unsafe {
            debug_assert!(!Self::is_last(prev));
            Self::set_size(prev, Self::size(prev) + Self::size(block) + HEADER_SIZE);
            Self::link_next(prev);
        }
    }
}

/// Index of the most significant set bit.
fn fls(size: usize) -> u32 {
    debug_assert!(size > 0);
    usize::BITS - 1 - size.leading_zeros()
}

/// Maps a block size to the list it is stored in.
fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = fls(size);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        ((fl - (FL_INDEX_SHIFT - 1)) as usize, sl)
    }
}

/// Maps a request size to the first list whose blocks are all large enough.
fn mapping_search(size: usize) -> (usize, usize) {
    let size = if size >= SMALL_BLOCK_SIZE {
        let round = (1 << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1;
        size + round
    } else {
        size
    };
    mapping_insert(size)
}

/// Rounds a request up to a block size, or `None` if it can never fit.
pub(crate) fn adjust_request_size(size: usize) -> Option<usize> {
    let adjusted = size.checked_next_multiple_of(ALIGN_SIZE)?.max(BLOCK_SIZE_MIN);
    (adjusted < BLOCK_SIZE_MAX).then_some(adjusted)
}

/// Outcome of a pool walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolWalk {
    pub(crate) used_bytes: usize,
    pub(crate) used_blocks: usize,
    pub(crate) free_bytes: usize,
    pub(crate) free_blocks: usize,
    pub(crate) largest_free: usize,
}

/// A TLSF pool over one region acquired from the system allocator.
pub(crate) struct Pool {
    region: NonNull<u8>,
    layout: Layout,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    free_lists: [[*mut BlockHeader; SL_INDEX_COUNT]; FL_INDEX_COUNT],
}

// The pool exclusively owns its region; nothing else aliases the blocks.
unsafe impl Send for Pool {}

impl Pool {
    /// Acquires a region of `size` bytes (rounded down to the block
    /// granularity) and formats it as one free block plus the sentinel.
    ///
    /// Returns `None` if the system allocator cannot provide the region. The
    /// caller must keep `size` within `POOL_SIZE_MIN..=POOL_SIZE_MAX`.
    pub(crate) fn new(size: usize) -> Option<Self> {
        let pool_size = size & !(ALIGN_SIZE - 1);
        assert!(
            (POOL_SIZE_MIN..=POOL_SIZE_MAX).contains(&pool_size),
            "Pool size must be within the indexable range"
        );

        let layout = Layout::from_size_align(pool_size, ALIGN_SIZE).ok()?;
        let region = NonNull::new(unsafe { alloc(layout) })?;

        let mut pool = Self {
            region,
            layout,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            free_lists: [[ptr::null_mut(); SL_INDEX_COUNT]; FL_INDEX_COUNT],
        };

        unsafe {
            let block = region.as_ptr().cast::<BlockHeader>();
            BlockHeader::write(block, ptr::null_mut(), pool_size - 2 * HEADER_SIZE);
            let sentinel = BlockHeader::next_phys(block);
            BlockHeader::write(sentinel, block, 0);
            BlockHeader::mark_free(block);
            pool.insert_free_block(block);
        }

        Some(pool)
    }

    /// Bytes of the region, headers included.
    pub(crate) fn region_size(&self) -> usize {
        self.layout.size()
    }

    /// Whether `ptr` could be the payload of a block in this pool.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let start = self.region.as_ptr().addr() + HEADER_SIZE;
        let end = self.region.as_ptr().addr() + self.layout.size() - HEADER_SIZE;
        (start..end).contains(&ptr.addr()) && ptr.addr() % ALIGN_SIZE == 0
    }

    /// Payload size of the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a block in this pool.
    pub(crate) unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { BlockHeader::size(BlockHeader::from_payload(ptr.as_ptr())) }
    }

    /// Whether the block at `ptr` is currently allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must satisfy [`Self::contains`].
    pub(crate) unsafe fn is_used(&self, ptr: NonNull<u8>) -> bool {
        unsafe { !BlockHeader::is_free(BlockHeader::from_payload(ptr.as_ptr())) }
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Alignments up to `ALIGN_SIZE` are satisfied by every payload; larger
    /// ones search for a block with room for a leading gap that is split off
    /// and returned to the free lists.
    pub(crate) fn malloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let adjusted = adjust_request_size(size)?;

        unsafe {
            if align <= ALIGN_SIZE {
                let block = self.locate_free_block(adjusted)?;
                return Some(self.prepare_used(block, adjusted));
            }

            // The leading gap must itself be able to form a free block.
            let gap_minimum = HEADER_SIZE + BLOCK_SIZE_MIN;
            let with_gap = adjust_request_size(adjusted.checked_add(align)?.checked_add(gap_minimum)?)?;
            let block = self.locate_free_block(with_gap)?;

            let payload = BlockHeader::payload(block).addr();
            let mut aligned = payload.next_multiple_of(align);
            let mut gap = aligned - payload;
            if gap != 0 && gap < gap_minimum {
                let offset = (gap_minimum - gap).max(align);
                aligned = (aligned + offset).next_multiple_of(align);
                gap = aligned - payload;
            }

            let block = if gap == 0 {
                block
            } else {
                self.trim_free_leading(block, gap)
            };
            debug_assert_eq!(BlockHeader::payload(block).addr() % align, 0);
            Some(self.prepare_used(block, adjusted))
        }
    }

    /// Resizes the block at `ptr`, in place when the block or its free
    /// successor is large enough, otherwise by allocate, copy and free.
    ///
    /// On failure the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a used block in this pool.
    pub(crate) unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let block = BlockHeader::from_payload(ptr.as_ptr());
            let next = BlockHeader::next_phys(block);
            let current_size = BlockHeader::size(block);
            let combined = current_size + BlockHeader::size(next) + HEADER_SIZE;
            let adjusted = adjust_request_size(size)?;

            if adjusted > current_size && (!BlockHeader::is_free(next) || adjusted > combined) {
                let moved = self.malloc(size, 1)?;
                ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), current_size.min(size));
                self.free(ptr);
                return Some(moved);
            }

            if adjusted > current_size {
                self.merge_next(block);
                BlockHeader::mark_used(block);
            }
            self.trim_used(block, adjusted);
            Some(ptr)
        }
    }

    /// Returns the block at `ptr` to the free lists, merging neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a used block in this pool.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let block = BlockHeader::from_payload(ptr.as_ptr());
            assert!(!BlockHeader::is_free(block), "Block must not be already free");
            BlockHeader::mark_free(block);
            let block = self.merge_prev(block);
            let block = self.merge_next(block);
            self.insert_free_block(block);
        }
    }

    /// Visits every block in physical order as `(payload, size, is_free)`.
    pub(crate) fn for_each_block(&self, mut f: impl FnMut(NonNull<u8>, usize, bool)) {
        unsafe {
            let mut block = self.region.as_ptr().cast::<BlockHeader>();
            while !BlockHeader::is_last(block) {
                let payload = NonNull::new_unchecked(BlockHeader::payload(block));
                f(payload, BlockHeader::size(block), BlockHeader::is_free(block));
                block = BlockHeader::next_phys(block);
            }
        }
    }

    pub(crate) fn walk(&self) -> PoolWalk {
        let mut walk = PoolWalk::default();
        self.for_each_block(|_, size, is_free| {
            if is_free {
                walk.free_bytes += size;
                walk.free_blocks += 1;
                walk.largest_free = walk.largest_free.max(size);
            } else {
                walk.used_bytes += size;
                walk.used_blocks += 1;
            }
        });
        walk
    }

    /// Checks the physical chain and the free lists against each other.
    pub(crate) fn check(&self) -> Result<(), &'static str> {
        let mut free_in_chain = 0;
        unsafe {
            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut block = self.region.as_ptr().cast::<BlockHeader>();
            loop {
                let prev_free = !prev.is_null() && BlockHeader::is_free(prev);
                if BlockHeader::is_prev_free(block) != prev_free {
                    return Err("prev-free flag does not match the previous block");
                }
                if prev_free && !ptr::eq((*block).prev_phys, prev) {
                    return Err("physical back link is broken");
                }
                if BlockHeader::is_last(block) {
                    if BlockHeader::is_free(block) {
                        return Err("sentinel block is marked free");
                    }
                    break;
                }
                if BlockHeader::size(block) % ALIGN_SIZE != 0 {
                    return Err("block size is not a multiple of the granularity");
                }
                if BlockHeader::is_free(block) {
                    if prev_free {
                        return Err("adjacent free blocks were not merged");
                    }
                    let (fl, sl) = mapping_insert(BlockHeader::size(block));
                    if !self.list_contains(fl, sl, block) {
                        return Err("free block missing from its free list");
                    }
                    free_in_chain += 1;
                }
                prev = block;
                block = BlockHeader::next_phys(block);
            }

            let mut free_in_lists = 0;
            for fl in 0..FL_INDEX_COUNT {
                let fl_set = self.fl_bitmap & (1 << fl) != 0;
                if fl_set != (self.sl_bitmap[fl] != 0) {
                    return Err("first-level bitmap disagrees with second-level bitmap");
                }
                for sl in 0..SL_INDEX_COUNT {
                    let head = self.free_lists[fl][sl];
                    if (self.sl_bitmap[fl] & (1 << sl) != 0) == head.is_null() {
                        return Err("second-level bitmap disagrees with list head");
                    }
                    let mut node = head;
                    while !node.is_null() {
                        if !BlockHeader::is_free(node) {
                            return Err("used block linked into a free list");
                        }
                        if mapping_insert(BlockHeader::size(node)) != (fl, sl) {
                            return Err("free block linked into the wrong list");
                        }
                        free_in_lists += 1;
                        node = (*BlockHeader::links(node)).next;
                    }
                }
            }
            if free_in_lists != free_in_chain {
                return Err("free lists and physical chain disagree on free block count");
            }
        }
        Ok(())
    }

    unsafe fn list_contains(&self, fl: usize, sl: usize, block: *mut BlockHeader) -> bool {
        let mut node = self.free_lists[fl][sl];
        while !node.is_null() {
            if ptr::eq(node, block) {
                return true;
            }
            node = unsafe { (*BlockHeader::links(node)).next };
        }
        false
    }

    fn search_suitable_block(&self, fl: usize, sl: usize) -> Option<(*mut BlockHeader, usize, usize)> {
        if fl >= FL_INDEX_COUNT {
            return None;
        }

        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (!0 << sl);
        if sl_map == 0 {
            let fl_map = self.fl_bitmap & (!0 << (fl + 1));
            if fl_map == 0 {
                return None;
            }
            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
        }
        debug_assert!(sl_map != 0);
        let sl = sl_map.trailing_zeros() as usize;
        Some((self.free_lists[fl][sl], fl, sl))
    }

    unsafe fn locate_free_block(&mut self, size: usize) -> Option<*mut BlockHeader> {
        let (fl, sl) = mapping_search(size);
        let (block, fl, sl) = self.search_suitable_block(fl, sl)?;
        unsafe {
            debug_assert!(BlockHeader::size(block) >= size);
            self.remove_free(block, fl, sl);
        }
        Some(block)
    }

    unsafe fn insert_free_block(&mut self, block: *mut BlockHeader) {
        unsafe {
            let (fl, sl) = mapping_insert(BlockHeader::size(block));
            let head = self.free_lists[fl][sl];
            assert!(!ptr::eq(head, block), "Free block must not be already linked");

            let links = BlockHeader::links(block);
            (*links).next = head;
            (*links).prev = ptr::null_mut();
            if !head.is_null() {
                (*BlockHeader::links(head)).prev = block;
            }
            self.free_lists[fl][sl] = block;
            self.fl_bitmap |= 1 << fl;
            self.sl_bitmap[fl] |= 1 << sl;
        }
    }

    unsafe fn remove_free_block(&mut self, block: *mut BlockHeader) {
        unsafe {
            let (fl, sl) = mapping_insert(BlockHeader::size(block));
            self.remove_free(block, fl, sl);
        }
    }

    unsafe fn remove_free(&mut self, block: *mut BlockHeader, fl: usize, sl: usize) {
        unsafe {
            let FreeLinks { next, prev } = BlockHeader::links(block).read();
            if !next.is_null() {
                (*BlockHeader::links(next)).prev = prev;
            }
            if !prev.is_null() {
                (*BlockHeader::links(prev)).next = next;
            }

            if ptr::eq(self.free_lists[fl][sl], block) {
                self.free_lists[fl][sl] = next;
                if next.is_null() {
                    self.sl_bitmap[fl] &= !(1 << sl);
                    if self.sl_bitmap[fl] == 0 {
                        self.fl_bitmap &= !(1 << fl);
                    }
                }
            }
        }
    }

    unsafe fn merge_prev(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        unsafe {
            if !BlockHeader::is_prev_free(block) {
                return block;
            }
            let prev = (*block).prev_phys;
            assert!(!prev.is_null(), "Free predecessor must exist");
            self.remove_free_block(prev);
            BlockHeader::absorb(prev, block);
            prev
        }
    }

    unsafe fn merge_next(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        unsafe {
            let next = BlockHeader::next_phys(block);
            if BlockHeader::is_free(next) {
                self.remove_free_block(next);
                BlockHeader::absorb(block, next);
            }
            block
        }
    }

    /// Returns the tail of a free block beyond `size` to the free lists.
    unsafe fn trim_free(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            if BlockHeader::can_split(block, size) {
                let remaining = BlockHeader::split(block, size);
                self.insert_free_block(remaining);
            }
        }
    }

    /// Returns the tail of a used block beyond `size` to the free lists.
    unsafe fn trim_used(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            if BlockHeader::can_split(block, size) {
                let remaining = BlockHeader::split(block, size);
                let remaining = self.merge_next(remaining);
                self.insert_free_block(remaining);
            }
        }
    }

    /// Splits `gap` leading bytes off a free block, keeps them free and
    /// returns the block that starts right after the gap.
    unsafe fn trim_free_leading(&mut self, block: *mut BlockHeader, gap: usize) -> *mut BlockHeader {
        unsafe {
            assert!(
                BlockHeader::can_split(block, gap - HEADER_SIZE),
                "Leading gap must form a block"
            );
            let remaining = BlockHeader::split(block, gap - HEADER_SIZE);
            BlockHeader::set_flag(remaining, BlockFlags::PREV_FREE, true);
            self.insert_free_block(block);
            remaining
        }
    }

    unsafe fn prepare_used(&mut self, block: *mut BlockHeader, size: usize) -> NonNull<u8> {
        unsafe {
            self.trim_free(block, size);
            BlockHeader::mark_used(block);
            NonNull::new_unchecked(BlockHeader::payload(block))
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe { dealloc(self.region.as_ptr(), self.layout) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    struct TestPool {
        pool: Pool,
    }

    impl TestPool {
        fn malloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
            let ptr = self.pool.malloc(size, align)?;
            unsafe {
                ptr.as_ptr().write_bytes(0x33, size);
            }
            self.pool.check().unwrap();
            Some(ptr)
        }

        unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
            unsafe {
                for i in 0..size {
                    assert_eq!(ptr.as_ptr().add(i).read(), 0x33);
                }
                ptr.as_ptr().write_bytes(0x55, size);
                self.pool.free(ptr);
            }
            self.pool.check().unwrap();
        }
    }

    fn with_test_pool<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&mut TestPool),
    {
        let pool = Pool::new(size).unwrap();
        pool.check().unwrap();
        let mut pool = TestPool { pool };
        test_fn(&mut pool);
        let walk = pool.pool.walk();
        assert_eq!(walk.used_blocks, 0, "test leaked blocks");
        assert_eq!(walk.free_blocks, 1, "free blocks were not coalesced");
    }

    #[test]
    fn test_mapping_insert() {
        assert_eq!(mapping_insert(16), (0, 1));
        assert_eq!(mapping_insert(240), (0, 15));
        assert_eq!(mapping_insert(256), (1, 0));
        assert_eq!(mapping_insert(271), (1, 0));
        assert_eq!(mapping_insert(272), (1, 1));
        assert_eq!(mapping_insert(511), (1, 15));
        assert_eq!(mapping_insert(512), (2, 0));
        assert_eq!(mapping_insert(1 << 20), (13, 0));
        assert_eq!(mapping_insert(BLOCK_SIZE_MAX - 1), (FL_INDEX_COUNT - 1, SL_INDEX_COUNT - 1));
    }

    #[test]
    fn test_mapping_search_rounds_up() {
        assert_eq!(mapping_search(16), (0, 1));
        assert_eq!(mapping_search(256), (1, 0));
        assert_eq!(mapping_search(257), (1, 1));
        assert_eq!(mapping_search(272), (1, 1));
        assert_eq!(mapping_search(273), (1, 2));
        assert_eq!(mapping_search(511), (2, 0));
    }

    #[test]
    fn test_adjust_request_size() {
        assert_eq!(adjust_request_size(0), Some(BLOCK_SIZE_MIN));
        assert_eq!(adjust_request_size(1), Some(16));
        assert_eq!(adjust_request_size(16), Some(16));
        assert_eq!(adjust_request_size(17), Some(32));
        assert_eq!(adjust_request_size(BLOCK_SIZE_MAX), None);
        assert_eq!(adjust_request_size(usize::MAX), None);
    }

    #[test]
    fn test_basic_allocation() {
        with_test_pool(1024, |pool| unsafe {
            let ptr = pool.malloc(64, 1).unwrap();
            assert_eq!(ptr.as_ptr().addr() % ALIGN_SIZE, 0);
            assert_eq!(pool.pool.block_size(ptr), 64);
            pool.free(ptr, 64);
        });
    }

    #[test]
    fn test_multiple_allocations() {
        with_test_pool(1024, |pool| unsafe {
            let ptr1 = pool.malloc(64, 1).unwrap();
            let ptr2 = pool.malloc(64, 1).unwrap();
            let ptr3 = pool.malloc(64, 1).unwrap();

            assert_ne!(ptr1, ptr2);
            assert_ne!(ptr2, ptr3);
            assert_ne!(ptr1, ptr3);

            pool.free(ptr2, 64);
            pool.free(ptr1, 64);
            pool.free(ptr3, 64);
        });
    }

    #[test]
    fn test_alignment() {
        with_test_pool(4096, |pool| unsafe {
            for align in [32, 64, 128, 256, 1024] {
                let ptr = pool.malloc(40, align).unwrap();
                assert_eq!(ptr.as_ptr().addr() % align, 0, "align {align}");
                pool.free(ptr, 40);
            }
        });
    }

    #[test]
    fn test_alignment_after_misaligning_allocation() {
        with_test_pool(4096, |pool| unsafe {
            // Shift the next free payload off a 64-byte boundary.
            let first = pool.malloc(16, 1).unwrap();
            let aligned = pool.malloc(100, 64).unwrap();
            assert_eq!(aligned.as_ptr().addr() % 64, 0);
            pool.free(first, 16);
            pool.free(aligned, 100);
        });
    }

    #[test]
    fn test_allocate_entire_pool() {
        with_test_pool(1024, |pool| unsafe {
            let size = 1024 - 2 * HEADER_SIZE;
            let ptr = pool.malloc(size, 1).unwrap();
            assert!(pool.malloc(16, 1).is_none());
            pool.free(ptr, size);

            let ptr = pool.malloc(size, 1).unwrap();
            pool.free(ptr, size);
        });
    }

    #[test]
    fn test_out_of_memory() {
        with_test_pool(256, |pool| {
            assert!(pool.malloc(512, 1).is_none());
        });
    }

    #[test]
    fn test_fragmentation_and_coalescing() {
        with_test_pool(4 * (64 + HEADER_SIZE) + 2 * HEADER_SIZE, |pool| unsafe {
            let ptr1 = pool.malloc(64, 1).unwrap();
            let ptr2 = pool.malloc(64, 1).unwrap();
            let ptr3 = pool.malloc(64, 1).unwrap();
            let ptr4 = pool.malloc(64, 1).unwrap();
            assert!(pool.malloc(16, 1).is_none());
            assert!(ptr1 < ptr2 && ptr2 < ptr3 && ptr3 < ptr4);

            pool.free(ptr2, 64);
            pool.free(ptr1, 64);

            // The two freed neighbors merged into one block with a header to spare.
            let large = pool.malloc(128 + HEADER_SIZE, 1).unwrap();
            assert_eq!(large, ptr1);

            pool.free(large, 128 + HEADER_SIZE);
            pool.free(ptr4, 64);
            pool.free(ptr3, 64);
        });
    }

    #[test]
    fn test_realloc_grows_in_place_into_free_successor() {
        with_test_pool(1024, |pool| unsafe {
            let ptr = pool.malloc(32, 1).unwrap();
            let grown = pool.pool.realloc(ptr, 200).unwrap();
            pool.pool.check().unwrap();
            assert_eq!(grown, ptr);
            assert!(pool.pool.block_size(grown) >= 200);
            for i in 0..32 {
                assert_eq!(grown.as_ptr().add(i).read(), 0x33);
            }
            grown.as_ptr().write_bytes(0x33, 200);
            pool.free(grown, 200);
        });
    }

    #[test]
    fn test_realloc_moves_when_successor_is_used() {
        with_test_pool(1024, |pool| unsafe {
            let ptr = pool.malloc(32, 1).unwrap();
            let blocker = pool.malloc(32, 1).unwrap();
            let moved = pool.pool.realloc(ptr, 200).unwrap();
            pool.pool.check().unwrap();
            assert_ne!(moved, ptr);
            for i in 0..32 {
                assert_eq!(moved.as_ptr().add(i).read(), 0x33);
            }
            moved.as_ptr().write_bytes(0x33, 200);
            pool.free(moved, 200);
            pool.free(blocker, 32);
        });
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        with_test_pool(1024, |pool| unsafe {
            let ptr = pool.malloc(256, 1).unwrap();
            let shrunk = pool.pool.realloc(ptr, 32).unwrap();
            pool.pool.check().unwrap();
            assert_eq!(shrunk, ptr);
            assert_eq!(pool.pool.block_size(shrunk), 32);
            pool.free(shrunk, 32);
        });
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        with_test_pool(256, |pool| unsafe {
            let ptr = pool.malloc(64, 1).unwrap();
            assert!(pool.pool.realloc(ptr, 4096).is_none());
            assert!(pool.pool.is_used(ptr));
            pool.free(ptr, 64);
        });
    }

    #[test]
    fn test_walk_counts_blocks() {
        with_test_pool(2048, |pool| unsafe {
            let a = pool.malloc(100, 1).unwrap();
            let b = pool.malloc(300, 1).unwrap();
            let walk = pool.pool.walk();
            assert_eq!(walk.used_blocks, 2);
            assert_eq!(walk.used_bytes, 112 + 304);
            assert_eq!(walk.free_blocks, 1);
            assert_eq!(
                walk.used_bytes + walk.free_bytes + 3 * HEADER_SIZE + HEADER_SIZE,
                pool.pool.region_size()
            );
            pool.free(a, 100);
            pool.free(b, 300);
        });
    }

    #[test]
    fn test_contains() {
        with_test_pool(1024, |pool| unsafe {
            let ptr = pool.malloc(64, 1).unwrap();
            assert!(pool.pool.contains(ptr.as_ptr()));
            assert!(!pool.pool.contains(ptr.as_ptr().add(1)));
            assert!(!pool.pool.contains(ptr::without_provenance(0x10)));
            pool.free(ptr, 64);
        });
    }
}
