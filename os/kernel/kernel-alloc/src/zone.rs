//! # Physical Zone (buddy allocator)
//!
//! A [`PhysicalZone`] manages one contiguous run of physical pages in chunks
//! of half a page. Blocks of order `o` span `2^o` chunks; the largest block is
//! of order [`MAX_ORDER`].
//!
//! ## Bookkeeping
//!
//! - Free blocks of one order are kept in a doubly linked freelist threaded
//!   through a side table of per-chunk links, addressed by [`ChunkIndex`]
//!   rather than by pointer. Only the first chunk of a free block is linked.
//! - Each order has a bitmap with one bit per block of that order, set iff the
//!   block is on the freelist. [`buddy_bit_index`] locates the buddy's bit.
//!
//! - Each chunk that starts an allocated block records the block's order, so
//!   a free must name exactly the block that was handed out.
//!
//! Freeing a block whose buddy bit is set unlinks the buddy and frees the
//! merged block one order up, so adjacent free buddies never coexist.
//!
//! ## Example
//! ```rust
//! # use kernel_alloc::zone::PhysicalZone;
//! # use kernel_memory_addresses::PhysicalAddress;
//! let mut zone = PhysicalZone::new(PhysicalAddress::new(0x10_0000), 16);
//! let frame = zone.allocate_block(1).unwrap();
//! assert_eq!(zone.available(), 15);
//! zone.deallocate_block(frame, 1);
//! assert_eq!(zone.available(), 16);
//! ```

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use log::trace;

/// Smallest allocation unit: half a page.
pub const CHUNK_SIZE: u64 = PAGE_SIZE / 2;

/// Largest block order; a block of this order spans `2^MAX_ORDER` chunks.
pub const MAX_ORDER: usize = 12;

/// Chunks per page.
const CHUNKS_PER_PAGE: u64 = PAGE_SIZE / CHUNK_SIZE;

/// Marks a chunk that does not start an allocated block.
const UNALLOCATED: u8 = u8::MAX;

/// Signed index of a chunk within its zone; [`ChunkIndex::NONE`] ends a list.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChunkIndex(i32);

impl ChunkIndex {
    pub const NONE: Self = Self(-1);

    #[inline]
    const fn new(chunk: usize) -> Self {
        debug_assert!(chunk <= i32::MAX as usize);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Self(chunk as i32)
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }

    /// The chunk number, or `None` for [`NONE`](Self::NONE).
    #[inline]
    #[must_use]
    pub const fn get(self) -> Option<usize> {
        if self.is_none() {
            None
        } else {
            #[allow(clippy::cast_sign_loss)]
            Some(self.0 as usize)
        }
    }
}

impl fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(i) => write!(f, "ChunkIndex({i})"),
            None => f.write_str("ChunkIndex(NONE)"),
        }
    }
}

/// Bitmap index of the buddy of the order-`order` block starting at `chunk`.
///
/// Bitmaps are indexed by block number (`chunk >> order`); buddies differ in
/// the lowest bit of the block number.
#[inline]
#[must_use]
pub const fn buddy_bit_index(chunk: usize, order: usize) -> usize {
    (chunk >> order) ^ 1
}

/// Smallest order whose blocks hold `pages` pages; `None` above [`MAX_ORDER`].
#[must_use]
pub const fn order_for_pages(pages: u64) -> Option<usize> {
    let Some(chunks) = pages.checked_mul(CHUNKS_PER_PAGE) else {
        return None;
    };
    let Some(rounded) = chunks.checked_next_power_of_two() else {
        return None;
    };
    let order = rounded.trailing_zeros() as usize;
    if order > MAX_ORDER { None } else { Some(order) }
}

/// Freelist links of one chunk.
#[derive(Copy, Clone)]
struct ChunkLink {
    prev: ChunkIndex,
    next: ChunkIndex,
}

impl ChunkLink {
    const UNLINKED: Self = Self {
        prev: ChunkIndex::NONE,
        next: ChunkIndex::NONE,
    };
}

/// Freelist and bitmap for one order.
struct BuddyBucket {
    order: usize,
    freelist_head: ChunkIndex,
    /// One bit per block of this order; set iff the block is free.
    bitmap: Vec<u64>,
    free_blocks: usize,
}

impl BuddyBucket {
    fn new(order: usize, chunk_count: usize) -> Self {
        let blocks = (chunk_count >> order) + 1;
        Self {
            order,
            freelist_head: ChunkIndex::NONE,
            bitmap: vec![0; blocks.div_ceil(64)],
            free_blocks: 0,
        }
    }

    #[inline]
    fn bit(&self, block: usize) -> bool {
        self.bitmap
            .get(block / 64)
            .is_some_and(|word| word & (1 << (block % 64)) != 0)
    }

    #[inline]
    fn set_bit(&mut self, block: usize, free: bool) {
        let word = &mut self.bitmap[block / 64];
        if free {
            *word |= 1 << (block % 64);
        } else {
            *word &= !(1 << (block % 64));
        }
    }
}

/// Buddy allocator over one contiguous physical range.
///
/// Not synchronized; the owner serializes access (see `ZoneAllocator`).
pub struct PhysicalZone {
    base: PhysicalAddress,
    page_count: u64,
    chunk_count: usize,
    used_chunks: usize,
    links: Vec<ChunkLink>,
    /// Order of the allocated block starting at each chunk, or [`UNALLOCATED`].
    allocated_order: Vec<u8>,
    buckets: Vec<BuddyBucket>,
}

impl PhysicalZone {
    /// Build a zone over `page_count` pages starting at `base`, all free.
    ///
    /// # Panics
    /// Panics if `base` is not page aligned, `page_count` is zero, or the
    /// zone has more chunks than a [`ChunkIndex`] can address.
    #[must_use]
    pub fn new(base: PhysicalAddress, page_count: u64) -> Self {
        assert!(base.is_page_aligned(), "zone base {base} is not page aligned");
        assert!(page_count > 0, "zone must cover at least one page");
        let chunk_count = page_count
            .checked_mul(CHUNKS_PER_PAGE)
            .and_then(|c| usize::try_from(c).ok())
            .filter(|&c| i32::try_from(c).is_ok())
            .unwrap_or_else(|| panic!("zone of {page_count} pages is too large"));

        let mut zone = Self {
            base,
            page_count,
            chunk_count,
            used_chunks: 0,
            links: vec![ChunkLink::UNLINKED; chunk_count],
            allocated_order: vec![UNALLOCATED; chunk_count],
            buckets: (0..=MAX_ORDER)
                .map(|order| BuddyBucket::new(order, chunk_count))
                .collect(),
        };

        // Carve the chunk range into maximal naturally aligned blocks.
        let mut chunk = 0;
        while chunk < chunk_count {
            let mut order = if chunk == 0 {
                MAX_ORDER
            } else {
                MAX_ORDER.min(chunk.trailing_zeros() as usize)
            };
            while chunk + (1 << order) > chunk_count {
                order -= 1;
            }
            zone.push_free(order, chunk);
            chunk += 1 << order;
        }
        zone
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[inline]
    #[must_use]
    pub const fn used_chunks(&self) -> usize {
        self.used_chunks
    }

    /// Free pages, rounding a free half page down.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.page_count - (self.used_chunks as u64) / CHUNKS_PER_PAGE
    }

    /// Free chunks.
    #[inline]
    #[must_use]
    pub const fn available_chunks(&self) -> usize {
        self.chunk_count - self.used_chunks
    }

    /// `true` if not a single chunk is free.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used_chunks == self.chunk_count
    }

    /// Half-open membership test against `[base, base + page_count * PAGE_SIZE)`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, paddr: PhysicalAddress) -> bool {
        match paddr.offset_from(self.base) {
            Some(offset) => offset < self.page_count * PAGE_SIZE,
            None => false,
        }
    }

    /// Number of free blocks of `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.buckets.get(order).map_or(0, |b| b.free_blocks)
    }

    /// Allocate a block of `2^order` chunks.
    ///
    /// Splits larger blocks as needed. Returns `None` if `order` exceeds
    /// [`MAX_ORDER`] or no block of this size can be produced.
    pub fn allocate_block(&mut self, order: usize) -> Option<PhysicalAddress> {
        let chunk = self.allocate_chunk(order)?;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.allocated_order[chunk] = order as u8;
        }
        self.used_chunks += 1 << order;
        Some(self.chunk_address(chunk))
    }

    fn allocate_chunk(&mut self, order: usize) -> Option<usize> {
        if order > MAX_ORDER {
            return None;
        }
        if let Some(chunk) = self.pop_free(order) {
            return Some(chunk);
        }
        if order == MAX_ORDER {
            return None;
        }
        let chunk = self.allocate_chunk(order + 1)?;
        let buddy = chunk + (1 << order);
        trace!(
            "zone {}: split order {} block at chunk {chunk}",
            self.base,
            order + 1
        );
        self.push_free(order, buddy);
        Some(chunk)
    }

    /// Return a block obtained from [`allocate_block`](Self::allocate_block)
    /// with the same `order`, coalescing with free buddies.
    ///
    /// # Panics
    /// Panics if `addr` is outside the zone, not aligned to a block of
    /// `order`, not the start of an allocated block, or was allocated with a
    /// different order.
    pub fn deallocate_block(&mut self, addr: PhysicalAddress, order: usize) {
        assert!(order <= MAX_ORDER, "order {order} exceeds the maximum order");
        assert!(self.contains(addr), "{addr} is not owned by zone {}", self.base);
        let chunk = self.chunk_of(addr);
        assert!(
            chunk.is_multiple_of(1 << order) && chunk + (1 << order) <= self.chunk_count,
            "{addr} is not an order {order} block of zone {}",
            self.base
        );
        match self.allocated_order[chunk] {
            UNALLOCATED => panic!(
                "double free of order {order} block at {addr} in zone {}",
                self.base
            ),
            allocated if usize::from(allocated) != order => panic!(
                "{addr} was allocated as order {allocated} but freed as order {order}"
            ),
            _ => {}
        }

        self.allocated_order[chunk] = UNALLOCATED;
        self.used_chunks = self
            .used_chunks
            .checked_sub(1 << order)
            .unwrap_or_else(|| panic!("zone {} accounting corrupted", self.base));
        self.free_chunk(chunk, order);
    }

    fn free_chunk(&mut self, chunk: usize, order: usize) {
        if order < MAX_ORDER {
            let buddy_block = buddy_bit_index(chunk, order);
            if self.buckets[order].bit(buddy_block) {
                let buddy = buddy_block << order;
                self.remove_free(order, buddy);
                self.free_chunk(chunk.min(buddy), order + 1);
                return;
            }
        }
        self.push_free(order, chunk);
    }

    #[inline]
    fn chunk_address(&self, chunk: usize) -> PhysicalAddress {
        self.base + chunk as u64 * CHUNK_SIZE
    }

    /// Chunk number of `addr`; the caller checked [`contains`](Self::contains).
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn chunk_of(&self, addr: PhysicalAddress) -> usize {
        let offset = addr.as_u64() - self.base.as_u64();
        assert!(
            offset.is_multiple_of(CHUNK_SIZE),
            "{addr} is not chunk aligned"
        );
        (offset / CHUNK_SIZE) as usize
    }

    fn push_free(&mut self, order: usize, chunk: usize) {
        let bucket = &mut self.buckets[order];
        debug_assert_eq!(bucket.order, order);
        let old_head = bucket.freelist_head;
        self.links[chunk] = ChunkLink {
            prev: ChunkIndex::NONE,
            next: old_head,
        };
        if let Some(head) = old_head.get() {
            self.links[head].prev = ChunkIndex::new(chunk);
        }
        bucket.freelist_head = ChunkIndex::new(chunk);
        bucket.set_bit(chunk >> order, true);
        bucket.free_blocks += 1;
    }

    fn pop_free(&mut self, order: usize) -> Option<usize> {
        let chunk = self.buckets[order].freelist_head.get()?;
        self.remove_free(order, chunk);
        Some(chunk)
    }

    fn remove_free(&mut self, order: usize, chunk: usize) {
        let ChunkLink { prev, next } = self.links[chunk];
        match prev.get() {
            Some(p) => self.links[p].next = next,
            None => self.buckets[order].freelist_head = next,
        }
        if let Some(n) = next.get() {
            self.links[n].prev = prev;
        }
        self.links[chunk] = ChunkLink::UNLINKED;

        let bucket = &mut self.buckets[order];
        bucket.set_bit(chunk >> order, false);
        bucket.free_blocks -= 1;
    }
}

impl fmt::Debug for PhysicalZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalZone")
            .field("base", &self.base)
            .field("page_count", &self.page_count)
            .field("used_chunks", &self.used_chunks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BASE: PhysicalAddress = PhysicalAddress::new(0x40_0000);

    /// 2048 pages = 4096 chunks = exactly one block of `MAX_ORDER`.
    fn max_order_zone() -> PhysicalZone {
        PhysicalZone::new(BASE, 2048)
    }

    fn other_orders_empty(zone: &PhysicalZone, except: usize) -> bool {
        (0..=MAX_ORDER)
            .filter(|&o| o != except)
            .all(|o| zone.free_blocks(o) == 0)
    }

    #[test]
    fn exhausting_order_zero_yields_every_chunk_once() {
        let pages = 8;
        let mut zone = PhysicalZone::new(BASE, pages);
        let mut seen = HashSet::new();
        while let Some(addr) = zone.allocate_block(0) {
            let offset = addr.offset_from(BASE).unwrap();
            assert_eq!(offset % CHUNK_SIZE, 0);
            assert!(seen.insert(addr), "{addr} handed out twice");
            assert_eq!(zone.available_chunks(), 2 * 8 - seen.len());
            assert_eq!(zone.available(), pages - seen.len() as u64 / 2);
        }
        assert_eq!(seen.len(), 16);
        assert!(zone.is_empty());
        assert_eq!(zone.available(), 0);
    }

    #[test]
    fn allocate_then_free_restores_the_zone() {
        let mut zone = max_order_zone();
        assert_eq!(zone.free_blocks(MAX_ORDER), 1);
        assert!(other_orders_empty(&zone, MAX_ORDER));

        for order in 0..=MAX_ORDER {
            let before = zone.available();
            let addr = zone.allocate_block(order).unwrap();
            zone.deallocate_block(addr, order);
            assert_eq!(zone.available(), before);
            assert_eq!(zone.free_blocks(MAX_ORDER), 1);
            assert!(other_orders_empty(&zone, MAX_ORDER));
        }
    }

    #[test]
    fn freed_buddies_coalesce_into_their_parent() {
        let mut zone = max_order_zone();
        let order = 3;
        let a = zone.allocate_block(order).unwrap();
        let b = zone.allocate_block(order).unwrap();
        // Pin the parent's own buddy so the merge stops one order up.
        let _pin = zone.allocate_block(order + 1).unwrap();

        let chunk_a = zone.chunk_of(a);
        let chunk_b = zone.chunk_of(b);
        assert_eq!(buddy_bit_index(chunk_a, order), chunk_b >> order);
        assert_eq!(buddy_bit_index(chunk_b, order), chunk_a >> order);

        zone.deallocate_block(a, order);
        zone.deallocate_block(b, order);

        // The coalesced parent is reused without splitting an order+2 block.
        let free_above = zone.free_blocks(order + 2);
        let parent = zone.allocate_block(order + 1).unwrap();
        assert_eq!(parent, a.min(b));
        assert_eq!(zone.free_blocks(order + 2), free_above);
    }

    #[test]
    fn odd_sized_zones_are_fully_usable() {
        // 7 pages = 14 chunks = 8 + 4 + 2
        let mut zone = PhysicalZone::new(BASE, 7);
        assert_eq!(zone.free_blocks(3), 1);
        assert_eq!(zone.free_blocks(2), 1);
        assert_eq!(zone.free_blocks(1), 1);

        let frames: Vec<_> = (0..7).map(|_| zone.allocate_block(1).unwrap()).collect();
        assert!(zone.allocate_block(1).is_none());
        for f in frames {
            zone.deallocate_block(f, 1);
        }
        assert_eq!(zone.available(), 7);
        assert!(zone.allocate_block(4).is_none());
        assert!(zone.allocate_block(3).is_some());
    }

    #[test]
    fn orders_above_max_fail() {
        let mut zone = max_order_zone();
        assert!(zone.allocate_block(MAX_ORDER + 1).is_none());
        assert!(zone.allocate_block(MAX_ORDER).is_some());
        assert!(zone.allocate_block(0).is_none());
    }

    #[test]
    fn contains_is_half_open() {
        let zone = PhysicalZone::new(BASE, 4);
        assert!(zone.contains(BASE));
        assert!(zone.contains(BASE + (4 * PAGE_SIZE - 1)));
        assert!(!zone.contains(BASE + 4 * PAGE_SIZE));
        assert!(!zone.contains(PhysicalAddress::new(BASE.as_u64() - 1)));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut zone = PhysicalZone::new(BASE, 4);
        let a = zone.allocate_block(1).unwrap();
        let _keep = zone.allocate_block(1).unwrap();
        zone.deallocate_block(a, 1);
        zone.deallocate_block(a, 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_inside_a_free_block_panics() {
        let mut zone = PhysicalZone::new(BASE, 4);
        zone.deallocate_block(BASE + PAGE_SIZE, 1);
    }

    #[test]
    #[should_panic(expected = "allocated as order 1 but freed as order 2")]
    fn freeing_with_a_larger_order_panics() {
        let mut zone = PhysicalZone::new(BASE, 2);
        let a = zone.allocate_block(1).unwrap();
        zone.deallocate_block(a, 2);
    }

    #[test]
    #[should_panic(expected = "allocated as order 1 but freed as order 2")]
    fn freeing_two_neighbours_as_one_block_panics() {
        let mut zone = PhysicalZone::new(BASE, 2);
        let a = zone.allocate_block(1).unwrap();
        let _b = zone.allocate_block(1).unwrap();
        zone.deallocate_block(a, 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_part_of_a_block_panics() {
        let mut zone = PhysicalZone::new(BASE, 2);
        let _a = zone.allocate_block(2).unwrap();
        zone.deallocate_block(BASE + PAGE_SIZE, 1);
    }

    #[test]
    fn rejected_frees_leave_accounting_intact() {
        let mut zone = PhysicalZone::new(BASE, 2);
        let a = zone.allocate_block(1).unwrap();
        let wrong = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            zone.deallocate_block(a, 2);
        }));
        assert!(wrong.is_err());
        assert_eq!(zone.used_chunks(), 2);
        assert_eq!(zone.available(), 1);
        zone.deallocate_block(a, 1);
        assert_eq!(zone.available(), 2);
        assert_eq!(zone.free_blocks(2), 1);
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn foreign_address_panics() {
        let mut zone = PhysicalZone::new(BASE, 4);
        zone.deallocate_block(PhysicalAddress::new(0x1000), 0);
    }

    #[test]
    #[should_panic(expected = "is not an order 2 block")]
    fn misaligned_block_panics() {
        let mut zone = PhysicalZone::new(BASE, 4);
        let _ = zone.allocate_block(2).unwrap();
        zone.deallocate_block(BASE + CHUNK_SIZE, 2);
    }

    #[test]
    fn order_for_pages_rounds_up() {
        assert_eq!(order_for_pages(1), Some(1));
        assert_eq!(order_for_pages(2), Some(2));
        assert_eq!(order_for_pages(3), Some(3));
        assert_eq!(order_for_pages(2048), Some(MAX_ORDER));
        assert_eq!(order_for_pages(2049), None);
    }
}
