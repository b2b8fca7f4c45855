// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! General-purpose best-fit allocator over fixed-address memory regions.
//!
//! Each region starts with a region header; the rest is carved into blocks,
//! every one of which begins with a `BlockHeader` carrying the physical
//! neighbour chain, the free-tree link, and the duplicate chain for blocks of
//! equal size. Free blocks are indexed by size in an AVL tree (ties hang off
//! the in-tree representative as a doubly-linked duplicate chain, which lets
//! allocation prefer a duplicate and skip rebalancing). Occupied blocks are
//! indexed by address in a second tree, so freeing a pointer that was never
//! handed out is detected instead of corrupting the heap.
//!
//! A block's `size` field counts the header and is zero while the block is
//! occupied; freeing recomputes it from the distance to the physical
//! neighbour and then merges with each adjacent free neighbour (at most two
//! merges).
//!
//! This is the only module in the crate that touches raw memory. All
//! `unsafe` is confined here; node handles never leave as anything but the
//! opaque `NonNull` payload pointers callers asked for.

use core::cmp::Ordering;
use core::ptr::NonNull;

use crate::avl::{AvlLink, AvlStore, AvlTree};

/// Allocation granularity and the minimum alignment of returned pointers and
/// region base addresses.
pub const ALIGNMENT: usize = 16;

const fn align_up(v: usize) -> usize {
    (v + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

const fn align_down(v: usize) -> usize {
    v & !(ALIGNMENT - 1)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeapError {
    InvalidParameter,
    NotEnoughMemory,
    InvalidBlock,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapInfo {
    pub total: usize,
    pub free: usize,
}

/// Handle to a block header inside some region.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct BlockRef(NonNull<BlockHeader>);

impl BlockRef {
    fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

#[repr(C)]
struct BlockHeader {
    /// Distance to the physical neighbour in bytes, header included; zero
    /// while the block is occupied.
    size: usize,
    prev: Option<BlockRef>,
    next: Option<BlockRef>,
    link: AvlLink<BlockRef>,
    prev_dup: Option<BlockRef>,
    next_dup: Option<BlockRef>,
}

#[repr(C)]
struct RegionHeader {
    free: AvlTree<BlockRef>,
    occupied: AvlTree<BlockRef>,
    total: usize,
    free_bytes: usize,
    /// Address one past the last usable byte; the physical extent of the
    /// final block runs to here.
    data_end: usize,
    next_region: Option<NonNull<RegionHeader>>,
}

const BLOCK_HDR: usize = align_up(core::mem::size_of::<BlockHeader>());
const REGION_HDR: usize = align_up(core::mem::size_of::<RegionHeader>());

/// Shorthand for the one aliasing rule this module lives by: at most one
/// reference produced by `blk`/`reg` is alive at a time; values are read
/// into locals before the next call.
unsafe fn blk<'a>(b: BlockRef) -> &'a mut BlockHeader {
    unsafe { &mut *b.0.as_ptr() }
}

unsafe fn reg<'a>(r: NonNull<RegionHeader>) -> &'a mut RegionHeader {
    unsafe { &mut *r.as_ptr() }
}

/// Free-tree store: blocks ordered by size.
struct BySize;

impl AvlStore for BySize {
    type Node = BlockRef;

    fn link(&self, n: BlockRef) -> &AvlLink<BlockRef> {
        unsafe { &(*n.0.as_ptr()).link }
    }

    fn link_mut(&mut self, n: BlockRef) -> &mut AvlLink<BlockRef> {
        unsafe { &mut (*n.0.as_ptr()).link }
    }

    fn order(&self, a: BlockRef, b: BlockRef) -> Ordering {
        let (sa, sb) =
            unsafe { ((*a.0.as_ptr()).size, (*b.0.as_ptr()).size) };
        sa.cmp(&sb)
    }
}

/// Occupied-tree store: blocks ordered by address.
struct ByAddr;

impl AvlStore for ByAddr {
    type Node = BlockRef;

    fn link(&self, n: BlockRef) -> &AvlLink<BlockRef> {
        unsafe { &(*n.0.as_ptr()).link }
    }

    fn link_mut(&mut self, n: BlockRef) -> &mut AvlLink<BlockRef> {
        unsafe { &mut (*n.0.as_ptr()).link }
    }

    fn order(&self, a: BlockRef, b: BlockRef) -> Ordering {
        a.addr().cmp(&b.addr())
    }
}

/// The allocator: a chain of regions, best-fit across all of them in chain
/// order.
///
/// No internal locking; in the kernel every call happens under the scheduler
/// lock.
pub struct Heap {
    first: Option<NonNull<RegionHeader>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.first.is_some()
    }

    /// Lays a region header plus one all-encompassing free block over the
    /// memory at `base`.
    ///
    /// # Safety
    ///
    /// `base..base+size` must be valid for reads and writes, exclusively
    /// owned by the heap from now on, aligned to [`ALIGNMENT`], and must
    /// outlive the heap.
    unsafe fn lay_out_region(
        base: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<RegionHeader>, HeapError> {
        if base.as_ptr() as usize % ALIGNMENT != 0 {
            return Err(HeapError::InvalidParameter);
        }
        // The region must fit its own header plus one block header, or
        // there is nothing to allocate from.
        if align_down(size) < REGION_HDR + BLOCK_HDR {
            return Err(HeapError::InvalidParameter);
        }
        let free_bytes = align_down(size) - REGION_HDR;

        let region: NonNull<RegionHeader> = base.cast();
        let block_addr = base.as_ptr() as usize + REGION_HDR;
        let block = BlockRef(
            NonNull::new(block_addr as *mut BlockHeader)
                .ok_or(HeapError::InvalidParameter)?,
        );

        unsafe {
            region.as_ptr().write(RegionHeader {
                free: AvlTree::new(),
                occupied: AvlTree::new(),
                total: size,
                free_bytes,
                data_end: block_addr + free_bytes,
                next_region: None,
            });
            block.0.as_ptr().write(BlockHeader {
                size: free_bytes,
                prev: None,
                next: None,
                link: AvlLink::detached(),
                prev_dup: None,
                next_dup: None,
            });
            let mut tree = reg(region).free;
            // The sole block of a fresh region cannot collide.
            let _ = tree.insert(&mut BySize, block);
            reg(region).free = tree;
        }
        Ok(region)
    }

    /// Initializes the heap over its first region. See
    /// [`Heap::lay_out_region`] for the safety contract.
    ///
    /// # Safety
    ///
    /// As for `lay_out_region`; additionally the heap must not already have
    /// regions (they would be leaked).
    pub unsafe fn init(
        &mut self,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), HeapError> {
        let region = unsafe { Self::lay_out_region(base, size) }?;
        self.first = Some(region);
        Ok(())
    }

    /// Appends another fixed-address region. The new region is consulted
    /// after all existing ones.
    ///
    /// # Safety
    ///
    /// As for [`Heap::init`].
    pub unsafe fn expand(
        &mut self,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), HeapError> {
        let Some(first) = self.first else {
            return unsafe { self.init(base, size) };
        };
        let region = unsafe { Self::lay_out_region(base, size) }?;
        unsafe {
            let old_next = reg(first).next_region;
            reg(region).next_region = old_next;
            reg(first).next_region = Some(region);
        }
        Ok(())
    }

    /// Links `block` into the region's free structures: into the size tree
    /// when its size is new, onto the representative's duplicate chain
    /// otherwise.
    unsafe fn insert_free_block(region: NonNull<RegionHeader>, block: BlockRef) {
        unsafe {
            let mut tree = reg(region).free;
            match tree.insert(&mut BySize, block) {
                Ok(()) => {
                    blk(block).prev_dup = None;
                    blk(block).next_dup = None;
                }
                Err(existing) => {
                    let after = blk(existing).next_dup;
                    blk(block).next_dup = after;
                    blk(block).prev_dup = Some(existing);
                    if let Some(a) = after {
                        blk(a).prev_dup = Some(block);
                    }
                    blk(existing).next_dup = Some(block);
                }
            }
            reg(region).free = tree;
        }
    }

    /// Unlinks a free block from the size tree / duplicate chain, promoting
    /// a duplicate into the tree cell when the block was a representative
    /// with duplicates.
    unsafe fn unlink_free_block(region: NonNull<RegionHeader>, block: BlockRef) {
        unsafe {
            let after = blk(block).next_dup;
            if let Some(before) = blk(block).prev_dup {
                blk(before).next_dup = after;
                if let Some(a) = after {
                    blk(a).prev_dup = Some(before);
                }
            } else {
                let mut tree = reg(region).free;
                match after {
                    None => tree.remove(&mut BySize, block),
                    Some(a) => {
                        tree.exchange(&mut BySize, block, a);
                        blk(a).prev_dup = None;
                    }
                }
                reg(region).free = tree;
            }
        }
    }

    /// Allocates `size` bytes, best-fit across the region chain.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidParameter);
        }
        let needed = size
            .checked_add(ALIGNMENT - 1)
            .map(|v| v & !(ALIGNMENT - 1))
            .and_then(|v| v.checked_add(BLOCK_HDR))
            .ok_or(HeapError::NotEnoughMemory)?;

        let mut cursor = self.first;
        while let Some(region) = cursor {
            unsafe {
                // Best fit: smallest free block whose size covers the
                // request.
                let mut best: Option<BlockRef> = None;
                let mut node = reg(region).free.root();
                while let Some(n) = node {
                    let nsize = blk(n).size;
                    if nsize < needed {
                        node = blk(n).link.right;
                    } else {
                        best = Some(n);
                        if nsize > needed {
                            node = blk(n).link.left;
                        } else {
                            break;
                        }
                    }
                }

                let Some(mut block) = best else {
                    cursor = reg(region).next_region;
                    continue;
                };

                // Prefer a duplicate of the same size; taking it instead of
                // the representative skips a tree rebalance.
                if let Some(dup) = blk(block).next_dup {
                    let after = blk(dup).next_dup;
                    blk(block).next_dup = after;
                    if let Some(a) = after {
                        blk(a).prev_dup = Some(block);
                    }
                    block = dup;
                } else {
                    let mut tree = reg(region).free;
                    tree.remove(&mut BySize, block);
                    reg(region).free = tree;
                }

                // Split when the leftover can hold a header plus at least
                // one aligned allocation unit.
                let bsize = blk(block).size;
                if bsize > needed + BLOCK_HDR + ALIGNMENT {
                    let tail = BlockRef(
                        NonNull::new_unchecked(
                            (block.addr() + needed) as *mut BlockHeader,
                        ),
                    );
                    let old_next = blk(block).next;
                    blk(tail).size = bsize - needed;
                    blk(tail).prev = Some(block);
                    blk(tail).next = old_next;
                    if let Some(nx) = old_next {
                        blk(nx).prev = Some(tail);
                    }
                    blk(block).next = Some(tail);
                    blk(block).size = needed;
                    Self::insert_free_block(region, tail);
                }

                let mut occupied = reg(region).occupied;
                // Address keys are unique; this cannot collide.
                let _ = occupied.insert(&mut ByAddr, block);
                reg(region).occupied = occupied;

                reg(region).free_bytes -= blk(block).size;

                // Zero size is the "occupied" marker.
                blk(block).size = 0;

                return Ok(NonNull::new_unchecked(
                    (block.addr() + BLOCK_HDR) as *mut u8,
                ));
            }
        }

        Err(HeapError::NotEnoughMemory)
    }

    /// Finds the region whose span contains `addr`.
    fn region_of(&self, addr: usize) -> Option<NonNull<RegionHeader>> {
        let mut cursor = self.first;
        while let Some(region) = cursor {
            let base = region.as_ptr() as usize;
            let total = unsafe { reg(region).total };
            if addr > base && addr < base + total {
                return Some(region);
            }
            cursor = unsafe { reg(region).next_region };
        }
        None
    }

    /// Releases a block previously returned by [`Heap::alloc`].
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        let Some(region) = self.region_of(addr) else {
            return Err(HeapError::InvalidBlock);
        };
        if addr < BLOCK_HDR {
            return Err(HeapError::InvalidBlock);
        }

        unsafe {
            let block = BlockRef(NonNull::new_unchecked(
                (addr - BLOCK_HDR) as *mut BlockHeader,
            ));

            // Only addresses in the occupied set may be freed.
            let occupied = reg(region).occupied;
            if occupied
                .search_by(&ByAddr, |n| block.addr().cmp(&n.addr()))
                .is_none()
            {
                return Err(HeapError::InvalidBlock);
            }
            let mut occupied = occupied;
            occupied.remove(&mut ByAddr, block);
            reg(region).occupied = occupied;

            // Recover the block's extent from the physical chain.
            let end = match blk(block).next {
                Some(nx) => nx.addr(),
                None => reg(region).data_end,
            };
            blk(block).size = end - block.addr();
            reg(region).free_bytes += blk(block).size;

            // Merge with each free physical neighbour; the loop runs
            // exactly twice, next first, then prev.
            let mut block = block;
            for check_prev in [false, true] {
                let merge = if check_prev {
                    blk(block).prev
                } else {
                    blk(block).next
                };
                let Some(merge) = merge else { continue };
                if blk(merge).size == 0 {
                    continue;
                }

                Self::unlink_free_block(region, merge);

                // Orient so `block` is the lower of the pair.
                let (lo, hi) = if check_prev {
                    (merge, block)
                } else {
                    (block, merge)
                };
                let hi_next = blk(hi).next;
                if let Some(nx) = hi_next {
                    blk(nx).prev = Some(lo);
                }
                blk(lo).next = hi_next;
                let hi_size = blk(hi).size;
                blk(lo).size += hi_size;
                block = lo;
            }

            Self::insert_free_block(region, block);
        }
        Ok(())
    }

    /// Aggregates capacity over the whole region chain.
    pub fn info(&self) -> HeapInfo {
        let mut out = HeapInfo::default();
        let mut cursor = self.first;
        while let Some(region) = cursor {
            unsafe {
                out.total += reg(region).total;
                out.free += reg(region).free_bytes;
                cursor = reg(region).next_region;
            }
        }
        out
    }

    /// Walks the physical chain of every region checking the structural
    /// invariants: extents tile the data area exactly, free sizes match
    /// extents, no two free blocks are adjacent, and the free-byte counter
    /// agrees with the walk.
    #[cfg(test)]
    fn check_consistency(&self) {
        let mut cursor = self.first;
        while let Some(region) = cursor {
            unsafe {
                let base = region.as_ptr() as usize;
                let data_end = reg(region).data_end;
                let mut at = base + REGION_HDR;
                let mut free_seen = 0usize;
                let mut prev_was_free = false;
                let mut node = Some(BlockRef(NonNull::new_unchecked(
                    at as *mut BlockHeader,
                )));
                while let Some(b) = node {
                    assert_eq!(b.addr(), at, "physical chain gap");
                    let next = blk(b).next;
                    let extent = match next {
                        Some(nx) => nx.addr() - at,
                        None => data_end - at,
                    };
                    let size = blk(b).size;
                    if size != 0 {
                        assert_eq!(size, extent, "free size != extent");
                        assert!(!prev_was_free, "adjacent free blocks");
                        free_seen += size;
                        prev_was_free = true;
                    } else {
                        prev_was_free = false;
                    }
                    at += extent;
                    node = next;
                }
                assert_eq!(at, data_end, "blocks do not tile the region");
                assert_eq!(
                    free_seen,
                    reg(region).free_bytes,
                    "free byte counter drifted"
                );
                cursor = reg(region).next_region;
            }
        }
    }
}
