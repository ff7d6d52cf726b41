use super::bucket::{
    chunks_for_size, Bucket, FreeBits, CHUNKS_PER_PAGE, CHUNK_SIZE, MAX_SMALL_ALLOC,
};
use super::code_pools::{decommit_range, protect_range, CodePagePools, PoolsGuard};
use super::page_pool::{SegmentHandle, UnwindAllocation};
use super::stats;
use super::trap;
use super::vm::{PlatformVmOps, Protection, VmOps};
use crate::sync::Arc;
use std::fmt;
use std::ptr::NonNull;

const NUM_SUB_PAGE_BUCKETS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The underlying pools could not serve the request (or the size
    /// arithmetic overflowed). The heap's state is unchanged.
    OutOfMemory,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "code heap out of memory"),
        }
    }
}

impl std::error::Error for HeapError {}

/// One OS page dedicated to sub-page code allocation.
///
/// Only the first [`MAX_SMALL_ALLOC`] bytes are chunked; on systems with
/// pages larger than 4 KiB the tail is never sub-allocated.
pub(crate) struct Page {
    address: NonNull<u8>,
    segment: SegmentHandle,
    free_bits: FreeBits,
    current_bucket: Bucket,
    is_decommitted: bool,
    /// Unwind blocks of the live allocations on this page. Bulk teardown
    /// releases these without the individual allocation records.
    unwind_blocks: Vec<UnwindAllocation>,
}

// Safety: Page is a bookkeeping record; the pools own the memory.
unsafe impl Send for Page {}

impl Page {
    fn new(address: NonNull<u8>, segment: SegmentHandle, bucket: Bucket) -> Self {
        Self {
            address,
            segment,
            free_bits: FreeBits::FULL,
            current_bucket: bucket,
            is_decommitted: false,
            unwind_blocks: Vec::new(),
        }
    }

    #[inline]
    fn has_no_space(&self) -> bool {
        self.free_bits.is_exhausted()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.free_bits.is_full()
    }

    /// True when a run long enough for one allocation of `bucket` is free.
    #[inline]
    fn can_allocate(&self, bucket: Bucket) -> bool {
        self.free_bits.has_run(bucket.chunk_count())
    }

    fn contains(&self, addr: usize, page_size: usize) -> bool {
        let base = self.address.as_ptr() as usize;
        addr >= base && addr < base + page_size
    }
}

#[derive(Debug)]
enum AllocKind {
    Small {
        /// Base address of the owning page (non-owning back reference).
        page: NonNull<u8>,
    },
    Large {
        segment: SegmentHandle,
        page_count: usize,
    },
}

/// A handed-out executable region.
///
/// Owned by the caller until returned via [`CodeHeap::free`] or
/// [`CodeHeap::decommit`]. Dropping the record without returning it leaks
/// the underlying chunks.
#[derive(Debug)]
pub struct Allocation {
    kind: AllocKind,
    address: NonNull<u8>,
    size: usize,
    unwind: Option<UnwindAllocation>,
}

// Safety: Allocation is a descriptor; the heap and pools own the memory.
unsafe impl Send for Allocation {}

impl Allocation {
    #[inline]
    #[must_use]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_large(&self) -> bool {
        matches!(self.kind, AllocKind::Large { .. })
    }

    /// Whole pages spanned. Large allocations only.
    #[must_use]
    pub fn page_count(&self) -> usize {
        match self.kind {
            AllocKind::Large { page_count, .. } => page_count,
            AllocKind::Small { .. } => {
                debug_assert!(false, "page_count on a sub-page allocation");
                0
            }
        }
    }

    /// Unwind data block tied to this allocation, if one was requested.
    #[inline]
    #[must_use]
    pub fn unwind(&self) -> Option<&UnwindAllocation> {
        self.unwind.as_ref()
    }
}

/// A live or decommitted whole-page allocation, tracked by the heap.
struct LargeObject {
    address: NonNull<u8>,
    segment: SegmentHandle,
    page_count: usize,
    is_decommitted: bool,
    unwind: Option<UnwindAllocation>,
}

// Safety: bookkeeping record only.
unsafe impl Send for LargeObject {}

impl LargeObject {
    fn contains(&self, addr: usize, page_size: usize) -> bool {
        let base = self.address.as_ptr() as usize;
        addr >= base && addr < base + self.page_count * page_size
    }
}

/// Bucketed executable-code heap.
///
/// Sub-page allocations are packed into 128-byte chunks inside shared pages;
/// anything larger than [`MAX_SMALL_ALLOC`] gets whole pages of its own.
/// Pages hand back to the pools lazily: an individually freed page is
/// decommitted and kept for recommit, a torn-down heap releases outright.
///
/// Single writer. Heaps sharing one [`CodePagePools`] serialize on its lock,
/// which every mutating operation acquires for its whole duration.
pub struct CodeHeap {
    pools: Arc<CodePagePools>,
    /// Partially-filled pages, indexed by bucket ordinal.
    buckets: [Vec<Page>; NUM_SUB_PAGE_BUCKETS],
    /// Pages with no space (or on a secondary-exhausted segment).
    full_pages: [Vec<Page>; NUM_SUB_PAGE_BUCKETS],
    large_objects: Vec<LargeObject>,
    decommitted_pages: Vec<Page>,
    decommitted_large: Vec<LargeObject>,
}

struct SecondaryExhausted;

impl CodeHeap {
    #[must_use]
    pub fn new(pools: Arc<CodePagePools>) -> Self {
        Self {
            pools,
            buckets: Default::default(),
            full_pages: Default::default(),
            large_objects: Vec::new(),
            decommitted_pages: Vec::new(),
            decommitted_large: Vec::new(),
        }
    }

    /// Allocate `bytes` of executable memory.
    ///
    /// The returned region is published (`ExecuteRead`); flip it writable
    /// with [`protect_allocation_with_execute_read_write`]
    /// (CodeHeap::protect_allocation_with_execute_read_write) before
    /// emitting into it.
    ///
    /// `pdata_count`/`xdata_size` request an unwind data block on the owning
    /// segment (requires secondary data enabled on the pools). With
    /// `prefer_pre_reserved`, placement tries the pre-reserved region first;
    /// whenever JIT code (`is_jit`) ends up outside it,
    /// `all_jit_in_pre_reserved` is cleared.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` when neither pool can serve the request. The
    /// heap's state is unchanged on failure.
    pub fn alloc(
        &mut self,
        bytes: usize,
        pdata_count: u16,
        xdata_size: u16,
        prefer_pre_reserved: bool,
        is_jit: bool,
        all_jit_in_pre_reserved: &mut bool,
    ) -> Result<Allocation, HeapError> {
        debug_assert!(bytes > 0);
        debug_assert!(
            (pdata_count == 0 && xdata_size == 0) || self.pools.secondary_enabled(),
            "unwind data requested but secondary data is disabled"
        );

        if bytes > MAX_SMALL_ALLOC {
            return self.alloc_large(
                bytes,
                pdata_count,
                xdata_size,
                prefer_pre_reserved,
                is_jit,
                all_jit_in_pre_reserved,
            );
        }

        let bucket = Bucket::for_size(bytes);
        let ord = bucket.ordinal();
        let pools = Arc::clone(&self.pools);
        let secondary_enabled = pools.secondary_enabled();
        let mut guard = pools.lock();

        let mut created_new_page = false;
        loop {
            let pos = match self.buckets[ord]
                .iter()
                .position(|p| p.can_allocate(bucket))
            {
                Some(pos) => Some(pos),
                None => self.split_page_for(bucket),
            };
            let pos = match pos {
                Some(pos) => pos,
                None => {
                    created_new_page = true;
                    match self.alloc_new_page(
                        bucket,
                        &mut guard,
                        prefer_pre_reserved,
                        is_jit,
                        all_jit_in_pre_reserved,
                    ) {
                        Some(pos) => pos,
                        None => return Err(HeapError::OutOfMemory),
                    }
                }
            };

            match Self::alloc_in_page(
                &mut self.buckets[ord][pos],
                bytes,
                pdata_count,
                xdata_size,
                &mut guard,
            ) {
                Ok(allocation) => {
                    let page = &self.buckets[ord][pos];
                    if Self::should_be_in_full_list(page, &guard, secondary_enabled) {
                        let page = self.buckets[ord].swap_remove(pos);
                        self.full_pages[ord].push(page);
                    }
                    return Ok(allocation);
                }
                Err(SecondaryExhausted) => {
                    // The segment cannot host another unwind block; the page
                    // is done taking unwind-bearing allocations. Park it and
                    // try elsewhere.
                    let page = self.buckets[ord].swap_remove(pos);
                    self.full_pages[ord].push(page);
                    if created_new_page {
                        // A fresh page did not help; its segment's slab is
                        // simply too small for this request.
                        return Err(HeapError::OutOfMemory);
                    }
                }
            }
        }
    }

    /// Carve one allocation out of `page`. On unwind-block failure the chunk
    /// bits are rolled back and the page is left untouched.
    fn alloc_in_page(
        page: &mut Page,
        bytes: usize,
        pdata_count: u16,
        xdata_size: u16,
        pools: &mut PoolsGuard<'_>,
    ) -> Result<Allocation, SecondaryExhausted> {
        debug_assert!(!page.is_decommitted);
        let chunks = chunks_for_size(bytes);
        let Some(index) = page.free_bits.first_run_of_ones(chunks) else {
            debug_assert!(false, "page was reported allocatable");
            // Safety: Unreachable logic; callers check can_allocate first.
            unsafe { std::hint::unreachable_unchecked() }
        };
        page.free_bits.mark_busy(index, chunks);

        // Safety: index + chunks <= 32, so the range stays inside the page.
        let address =
            unsafe { NonNull::new_unchecked(page.address.as_ptr().add(index as usize * CHUNK_SIZE)) };

        let unwind = if pdata_count > 0 || xdata_size > 0 {
            match pools.alloc_secondary(page.segment, address, bytes, pdata_count, xdata_size) {
                Some(block) => {
                    page.unwind_blocks.push(block);
                    Some(block)
                }
                None => {
                    page.free_bits.mark_free(index, chunks);
                    return Err(SecondaryExhausted);
                }
            }
        } else {
            None
        };

        stats::CODE_LIVE.add(chunks as usize * CHUNK_SIZE);
        log::trace!(
            "alloc {} bytes ({} chunk(s)) at {:p} on page {:p}",
            bytes,
            chunks,
            address,
            page.address
        );
        Ok(Allocation {
            kind: AllocKind::Small { page: page.address },
            address,
            size: bytes,
            unwind,
        })
    }

    /// Repurpose a page from a larger bucket that still holds a long enough
    /// free run — a page parked for 256-byte objects can serve a 128-byte
    /// request. The move is logical only: existing allocations stay put.
    /// Returns the page's position in the target bucket list.
    fn split_page_for(&mut self, bucket: Bucket) -> Option<usize> {
        let target = bucket.ordinal();
        let chunks = bucket.chunk_count();
        for ord in target + 1..NUM_SUB_PAGE_BUCKETS {
            if let Some(pos) = self.buckets[ord]
                .iter()
                .position(|p| p.free_bits.has_run(chunks))
            {
                let mut page = self.buckets[ord].swap_remove(pos);
                log::trace!(
                    "splitting page {:p}: {:?} -> {:?}",
                    page.address,
                    page.current_bucket,
                    bucket
                );
                page.current_bucket = bucket;
                self.buckets[target].push(page);
                return Some(self.buckets[target].len() - 1);
            }
        }
        None
    }

    /// Put a fresh (or recommitted) page into `buckets[bucket]`, published
    /// read-execute. Returns its position, or `None` when both pools failed.
    fn alloc_new_page(
        &mut self,
        bucket: Bucket,
        pools: &mut PoolsGuard<'_>,
        prefer_pre_reserved: bool,
        is_jit: bool,
        all_jit_in_pre_reserved: &mut bool,
    ) -> Option<usize> {
        let ord = bucket.ordinal();

        // Resurrect a decommitted page before asking the pools for more.
        while let Some(mut page) = self.decommitted_pages.pop() {
            debug_assert!(page.unwind_blocks.is_empty());
            if pools.recommit_pages(page.address, 1, page.segment) {
                protect_range(page.address, 1, Protection::ExecuteRead, Protection::ReadWrite);
                page.is_decommitted = false;
                page.free_bits = FreeBits::FULL;
                page.current_bucket = bucket;
                log::trace!("recommitted page {:p} for {:?}", page.address, bucket);
                self.buckets[ord].push(page);
                return Some(self.buckets[ord].len() - 1);
            }
            // Recommit refused: surrender the record and its range.
            pools.release_decommitted(page.address, 1, page.segment);
        }

        let (address, segment) =
            pools.alloc_pages(1, prefer_pre_reserved, is_jit, all_jit_in_pre_reserved)?;
        protect_range(address, 1, Protection::ExecuteRead, Protection::ReadWrite);
        self.buckets[ord].push(Page::new(address, segment, bucket));
        Some(self.buckets[ord].len() - 1)
    }

    fn should_be_in_full_list(
        page: &Page,
        pools: &PoolsGuard<'_>,
        secondary_enabled: bool,
    ) -> bool {
        page.has_no_space() || (secondary_enabled && !pools.can_alloc_secondary(page.segment))
    }

    fn alloc_large(
        &mut self,
        bytes: usize,
        pdata_count: u16,
        xdata_size: u16,
        prefer_pre_reserved: bool,
        is_jit: bool,
        all_jit_in_pre_reserved: &mut bool,
    ) -> Result<Allocation, HeapError> {
        let page_size = PlatformVmOps::page_size();
        let page_count = bytes
            .checked_add(page_size - 1)
            .ok_or(HeapError::OutOfMemory)?
            / page_size;
        let size = page_count * page_size;

        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        // A decommitted range of the exact span is the cheapest source.
        let (address, segment) = match self.take_decommitted_large(page_count, &mut guard) {
            Some(range) => range,
            None => guard
                .alloc_pages(page_count, prefer_pre_reserved, is_jit, all_jit_in_pre_reserved)
                .ok_or(HeapError::OutOfMemory)?,
        };

        let unwind = if pdata_count > 0 || xdata_size > 0 {
            match guard.alloc_secondary(segment, address, size, pdata_count, xdata_size) {
                Some(block) => Some(block),
                None => {
                    guard.release_pages(address, page_count, segment);
                    return Err(HeapError::OutOfMemory);
                }
            }
        } else {
            None
        };

        protect_range(address, page_count, Protection::ExecuteRead, Protection::ReadWrite);
        self.large_objects.push(LargeObject {
            address,
            segment,
            page_count,
            is_decommitted: false,
            unwind,
        });
        stats::CODE_LIVE.add(size);
        log::trace!("large alloc: {} page(s) at {:p}", page_count, address);
        Ok(Allocation {
            kind: AllocKind::Large {
                segment,
                page_count,
            },
            address,
            size,
            unwind,
        })
    }

    /// Recommit a decommitted large range of exactly `page_count` pages.
    fn take_decommitted_large(
        &mut self,
        page_count: usize,
        pools: &mut PoolsGuard<'_>,
    ) -> Option<(NonNull<u8>, SegmentHandle)> {
        let pos = self
            .decommitted_large
            .iter()
            .position(|l| l.page_count == page_count)?;
        let obj = self.decommitted_large.swap_remove(pos);
        debug_assert!(obj.is_decommitted);
        debug_assert!(obj.unwind.is_none());
        if pools.recommit_pages(obj.address, obj.page_count, obj.segment) {
            Some((obj.address, obj.segment))
        } else {
            pools.release_decommitted(obj.address, obj.page_count, obj.segment);
            None
        }
    }

    /// Return an allocation. The freed range is trap-filled so stale jumps
    /// fault instead of running garbage. An emptied page is decommitted and
    /// kept for recommit; a page still holding code stays published.
    pub fn free(&mut self, allocation: Allocation) {
        match allocation.kind {
            AllocKind::Large { .. } => self.free_large(allocation),
            AllocKind::Small { page } => self.free_small(allocation, page),
        }
    }

    fn free_small(&mut self, allocation: Allocation, page_base: NonNull<u8>) {
        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        let Some((ord, pos, was_full)) = self.locate_page(page_base) else {
            debug_assert!(false, "free of an allocation the heap does not own");
            return;
        };

        let chunks = chunks_for_size(allocation.size);
        let offset = allocation.address.as_ptr() as usize - page_base.as_ptr() as usize;
        debug_assert!(offset.is_multiple_of(CHUNK_SIZE));
        // Chunk indices fit in 6 bits.
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset / CHUNK_SIZE) as u32;

        let (segment, becomes_empty) = {
            let page = if was_full {
                &self.full_pages[ord][pos]
            } else {
                &self.buckets[ord][pos]
            };
            debug_assert!(!page.is_decommitted);
            debug_assert!(page.free_bits.is_run_busy(index, chunks));
            let mut after = page.free_bits;
            after.mark_free(index, chunks);
            (page.segment, after.is_full())
        };

        // Whole-page teardown can drop execute entirely; a partial free must
        // keep sibling functions runnable while we scribble.
        let writable = if becomes_empty {
            Protection::ReadWrite
        } else {
            Protection::ExecuteReadWrite
        };
        protect_range(page_base, 1, writable, Protection::ExecuteRead);
        // Safety: the range belongs to the allocation being freed and the
        // page is writable.
        unsafe {
            trap::fill_trap(std::slice::from_raw_parts_mut(
                allocation.address.as_ptr(),
                allocation.size,
            ));
        }
        if !becomes_empty {
            protect_range(page_base, 1, Protection::ExecuteRead, writable);
        }

        {
            let page = if was_full {
                &mut self.full_pages[ord][pos]
            } else {
                &mut self.buckets[ord][pos]
            };
            page.free_bits.mark_free(index, chunks);
            if let Some(block) = allocation.unwind {
                match page.unwind_blocks.iter().position(|b| *b == block) {
                    Some(tracked) => {
                        page.unwind_blocks.swap_remove(tracked);
                    }
                    None => debug_assert!(false, "unwind block not tracked on its owning page"),
                }
                guard.release_secondary(segment, block);
            }
        }
        stats::sub_saturating(&stats::CODE_LIVE, chunks as usize * CHUNK_SIZE);
        log::trace!(
            "freed {} bytes at {:p} on page {:p}",
            allocation.size,
            allocation.address,
            page_base
        );

        // Back to service, or out the door.
        let mut pos = pos;
        if was_full {
            let page = self.full_pages[ord].swap_remove(pos);
            self.buckets[ord].push(page);
            pos = self.buckets[ord].len() - 1;
        }
        if becomes_empty {
            let mut page = self.buckets[ord].swap_remove(pos);
            debug_assert!(page.unwind_blocks.is_empty());
            // Individually freed pages are reclaimed lazily: drop the
            // backing, keep the record for recommit.
            decommit_range(page.address, 1);
            guard.track_decommitted_pages(page.address, 1, page.segment);
            page.is_decommitted = true;
            self.decommitted_pages.push(page);
        }
    }

    fn free_large(&mut self, allocation: Allocation) {
        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        let Some(pos) = self
            .large_objects
            .iter()
            .position(|l| l.address == allocation.address)
        else {
            debug_assert!(false, "free of a large allocation the heap does not own");
            return;
        };
        let obj = self.large_objects.swap_remove(pos);
        debug_assert_eq!(obj.page_count, allocation.page_count());
        debug_assert_eq!(obj.unwind, allocation.unwind);

        protect_range(
            obj.address,
            obj.page_count,
            Protection::ReadWrite,
            Protection::ExecuteRead,
        );
        // Safety: the whole range belongs to the freed allocation.
        unsafe {
            trap::fill_trap(std::slice::from_raw_parts_mut(
                obj.address.as_ptr(),
                allocation.size,
            ));
        }

        if let Some(block) = obj.unwind {
            guard.release_secondary(obj.segment, block);
        }
        guard.release_pages(obj.address, obj.page_count, obj.segment);
        stats::sub_saturating(
            &stats::CODE_LIVE,
            obj.page_count * PlatformVmOps::page_size(),
        );
        log::trace!("freed large: {} page(s) at {:p}", obj.page_count, obj.address);
    }

    /// Like [`free`](CodeHeap::free), but the pages are decommitted rather
    /// than released; their records are retained and may be recommitted by a
    /// later allocation of matching shape.
    pub fn decommit(&mut self, allocation: Allocation) {
        match allocation.kind {
            // For a sub-page allocation this coincides with `free`: the page
            // is decommitted exactly when it empties.
            AllocKind::Small { page } => self.free_small(allocation, page),
            AllocKind::Large { .. } => self.decommit_large(allocation),
        }
    }

    fn decommit_large(&mut self, allocation: Allocation) {
        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        let Some(pos) = self
            .large_objects
            .iter()
            .position(|l| l.address == allocation.address)
        else {
            debug_assert!(false, "decommit of a large allocation the heap does not own");
            return;
        };
        let mut obj = self.large_objects.swap_remove(pos);
        debug_assert_eq!(obj.unwind, allocation.unwind);

        if let Some(block) = obj.unwind.take() {
            guard.release_secondary(obj.segment, block);
        }
        // No trap fill: a decommitted range has no access at all, which is
        // stronger than a trap.
        decommit_range(obj.address, obj.page_count);
        guard.track_decommitted_pages(obj.address, obj.page_count, obj.segment);
        stats::sub_saturating(
            &stats::CODE_LIVE,
            obj.page_count * PlatformVmOps::page_size(),
        );
        obj.is_decommitted = true;
        self.decommitted_large.push(obj);
    }

    /// Tear down everything this heap tracks. Pages still holding code are
    /// decommitted on their way out; empty and decommitted ones are handed
    /// straight back. Outstanding `Allocation` records become stale.
    pub fn free_all(&mut self) {
        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        for page in self.decommitted_pages.drain(..) {
            debug_assert!(page.unwind_blocks.is_empty());
            guard.release_decommitted(page.address, 1, page.segment);
        }
        for obj in self.decommitted_large.drain(..) {
            debug_assert!(obj.unwind.is_none());
            guard.release_decommitted(obj.address, obj.page_count, obj.segment);
        }

        let page_size = PlatformVmOps::page_size();
        for obj in self.large_objects.drain(..) {
            if let Some(block) = obj.unwind {
                guard.release_secondary(obj.segment, block);
            }
            stats::sub_saturating(&stats::CODE_LIVE, obj.page_count * page_size);
            decommit_range(obj.address, obj.page_count);
            guard.track_decommitted_pages(obj.address, obj.page_count, obj.segment);
            guard.release_decommitted(obj.address, obj.page_count, obj.segment);
        }

        for ord in 0..NUM_SUB_PAGE_BUCKETS {
            let pages = self.buckets[ord]
                .drain(..)
                .chain(self.full_pages[ord].drain(..));
            for page in pages {
                Self::surrender_page(page, &mut guard, true);
            }
        }
        log::debug!("code heap flushed");
    }

    /// Give a bucket page back to the pools. Outstanding unwind blocks go
    /// back to their slab first — the segment may outlive this heap. With
    /// `lazy`, occupied pages are decommitted; the destructor path releases
    /// outright.
    fn surrender_page(mut page: Page, guard: &mut PoolsGuard<'_>, lazy: bool) {
        for block in page.unwind_blocks.drain(..) {
            guard.release_secondary(page.segment, block);
        }
        if !page.is_empty() {
            let busy = CHUNKS_PER_PAGE - page.free_bits.count_free();
            stats::sub_saturating(&stats::CODE_LIVE, busy as usize * CHUNK_SIZE);
            if lazy {
                decommit_range(page.address, 1);
                guard.track_decommitted_pages(page.address, 1, page.segment);
                guard.release_decommitted(page.address, 1, page.segment);
                return;
            }
        }
        guard.release_pages(page.address, 1, page.segment);
    }

    /// True iff `addr` lies within a page owned by any heap list or within a
    /// live or decommitted large allocation.
    #[must_use]
    pub fn is_in_heap(&self, addr: *const u8) -> bool {
        let page_size = PlatformVmOps::page_size();
        let a = addr as usize;
        self.buckets
            .iter()
            .chain(self.full_pages.iter())
            .any(|list| list.iter().any(|p| p.contains(a, page_size)))
            || self.decommitted_pages.iter().any(|p| p.contains(a, page_size))
            || self.large_objects.iter().any(|l| l.contains(a, page_size))
            || self.decommitted_large.iter().any(|l| l.contains(a, page_size))
    }

    /// Flip the protection of an allocation (the owning page for sub-page
    /// allocations, the whole range for large ones).
    ///
    /// # Panics
    ///
    /// Panics when the OS refuses the transition; see the pools' protection
    /// contract.
    pub fn protect_allocation(
        &self,
        allocation: &Allocation,
        new: Protection,
        expected_old: Protection,
    ) {
        match allocation.kind {
            AllocKind::Small { page } => protect_range(page, 1, new, expected_old),
            AllocKind::Large { page_count, .. } => {
                protect_range(allocation.address, page_count, new, expected_old);
            }
        }
    }

    /// Open a patch window: published -> writable-and-executable.
    pub fn protect_allocation_with_execute_read_write(&self, allocation: &Allocation) {
        self.protect_allocation(
            allocation,
            Protection::ExecuteReadWrite,
            Protection::ExecuteRead,
        );
    }

    /// Close the patch window: writable-and-executable -> published.
    pub fn protect_allocation_with_execute_read_only(&self, allocation: &Allocation) {
        self.protect_allocation(
            allocation,
            Protection::ExecuteRead,
            Protection::ExecuteReadWrite,
        );
    }

    /// Snapshot the global heap counters.
    #[must_use]
    pub fn stats(&self) -> stats::HeapStats {
        stats::snapshot()
    }

    fn locate_page(&self, base: NonNull<u8>) -> Option<(usize, usize, bool)> {
        for ord in 0..NUM_SUB_PAGE_BUCKETS {
            if let Some(pos) = self.buckets[ord].iter().position(|p| p.address == base) {
                return Some((ord, pos, false));
            }
            if let Some(pos) = self.full_pages[ord].iter().position(|p| p.address == base) {
                return Some((ord, pos, true));
            }
        }
        None
    }

    /// List-membership invariants, checked from tests.
    #[cfg(test)]
    fn assert_list_invariants(&self) {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for ord in 0..NUM_SUB_PAGE_BUCKETS {
            for page in &self.buckets[ord] {
                assert_eq!(page.current_bucket.ordinal(), ord);
                assert!(!page.is_decommitted);
                assert!(seen.insert(page.address), "page on two lists");
            }
            for page in &self.full_pages[ord] {
                assert_eq!(page.current_bucket.ordinal(), ord);
                assert!(!page.is_decommitted);
                assert!(seen.insert(page.address), "page on two lists");
            }
        }
        for page in &self.decommitted_pages {
            assert!(page.is_decommitted);
            assert!(seen.insert(page.address), "page on two lists");
        }
    }
}

impl Drop for CodeHeap {
    fn drop(&mut self) {
        let pools = Arc::clone(&self.pools);
        let mut guard = pools.lock();

        for page in self.decommitted_pages.drain(..) {
            debug_assert!(page.unwind_blocks.is_empty());
            guard.release_decommitted(page.address, 1, page.segment);
        }
        for obj in self.decommitted_large.drain(..) {
            debug_assert!(obj.unwind.is_none());
            guard.release_decommitted(obj.address, obj.page_count, obj.segment);
        }
        let page_size = PlatformVmOps::page_size();
        for obj in self.large_objects.drain(..) {
            if let Some(block) = obj.unwind {
                guard.release_secondary(obj.segment, block);
            }
            stats::sub_saturating(&stats::CODE_LIVE, obj.page_count * page_size);
            guard.release_pages(obj.address, obj.page_count, obj.segment);
        }
        for ord in 0..NUM_SUB_PAGE_BUCKETS {
            let pages = self.buckets[ord]
                .drain(..)
                .chain(self.full_pages[ord].drain(..));
            for page in pages {
                Self::surrender_page(page, &mut guard, false);
            }
        }
    }
}
