use super::stats;
use super::vm::{PlatformVmOps, Protection, VmError, VmOps};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Default pages per segment reservation.
pub(crate) const SEGMENT_PAGES: usize = 64;

/// Bytes per function-table entry in an unwind slab, 8-byte aligned.
const UNWIND_RECORD_SIZE: u32 = 16;

/// Which of the two code page pools a segment belongs to. Immutable for the
/// segment's whole life, so it can be read without the pools lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PoolKind {
    General,
    PreReserved,
}

/// Identifies a segment within one of the two code page pools.
///
/// Copyable, non-owning. The pool that minted the handle owns the segment;
/// pages and allocations carry the handle back to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegmentHandle {
    pub(crate) kind: PoolKind,
    pub(crate) index: u32,
}

impl SegmentHandle {
    /// True when the segment was carved from the pre-reserved region.
    #[inline]
    #[must_use]
    pub fn is_pre_reserved(self) -> bool {
        self.kind == PoolKind::PreReserved
    }
}

/// A block of unwind data carved from a segment's unwind slab.
///
/// The block lives exactly as long as the code allocation it describes; the
/// heap releases it when the code is freed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UnwindAllocation {
    address: NonNull<u8>,
    offset: u32,
    size: u32,
}

impl UnwindAllocation {
    #[inline]
    #[must_use]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }
}

// Safety: UnwindAllocation is a descriptor; the slab owns the memory.
unsafe impl Send for UnwindAllocation {}

/// Per-segment arena for unwind/exception data.
///
/// A single committed reservation, bump-allocated with a first-fit free list.
/// Code allocations with pdata/xdata requests draw from the slab of their own
/// segment, so unwind data stays close to the code it describes and dies with
/// the segment.
struct UnwindSlab {
    base: NonNull<u8>,
    size: u32,
    cursor: u32,
    /// Freed blocks as (offset, size), reused first-fit.
    free_list: Vec<(u32, u32)>,
}

impl UnwindSlab {
    fn new(size: usize) -> Result<Self, VmError> {
        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(size)? };
        // Safety: FFI call to commit memory; the range was just reserved.
        if let Err(e) = unsafe { PlatformVmOps::commit(base, size) } {
            // Safety: releasing the reservation we just made.
            unsafe { drop(PlatformVmOps::release(base, size)) };
            return Err(e);
        }
        stats::TOTAL_RESERVED.add(size);
        stats::TOTAL_COMMITTED.add(size);
        stats::UNWIND_COMMITTED.add(size);
        Ok(Self {
            base,
            // Slab sizes are small (a few KiB); u32 offsets are plenty.
            #[allow(clippy::cast_possible_truncation)]
            size: size as u32,
            cursor: 0,
            free_list: Vec::new(),
        })
    }

    fn block_bytes(pdata_count: u16, xdata_size: u16) -> u32 {
        let raw = u32::from(pdata_count) * UNWIND_RECORD_SIZE + u32::from(xdata_size);
        raw.max(UNWIND_RECORD_SIZE).next_multiple_of(8)
    }

    /// A minimal record still fits somewhere in the slab.
    fn can_alloc(&self) -> bool {
        !self.free_list.is_empty() || self.size - self.cursor >= UNWIND_RECORD_SIZE
    }

    fn alloc(&mut self, pdata_count: u16, xdata_size: u16) -> Option<UnwindAllocation> {
        debug_assert!(pdata_count > 0 || xdata_size > 0);
        let bytes = Self::block_bytes(pdata_count, xdata_size);

        // First fit from the free list; a larger block donates its tail back.
        if let Some(pos) = self.free_list.iter().position(|&(_, s)| s >= bytes) {
            let (offset, found) = self.free_list.swap_remove(pos);
            if found > bytes {
                self.free_list.push((offset + bytes, found - bytes));
            }
            return Some(self.descriptor(offset, bytes));
        }

        if self.size - self.cursor >= bytes {
            let offset = self.cursor;
            self.cursor += bytes;
            return Some(self.descriptor(offset, bytes));
        }

        None
    }

    fn descriptor(&self, offset: u32, size: u32) -> UnwindAllocation {
        // Safety: offset < self.size, within the slab's committed reservation.
        let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) };
        UnwindAllocation {
            address,
            offset,
            size,
        }
    }

    fn release(&mut self, block: UnwindAllocation) {
        debug_assert!(block.offset + block.size <= self.cursor);
        debug_assert!(
            !self.free_list.iter().any(|&(o, _)| o == block.offset),
            "double free of unwind block at offset {}",
            block.offset
        );
        self.free_list.push((block.offset, block.size));
    }
}

impl Drop for UnwindSlab {
    fn drop(&mut self) {
        // Safety: the slab owns its reservation.
        unsafe {
            drop(PlatformVmOps::release(self.base, self.size as usize));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.size as usize);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, self.size as usize);
        stats::sub_saturating(&stats::UNWIND_COMMITTED, self.size as usize);
    }
}

/// One contiguous multi-page reservation.
///
/// Each page is in one of four states, tracked by two bitsets:
///
/// | `free` | `committed` | state |
/// |--------|-------------|-------|
/// | 1      | 0           | virgin (never committed) |
/// | 0      | 1           | handed out |
/// | 1      | 1           | returned, backing retained |
/// | 0      | 0           | decommit-tracked (handed out, backing dropped) |
struct Segment {
    base: NonNull<u8>,
    page_count: usize,
    free: FixedBitSet,
    committed: FixedBitSet,
    /// General-pool segments own their reservation; pre-reserved segments are
    /// carved from the pool's region and give their range back on teardown.
    owns_reservation: bool,
    unwind: Option<UnwindSlab>,
}

// Safety: Segment owns (or exclusively manages) its memory range.
unsafe impl Send for Segment {}

impl Segment {
    fn new(
        base: NonNull<u8>,
        page_count: usize,
        owns_reservation: bool,
        unwind: Option<UnwindSlab>,
    ) -> Self {
        let mut free = FixedBitSet::with_capacity(page_count);
        free.insert_range(..);
        Self {
            base,
            page_count,
            free,
            committed: FixedBitSet::with_capacity(page_count),
            owns_reservation,
            unwind,
        }
    }

    fn page_index(&self, addr: NonNull<u8>, page_size: usize) -> usize {
        let offset = addr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(offset < self.page_count * page_size);
        debug_assert!(offset.is_multiple_of(page_size));
        offset / page_size
    }

    fn page_addr(&self, index: usize, page_size: usize) -> NonNull<u8> {
        debug_assert!(index < self.page_count);
        // Safety: index is within the segment's reserved range.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * page_size)) }
    }

    /// Lowest start index of `n` consecutive free pages.
    fn find_free_run(&self, n: usize) -> Option<usize> {
        if n > self.page_count {
            return None;
        }
        let mut run = 0;
        for i in 0..self.page_count {
            if self.free.contains(i) {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// No pages handed out or decommit-tracked.
    fn is_idle(&self) -> bool {
        self.free.count_ones(..) == self.page_count
    }

    fn committed_bytes(&self, page_size: usize) -> usize {
        self.committed.count_ones(..) * page_size
    }
}

/// The pre-reserved region: one large contiguous reservation made at startup
/// so JIT code stays within a single short-displacement range. Segments are
/// carved by bumping a cursor; idle segment ranges are recycled because the
/// address space can never be unreserved.
struct Region {
    base: NonNull<u8>,
    size: usize,
    cursor: usize,
    recycled: Vec<(NonNull<u8>, usize)>,
}

// Safety: Region owns its reservation.
unsafe impl Send for Region {}

impl Region {
    /// Carve a range of at least `pages` pages, reusing an idle range first.
    /// Returns the range base and its page count (may exceed the request).
    fn carve(&mut self, pages: usize, page_size: usize) -> Option<(NonNull<u8>, usize)> {
        if let Some(pos) = self.recycled.iter().position(|&(_, pc)| pc >= pages) {
            return Some(self.recycled.swap_remove(pos));
        }
        let bytes = pages.checked_mul(page_size)?;
        if self.cursor.checked_add(bytes)? > self.size {
            return None;
        }
        // Safety: cursor + bytes lies within the region reservation.
        let base = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.cursor)) };
        self.cursor += bytes;
        Some((base, pages))
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: the region owns its reservation.
        unsafe {
            drop(PlatformVmOps::release(self.base, self.size));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.size);
    }
}

/// One underlying code page allocator: reserves segments, commits pages on
/// demand, and tracks free/decommitted pages per segment.
///
/// Pages handed out by [`alloc_pages`](PagePool::alloc_pages) are always
/// committed and writable; protection hand-off to executable is the heap's
/// business.
pub(crate) struct PagePool {
    kind: PoolKind,
    page_size: usize,
    segment_pages: usize,
    secondary_enabled: bool,
    unwind_slab_size: usize,
    /// Index-stable slab; `None` marks a released segment. Handles embed the
    /// index, so slots are never reused while any page of the old segment
    /// could still be referenced.
    segments: Vec<Option<Segment>>,
    /// `PreReserved` only.
    region: Option<Region>,
}

// Safety: PagePool owns all its segments' memory.
unsafe impl Send for PagePool {}

impl PagePool {
    pub(crate) fn general(
        segment_pages: usize,
        secondary_enabled: bool,
        unwind_slab_size: usize,
    ) -> Self {
        Self {
            kind: PoolKind::General,
            page_size: PlatformVmOps::page_size(),
            segment_pages,
            secondary_enabled,
            unwind_slab_size,
            segments: Vec::new(),
            region: None,
        }
    }

    /// Reserve the whole pre-reserved region up front.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the address-space reservation fails.
    pub(crate) fn pre_reserved(
        region_size: usize,
        segment_pages: usize,
        secondary_enabled: bool,
        unwind_slab_size: usize,
    ) -> Result<Self, VmError> {
        let page_size = PlatformVmOps::page_size();
        let region_size = region_size.next_multiple_of(page_size);
        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(region_size)? };
        stats::TOTAL_RESERVED.add(region_size);
        log::debug!(
            "pre-reserved code region: {} KiB at {:p}",
            region_size / 1024,
            base
        );
        Ok(Self {
            kind: PoolKind::PreReserved,
            page_size,
            segment_pages,
            secondary_enabled,
            unwind_slab_size,
            segments: Vec::new(),
            region: Some(Region {
                base,
                size: region_size,
                cursor: 0,
                recycled: Vec::new(),
            }),
        })
    }

    fn segment(&self, index: u32) -> &Segment {
        match self.segments.get(index as usize).and_then(Option::as_ref) {
            Some(seg) => seg,
            None => {
                debug_assert!(false, "stale segment handle {index}");
                // Safety: Unreachable logic; handles are only minted for
                // live segments and slots are never reused.
                unsafe { std::hint::unreachable_unchecked() }
            }
        }
    }

    fn segment_mut(&mut self, index: u32) -> &mut Segment {
        match self.segments.get_mut(index as usize).and_then(Option::as_mut) {
            Some(seg) => seg,
            None => {
                debug_assert!(false, "stale segment handle {index}");
                // Safety: Unreachable logic; handles are only minted for
                // live segments and slots are never reused.
                unsafe { std::hint::unreachable_unchecked() }
            }
        }
    }

    /// Allocate `n` consecutive pages. Returns the base address and the
    /// owning segment index, or `None` when the pool cannot serve the
    /// request (region exhausted, reservation or commit failure).
    pub(crate) fn alloc_pages(&mut self, n: usize) -> Option<(NonNull<u8>, u32)> {
        debug_assert!(n > 0);

        // Existing segments first, lowest index — keeps placement dense and
        // deterministic.
        for idx in 0..self.segments.len() {
            let Some(seg) = &self.segments[idx] else {
                continue;
            };
            if let Some(start) = seg.find_free_run(n) {
                // Segment indices stay well under u32::MAX.
                #[allow(clippy::cast_possible_truncation)]
                let idx = idx as u32;
                return self.take_run(idx, start, n);
            }
        }

        let idx = self.new_segment(n)?;
        let Some(start) = self.segment(idx).find_free_run(n) else {
            debug_assert!(false, "fresh segment cannot hold the request");
            // Safety: Unreachable logic; new_segment sizes the segment to fit.
            unsafe { std::hint::unreachable_unchecked() }
        };
        self.take_run(idx, start, n)
    }

    /// Create a segment big enough for an `n`-page request.
    fn new_segment(&mut self, n: usize) -> Option<u32> {
        let pages = self.segment_pages.max(n);
        let (base, pages, owns) = match self.kind {
            PoolKind::General => {
                let bytes = pages.checked_mul(self.page_size)?;
                // Safety: FFI call to reserve memory.
                let base = match unsafe { PlatformVmOps::reserve(bytes) } {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("code segment reservation failed: {e}");
                        return None;
                    }
                };
                stats::TOTAL_RESERVED.add(bytes);
                (base, pages, true)
            }
            PoolKind::PreReserved => {
                let region = self.region.as_mut()?;
                let (base, pages) = region.carve(pages, self.page_size)?;
                (base, pages, false)
            }
        };

        let unwind = if self.secondary_enabled {
            match UnwindSlab::new(self.unwind_slab_size) {
                Ok(slab) => Some(slab),
                Err(e) => {
                    log::warn!("unwind slab allocation failed: {e}");
                    self.surrender_range(base, pages, owns);
                    return None;
                }
            }
        } else {
            None
        };

        // Segment indices stay well under u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let index = self.segments.len() as u32;
        self.segments
            .push(Some(Segment::new(base, pages, owns, unwind)));
        log::trace!(
            "new {:?} code segment {} ({} pages at {:p})",
            self.kind,
            index,
            pages,
            base
        );
        Some(index)
    }

    fn surrender_range(&mut self, base: NonNull<u8>, pages: usize, owns: bool) {
        if owns {
            // Safety: the range was reserved above and never handed out.
            unsafe {
                drop(PlatformVmOps::release(base, pages * self.page_size));
            }
            stats::sub_saturating(&stats::TOTAL_RESERVED, pages * self.page_size);
        } else if let Some(region) = self.region.as_mut() {
            region.recycled.push((base, pages));
        }
    }

    /// Hand out pages `[start, start + n)` of segment `idx`, committing
    /// virgin pages and re-opening returned ones for writing.
    fn take_run(&mut self, idx: u32, start: usize, n: usize) -> Option<(NonNull<u8>, u32)> {
        let page_size = self.page_size;
        let seg = self.segment_mut(idx);
        for i in start..start + n {
            debug_assert!(seg.free.contains(i));
            let addr = seg.page_addr(i, page_size);
            if seg.committed.contains(i) {
                // Returned page: may still be read-execute from its previous
                // life; hand it back writable.
                // Safety: the page is committed and owned by this segment.
                if let Err(e) = unsafe { PlatformVmOps::protect(addr, page_size, Protection::ReadWrite) } {
                    // Fatal per the protection contract: the mapping is in an
                    // unknown state.
                    panic!("code page protection failed: {e}");
                }
            } else {
                // Safety: the range lies within the segment's reservation.
                match unsafe { PlatformVmOps::commit(addr, page_size) } {
                    Ok(()) => {
                        seg.committed.insert(i);
                        stats::TOTAL_COMMITTED.add(page_size);
                        stats::CODE_COMMITTED.add(page_size);
                    }
                    Err(e) => {
                        log::warn!("code page commit failed: {e}");
                        // Roll back: re-free the pages taken so far.
                        for j in start..i {
                            seg.free.insert(j);
                        }
                        return None;
                    }
                }
            }
            seg.free.set(i, false);
        }
        Some((seg.page_addr(start, page_size), idx))
    }

    /// Return pages to the pool; physical backing is retained until the
    /// segment goes idle or the pages are decommitted.
    pub(crate) fn release_pages(&mut self, addr: NonNull<u8>, n: usize, index: u32) {
        let page_size = self.page_size;
        let seg = self.segment_mut(index);
        let start = seg.page_index(addr, page_size);
        for i in start..start + n {
            debug_assert!(!seg.free.contains(i), "releasing a page that is not live");
            seg.free.insert(i);
        }
        self.sweep_segment(index);
    }

    /// Record that `[addr, addr + n pages)` lost its physical backing while
    /// remaining handed out (the caller already issued the decommit).
    pub(crate) fn track_decommitted(&mut self, addr: NonNull<u8>, n: usize, index: u32) {
        let page_size = self.page_size;
        let seg = self.segment_mut(index);
        let start = seg.page_index(addr, page_size);
        for i in start..start + n {
            debug_assert!(!seg.free.contains(i));
            if seg.committed.contains(i) {
                seg.committed.set(i, false);
                stats::sub_saturating(&stats::TOTAL_COMMITTED, page_size);
                stats::sub_saturating(&stats::CODE_COMMITTED, page_size);
            }
        }
    }

    /// Free a decommit-tracked range without recommitting it.
    pub(crate) fn release_decommitted(&mut self, addr: NonNull<u8>, n: usize, index: u32) {
        let page_size = self.page_size;
        let seg = self.segment_mut(index);
        let start = seg.page_index(addr, page_size);
        for i in start..start + n {
            debug_assert!(!seg.free.contains(i) && !seg.committed.contains(i));
            seg.free.insert(i);
        }
        self.sweep_segment(index);
    }

    /// Bring a decommit-tracked range back into service. On success the pages
    /// are committed, writable, and still owned by the caller.
    pub(crate) fn recommit_pages(&mut self, addr: NonNull<u8>, n: usize, index: u32) -> bool {
        let page_size = self.page_size;
        let seg = self.segment_mut(index);
        let start = seg.page_index(addr, page_size);
        for i in start..start + n {
            debug_assert!(!seg.free.contains(i) && !seg.committed.contains(i));
            let page = seg.page_addr(i, page_size);
            // Safety: the range lies within the segment's reservation.
            match unsafe { PlatformVmOps::commit(page, page_size) } {
                Ok(()) => {
                    seg.committed.insert(i);
                    stats::TOTAL_COMMITTED.add(page_size);
                    stats::CODE_COMMITTED.add(page_size);
                }
                Err(e) => {
                    log::warn!("code page recommit failed: {e}");
                    // Put the pages recommitted so far back to tracked state.
                    for j in start..i {
                        let back = seg.page_addr(j, page_size);
                        // Safety: page was committed in this loop.
                        unsafe { drop(PlatformVmOps::decommit(back, page_size)) };
                        seg.committed.set(j, false);
                        stats::sub_saturating(&stats::TOTAL_COMMITTED, page_size);
                        stats::sub_saturating(&stats::CODE_COMMITTED, page_size);
                    }
                    return false;
                }
            }
        }
        true
    }

    pub(crate) fn alloc_unwind(
        &mut self,
        index: u32,
        fn_start: NonNull<u8>,
        fn_size: usize,
        pdata_count: u16,
        xdata_size: u16,
    ) -> Option<UnwindAllocation> {
        let seg = self.segment_mut(index);
        let slab = seg.unwind.as_mut()?;
        let block = slab.alloc(pdata_count, xdata_size);
        if block.is_some() {
            log::trace!(
                "unwind block for fn {:p}+{:#x}: {} pdata, {} xdata bytes",
                fn_start,
                fn_size,
                pdata_count,
                xdata_size
            );
        }
        block
    }

    pub(crate) fn release_unwind(&mut self, index: u32, block: UnwindAllocation) {
        let seg = self.segment_mut(index);
        if let Some(slab) = seg.unwind.as_mut() {
            slab.release(block);
        } else {
            debug_assert!(false, "unwind release on a segment without a slab");
        }
    }

    pub(crate) fn can_alloc_unwind(&self, index: u32) -> bool {
        self.segment(index)
            .unwind
            .as_ref()
            .is_some_and(UnwindSlab::can_alloc)
    }

    /// Release a segment whose pages are all free again.
    fn sweep_segment(&mut self, index: u32) {
        let page_size = self.page_size;
        let slot = &mut self.segments[index as usize];
        let Some(seg) = slot else { return };
        if !seg.is_idle() {
            return;
        }

        let committed = seg.committed_bytes(page_size);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
        stats::sub_saturating(&stats::CODE_COMMITTED, committed);

        let Some(seg) = slot.take() else {
            debug_assert!(false, "segment vanished under the sweep");
            // Safety: Unreachable logic; the slot was occupied just above.
            unsafe { std::hint::unreachable_unchecked() }
        };
        log::trace!("retiring {:?} code segment {}", self.kind, index);
        if seg.owns_reservation {
            // Safety: the segment owns its reservation and has no live pages.
            unsafe {
                drop(PlatformVmOps::release(
                    seg.base,
                    seg.page_count * page_size,
                ));
            }
            stats::sub_saturating(&stats::TOTAL_RESERVED, seg.page_count * page_size);
        } else if let Some(region) = self.region.as_mut() {
            region.recycled.push((seg.base, seg.page_count));
        }
        // seg.unwind drops here, releasing the slab.
    }

    #[cfg(test)]
    pub(crate) fn live_segments(&self) -> usize {
        self.segments.iter().flatten().count()
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let page_size = self.page_size;
        for slot in &mut self.segments {
            let Some(seg) = slot.take() else { continue };
            let committed = seg.committed_bytes(page_size);
            stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
            stats::sub_saturating(&stats::CODE_COMMITTED, committed);
            if seg.owns_reservation {
                // Safety: dropping the pool; the reservation is ours.
                unsafe {
                    drop(PlatformVmOps::release(
                        seg.base,
                        seg.page_count * page_size,
                    ));
                }
                stats::sub_saturating(&stats::TOTAL_RESERVED, seg.page_count * page_size);
            }
        }
        // self.region (if any) drops after the segments carved from it.
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn page_size() -> usize {
        PlatformVmOps::page_size()
    }

    #[test]
    fn test_general_alloc_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(4, false, 0);

        let (a, seg_a) = pool.alloc_pages(1).expect("alloc failed");
        let (b, seg_b) = pool.alloc_pages(1).expect("alloc failed");
        assert_eq!(seg_a, seg_b, "both pages should come from one segment");
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            page_size(),
            "placement should be dense"
        );

        // Handed-out pages are writable.
        // Safety: Test code.
        unsafe {
            a.as_ptr().write(0xAB);
            assert_eq!(a.as_ptr().read(), 0xAB);
        }

        pool.release_pages(a, 1, seg_a);
        pool.release_pages(b, 1, seg_b);
        // Segment went idle and was retired.
        assert_eq!(pool.live_segments(), 0);
    }

    #[test]
    fn test_released_page_reused_lowest_first() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(4, false, 0);

        let (a, seg) = pool.alloc_pages(1).unwrap();
        let (_b, _) = pool.alloc_pages(1).unwrap();
        pool.release_pages(a, 1, seg);

        let (c, _) = pool.alloc_pages(1).unwrap();
        assert_eq!(c, a, "released page should be reused first");
    }

    #[test]
    fn test_multi_page_run_is_contiguous() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(8, false, 0);

        let (base, seg) = pool.alloc_pages(3).unwrap();
        // Safety: Test code.
        unsafe {
            base.as_ptr().write(1);
            base.as_ptr().add(page_size() * 3 - 1).write(2);
        }
        pool.release_pages(base, 3, seg);
    }

    #[test]
    fn test_request_larger_than_segment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(2, false, 0);

        let (base, seg) = pool.alloc_pages(5).unwrap();
        // Safety: Test code.
        unsafe {
            base.as_ptr().add(page_size() * 4).write(7);
        }
        pool.release_pages(base, 5, seg);
        assert_eq!(pool.live_segments(), 0);
    }

    #[test]
    fn test_decommit_track_recommit() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(4, false, 0);

        let (addr, seg) = pool.alloc_pages(1).unwrap();
        // Safety: Test code.
        unsafe { addr.as_ptr().write(0x11) };

        // Safety: Test code.
        unsafe { PlatformVmOps::decommit(addr, page_size()).unwrap() };
        pool.track_decommitted(addr, 1, seg);

        assert!(pool.recommit_pages(addr, 1, seg));
        // Recommitted page is writable again.
        // Safety: Test code.
        unsafe {
            addr.as_ptr().write(0x22);
            assert_eq!(addr.as_ptr().read(), 0x22);
        }

        pool.release_pages(addr, 1, seg);
    }

    #[test]
    fn test_release_decommitted_retires_segment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(4, false, 0);

        let (addr, seg) = pool.alloc_pages(2).unwrap();
        // Safety: Test code.
        unsafe { PlatformVmOps::decommit(addr, page_size() * 2).unwrap() };
        pool.track_decommitted(addr, 2, seg);
        pool.release_decommitted(addr, 2, seg);
        assert_eq!(pool.live_segments(), 0);
    }

    #[test]
    fn test_pre_reserved_exhaustion_and_recycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Room for exactly two single-page segments.
        let mut pool = PagePool::pre_reserved(page_size() * 2, 1, false, 0).unwrap();

        let (a, seg_a) = pool.alloc_pages(1).expect("first page");
        let (_b, _seg_b) = pool.alloc_pages(1).expect("second page");
        assert!(pool.alloc_pages(1).is_none(), "region must be exhausted");

        // Releasing returns the carved range for reuse.
        pool.release_pages(a, 1, seg_a);
        let (c, _) = pool.alloc_pages(1).expect("recycled page");
        assert_eq!(c, a);
    }

    #[test]
    fn test_pre_reserved_region_stays_contiguous() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::pre_reserved(page_size() * 8, 2, false, 0).unwrap();

        let (a, _) = pool.alloc_pages(1).unwrap();
        let (b, _) = pool.alloc_pages(2).unwrap();
        let span = b.as_ptr() as usize - a.as_ptr() as usize;
        assert!(
            span < page_size() * 8,
            "all pre-reserved pages must stay inside the region"
        );
    }

    #[test]
    fn test_unwind_slab_alloc_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = PagePool::general(4, true, 4096);

        let (addr, seg) = pool.alloc_pages(1).unwrap();
        assert!(pool.can_alloc_unwind(seg));

        let block = pool
            .alloc_unwind(seg, addr, 200, 1, 32)
            .expect("unwind alloc failed");
        assert!(block.size() >= 32);

        // The block is writable data memory.
        // Safety: Test code.
        unsafe {
            block.address().as_ptr().write(0x5A);
            assert_eq!(block.address().as_ptr().read(), 0x5A);
        }

        pool.release_unwind(seg, block);
        pool.release_pages(addr, 1, seg);
    }

    #[test]
    fn test_unwind_slab_exhaustion() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Tiny slab: two minimal records fit, the third does not.
        let mut pool = PagePool::general(4, true, 32);

        let (addr, seg) = pool.alloc_pages(1).unwrap();
        let a = pool.alloc_unwind(seg, addr, 64, 1, 0).expect("first");
        let _b = pool.alloc_unwind(seg, addr, 64, 1, 0).expect("second");
        assert!(pool.alloc_unwind(seg, addr, 64, 1, 0).is_none());
        assert!(!pool.can_alloc_unwind(seg));

        // Freeing one makes room again.
        pool.release_unwind(seg, a);
        assert!(pool.can_alloc_unwind(seg));
        let c = pool.alloc_unwind(seg, addr, 64, 1, 0).expect("reuse");
        assert_eq!(c.address(), a.address());

        pool.release_pages(addr, 1, seg);
    }

    #[test]
    fn test_unwind_block_sizing() {
        assert_eq!(UnwindSlab::block_bytes(1, 0), 16);
        assert_eq!(UnwindSlab::block_bytes(0, 1), 16);
        assert_eq!(UnwindSlab::block_bytes(1, 9), 32);
        assert_eq!(UnwindSlab::block_bytes(2, 0), 32);
    }
}
