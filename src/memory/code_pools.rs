use super::page_pool::{PagePool, PoolKind, SegmentHandle, UnwindAllocation, SEGMENT_PAGES};
use super::vm::{PlatformVmOps, Protection, VmOps};
use crate::sync::{Mutex, MutexGuard};
use std::ptr::NonNull;

/// Configuration for [`CodePagePools`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct CodePoolsConfig {
    /// Address-space size of the pre-reserved code region, reserved up front
    /// so JIT code shares one short-displacement range. `0` disables the
    /// region entirely. Default: 4 MiB.
    pub pre_reserved_region_size: usize,

    /// Pages per code segment reservation. Default: 64.
    pub segment_page_count: usize,

    /// Enable per-segment unwind (pdata/xdata) slabs. Default: false.
    pub secondary_data_enabled: bool,

    /// Bytes per unwind slab when secondary data is enabled. Default: 4096.
    pub unwind_slab_size: usize,
}

impl Default for CodePoolsConfig {
    fn default() -> Self {
        Self {
            pre_reserved_region_size: 4 * 1024 * 1024,
            segment_page_count: SEGMENT_PAGES,
            secondary_data_enabled: false,
            unwind_slab_size: 4096,
        }
    }
}

/// Change the protection of `page_count` pages at `addr`.
///
/// Free function rather than a method: the OS call is atomic, reads no pool
/// state, and so needs neither the lock nor a pools reference. `expected_old`
/// documents the transition the caller believes it is making; incoherent
/// pairs are debug-asserted.
///
/// # Panics
///
/// Panics when the OS refuses the transition — continuing would risk a W^X
/// violation or executing non-code.
pub(crate) fn protect_range(
    addr: NonNull<u8>,
    page_count: usize,
    new: Protection,
    expected_old: Protection,
) {
    debug_assert_ne!(new, expected_old, "protection transition to itself");
    debug_assert!(
        new.is_writable() || new.is_executable(),
        "code pages are never protected to {new}"
    );
    let bytes = page_count * PlatformVmOps::page_size();
    // Safety: the caller owns the page range via a heap list or live
    // allocation; the range is committed.
    if let Err(e) = unsafe { PlatformVmOps::protect(addr, bytes, new) } {
        panic!("code page protection failed ({expected_old} -> {new}): {e}");
    }
}

/// Return the physical backing of `page_count` pages at `addr` to the OS.
/// Bookkeeping is separate ([`PoolsGuard::track_decommitted_pages`]); this is
/// only the VM call, so no lock is required.
pub(crate) fn decommit_range(addr: NonNull<u8>, page_count: usize) {
    let bytes = page_count * PlatformVmOps::page_size();
    // Safety: the caller owns the page range and has no live references
    // into it.
    if let Err(e) = unsafe { PlatformVmOps::decommit(addr, bytes) } {
        // Backing stays resident; correctness is unaffected.
        log::warn!("code page decommit failed: {e}");
    }
}

pub(crate) struct PoolsInner {
    general: PagePool,
    pre_reserved: Option<PagePool>,
}

/// The pair of underlying code page pools, shared by every heap attached to
/// the same JIT.
///
/// All mutating operations live on [`PoolsGuard`], so they are only reachable
/// while the lock is held. Immutable facts — segment kind, whether secondary
/// data is enabled — are readable without it.
pub struct CodePagePools {
    inner: Mutex<PoolsInner>,
    secondary_enabled: bool,
}

impl Default for CodePagePools {
    fn default() -> Self {
        Self::new()
    }
}

impl CodePagePools {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CodePoolsConfig::default())
    }

    /// Build the pool pair. A failed pre-reserved region reservation is not
    /// fatal: the region is disabled and every request falls through to the
    /// general pool.
    #[must_use]
    pub fn with_config(config: CodePoolsConfig) -> Self {
        let secondary = config.secondary_data_enabled;
        let pre_reserved = if config.pre_reserved_region_size == 0 {
            None
        } else {
            match PagePool::pre_reserved(
                config.pre_reserved_region_size,
                config.segment_page_count,
                secondary,
                config.unwind_slab_size,
            ) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    log::warn!("pre-reserved code region unavailable: {e}");
                    None
                }
            }
        };
        Self {
            inner: Mutex::new(PoolsInner {
                general: PagePool::general(
                    config.segment_page_count,
                    secondary,
                    config.unwind_slab_size,
                ),
                pre_reserved,
            }),
            secondary_enabled: secondary,
        }
    }

    /// Acquire the pools lock. Every mutating pool operation is a method on
    /// the returned guard.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub(crate) fn lock(&self) -> PoolsGuard<'_> {
        PoolsGuard {
            inner: self.inner.lock().unwrap(),
        }
    }

    /// Whether per-allocation unwind data is in play. Immutable, no lock.
    #[inline]
    #[must_use]
    pub fn secondary_enabled(&self) -> bool {
        self.secondary_enabled
    }
}

/// Lock guard over the pool pair. Holding one is the license to mutate pool
/// state; the borrow checker enforces what the original design asserted.
pub(crate) struct PoolsGuard<'a> {
    inner: MutexGuard<'a, PoolsInner>,
}

impl PoolsGuard<'_> {
    fn pool_mut(&mut self, segment: SegmentHandle) -> &mut PagePool {
        match segment.kind {
            PoolKind::General => &mut self.inner.general,
            PoolKind::PreReserved => match self.inner.pre_reserved.as_mut() {
                Some(pool) => pool,
                None => {
                    debug_assert!(false, "pre-reserved handle without a pre-reserved pool");
                    // Safety: Unreachable logic; handles of this kind are
                    // only minted by the pre-reserved pool.
                    unsafe { std::hint::unreachable_unchecked() }
                }
            },
        }
    }

    fn pool(&self, segment: SegmentHandle) -> &PagePool {
        match segment.kind {
            PoolKind::General => &self.inner.general,
            PoolKind::PreReserved => match self.inner.pre_reserved.as_ref() {
                Some(pool) => pool,
                None => {
                    debug_assert!(false, "pre-reserved handle without a pre-reserved pool");
                    // Safety: Unreachable logic; handles of this kind are
                    // only minted by the pre-reserved pool.
                    unsafe { std::hint::unreachable_unchecked() }
                }
            },
        }
    }

    /// Allocate `n` consecutive committed, writable pages.
    ///
    /// With `prefer_pre_reserved`, the pre-reserved pool is tried first.
    /// Whenever JIT code lands in the general pool instead,
    /// `all_jit_in_pre_reserved` is cleared — the caller uses it to decide
    /// whether short-displacement call encodings are still safe everywhere.
    pub(crate) fn alloc_pages(
        &mut self,
        n: usize,
        prefer_pre_reserved: bool,
        is_jit: bool,
        all_jit_in_pre_reserved: &mut bool,
    ) -> Option<(NonNull<u8>, SegmentHandle)> {
        if prefer_pre_reserved {
            if let Some(pre) = self.inner.pre_reserved.as_mut() {
                if let Some((addr, index)) = pre.alloc_pages(n) {
                    return Some((
                        addr,
                        SegmentHandle {
                            kind: PoolKind::PreReserved,
                            index,
                        },
                    ));
                }
                log::trace!("pre-reserved region cannot serve {n} page(s), falling back");
            }
        }

        if is_jit {
            *all_jit_in_pre_reserved = false;
        }
        let (addr, index) = self.inner.general.alloc_pages(n)?;
        Some((
            addr,
            SegmentHandle {
                kind: PoolKind::General,
                index,
            },
        ))
    }

    pub(crate) fn release_pages(&mut self, addr: NonNull<u8>, n: usize, segment: SegmentHandle) {
        self.pool_mut(segment).release_pages(addr, n, segment.index);
    }

    pub(crate) fn track_decommitted_pages(
        &mut self,
        addr: NonNull<u8>,
        n: usize,
        segment: SegmentHandle,
    ) {
        self.pool_mut(segment)
            .track_decommitted(addr, n, segment.index);
    }

    pub(crate) fn release_decommitted(
        &mut self,
        addr: NonNull<u8>,
        n: usize,
        segment: SegmentHandle,
    ) {
        self.pool_mut(segment)
            .release_decommitted(addr, n, segment.index);
    }

    pub(crate) fn recommit_pages(
        &mut self,
        addr: NonNull<u8>,
        n: usize,
        segment: SegmentHandle,
    ) -> bool {
        self.pool_mut(segment)
            .recommit_pages(addr, n, segment.index)
    }

    pub(crate) fn alloc_secondary(
        &mut self,
        segment: SegmentHandle,
        fn_start: NonNull<u8>,
        fn_size: usize,
        pdata_count: u16,
        xdata_size: u16,
    ) -> Option<UnwindAllocation> {
        self.pool_mut(segment)
            .alloc_unwind(segment.index, fn_start, fn_size, pdata_count, xdata_size)
    }

    pub(crate) fn release_secondary(&mut self, segment: SegmentHandle, block: UnwindAllocation) {
        self.pool_mut(segment).release_unwind(segment.index, block);
    }

    pub(crate) fn can_alloc_secondary(&self, segment: SegmentHandle) -> bool {
        self.pool(segment).can_alloc_unwind(segment.index)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn page_size() -> usize {
        PlatformVmOps::page_size()
    }

    fn tiny_pre_reserved(pages: usize) -> CodePagePools {
        CodePagePools::with_config(CodePoolsConfig {
            pre_reserved_region_size: page_size() * pages,
            segment_page_count: 1,
            ..Default::default()
        })
    }

    #[test]
    fn test_prefers_pre_reserved() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = tiny_pre_reserved(2);
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (_, seg) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        assert!(seg.is_pre_reserved());
        assert!(all_jit, "flag must stay set while in the region");
    }

    #[test]
    fn test_fallback_clears_jit_flag() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = tiny_pre_reserved(1);
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (_, first) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        assert!(first.is_pre_reserved());

        // Region exhausted: next page comes from the general pool.
        let (_, second) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        assert!(!second.is_pre_reserved());
        assert!(!all_jit, "flag must clear when JIT code leaves the region");
    }

    #[test]
    fn test_no_preference_goes_general() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = tiny_pre_reserved(4);
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (_, seg) = guard.alloc_pages(1, false, true, &mut all_jit).unwrap();
        assert!(!seg.is_pre_reserved());
        assert!(!all_jit, "JIT code in the general pool clears the flag");
    }

    #[test]
    fn test_non_jit_fallback_keeps_flag() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = tiny_pre_reserved(1);
        let mut all_jit = true;

        let mut guard = pools.lock();
        // Thunk/helper allocations do not count against the flag.
        let (_, seg) = guard.alloc_pages(1, false, false, &mut all_jit).unwrap();
        assert!(!seg.is_pre_reserved());
        assert!(all_jit);
    }

    #[test]
    fn test_dispatch_by_segment_kind() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = tiny_pre_reserved(2);
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (pre_addr, pre_seg) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        let (gen_addr, gen_seg) = guard.alloc_pages(1, false, false, &mut all_jit).unwrap();

        // Release through the handle; each pool must get its own page back.
        guard.release_pages(pre_addr, 1, pre_seg);
        guard.release_pages(gen_addr, 1, gen_seg);

        let (again, seg_again) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        assert!(seg_again.is_pre_reserved());
        assert_eq!(again, pre_addr);
    }

    #[test]
    fn test_region_disabled() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = CodePagePools::with_config(CodePoolsConfig {
            pre_reserved_region_size: 0,
            segment_page_count: 2,
            ..Default::default()
        });
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (_, seg) = guard.alloc_pages(1, true, true, &mut all_jit).unwrap();
        assert!(!seg.is_pre_reserved());
        assert!(!all_jit);
    }

    #[test]
    fn test_protect_roundtrip_through_pools() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = CodePagePools::new();
        let mut all_jit = true;

        let mut guard = pools.lock();
        let (addr, seg) = guard.alloc_pages(1, false, false, &mut all_jit).unwrap();
        drop(guard);

        // Safety: Test code; the page is ours and writable.
        unsafe { addr.as_ptr().write(0xC3) };

        protect_range(addr, 1, Protection::ExecuteRead, Protection::ReadWrite);
        // Safety: Test code; ExecuteRead pages stay readable.
        unsafe { assert_eq!(addr.as_ptr().read(), 0xC3) };
        protect_range(addr, 1, Protection::ReadWrite, Protection::ExecuteRead);
        // Safety: Test code.
        unsafe { addr.as_ptr().write(0x90) };

        pools.lock().release_pages(addr, 1, seg);
    }

    #[test]
    fn test_secondary_disabled_by_default() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pools = CodePagePools::new();
        assert!(!pools.secondary_enabled());

        let mut all_jit = true;
        let mut guard = pools.lock();
        let (addr, seg) = guard.alloc_pages(1, false, false, &mut all_jit).unwrap();
        assert!(guard.alloc_secondary(seg, addr, 100, 1, 8).is_none());
        assert!(!guard.can_alloc_secondary(seg));
    }
}
