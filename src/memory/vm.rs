use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    ProtectFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::ProtectFailed(e) => write!(f, "VM protect failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e)
            | VmError::ProtectFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Page protection attribute.
///
/// Code pages alternate between `ExecuteRead` (published, runnable) and a
/// writable state (`ReadWrite` for whole-page rewrites, `ExecuteReadWrite`
/// for patching a page that still holds running code). A page is never left
/// writable-and-executable outside an explicit patch window.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    NoAccess,
    ReadWrite,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    #[inline]
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ExecuteReadWrite)
    }

    #[inline]
    #[must_use]
    pub fn is_executable(self) -> bool {
        matches!(self, Protection::ExecuteRead | Protection::ExecuteReadWrite)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protection::NoAccess => "---",
            Protection::ReadWrite => "rw-",
            Protection::ExecuteRead => "r-x",
            Protection::ExecuteReadWrite => "rwx",
        };
        f.write_str(s)
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    /// Committed pages are readable and writable.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Change the protection attribute of a committed range.
    unsafe fn protect(ptr: NonNull<u8>, size: usize, prot: Protection) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, Protection, VmError, VmOps};
    use std::io;

    fn prot_flags(prot: Protection) -> libc::c_int {
        match prot {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ExecuteReadWrite => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Code pages are written once and then executed; fault them in
                // up front rather than one minor fault at a time while the JIT
                // streams instructions.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
                };
            }

            // NOTE: Zeroing is NOT done here. Freed executable ranges are
            // overwritten with the trap pattern at the heap layer instead.

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Unified path for macOS and Linux: MADV_FREE + mprotect(PROT_NONE).
            //
            // MADV_FREE marks pages for lazy reclamation — the cheapest decommit
            // on both platforms. The kernel reclaims physical pages when under
            // pressure; if it doesn't, old data may persist. No zeroing guarantee.
            //
            // mprotect(PROT_NONE) removes access, which also guarantees a stale
            // jump into a decommitted code page faults instead of executing
            // leftover instructions.
            //
            // MADV_FREE: macOS (all versions), Linux >= 4.5 (March 2016).
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(ptr: NonNull<u8>, size: usize, prot: Protection) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, prot_flags(prot))
            } != 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::*;
    use std::io;

    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;
    const PAGE_EXECUTE_READWRITE: u32 = 0x40;

    extern "system" {
        fn VirtualProtect(
            address: *mut libc::c_void,
            size: usize,
            new_protect: u32,
            old_protect: *mut u32,
        ) -> i32;
    }

    fn prot_flags(prot: Protection) -> u32 {
        match prot {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ExecuteRead => PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE,
                    libc::PAGE_NOACCESS,
                )
            };

            match NonNull::new(ptr as *mut u8) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr() as *mut libc::c_void,
                    size,
                    libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };

            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualFree.
            if unsafe {
                libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, size, libc::MEM_DECOMMIT)
            } == 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // Windows VirtualFree with MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, 0, libc::MEM_RELEASE) }
                == 0
            {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(ptr: NonNull<u8>, size: usize, prot: Protection) -> Result<(), VmError> {
            let mut old: u32 = 0;
            // Safety: FFI call to VirtualProtect.
            if unsafe {
                VirtualProtect(
                    ptr.as_ptr() as *mut libc::c_void,
                    size,
                    prot_flags(prot),
                    &mut old,
                )
            } == 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *PAGE_SIZE.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain heap allocation (via `std::alloc::alloc` / `dealloc`).
//
// `commit` / `decommit` / `protect` are intentional no-ops: the memory is
// always accessible once reserved, and no execution happens in these builds.
//
// This is sufficient for testing the *synchronization* logic of the pools
// (loom) and detecting undefined behaviour in unsafe pointer code (Miri);
// actual page-fault and protection behaviour is tested by the real platform
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn protect(_ptr: NonNull<u8>, _size: usize, _prot: Protection) -> Result<(), VmError> {
        Ok(()) // no-op; nothing is executed in these builds
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            // Write to memory
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");

            // Release
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size usually fails with EINVAL. We expect an error.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_commit_idempotent() {
        // Commit same range twice — should succeed without error
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("First commit failed");

            // Second commit on same range
            PlatformVmOps::commit(ptr, size).expect("Second commit failed (idempotency check)");

            // Verify write
            *(ptr.as_ptr()) = 123;

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        // Full cycle: reserve → commit → write → decommit → recommit → write → release
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            // 1. Commit & Write
            PlatformVmOps::commit(ptr, size).expect("Commit failed");
            *(ptr.as_ptr()) = 42;
            assert_eq!(*(ptr.as_ptr().cast_const()), 42);

            // 2. Decommit
            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");

            // 3. Recommit
            PlatformVmOps::commit(ptr, size).expect("Recommit failed");

            // 4. Write again (memory content is undefined after decommit, so we just write new)
            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_partial_commit() {
        // Reserve large range, commit only a sub-range
        let page_size = PlatformVmOps::page_size();
        let total_size = page_size * 4;
        let commit_size = page_size * 2;
        let offset = page_size;

        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(total_size).expect("Reserve failed");
            let commit_ptr = NonNull::new(ptr.as_ptr().add(offset)).unwrap();

            // Commit middle pages
            PlatformVmOps::commit(commit_ptr, commit_size).expect("Partial commit failed");

            // Write to committed region
            let slice = std::slice::from_raw_parts_mut(commit_ptr.as_ptr(), commit_size);
            slice[0] = 10;
            slice[commit_size - 1] = 20;

            assert_eq!(slice[0], 10);
            assert_eq!(slice[commit_size - 1], 20);

            // Clean up
            PlatformVmOps::release(ptr, total_size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_reservations() {
        // Multiple independent reserve/commit/release cycles — no interference
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");

            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("Commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            assert_eq!(*(ptr1.as_ptr()), 1);
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[test]
    fn test_protect_roundtrip() {
        // RW → RX → RW; the page stays readable throughout and becomes
        // writable again after the final flip.
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            *(ptr.as_ptr()) = 0xC3;

            PlatformVmOps::protect(ptr, size, Protection::ExecuteRead).expect("RX failed");
            // Still readable
            assert_eq!(*(ptr.as_ptr().cast_const()), 0xC3);

            PlatformVmOps::protect(ptr, size, Protection::ReadWrite).expect("RW failed");
            *(ptr.as_ptr()) = 0x90;
            assert_eq!(*(ptr.as_ptr().cast_const()), 0x90);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_protect_execute_read_write() {
        // The patch-while-running attribute keeps the page writable.
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            PlatformVmOps::protect(ptr, size, Protection::ExecuteReadWrite).expect("RWX failed");
            *(ptr.as_ptr()) = 0xCC;
            assert_eq!(*(ptr.as_ptr().cast_const()), 0xCC);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_protection_predicates() {
        assert!(Protection::ReadWrite.is_writable());
        assert!(Protection::ExecuteReadWrite.is_writable());
        assert!(!Protection::ExecuteRead.is_writable());
        assert!(!Protection::NoAccess.is_writable());

        assert!(Protection::ExecuteRead.is_executable());
        assert!(Protection::ExecuteReadWrite.is_executable());
        assert!(!Protection::ReadWrite.is_executable());
        assert!(!Protection::NoAccess.is_executable());
    }
}
