use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(io::Error),
    DualMapFailed(io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
            VmError::DualMapFailed(e) => write!(f, "VM dual mapping failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::DualMapFailed(e) => Some(e),
        }
    }
}

/// The two views of one block mapping.
///
/// For a single RWX mapping both pointers are equal. For a dual mapping `rx`
/// is the read+execute view and `rw` the read+write view of the same backing
/// memory; a write through `rw` is immediately visible through `rx`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) rx: NonNull<u8>,
    pub(crate) rw: NonNull<u8>,
}

impl Mapping {
    pub(crate) fn is_dual(self) -> bool {
        self.rx != self.rw
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Map a region that is simultaneously writable and executable.
    /// Both returned views are the same pointer.
    unsafe fn map_rwx(size: usize) -> Result<Mapping, VmError>;

    /// Map one anonymous backing region into two views: read+execute and
    /// read+write. Used where W^X policy forbids a single RWX mapping.
    unsafe fn map_dual(size: usize) -> Result<Mapping, VmError>;

    /// Unmap both views of a mapping.
    ///
    /// Infallible from the caller's perspective: an OS-level failure aborts
    /// the process, because a mapping we can no longer release leaves the
    /// address-space accounting permanently inconsistent.
    unsafe fn unmap(mapping: Mapping, size: usize);

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

/// Per-thread write access to `MAP_JIT` regions. Only meaningful on Apple
/// Silicon, where RWX mappings require toggling between write and execute
/// access; a no-op everywhere else.
#[derive(Clone, Copy)]
pub(crate) enum JitAccess {
    ReadWrite,
    ReadExecute,
}

#[cfg(all(target_os = "macos", target_arch = "aarch64", not(any(loom, miri))))]
pub(crate) fn protect_jit_memory(access: JitAccess) {
    // Safety: FFI call; affects only the calling thread.
    unsafe {
        libc::pthread_jit_write_protect_np(matches!(access, JitAccess::ReadExecute) as libc::c_int);
    }
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64", not(any(loom, miri)))))]
pub(crate) fn protect_jit_memory(_access: JitAccess) {}

/// Flush the instruction cache over `[ptr, ptr+len)` after writing code.
pub(crate) fn flush_instruction_cache(ptr: *const u8, len: usize) {
    // x86 instruction caches are coherent with data writes; nothing to do.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64", loom, miri))]
    {
        let _ = (ptr, len);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", loom, miri)))]
    {
        extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        // Safety: compiler-rt builtin over a valid mapped range.
        unsafe { __clear_cache(ptr.cast_mut().cast(), ptr.add(len).cast_mut().cast()) };
    }
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{Mapping, NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    // ----------------------------------------------------------------
    // Dual mapping backing — platform-specific helpers
    //
    // Both platforms back the two views with one anonymous file-like
    // object mapped twice via MAP_SHARED. The descriptor is closed once
    // both views exist; the kernel keeps the backing alive until the
    // last view is unmapped.
    // ----------------------------------------------------------------

    /// Linux: anonymous memfd, no filesystem presence at any point.
    #[cfg(target_os = "linux")]
    unsafe fn dual_backing_fd(size: usize) -> Result<libc::c_int, VmError> {
        // Safety: FFI call to memfd_create.
        let fd = unsafe { libc::memfd_create(c"jitmem-dual".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(VmError::DualMapFailed(io::Error::last_os_error()));
        }
        // Safety: FFI call to ftruncate on a descriptor we just opened.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            // Safety: FFI call to close.
            unsafe { libc::close(fd) };
            return Err(VmError::DualMapFailed(err));
        }
        Ok(fd)
    }

    /// macOS: POSIX shared memory object, unlinked immediately after open so
    /// it lives only as long as the mappings. Names must be unique per open
    /// attempt; retry on EEXIST (a leftover from a crashed process).
    #[cfg(target_os = "macos")]
    unsafe fn dual_backing_fd(size: usize) -> Result<libc::c_int, VmError> {
        use crate::sync::atomic::{AtomicUsize, Ordering};
        static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

        loop {
            let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
            let name = format!("/jitmem-{}-{}\0", std::process::id(), seq);
            let name_ptr = name.as_ptr().cast::<libc::c_char>();
            // Safety: FFI call to shm_open with a NUL-terminated name.
            let fd = unsafe {
                libc::shm_open(
                    name_ptr,
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EEXIST) {
                    continue;
                }
                return Err(VmError::DualMapFailed(err));
            }
            // Safety: FFI call to shm_unlink; the open descriptor keeps the
            // object alive.
            unsafe { libc::shm_unlink(name_ptr) };
            // Safety: FFI call to ftruncate.
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                // Safety: FFI call to close.
                unsafe { libc::close(fd) };
                return Err(VmError::DualMapFailed(err));
            }
            return Ok(fd);
        }
    }

    /// Unmap one view. Aborts on failure — there is no safe recovery from a
    /// dangling mapping claim.
    unsafe fn unmap_one(ptr: NonNull<u8>, size: usize) {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            eprintln!(
                "jitmem: munmap({:p}, {size}) failed: {}",
                ptr,
                io::Error::last_os_error()
            );
            std::process::abort();
        }
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map_rwx(size: usize) -> Result<Mapping, VmError> {
            #[cfg(target_os = "macos")]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT;
            #[cfg(not(target_os = "macos"))]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    flags,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(Mapping { rx: p, rw: p }),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn map_dual(size: usize) -> Result<Mapping, VmError> {
            // Safety: size is forwarded unchanged to the backing object.
            let fd = unsafe { dual_backing_fd(size)? };

            // Safety: FFI call to mmap over the shared backing.
            let rw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if rw == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                // Safety: FFI call to close.
                unsafe { libc::close(fd) };
                return Err(VmError::DualMapFailed(err));
            }

            // Safety: FFI call to mmap over the shared backing.
            let rx = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_EXEC,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if rx == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                // Safety: rw was just mapped with this exact size.
                unsafe {
                    libc::munmap(rw, size);
                    libc::close(fd);
                }
                return Err(VmError::DualMapFailed(err));
            }

            // Safety: FFI call to close; both views keep the backing alive.
            unsafe { libc::close(fd) };

            match (NonNull::new(rx.cast::<u8>()), NonNull::new(rw.cast::<u8>())) {
                (Some(rx), Some(rw)) => Ok(Mapping { rx, rw }),
                _ => Err(VmError::DualMapFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn unmap(mapping: Mapping, size: usize) {
            // Safety: upheld by caller — both views were mapped with `size`.
            unsafe {
                unmap_one(mapping.rw, size);
                if mapping.is_dual() {
                    unmap_one(mapping.rx, size);
                }
            }
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

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every mapping
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
//
// A "dual" mapping collapses to a single pointer: nothing is executed under
// loom or Miri, so the rw view standing in for both is sufficient to test
// the allocator's bookkeeping and synchronization.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map_rwx(size: usize) -> Result<Mapping, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(p) => Ok(Mapping { rx: p, rw: p }),
            None => Err(VmError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))),
        }
    }

    unsafe fn map_dual(size: usize) -> Result<Mapping, VmError> {
        // Safety: forwarded; see mock note above.
        unsafe { Self::map_rwx(size) }
    }

    unsafe fn unmap(mapping: Mapping, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .expect("layout was valid at mapping time");
        // Safety: ptr was allocated with the same layout via `map_rwx`.
        unsafe { std::alloc::dealloc(mapping.rw.as_ptr(), layout) };
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_map_rwx_write_read() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let m = PlatformVmOps::map_rwx(size).expect("map_rwx failed");
            assert!(!m.is_dual());

            protect_jit_memory(JitAccess::ReadWrite);
            let slice = std::slice::from_raw_parts_mut(m.rw.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            protect_jit_memory(JitAccess::ReadExecute);
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformVmOps::unmap(m, size);
        }
    }

    #[test]
    fn test_map_rwx_zero_size_fails() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map_rwx(0) };
        assert!(result.is_err(), "mapping 0 bytes should fail");
    }

    #[test]
    fn test_dual_mapping_aliases() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let m = PlatformVmOps::map_dual(size).expect("map_dual failed");
            assert!(m.is_dual(), "dual mapping must return two distinct views");

            // A write through the rw view must be visible through the rx view.
            m.rw.as_ptr().write(0xC3);
            m.rw.as_ptr().add(size - 1).write(0x90);
            assert_eq!(m.rx.as_ptr().read(), 0xC3);
            assert_eq!(m.rx.as_ptr().add(size - 1).read(), 0x90);

            PlatformVmOps::unmap(m, size);
        }
    }

    #[test]
    fn test_dual_mapping_rx_not_writable() {
        // We cannot safely test the segfault, but we can verify the views are
        // distinct addresses — the whole point of the dual mapping.
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let m = PlatformVmOps::map_dual(size).expect("map_dual failed");
            assert_ne!(m.rx.as_ptr(), m.rw.as_ptr());
            PlatformVmOps::unmap(m, size);
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_mappings_independent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let m1 = PlatformVmOps::map_rwx(size).expect("map 1 failed");
            let m2 = PlatformVmOps::map_rwx(size).expect("map 2 failed");

            assert_ne!(m1.rw, m2.rw);

            protect_jit_memory(JitAccess::ReadWrite);
            m1.rw.as_ptr().write(1);
            m2.rw.as_ptr().write(2);
            protect_jit_memory(JitAccess::ReadExecute);

            assert_eq!(m1.rw.as_ptr().read(), 1);

            PlatformVmOps::unmap(m1, size);

            // m2 must still be valid.
            assert_eq!(m2.rw.as_ptr().read(), 2);

            PlatformVmOps::unmap(m2, size);
        }
    }

    #[test]
    fn test_dual_mapping_multi_page() {
        let size = PlatformVmOps::page_size() * 4;
        // Safety: Test code.
        unsafe {
            let m = PlatformVmOps::map_dual(size).expect("map_dual failed");
            for page in 0..4 {
                let off = page * PlatformVmOps::page_size();
                m.rw.as_ptr().add(off).write(page as u8 + 1);
            }
            for page in 0..4 {
                let off = page * PlatformVmOps::page_size();
                assert_eq!(m.rx.as_ptr().add(off).read(), page as u8 + 1);
            }
            PlatformVmOps::unmap(m, size);
        }
    }
}
