//! Linux virtual-memory primitives.
//!
//! The arena lives in an anonymous `memfd` mapped `MAP_SHARED`, so the same
//! file page can back several virtual spans at once; that cross-mapping is
//! the mechanical basis of meshing. Decommit is a hole punched in the file,
//! which releases the physical pages while keeping the virtual range mapped.

#![allow(unsafe_code)]

use std::io;

pub use crate::size_class::PAGE_SIZE;

/// Creates the arena backing file, sized (sparsely) to `bytes`.
pub fn create_arena_file(bytes: usize) -> io::Result<i32> {
    // SAFETY: the name is a valid nul-terminated string; memfd_create does
    // not retain the pointer.
    let fd = unsafe { libc::memfd_create(c"quilt-arena".as_ptr(), 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just opened by us.
    if unsafe { libc::ftruncate(fd, bytes as libc::off_t) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Maps the whole arena file once; the kernel picks the base address.
pub fn map_arena(fd: i32, bytes: usize) -> io::Result<*mut u8> {
    // SAFETY: fd is a live memfd of at least `bytes`; NULL hint lets the
    // kernel place the mapping.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast())
}

/// Replaces the mapping at `addr` so it views `file_offset` of the arena file.
///
/// # Safety
///
/// `addr..addr + bytes` must lie inside the arena mapping owned by the
/// caller, and `file_offset + bytes` must not exceed the file size. The old
/// mapping for the range is atomically discarded by the kernel.
pub unsafe fn remap_fixed(fd: i32, addr: *mut u8, bytes: usize, file_offset: usize) -> io::Result<()> {
    let ptr = libc::mmap(
        addr.cast(),
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        file_offset as libc::off_t,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    debug_assert_eq!(ptr.cast::<u8>(), addr);
    Ok(())
}

/// Releases the physical pages backing a file range. The file size and any
/// mappings of the range are unaffected; subsequent reads return zeroes.
pub fn punch_hole(fd: i32, offset: usize, bytes: usize) -> io::Result<()> {
    // SAFETY: plain fallocate on a file descriptor we own.
    let rc = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            bytes as libc::off_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Maps a fresh anonymous private region for the large-object path.
pub fn map_anon(bytes: usize) -> io::Result<*mut u8> {
    // SAFETY: anonymous mapping, no fd involved.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast())
}

/// Unmaps a region previously returned by [`map_arena`] or [`map_anon`].
///
/// # Safety
///
/// `addr..addr + bytes` must be exactly a region returned by one of the
/// mapping calls above, with no live references into it.
pub unsafe fn unmap(addr: *mut u8, bytes: usize) {
    libc::munmap(addr.cast(), bytes);
}

/// Closes the arena backing file.
pub fn close_arena_file(fd: i32) {
    // SAFETY: fd came from create_arena_file and is not used afterwards.
    unsafe { libc::close(fd) };
}
