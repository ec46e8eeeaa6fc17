// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Thin wrappers over the host's memory mapping primitives.

use std::os::fd::RawFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    size as usize
});

/// The size of one page of virtual memory on this host. Always a positive
/// power of two.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Access protection for the mappings created on behalf of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prot {
    Read,
    ReadWrite,
}

impl Prot {
    fn flags(self) -> libc::c_int {
        match self {
            Prot::Read => libc::PROT_READ,
            Prot::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Map `size` bytes of `fd` starting at `offset` (both page granular) at a
/// kernel-chosen address, shared with other mappings of the file.
pub(crate) fn map_file(
    fd: RawFd,
    prot: Prot,
    offset: u64,
    size: usize,
) -> std::result::Result<NonNull<u8>, Errno> {
    // SAFETY: a MAP_SHARED mapping at a kernel-chosen address cannot
    // clobber any existing mapping
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot.flags(),
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    // SAFETY: a successful mmap never returns null
    Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
}

/// Replace `[addr, addr + size)` with zero-filled anonymous pages, keeping
/// the same protection. The region stays mapped at the same address.
///
/// # Safety
/// The range must be a mapping owned by the caller.
pub(crate) unsafe fn map_anonymous_fixed(
    addr: NonNull<u8>,
    size: usize,
    prot: Prot,
) -> std::result::Result<(), Errno> {
    // SAFETY: per the caller's contract only the caller's own mapping is
    // replaced
    let ptr = unsafe {
        libc::mmap(
            addr.as_ptr().cast(),
            size,
            prot.flags(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    debug_assert_eq!(ptr.cast(), addr.as_ptr(), "MAP_FIXED must not relocate");
    Ok(())
}

/// Unmap a region previously returned by [`map_file`].
///
/// # Safety
/// No pointer into the region may be dereferenced afterwards.
pub(crate) unsafe fn unmap(addr: NonNull<u8>, size: usize) {
    // SAFETY: the caller owns the mapping
    let rc = unsafe { libc::munmap(addr.as_ptr().cast(), size) };
    if rc != 0 {
        // the range was not a mapping of ours, which is a bookkeeping bug;
        // nothing can be released here
        tracing::error!(errno = %Errno::last(), ?addr, size, "munmap of cache window failed");
    }
}
