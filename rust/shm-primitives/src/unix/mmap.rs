//! Shared memory mappings of named objects.
//!
//! This module provides `MmapRegion`, a `MAP_SHARED` mapping of an open
//! [`ShmObject`](super::ShmObject). Writes through one mapping are visible
//! to every other process that maps the same object.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};

use crate::Region;

/// A process-local `MAP_SHARED` mapping.
///
/// The mapping stays valid after the descriptor it was created from is
/// closed and after the object's name is unlinked; it is released on drop.
pub struct MmapRegion {
    /// Pointer to the mapped memory
    ptr: *mut u8,
    /// Length of the mapping in bytes
    len: usize,
}

impl MmapRegion {
    /// Map the first `len` bytes of `fd` read/write with `MAP_SHARED`.
    pub fn map_shared(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Get a `Region` view of this mapping.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: The mapping is valid for the lifetime of MmapRegion
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    /// Get the size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (zero bytes).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: The mapping is valid for the lifetime of MmapRegion and can be
// accessed from multiple threads (the underlying memory is shared anyway).
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
