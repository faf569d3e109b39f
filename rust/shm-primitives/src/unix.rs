pub mod mmap;
pub mod semaphore;
pub mod shm;

pub use mmap::MmapRegion;
pub use semaphore::{NamedSemaphore, SemaphoreGuard};
pub use shm::{FileId, ShmObject};

use std::ffi::CString;
use std::io;

/// Convert an object name into a C string, rejecting interior NULs.
fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "object name contains a NUL byte",
        )
    })
}
