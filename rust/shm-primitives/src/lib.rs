#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

pub mod region;

#[cfg(all(unix, feature = "std"))]
pub mod unix;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::{OutOfBounds, Region};

#[cfg(all(unix, feature = "std"))]
pub use unix::{FileId, MmapRegion, NamedSemaphore, SemaphoreGuard, ShmObject};
