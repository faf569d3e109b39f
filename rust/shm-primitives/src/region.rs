use core::fmt;
use core::ptr::{self, NonNull};

/// A contiguous region of memory addressed by byte offset.
///
/// The memory behind a region is usually shared with other processes, so
/// every access copies bytes in or out instead of handing out references.
///
/// # Safety
///
/// The caller must ensure:
/// - `base` is valid for reads and writes of `len` bytes
/// - the memory remains valid for the lifetime of this Region
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

/// A byte range fell outside a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    /// Start of the requested range.
    pub offset: usize,
    /// Length of the requested range.
    pub len: usize,
    /// Size of the region.
    pub region_len: usize,
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "range {}..{} out of bounds (len={})",
            self.offset,
            self.offset.saturating_add(self.len),
            self.region_len
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OutOfBounds {}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for reads and writes of `len` bytes
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        let base = NonNull::new(base).expect("region base must be non-null");
        Self { base, len }
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<(), OutOfBounds> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        self.check(offset, dst.len())?;
        // SAFETY: the range was bounds-checked and `dst` cannot alias the
        // region because it is an exclusive borrow of ordinary memory.
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        self.check(offset, src.len())?;
        // SAFETY: the range was bounds-checked.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `offset` with `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<(), OutOfBounds> {
        self.check(offset, len)?;
        // SAFETY: the range was bounds-checked.
        unsafe { ptr::write_bytes(self.as_ptr().add(offset), byte, len) };
        Ok(())
    }

    /// Copy the whole region into a fresh vector.
    #[cfg(any(test, feature = "alloc"))]
    pub fn to_vec(&self) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec![0u8; self.len];
        // Cannot fail: the destination has exactly the region's length.
        let _ = self.read_at(0, &mut out);
        out
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use core::ptr::NonNull;

    /// Heap-backed region for tests or heap-based usage.
    pub struct HeapRegion {
        base: NonNull<u8>,
        len: usize,
        layout: Layout,
    }

    impl HeapRegion {
        /// Allocate a zeroed heap region aligned to 64 bytes.
        pub fn new_zeroed(size: usize) -> Self {
            let layout =
                Layout::from_size_align(size.max(1), 64).expect("invalid heap region layout");
            let ptr = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(ptr).expect("heap region allocation failed");
            Self {
                base,
                len: size,
                layout,
            }
        }

        /// Returns a Region view of this allocation.
        #[inline]
        pub fn region(&self) -> Region {
            unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
        }

        /// Returns the allocation size.
        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        /// Returns true if the allocation is zero-length.
        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let heap = HeapRegion::new_zeroed(16);
        let region = heap.region();

        region.write_at(4, &[0xAA, 0x03, 0x09]).unwrap();

        let mut out = [0u8; 3];
        region.read_at(4, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0x03, 0x09]);
        assert_eq!(region.to_vec()[..4], [0, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let heap = HeapRegion::new_zeroed(8);
        let region = heap.region();

        let err = region.write_at(6, &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            OutOfBounds {
                offset: 6,
                len: 3,
                region_len: 8
            }
        );

        let mut out = [0u8; 1];
        assert!(region.read_at(8, &mut out).is_err());
        assert!(region.read_at(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn fill_clears_bytes() {
        let heap = HeapRegion::new_zeroed(4);
        let region = heap.region();
        region.write_at(0, &[9, 9, 9, 9]).unwrap();
        region.fill(1, 2, 0).unwrap();
        assert_eq!(region.to_vec(), [9, 0, 0, 9]);
    }

    #[test]
    fn copies_share_memory() {
        let heap = HeapRegion::new_zeroed(4);
        let a = heap.region();
        let b = a;
        a.write_at(0, &[7]).unwrap();
        let mut out = [0u8; 1];
        b.read_at(0, &mut out).unwrap();
        assert_eq!(out[0], 7);
    }
}
