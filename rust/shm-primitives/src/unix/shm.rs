//! Named POSIX shared-memory objects.
//!
//! A [`ShmObject`] is the open file descriptor of an object created with
//! `shm_open`. Its name is shared by every process on the host; its
//! lifetime ends only when the name is unlinked and the last descriptor and
//! mapping are gone.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::c_name;

/// Identity of an open object, used to tell whether a name still refers to
/// the object a process mapped earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    // SAFETY: `stat` is plain old data and fully written by a successful fstat.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn shm_open(name: &CString, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// An open named shared-memory object.
///
/// Dropping the object closes the descriptor but never unlinks the name.
#[derive(Debug)]
pub struct ShmObject {
    fd: OwnedFd,
    name: String,
}

impl ShmObject {
    /// Create a new object, failing with [`io::ErrorKind::AlreadyExists`] if
    /// the name is taken.
    ///
    /// The object starts with size zero; call [`ShmObject::resize`] before
    /// mapping it.
    pub fn create_exclusive(name: &str, mode: libc::mode_t) -> io::Result<Self> {
        let c = c_name(name)?;
        let fd = shm_open(&c, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, mode)?;
        Ok(Self {
            fd,
            name: name.to_owned(),
        })
    }

    /// Open an existing object read/write, failing with
    /// [`io::ErrorKind::NotFound`] if the name is unknown.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let c = c_name(name)?;
        let fd = shm_open(&c, libc::O_RDWR, 0)?;
        Ok(Self {
            fd,
            name: name.to_owned(),
        })
    }

    /// Look up the identity of whatever object currently carries `name`.
    ///
    /// Returns `Ok(None)` when no object has that name.
    pub fn probe(name: &str) -> io::Result<Option<FileId>> {
        let c = c_name(name)?;
        match shm_open(&c, libc::O_RDONLY, 0) {
            Ok(fd) => {
                let st = fstat(fd.as_raw_fd())?;
                Ok(Some(FileId {
                    dev: st.st_dev as u64,
                    ino: st.st_ino as u64,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove `name` from the system namespace.
    ///
    /// Existing descriptors and mappings stay valid until they are closed.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Set the object's size in bytes.
    pub fn resize(&self, len: usize) -> io::Result<()> {
        let len = libc::off_t::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "size does not fit in off_t")
        })?;
        if unsafe { libc::ftruncate(self.fd.as_raw_fd(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current size of the object in bytes.
    pub fn len(&self) -> io::Result<usize> {
        let st = fstat(self.fd.as_raw_fd())?;
        usize::try_from(st.st_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative object size"))
    }

    /// Returns true if the object has size zero.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Identity of this open object.
    pub fn id(&self) -> io::Result<FileId> {
        let st = fstat(self.fd.as_raw_fd())?;
        Ok(FileId {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }

    /// The name the object was opened with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsFd for ShmObject {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ShmObject {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
