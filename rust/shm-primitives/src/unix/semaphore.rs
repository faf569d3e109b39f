//! Named POSIX semaphores used as cross-process locks.
//!
//! Acquisition polls `sem_trywait` instead of blocking in `sem_wait` so a
//! lock left behind by a crashed process turns into a timeout rather than a
//! hang. `sem_timedwait` is not available on every unix we target.

use std::io;
use std::time::{Duration, Instant};

use super::c_name;

/// Upper bound on the sleep between two `sem_trywait` attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(5);

/// An open named semaphore.
///
/// Dropping the semaphore closes this process's handle; the name survives
/// until [`NamedSemaphore::unlink`] is called.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

impl NamedSemaphore {
    /// Open the semaphore called `name`, creating it with `initial` permits
    /// if it does not exist yet.
    pub fn open_or_create(name: &str, mode: libc::mode_t, initial: u32) -> io::Result<Self> {
        let c = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT,
                mode as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: name.to_owned(),
        })
    }

    /// Remove `name` from the system namespace.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Take one permit if one is available right now.
    pub fn try_acquire(&self) -> io::Result<Option<SemaphoreGuard<'_>>> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(Some(SemaphoreGuard { sem: self }));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(None),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Take one permit, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if the timeout elapsed.
    pub fn acquire_timeout(&self, timeout: Duration) -> io::Result<Option<SemaphoreGuard<'_>>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(50);
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(Some(guard));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn release(&self) {
        unsafe { libc::sem_post(self.sem) };
    }

    /// The name the semaphore was opened with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

// SAFETY: POSIX semaphores are designed for concurrent use from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

/// A held permit; released on drop.
pub struct SemaphoreGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/shmp_sem_{tag}_{}", std::process::id())
    }

    #[test]
    fn guard_releases_on_drop() {
        let name = unique("guard");
        let sem = NamedSemaphore::open_or_create(&name, 0o600, 1).unwrap();

        let guard = sem.try_acquire().unwrap();
        assert!(guard.is_some());
        assert!(sem.try_acquire().unwrap().is_none());

        drop(guard);
        assert!(sem.try_acquire().unwrap().is_some());

        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn second_handle_sees_same_permits() {
        let name = unique("shared");
        let a = NamedSemaphore::open_or_create(&name, 0o600, 1).unwrap();
        let b = NamedSemaphore::open_or_create(&name, 0o600, 1).unwrap();

        let _held = a.try_acquire().unwrap().unwrap();
        let waited = b.acquire_timeout(Duration::from_millis(20)).unwrap();
        assert!(waited.is_none());

        NamedSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn acquire_timeout_succeeds_when_free() {
        let name = unique("free");
        let sem = NamedSemaphore::open_or_create(&name, 0o600, 1).unwrap();
        assert!(
            sem.acquire_timeout(Duration::from_millis(10))
                .unwrap()
                .is_some()
        );
        NamedSemaphore::unlink(&name).unwrap();
    }
}
