//! Segment manager.
//!
//! A [`Segment`] owns one process-local mapping of a named shared-memory
//! object and tracks its lifecycle:
//!
//! ```text
//!            open / restart
//!   Stopped ───────────────▶ Started
//!      ▲                        │
//!      └────────────────────────┘
//!        close, or the object was
//!        unlinked by another handle
//! ```
//!
//! The handle that created the object it is mapped to is the one that
//! unlinks it on close. Every other handle only ever drops its own mapping.

use std::fmt;
use std::io;
use std::os::unix::io::AsFd;
use std::time::Duration;

use shm_primitives::{FileId, MmapRegion, NamedSemaphore, Region, ShmObject};

use crate::config::{LOCK_SUFFIX, OBJECT_MODE, SHM_NAME_PREFIX, StoreOptions};
use crate::error::StoreError;

#[cfg(target_os = "macos")]
const MAX_OBJECT_NAME: usize = 31;
#[cfg(not(target_os = "macos"))]
const MAX_OBJECT_NAME: usize = 255;

/// Which side of the backing object's lifetime a handle starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the object exclusively and sizes it.
    Creator,
    /// Attaches to an object some other handle created.
    Attacher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Creator => f.write_str("creator"),
            Role::Attacher => f.write_str("attacher"),
        }
    }
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Started,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Stopped => f.write_str("Stopped"),
            State::Started => f.write_str("Started"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPolicy {
    /// Follow the role: creators create, attachers attach.
    Strict,
    /// Create with the remembered capacity, attach if the name is taken.
    CreateOrAttach,
}

/// A live mapping plus what is needed to validate and release it.
struct Mapping {
    region: MmapRegion,
    object: ShmObject,
    id: FileId,
    lock: Option<NamedSemaphore>,
    /// This handle created the object.
    created: bool,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        tracing::debug!(
            name = %self.object.name(),
            size = self.region.len(),
            "unmapped shared memory object"
        );
    }
}

/// Check that `name` can be turned into object and lock names.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('/') {
        "name contains '/'"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else if SHM_NAME_PREFIX.len() + name.len() + LOCK_SUFFIX.len() > MAX_OBJECT_NAME {
        "name is too long"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidName {
        name: name.to_owned(),
        reason,
    })
}

/// The backing object name for a logical store name.
pub fn object_name(name: &str) -> String {
    format!("{SHM_NAME_PREFIX}{name}")
}

/// One process's view of a named segment.
pub struct Segment {
    name: String,
    object_name: String,
    lock_name: String,
    role: Role,
    exist: bool,
    locking: bool,
    lock_timeout: Duration,
    size_hint: usize,
    /// Size of the object, known once it has been created or attached.
    capacity: Option<usize>,
    mapping: Option<Mapping>,
}

impl Segment {
    /// Create or attach per `options.role` and map the object.
    ///
    /// A creator sizes a new object to `size_hint` bytes and fails with
    /// [`StoreError::AlreadyExists`] if the name is taken, unless
    /// `options.exist` is set. An attacher fails with
    /// [`StoreError::NotFound`] if there is nothing to attach to.
    pub fn open(name: &str, size_hint: usize, options: &StoreOptions) -> Result<Self, StoreError> {
        let mut segment = Self::unopened(name, size_hint, options)?;
        segment.establish(OpenPolicy::Strict)?;
        Ok(segment)
    }

    fn unopened(name: &str, size_hint: usize, options: &StoreOptions) -> Result<Self, StoreError> {
        validate_name(name)?;
        let object_name = object_name(name);
        Ok(Self {
            name: name.to_owned(),
            lock_name: format!("{object_name}{LOCK_SUFFIX}"),
            object_name,
            role: options.role,
            exist: options.exist,
            locking: options.locking,
            lock_timeout: options.lock_timeout,
            size_hint: size_hint.max(1),
            capacity: None,
            mapping: None,
        })
    }

    fn establish(&mut self, policy: OpenPolicy) -> Result<(), StoreError> {
        let mapping = match (policy, self.role) {
            (OpenPolicy::Strict, Role::Creator) => match self.create(self.size_hint) {
                Err(StoreError::AlreadyExists { .. }) if self.exist => {
                    tracing::debug!(name = %self.object_name, "object exists, attaching instead");
                    self.attach()?
                }
                other => other?,
            },
            (OpenPolicy::Strict, Role::Attacher) => self.attach()?,
            (OpenPolicy::CreateOrAttach, _) => match self.capacity {
                Some(capacity) => match self.create(capacity) {
                    Err(StoreError::AlreadyExists { .. }) => self.attach()?,
                    other => other?,
                },
                None => self.attach()?,
            },
        };
        self.capacity = Some(mapping.region.len());
        self.mapping = Some(mapping);
        Ok(())
    }

    fn create(&self, size: usize) -> Result<Mapping, StoreError> {
        let object =
            ShmObject::create_exclusive(&self.object_name, OBJECT_MODE).map_err(|e| {
                match e.kind() {
                    io::ErrorKind::AlreadyExists => StoreError::AlreadyExists {
                        name: self.object_name.clone(),
                    },
                    _ => StoreError::Io(e),
                }
            })?;

        match self.map_created(object, size) {
            Ok(mapping) => {
                tracing::info!(name = %self.object_name, size, "created shared memory object");
                Ok(mapping)
            }
            Err(e) => {
                // The name is ours; do not leave an unsized object behind.
                let _ = ShmObject::unlink(&self.object_name);
                Err(e)
            }
        }
    }

    fn map_created(&self, object: ShmObject, size: usize) -> Result<Mapping, StoreError> {
        // The lock must be final before the object is sized: attachers
        // refuse an unsized object, so none can open a lock about to be
        // replaced.
        let lock = if self.locking {
            // A lock left under this name belongs to an earlier object.
            let _ = NamedSemaphore::unlink(&self.lock_name);
            Some(NamedSemaphore::open_or_create(
                &self.lock_name,
                OBJECT_MODE,
                1,
            )?)
        } else {
            None
        };
        object.resize(size)?;
        let id = object.id()?;
        let region = MmapRegion::map_shared(object.as_fd(), size)?;
        Ok(Mapping {
            region,
            object,
            id,
            lock,
            created: true,
        })
    }

    fn attach(&self) -> Result<Mapping, StoreError> {
        let object = ShmObject::open_existing(&self.object_name).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                name: self.object_name.clone(),
            },
            _ => StoreError::Io(e),
        })?;

        let size = object.len()?;
        if size == 0 {
            // Its creator has not sized it yet.
            tracing::debug!(name = %self.object_name, "object not sized yet");
            return Err(StoreError::NotFound {
                name: self.object_name.clone(),
            });
        }
        let id = object.id()?;
        let region = MmapRegion::map_shared(object.as_fd(), size)?;
        let lock = if self.locking {
            Some(NamedSemaphore::open_or_create(
                &self.lock_name,
                OBJECT_MODE,
                1,
            )?)
        } else {
            None
        };

        tracing::info!(name = %self.object_name, size, "attached to shared memory object");
        Ok(Mapping {
            region,
            object,
            id,
            lock,
            created: false,
        })
    }

    fn is_current(&self, mapping: &Mapping) -> bool {
        match ShmObject::probe(&self.object_name) {
            Ok(Some(id)) => id == mapping.id,
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(name = %self.object_name, error = %e, "probe failed, keeping mapping");
                true
            }
        }
    }

    /// Drop the mapping if its object was unlinked or replaced.
    pub fn refresh(&mut self) -> State {
        if let Some(mapping) = &self.mapping {
            if !self.is_current(mapping) {
                tracing::warn!(
                    name = %self.object_name,
                    "shared memory object was removed, detaching"
                );
                self.mapping = None;
            }
        }
        self.state()
    }

    /// Unmap, and unlink the object if this handle created it.
    ///
    /// Closing a stopped segment does nothing.
    pub fn close(&mut self) {
        let Some(mapping) = self.mapping.take() else {
            return;
        };
        let (id, created) = (mapping.id, mapping.created);
        drop(mapping);

        if created {
            self.unlink_if_current(id);
        }
    }

    fn unlink_if_current(&self, id: FileId) {
        match ShmObject::probe(&self.object_name) {
            Ok(Some(current)) if current == id => {
                match ShmObject::unlink(&self.object_name) {
                    Ok(()) => {
                        tracing::info!(name = %self.object_name, "unlinked shared memory object");
                    }
                    Err(e) => {
                        tracing::warn!(name = %self.object_name, error = %e, "shm_unlink failed");
                    }
                }
                let _ = NamedSemaphore::unlink(&self.lock_name);
            }
            Ok(_) => {
                tracing::debug!(
                    name = %self.object_name,
                    "object already replaced or removed, not unlinking"
                );
            }
            Err(e) => {
                tracing::warn!(name = %self.object_name, error = %e, "probe before unlink failed");
            }
        }
    }

    /// Re-run create-or-attach without forgetting the segment's name, role
    /// and capacity. Does nothing if the segment is started.
    ///
    /// Once a capacity is known, restart creates the object if it is gone
    /// and attaches if it exists; the handle that creates it becomes the
    /// one that unlinks it.
    pub fn restart(&mut self) -> Result<(), StoreError> {
        if self.refresh() == State::Started {
            return Ok(());
        }
        tracing::debug!(name = %self.object_name, role = %self.role, "restarting segment");
        self.establish(OpenPolicy::CreateOrAttach)
    }

    /// Run `f` on the mapped bytes while holding the segment lock.
    ///
    /// Returns [`StoreError::NoValue`] when the segment is stopped or its
    /// object has been removed.
    pub fn with_region<T>(
        &self,
        f: impl FnOnce(Region) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mapping = self.mapping.as_ref().ok_or(StoreError::NoValue)?;
        if !self.is_current(mapping) {
            return Err(StoreError::NoValue);
        }
        let _guard = match &mapping.lock {
            Some(lock) => Some(lock.acquire_timeout(self.lock_timeout)?.ok_or_else(|| {
                StoreError::LockTimeout {
                    name: self.lock_name.clone(),
                    timeout: self.lock_timeout,
                }
            })?),
            None => None,
        };
        f(mapping.region.region())
    }

    /// Run `f` on the mapped bytes without taking the segment lock.
    ///
    /// A concurrent writer may leave `f` looking at a torn frame.
    pub fn with_region_unlocked<T>(
        &self,
        f: impl FnOnce(Region) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mapping = self.mapping.as_ref().ok_or(StoreError::NoValue)?;
        if !self.is_current(mapping) {
            return Err(StoreError::NoValue);
        }
        f(mapping.region.region())
    }

    pub fn state(&self) -> State {
        if self.mapping.is_some() {
            State::Started
        } else {
            State::Stopped
        }
    }

    /// True while the mapping is live and the name still refers to it.
    pub fn is_available(&self) -> bool {
        self.mapping.as_ref().is_some_and(|m| self.is_current(m))
    }

    /// Whether the mapped object was created by this handle.
    pub fn created(&self) -> bool {
        self.mapping.as_ref().is_some_and(|m| m.created)
    }

    /// Size in bytes, once known.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.object_name)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "{tag}{}x{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn creator() -> StoreOptions {
        StoreOptions::creator()
    }

    fn attacher() -> StoreOptions {
        StoreOptions::attacher()
    }

    #[test]
    fn creator_then_attacher_share_bytes() {
        let name = unique("seg");
        let mut owner = Segment::open(&name, 64, &creator()).unwrap();
        let mut peer = Segment::open(&name, 0, &attacher()).unwrap();

        assert_eq!(owner.state(), State::Started);
        assert_eq!(peer.state(), State::Started);
        assert!(owner.created());
        assert!(!peer.created());
        assert_eq!(peer.capacity(), Some(64));

        owner
            .with_region(|r| Ok(r.write_at(0, &[1, 2, 3]).unwrap()))
            .unwrap();
        let bytes = peer
            .with_region(|r| {
                let mut out = [0u8; 3];
                r.read_at(0, &mut out).unwrap();
                Ok(out)
            })
            .unwrap();
        assert_eq!(bytes, [1, 2, 3]);

        peer.close();
        owner.close();
    }

    #[test]
    fn creator_collision_is_already_exists() {
        let name = unique("dup");
        let mut first = Segment::open(&name, 16, &creator()).unwrap();

        let err = Segment::open(&name, 16, &creator()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let mut tolerant = Segment::open(&name, 16, &creator().exist(true)).unwrap();
        assert!(!tolerant.created());

        tolerant.close();
        assert!(first.is_available());
        first.close();
    }

    #[test]
    fn attacher_without_object_is_not_found() {
        let err = Segment::open(&unique("none"), 0, &attacher()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn close_is_idempotent() {
        let name = unique("close");
        let mut segment = Segment::open(&name, 16, &creator()).unwrap();

        segment.close();
        assert_eq!(segment.state(), State::Stopped);
        assert!(!segment.is_available());
        segment.close();
        assert_eq!(segment.state(), State::Stopped);

        assert_eq!(ShmObject::probe(&object_name(&name)).unwrap(), None);
        assert!(matches!(
            segment.with_region(|_| Ok(())),
            Err(StoreError::NoValue)
        ));
    }

    #[test]
    fn attacher_close_keeps_object() {
        let name = unique("keep");
        let mut owner = Segment::open(&name, 16, &creator()).unwrap();
        let mut peer = Segment::open(&name, 0, &attacher()).unwrap();

        peer.close();
        assert!(owner.is_available());
        assert!(ShmObject::probe(&object_name(&name)).unwrap().is_some());
        owner.close();
    }

    #[test]
    fn removed_object_detaches_attacher() {
        let name = unique("gone");
        let mut owner = Segment::open(&name, 16, &creator()).unwrap();
        let mut peer = Segment::open(&name, 0, &attacher()).unwrap();

        owner.close();
        assert!(!peer.is_available());
        assert!(matches!(
            peer.with_region(|_| Ok(())),
            Err(StoreError::NoValue)
        ));
        assert_eq!(peer.refresh(), State::Stopped);
    }

    #[test]
    fn restart_recreates_then_reattaches() {
        let name = unique("again");
        let mut owner = Segment::open(&name, 32, &creator()).unwrap();
        let mut peer = Segment::open(&name, 0, &attacher()).unwrap();

        owner.close();
        peer.restart().unwrap();
        assert_eq!(peer.state(), State::Started);
        assert!(peer.created());
        assert_eq!(peer.capacity(), Some(32));

        owner.restart().unwrap();
        assert!(!owner.created());
        assert!(owner.is_available());

        // The first creator no longer owns the object.
        owner.close();
        assert!(peer.is_available());
        peer.close();
        assert_eq!(ShmObject::probe(&object_name(&name)).unwrap(), None);
    }

    #[test]
    fn restart_when_started_is_noop() {
        let name = unique("noop");
        let mut segment = Segment::open(&name, 16, &creator()).unwrap();
        segment.restart().unwrap();
        assert!(segment.created());
        segment.close();
    }

    #[test]
    fn attacher_opens_once_creator_exists() {
        let name = unique("late");
        let mut options = attacher();
        options.locking = false;
        assert!(Segment::open(&name, 0, &options).is_err());

        let mut owner = Segment::open(&name, 16, &creator()).unwrap();
        // A fresh attacher can now attach.
        let mut peer = Segment::open(&name, 0, &options).unwrap();
        assert!(peer.is_available());
        peer.close();
        owner.close();
    }

    #[test]
    fn attacher_arriving_during_create_shares_the_lock() {
        let name = unique("race");
        let timeout = Duration::from_millis(20);
        let mut owner = Segment::unopened(&name, 16, &creator().lock_timeout(timeout)).unwrap();

        // A lock left behind by an earlier object, stuck at zero.
        let stale = NamedSemaphore::open_or_create(&owner.lock_name, OBJECT_MODE, 0).unwrap();

        let object = ShmObject::create_exclusive(owner.object_name(), OBJECT_MODE).unwrap();
        // Created but not sized yet: attachers see nothing to attach to.
        let err = Segment::open(&name, 0, &attacher()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(err.is_recoverable());

        let mapping = owner.map_created(object, 16).unwrap();
        let mut peer = Segment::open(&name, 0, &attacher().lock_timeout(timeout)).unwrap();

        let guard = mapping.lock.as_ref().unwrap().try_acquire().unwrap().unwrap();
        assert!(matches!(
            peer.with_region(|_| Ok(())),
            Err(StoreError::LockTimeout { .. })
        ));
        drop(guard);
        peer.with_region(|_| Ok(())).unwrap();
        drop(stale);

        peer.close();
        owner.capacity = Some(16);
        owner.mapping = Some(mapping);
        owner.close();
        assert_eq!(ShmObject::probe(&object_name(&name)).unwrap(), None);
    }

    #[test]
    fn unlocked_segment_skips_semaphore() {
        let name = unique("nolock");
        let mut segment = Segment::open(&name, 8, &creator().locking(false)).unwrap();
        segment.with_region(|r| Ok(r.fill(0, 8, 0xEE).unwrap())).unwrap();
        segment.close();
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["", "a/b", "nul\0", &"x".repeat(300)] {
            assert!(matches!(
                validate_name(name),
                Err(StoreError::InvalidName { .. })
            ));
        }
        validate_name("ok_name").unwrap();
        assert_eq!(object_name("abc"), "/psm_abc");
    }
}
