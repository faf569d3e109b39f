//! Store configuration.

use std::time::Duration;

use crate::segment::Role;
use crate::value::ValueKind;

/// Prefix prepended to every logical name to form the object name.
pub const SHM_NAME_PREFIX: &str = "/psm_";

/// Suffix appended to the object name to form the lock name.
pub const LOCK_SUFFIX: &str = ".lock";

/// Permission bits for created objects (owner read/write only).
pub const OBJECT_MODE: libc::mode_t = 0o600;

/// Segment size requested when no hint is given.
pub const DEFAULT_SIZE_HINT: usize = 8;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

fn lock_timeout_from_env() -> Duration {
    std::env::var("PSM_LOCK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_LOCK_TIMEOUT)
}

/// Options for opening a store.
///
/// ```
/// use psm::{Role, StoreOptions};
///
/// let options = StoreOptions {
///     role: Role::Attacher,
///     locking: false,
///     ..StoreOptions::default()
/// };
/// assert_eq!(options.size_hint, 8);
/// ```
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Whether this handle creates the backing object or attaches to it.
    pub role: Role,
    /// Minimum segment size in bytes for a creator. The segment is never
    /// smaller than the initial value's frame.
    pub size_hint: usize,
    /// Let a creator attach when an object with its name already exists.
    pub exist: bool,
    /// Declared value kind. Defaults to the initial value's kind (creator)
    /// or the stored frame's kind (attacher).
    pub kind: Option<ValueKind>,
    /// Guard every read and write with the segment's named semaphore.
    pub locking: bool,
    /// How long to wait for the segment lock.
    ///
    /// Defaults to `PSM_LOCK_TIMEOUT_MS` when set, otherwise one second.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            role: Role::Creator,
            size_hint: DEFAULT_SIZE_HINT,
            exist: false,
            kind: None,
            locking: true,
            lock_timeout: lock_timeout_from_env(),
        }
    }
}

impl StoreOptions {
    pub fn creator() -> Self {
        Self::default()
    }

    pub fn attacher() -> Self {
        Self {
            role: Role::Attacher,
            ..Self::default()
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn size_hint(mut self, size_hint: usize) -> Self {
        self.size_hint = size_hint;
        self
    }

    pub fn exist(mut self, exist: bool) -> Self {
        self.exist = exist;
        self
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let options = StoreOptions::attacher()
            .kind(ValueKind::Text)
            .size_hint(64)
            .locking(false);
        assert_eq!(options.role, Role::Attacher);
        assert_eq!(options.kind, Some(ValueKind::Text));
        assert_eq!(options.size_hint, 64);
        assert!(!options.locking);
        assert!(!options.exist);
    }

    #[test]
    fn creator_defaults() {
        let options = StoreOptions::creator();
        assert_eq!(options.role, Role::Creator);
        assert_eq!(options.size_hint, DEFAULT_SIZE_HINT);
        assert!(options.locking);
        assert!(options.lock_timeout > Duration::ZERO);
    }
}
