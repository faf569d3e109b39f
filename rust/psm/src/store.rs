//! Store handle: one typed value in one named segment.

use std::fmt;

use shm_primitives::Region;

use crate::codec;
use crate::config::StoreOptions;
use crate::error::StoreError;
use crate::segment::{Role, Segment, State};
use crate::value::{Value, ValueKind, normalize_index};

/// A process-local handle on a value shared through named shared memory.
///
/// ```no_run
/// use psm::SharedValue;
///
/// let mut owner = SharedValue::create("greeting", "azerty")?;
/// let mut peer = SharedValue::attach("greeting")?;
/// assert_eq!(peer.value()?, "azerty".into());
///
/// peer.set_value("ytreza")?;
/// assert_eq!(owner.value()?, "ytreza".into());
///
/// peer.close();
/// owner.close();
/// # Ok::<(), psm::StoreError>(())
/// ```
///
/// Dropping a handle unmaps its segment but never unlinks the backing
/// object; call [`SharedValue::close`] on the creating handle for that.
pub struct SharedValue {
    segment: Segment,
    kind: Option<ValueKind>,
}

impl SharedValue {
    /// Create the segment `name` holding `initial`.
    pub fn create(name: &str, initial: impl Into<Value>) -> Result<Self, StoreError> {
        Self::open(name, StoreOptions::creator(), Some(initial.into()))
    }

    /// Attach to the segment `name` created elsewhere.
    pub fn attach(name: &str) -> Result<Self, StoreError> {
        Self::open(name, StoreOptions::attacher(), None)
    }

    /// Open `name` as described by `options`.
    ///
    /// A creator needs `initial`; the segment is sized to fit it and it is
    /// written only if this call created the object. An attacher uses
    /// `initial`, when given, only to fix its kind.
    pub fn open(
        name: &str,
        options: StoreOptions,
        initial: Option<Value>,
    ) -> Result<Self, StoreError> {
        if options.role == Role::Creator && initial.is_none() {
            return Err(StoreError::InitialValueRequired);
        }
        let initial_kind = initial.as_ref().map(Value::kind);
        if let (Some(expected), Some(found)) = (options.kind, initial_kind) {
            if expected != found {
                return Err(StoreError::TypeMismatch { expected, found });
            }
        }

        let frame = match (options.role, &initial) {
            (Role::Creator, Some(value)) => Some(codec::encode(value)?),
            _ => None,
        };
        let size = frame
            .as_ref()
            .map_or(options.size_hint, |f| options.size_hint.max(f.len()));

        let mut segment = Segment::open(name, size, &options)?;
        let mut kind = options.kind.or(initial_kind);

        match frame {
            Some(frame) if segment.created() => {
                if let Err(e) = segment.with_region(|region| write_frame(region, &frame)) {
                    segment.close();
                    return Err(e);
                }
                tracing::debug!(name = %segment.object_name(), bytes = frame.len(), "wrote initial value");
            }
            _ => {
                if kind.is_none() {
                    kind = segment.with_region(peek_kind).ok();
                }
            }
        }

        Ok(Self { segment, kind })
    }

    fn live(&mut self) -> Result<&Segment, StoreError> {
        match self.segment.refresh() {
            State::Started => Ok(&self.segment),
            State::Stopped => Err(StoreError::NoValue),
        }
    }

    fn check_kind(&self, found: ValueKind) -> Result<(), StoreError> {
        match self.kind {
            Some(expected) if expected != found => {
                tracing::warn!(name = %self.segment.object_name(), %expected, %found, "rejected value of the wrong kind");
                Err(StoreError::TypeMismatch { expected, found })
            }
            _ => Ok(()),
        }
    }

    /// Decode the stored value.
    pub fn value(&mut self) -> Result<Value, StoreError> {
        let value = self.live()?.with_region(read_value)?;
        if self.kind.is_none() {
            self.kind = Some(value.kind());
        }
        Ok(value)
    }

    /// Replace the stored value.
    ///
    /// The value must match the store's kind and its frame must fit the
    /// segment; otherwise the stored frame is left untouched.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<(), StoreError> {
        let value = value.into();
        self.check_kind(value.kind())?;
        let frame = codec::encode(&value)?;
        self.live()?
            .with_region(|region| write_frame(region, &frame))?;

        if self.kind.is_none() {
            tracing::debug!(name = %self.segment.object_name(), kind = %value.kind(), "adopted kind");
            self.kind = Some(value.kind());
        }
        tracing::trace!(name = %self.segment.object_name(), bytes = frame.len(), "stored value");
        Ok(())
    }

    /// Decode, change and re-encode the stored value under one lock.
    fn modify<T>(
        &mut self,
        f: impl FnOnce(&mut Value) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.live()?.with_region(|region| {
            let mut value = read_value(region)?;
            let out = f(&mut value)?;
            write_frame(region, &codec::encode(&value)?)?;
            Ok(out)
        })
    }

    /// Element of a List/Tuple by index, or value of a Mapping by key.
    ///
    /// On a number or Text the whole value is returned.
    pub fn item(&mut self, key: &Value) -> Result<Value, StoreError> {
        let value = self.value()?;
        item_of(&value, key)
    }

    /// Replace a List element, or insert or replace a Mapping entry.
    pub fn set_item(&mut self, key: &Value, item: impl Into<Value>) -> Result<(), StoreError> {
        let item = item.into();
        self.modify(|value| match value {
            Value::List(items) => {
                let index = resolve_index(key, items.len())?;
                items[index] = item;
                Ok(())
            }
            Value::Mapping(pairs) => {
                match pairs.iter_mut().find(|(k, _)| k == key) {
                    Some((_, v)) => *v = item,
                    None => pairs.push((key.clone(), item)),
                }
                Ok(())
            }
            other => Err(immutable(other.kind())),
        })
    }

    /// Remove and return a List element or a Mapping entry's value.
    pub fn remove_item(&mut self, key: &Value) -> Result<Value, StoreError> {
        self.modify(|value| match value {
            Value::List(items) => {
                let index = resolve_index(key, items.len())?;
                Ok(items.remove(index))
            }
            Value::Mapping(pairs) => {
                let position = pairs
                    .iter()
                    .position(|(k, _)| k == key)
                    .ok_or_else(|| StoreError::KeyNotFound {
                        key: key.to_string(),
                    })?;
                Ok(pairs.remove(position).1)
            }
            other => Err(immutable(other.kind())),
        })
    }

    /// Number of elements, entries or characters.
    pub fn len(&mut self) -> Result<usize, StoreError> {
        let value = self.value()?;
        value
            .len()
            .ok_or(StoreError::NotIndexable { kind: value.kind() })
    }

    pub fn is_empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Element, key or substring test, depending on the stored kind.
    pub fn contains(&mut self, needle: &Value) -> Result<bool, StoreError> {
        let value = self.value()?;
        match value {
            Value::Integer(_) | Value::Float(_) => {
                Err(StoreError::NotIndexable { kind: value.kind() })
            }
            _ => Ok(value.contains(needle)),
        }
    }

    /// Unmap; the creating handle also unlinks the backing object.
    pub fn close(&mut self) {
        self.segment.close();
    }

    /// Map the segment again after a close or after the object went away.
    pub fn restart(&mut self) -> Result<(), StoreError> {
        self.segment.restart()?;
        if self.kind.is_none() {
            self.kind = self.segment.with_region(peek_kind).ok();
        }
        Ok(())
    }

    /// Declared kind, if one is known yet.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn object_name(&self) -> &str {
        self.segment.object_name()
    }

    pub fn role(&self) -> Role {
        self.segment.role()
    }

    pub fn state(&self) -> State {
        self.segment.state()
    }

    pub fn is_available(&self) -> bool {
        self.segment.is_available()
    }

    /// Segment size in bytes.
    pub fn capacity(&self) -> Option<usize> {
        self.segment.capacity()
    }
}

/// Reads the value without the segment lock, so formatting never waits on
/// another handle; a concurrent write can show up as a corrupt frame.
impl fmt::Display for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Shared memory object: {}", self.object_name())?;
        writeln!(f, "Role: {}", self.role())?;
        writeln!(f, "Status: {}", self.state())?;
        writeln!(f, "Available: {}", self.is_available())?;
        match self.segment.with_region_unlocked(read_value) {
            Ok(value) => write!(f, "Value: {value}"),
            Err(e) => write!(f, "Value: <{e}>"),
        }
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedValue")
            .field("segment", &self.segment)
            .field("kind", &self.kind)
            .finish()
    }
}

fn read_value(region: Region) -> Result<Value, StoreError> {
    Ok(codec::decode(&region.to_vec())?)
}

fn peek_kind(region: Region) -> Result<ValueKind, StoreError> {
    Ok(codec::peek_kind(&region.to_vec())?)
}

fn write_frame(region: Region, frame: &[u8]) -> Result<(), StoreError> {
    let exceeded = StoreError::CapacityExceeded {
        needed: frame.len(),
        capacity: region.len(),
    };
    if frame.len() > region.len() {
        return Err(exceeded);
    }
    region.write_at(0, frame).map_err(|_| exceeded)
}

fn resolve_index(key: &Value, len: usize) -> Result<usize, StoreError> {
    let index = key.as_integer().ok_or(StoreError::TypeMismatch {
        expected: ValueKind::Integer,
        found: key.kind(),
    })?;
    normalize_index(index, len).ok_or(StoreError::IndexOutOfRange { index, len })
}

fn immutable(kind: ValueKind) -> StoreError {
    match kind {
        ValueKind::Tuple | ValueKind::Text => StoreError::ReadOnly { kind },
        _ => StoreError::NotIndexable { kind },
    }
}

fn item_of(value: &Value, key: &Value) -> Result<Value, StoreError> {
    match value {
        Value::List(items) | Value::Tuple(items) => {
            Ok(items[resolve_index(key, items.len())?].clone())
        }
        Value::Mapping(_) => value
            .get_key(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound {
                key: key.to_string(),
            }),
        Value::Integer(_) | Value::Float(_) | Value::Text(_) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shm_primitives::HeapRegion;

    #[test]
    fn sequence_items_by_index() {
        let list = Value::List(vec![10.into(), 20.into(), 30.into()]);
        assert_eq!(item_of(&list, &0.into()).unwrap(), Value::Integer(10));
        assert_eq!(item_of(&list, &(-1).into()).unwrap(), Value::Integer(30));
        assert!(matches!(
            item_of(&list, &3.into()),
            Err(StoreError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(matches!(
            item_of(&list, &"a".into()),
            Err(StoreError::TypeMismatch {
                expected: ValueKind::Integer,
                found: ValueKind::Text
            })
        ));
    }

    #[test]
    fn mapping_items_by_key() {
        let map = Value::Mapping(vec![("a".into(), 1.into())]);
        assert_eq!(item_of(&map, &"a".into()).unwrap(), Value::Integer(1));
        assert!(matches!(
            item_of(&map, &"b".into()),
            Err(StoreError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn scalar_item_is_whole_value() {
        let text = Value::from("azerty");
        assert_eq!(item_of(&text, &0.into()).unwrap(), text);
        assert_eq!(item_of(&Value::Float(1.5), &7.into()).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn write_frame_checks_capacity() {
        let heap = HeapRegion::new_zeroed(4);
        let err = write_frame(heap.region(), &[0; 5]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CapacityExceeded {
                needed: 5,
                capacity: 4
            }
        ));
        assert_eq!(heap.region().to_vec(), vec![0; 4]);

        write_frame(heap.region(), &[1, 2]).unwrap();
        assert_eq!(heap.region().to_vec(), vec![1, 2, 0, 0]);
    }

    #[test]
    fn read_value_from_region() {
        let heap = HeapRegion::new_zeroed(32);
        assert!(matches!(read_value(heap.region()), Err(StoreError::NoValue)));

        let frame = codec::encode(&"azerty".into()).unwrap();
        write_frame(heap.region(), &frame).unwrap();
        assert_eq!(read_value(heap.region()).unwrap(), Value::from("azerty"));
        assert_eq!(peek_kind(heap.region()).unwrap(), ValueKind::Text);
    }

    #[test]
    fn tuples_and_text_are_read_only() {
        assert!(matches!(
            immutable(ValueKind::Tuple),
            StoreError::ReadOnly { .. }
        ));
        assert!(matches!(
            immutable(ValueKind::Text),
            StoreError::ReadOnly { .. }
        ));
        assert!(matches!(
            immutable(ValueKind::Integer),
            StoreError::NotIndexable { .. }
        ));
    }
}
