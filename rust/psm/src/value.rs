//! The closed set of values a store can hold.

use std::fmt;

/// A value that can be written to a shared segment.
///
/// `Tuple` differs from `List` only in how it is tagged on the wire.
/// `Mapping` keeps its pairs in insertion order; the wire format does not
/// require unique keys, but the item accessors treat the first match as the
/// entry for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Mapping(Vec<(Value, Value)>),
}

/// The variant of a [`Value`], without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Float,
    Text,
    List,
    Tuple,
    Mapping,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::List => "list",
            ValueKind::Tuple => "tuple",
            ValueKind::Mapping => "mapping",
        }
    }

    /// Whether values of this kind hold other values.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ValueKind::List | ValueKind::Tuple | ValueKind::Mapping
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Tuple(_) => ValueKind::Tuple,
            Value::Mapping(_) => ValueKind::Mapping,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Number of elements (List/Tuple), pairs (Mapping) or characters (Text).
    ///
    /// Returns `None` for numbers.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items.len()),
            Value::Mapping(pairs) => Some(pairs.len()),
            Value::Text(s) => Some(s.chars().count()),
            Value::Integer(_) | Value::Float(_) => None,
        }
    }

    /// Look up the value stored under `key` in a Mapping.
    pub fn get_key(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Mapping(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Element test for List/Tuple, key test for Mapping, substring test for
    /// Text. Numbers contain nothing.
    pub fn contains(&self, needle: &Value) -> bool {
        match self {
            Value::List(items) | Value::Tuple(items) => items.contains(needle),
            Value::Mapping(pairs) => pairs.iter().any(|(k, _)| k == needle),
            Value::Text(s) => match needle {
                Value::Text(sub) => s.contains(sub.as_str()),
                _ => false,
            },
            Value::Integer(_) | Value::Float(_) => false,
        }
    }
}

/// Resolve a possibly negative index against a sequence of `len` elements.
///
/// Negative indices count from the end, so `-1` is the last element.
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                f.write_str("[")?;
                seq(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                seq(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Value::Mapping(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Vec<(Value, Value)>> for Value {
    fn from(v: Vec<(Value, Value)>) -> Self {
        Value::Mapping(v)
    }
}
