//! Tag/length/payload framing for [`Value`]s.
//!
//! A record is `tag (1) | len (1) | payload (len)`. The single top-level
//! record in a segment is wrapped in sentinels:
//!
//! ```text
//! ┌──────┬─────┬─────┬───────────────────────────┬──────┐
//! │ 0xAA │ tag │ len │ payload (len bytes)       │ 0xBB │
//! └──────┴─────┴─────┴───────────────────────────┴──────┘
//! ```
//!
//! Scalars carry an 8-byte big-endian payload (Integer as two's complement,
//! Float as its IEEE-754 bit pattern). Text carries a 9-byte big-endian
//! payload holding its UTF-8 bytes read as one base-256 integer. Containers
//! carry their children's records back to back, without sentinels; a
//! Mapping alternates key and value records.

use std::fmt;

use crate::value::{Value, ValueKind};

/// First byte of a framed value.
pub const SENTINEL_BEGIN: u8 = 0xAA;

/// Last byte of a framed value.
pub const SENTINEL_END: u8 = 0xBB;

/// Payload length of Integer and Float records.
pub const SCALAR_LEN: u8 = 8;

/// Payload length of Text records.
pub const TEXT_LEN: u8 = 9;

/// Tag + length.
const HEADER_LEN: usize = 2;

/// Wire discriminators.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Integer = 0x0,
    Float = 0x1,
    /// Reserved; never written.
    Complex = 0x2,
    Text = 0x3,
    List = 0x4,
    Mapping = 0x5,
    Tuple = 0x6,
    /// Reserved; never written.
    NdArray = 0x7,
}

impl Tag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x0 => Tag::Integer,
            0x1 => Tag::Float,
            0x2 => Tag::Complex,
            0x3 => Tag::Text,
            0x4 => Tag::List,
            0x5 => Tag::Mapping,
            0x6 => Tag::Tuple,
            0x7 => Tag::NdArray,
            _ => return None,
        })
    }

    pub fn of(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Integer => Tag::Integer,
            ValueKind::Float => Tag::Float,
            ValueKind::Text => Tag::Text,
            ValueKind::List => Tag::List,
            ValueKind::Mapping => Tag::Mapping,
            ValueKind::Tuple => Tag::Tuple,
        }
    }

    /// The value kind this tag decodes to, if it is not a reserved tag.
    pub fn kind(self) -> Option<ValueKind> {
        match self {
            Tag::Integer => Some(ValueKind::Integer),
            Tag::Float => Some(ValueKind::Float),
            Tag::Text => Some(ValueKind::Text),
            Tag::List => Some(ValueKind::List),
            Tag::Mapping => Some(ValueKind::Mapping),
            Tag::Tuple => Some(ValueKind::Tuple),
            Tag::Complex | Tag::NdArray => None,
        }
    }
}

/// A value that cannot be represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Text longer than the fixed 9-byte payload.
    TextTooLong { len: usize },
    /// Text whose first byte is NUL; the base-256 payload drops leading zeros.
    TextLeadingNul,
    /// A container whose children do not fit the one-byte length field.
    ContainerTooLarge { len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::TextTooLong { len } => write!(
                f,
                "text is {len} bytes, at most {TEXT_LEN} fit in a record"
            ),
            EncodeError::TextLeadingNul => write!(f, "text cannot start with a NUL byte"),
            EncodeError::ContainerTooLarge { len } => write!(
                f,
                "container children are {len} bytes, at most {} fit in a record",
                u8::MAX
            ),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptFrame {
    /// The buffer ends before the frame does.
    Truncated,
    /// The byte after the payload is not [`SENTINEL_END`].
    BadEndSentinel { found: u8 },
    /// The tag byte is not a known discriminator.
    UnknownTag(u8),
    /// The tag is reserved and has no value representation.
    ReservedTag(Tag),
    /// A scalar or Text record with the wrong payload length.
    BadLength { tag: Tag, len: u8 },
    /// A child record's length runs past the end of its parent.
    ChildOverrun,
    /// A Mapping with an odd number of child records.
    UnpairedKey,
    /// Text payload that is not UTF-8.
    InvalidUtf8,
}

impl fmt::Display for CorruptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptFrame::Truncated => write!(f, "frame is truncated"),
            CorruptFrame::BadEndSentinel { found } => {
                write!(f, "expected end sentinel 0x{SENTINEL_END:02X}, found 0x{found:02X}")
            }
            CorruptFrame::UnknownTag(tag) => write!(f, "unknown tag 0x{tag:02X}"),
            CorruptFrame::ReservedTag(tag) => write!(f, "reserved tag {tag:?}"),
            CorruptFrame::BadLength { tag, len } => {
                write!(f, "{tag:?} record has invalid length {len}")
            }
            CorruptFrame::ChildOverrun => write!(f, "child record overruns its container"),
            CorruptFrame::UnpairedKey => write!(f, "mapping has a key without a value"),
            CorruptFrame::InvalidUtf8 => write!(f, "text is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CorruptFrame {}

/// Result of reading a frame that does not hold a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer does not start with [`SENTINEL_BEGIN`]: nothing was stored.
    NoValue,
    /// A frame was started but is malformed.
    Corrupt(CorruptFrame),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NoValue => write!(f, "no value stored"),
            DecodeError::Corrupt(c) => write!(f, "corrupt frame: {c}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Corrupt(c) => Some(c),
            DecodeError::NoValue => None,
        }
    }
}

impl From<CorruptFrame> for DecodeError {
    fn from(c: CorruptFrame) -> Self {
        DecodeError::Corrupt(c)
    }
}

// ── writer ────────────────────────────────────────────────────────────────────

/// Encode `value` as a complete frame, sentinels included.
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(frame_len(value));
    out.push(SENTINEL_BEGIN);
    encode_record(value, &mut out)?;
    out.push(SENTINEL_END);
    Ok(out)
}

/// Append the unframed record for `value` to `out`.
pub fn encode_record(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match value {
        Value::Integer(i) => {
            out.extend_from_slice(&[Tag::Integer as u8, SCALAR_LEN]);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(x) => {
            out.extend_from_slice(&[Tag::Float as u8, SCALAR_LEN]);
            out.extend_from_slice(&x.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            out.extend_from_slice(&[Tag::Text as u8, TEXT_LEN]);
            out.extend_from_slice(&text_payload(s)?);
        }
        Value::List(items) => encode_container(Tag::List, items.iter(), out)?,
        Value::Tuple(items) => encode_container(Tag::Tuple, items.iter(), out)?,
        Value::Mapping(pairs) => encode_container(
            Tag::Mapping,
            pairs.iter().flat_map(|(k, v)| [k, v]),
            out,
        )?,
    }
    Ok(())
}

fn encode_container<'a>(
    tag: Tag,
    children: impl Iterator<Item = &'a Value>,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let mut body = Vec::new();
    for child in children {
        encode_record(child, &mut body)?;
    }
    let len = u8::try_from(body.len())
        .map_err(|_| EncodeError::ContainerTooLarge { len: body.len() })?;
    out.extend_from_slice(&[tag as u8, len]);
    out.extend_from_slice(&body);
    Ok(())
}

fn text_payload(s: &str) -> Result<[u8; TEXT_LEN as usize], EncodeError> {
    let bytes = s.as_bytes();
    if bytes.len() > TEXT_LEN as usize {
        return Err(EncodeError::TextTooLong { len: bytes.len() });
    }
    if bytes.first() == Some(&0) {
        return Err(EncodeError::TextLeadingNul);
    }
    let mut payload = [0u8; TEXT_LEN as usize];
    payload[TEXT_LEN as usize - bytes.len()..].copy_from_slice(bytes);
    Ok(payload)
}

/// Size in bytes of the frame [`encode`] produces for `value`.
///
/// Does not check the wire limits; [`encode`] does.
pub fn frame_len(value: &Value) -> usize {
    2 + record_len(value)
}

fn record_len(value: &Value) -> usize {
    HEADER_LEN
        + match value {
            Value::Integer(_) | Value::Float(_) => SCALAR_LEN as usize,
            Value::Text(_) => TEXT_LEN as usize,
            Value::List(items) | Value::Tuple(items) => items.iter().map(record_len).sum(),
            Value::Mapping(pairs) => pairs
                .iter()
                .map(|(k, v)| record_len(k) + record_len(v))
                .sum(),
        }
}

// ── reader ────────────────────────────────────────────────────────────────────

/// Decode the frame at the start of `buf`.
///
/// Bytes after the end sentinel are ignored, so `buf` may be a whole
/// segment.
pub fn decode(buf: &[u8]) -> Result<Value, DecodeError> {
    if buf.first() != Some(&SENTINEL_BEGIN) {
        return Err(DecodeError::NoValue);
    }
    let len = *buf.get(2).ok_or(CorruptFrame::Truncated)? as usize;
    let end = 1 + HEADER_LEN + len;
    let found = *buf.get(end).ok_or(CorruptFrame::Truncated)?;
    if found != SENTINEL_END {
        return Err(CorruptFrame::BadEndSentinel { found }.into());
    }
    Ok(decode_record(&buf[1..end])?)
}

/// Read only the tag of the frame at the start of `buf`.
///
/// Cheaper than a full decode when only the stored kind matters.
pub fn peek_kind(buf: &[u8]) -> Result<ValueKind, DecodeError> {
    if buf.first() != Some(&SENTINEL_BEGIN) {
        return Err(DecodeError::NoValue);
    }
    let byte = *buf.get(1).ok_or(CorruptFrame::Truncated)?;
    let tag = Tag::from_u8(byte).ok_or(CorruptFrame::UnknownTag(byte))?;
    Ok(tag.kind().ok_or(CorruptFrame::ReservedTag(tag))?)
}

/// Decode one unframed record that spans all of `record`.
fn decode_record(record: &[u8]) -> Result<Value, CorruptFrame> {
    let [byte, len, payload @ ..] = record else {
        return Err(CorruptFrame::Truncated);
    };
    if payload.len() != *len as usize {
        return Err(CorruptFrame::ChildOverrun);
    }
    let tag = Tag::from_u8(*byte).ok_or(CorruptFrame::UnknownTag(*byte))?;

    match tag {
        Tag::Integer => Ok(Value::Integer(i64::from_be_bytes(scalar(tag, payload)?))),
        Tag::Float => Ok(Value::Float(f64::from_bits(u64::from_be_bytes(scalar(
            tag, payload,
        )?)))),
        Tag::Text => {
            if payload.len() != TEXT_LEN as usize {
                return Err(CorruptFrame::BadLength { tag, len: *len });
            }
            let start = payload
                .iter()
                .position(|&b| b != 0)
                .unwrap_or(payload.len());
            String::from_utf8(payload[start..].to_vec())
                .map(Value::Text)
                .map_err(|_| CorruptFrame::InvalidUtf8)
        }
        Tag::List => Ok(Value::List(children(payload)?)),
        Tag::Tuple => Ok(Value::Tuple(children(payload)?)),
        Tag::Mapping => {
            let flat = children(payload)?;
            if flat.len() % 2 != 0 {
                return Err(CorruptFrame::UnpairedKey);
            }
            let mut pairs = Vec::with_capacity(flat.len() / 2);
            let mut iter = flat.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok(Value::Mapping(pairs))
        }
        Tag::Complex | Tag::NdArray => Err(CorruptFrame::ReservedTag(tag)),
    }
}

fn scalar(tag: Tag, payload: &[u8]) -> Result<[u8; 8], CorruptFrame> {
    payload.try_into().map_err(|_| CorruptFrame::BadLength {
        tag,
        len: payload.len() as u8,
    })
}

/// Split a container payload into child records and decode each.
fn children(mut body: &[u8]) -> Result<Vec<Value>, CorruptFrame> {
    let mut values = Vec::new();
    while !body.is_empty() {
        let len = *body.get(1).ok_or(CorruptFrame::ChildOverrun)? as usize;
        let n = HEADER_LEN + len;
        if n > body.len() {
            return Err(CorruptFrame::ChildOverrun);
        }
        let (child, rest) = body.split_at(n);
        values.push(decode_record(child)?);
        body = rest;
    }
    Ok(values)
}
