#![doc = include_str!("../README.md")]

pub mod codec;
pub mod config;
pub mod error;
pub mod segment;
pub mod store;
pub mod value;

pub use codec::{CorruptFrame, DecodeError, EncodeError, Tag, decode, encode, frame_len};
pub use config::StoreOptions;
pub use error::StoreError;
pub use segment::{Role, Segment, State};
pub use store::SharedValue;
pub use value::{Value, ValueKind};
