//! Canonical binary encoding for nested metadata values.
//!
//! Integers, byte strings, lists and byte-keyed maps are serialized in a
//! bencode-compatible form. Maps are always emitted with keys in ascending
//! raw byte order, so structurally equal values produce identical bytes.
//! Content identifiers and every wire message depend on that property.

mod decode;
mod encode;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use value::Value;

/// Failures while decoding a canonical byte sequence.
///
/// A codec error is fatal to the single decode call that produced it and
/// never to the connection or process that received the bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("Invalid integer at offset {offset}: {reason}")]
    InvalidInteger { offset: usize, reason: &'static str },

    #[error("Invalid string length at offset {offset}")]
    InvalidStringLength { offset: usize },

    #[error("Unexpected byte 0x{byte:02x} at offset {offset}")]
    UnexpectedByte { offset: usize, byte: u8 },

    #[error("Map keys out of order at offset {offset}")]
    UnsortedKeys { offset: usize },

    #[error("Duplicate map key at offset {offset}")]
    DuplicateKey { offset: usize },

    #[error("Nesting deeper than {max_depth} levels")]
    NestingTooDeep { max_depth: usize },

    #[error("{remaining} trailing bytes after value")]
    TrailingData { remaining: usize },
}
