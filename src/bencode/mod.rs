//! Bencode value algebra and codec.
//!
//! Bencode is the container format of the BitTorrent metainfo file and of
//! tracker responses: byte strings, 64-bit integers, lists, and
//! dictionaries keyed by byte strings. The decoder here works over an
//! in-memory slice with an explicit cursor so that callers can recover the
//! exact source bytes of a sub-value (the infohash depends on that).
use std::collections::HashMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, raw_slice_for_key, Decoder};
pub use encoder::{encode, to_bytes};

/// A decoded bencode value.
///
/// - `String(Vec<u8>)` - a length-prefixed byte string (`4:spam`). Stored
///   as raw bytes; torrent fields are frequently not UTF-8.
/// - `Integer(i64)` - `i42e`.
/// - `List(Vec<..>)` - `l...e`.
/// - `Dict(HashMap<..>)` - `d...e`, keys are byte strings in strictly
///   increasing raw-byte order on the wire.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(HashMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Returns the byte string contents, if this value is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer, if this value is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// Error type for bencode decode/encode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("dictionary keys not strictly sorted")]
    UnsortedDictKeys,

    #[error("trailing bytes after value")]
    TrailingData,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
