//! Torrent metainfo parsing and validation.
//!
//! Provides the immutable [`Metainfo`] descriptor built from a .torrent
//! file, plus the error type covering everything that can be structurally
//! wrong with one.
use thiserror::Error;
pub mod info_hash;
pub mod metainfo;

pub use metainfo::{FileEntry, Metainfo, BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces string length not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("{actual} piece hashes for {expected} pieces")]
    PieceCountMismatch { expected: usize, actual: usize },

    #[error("unusable path in file list: {0}")]
    InvalidPath(String),
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
