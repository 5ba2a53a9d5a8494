//! The metainfo descriptor and its parser.
//!
//! A [`Metainfo`] is the immutable description of one torrent: the file
//! layout with running offsets, piece geometry, piece hashes, the
//! infohash, and the tracker list.
use crate::bencode::{self, BencodeValue};
use crate::torrent::info_hash;

use super::TorrentError;
use super::TorrentResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed request granularity of the peer wire: 16 KiB.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// One file of the torrent, positioned inside the logical byte vector.
///
/// `offset` is the distance from the start of the logical vector; entries
/// are ordered and contiguous, so the last `offset + length` equals the
/// total size. Single-file torrents carry one entry whose `path` is the
/// torrent name.
#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub files: Vec<FileEntry>,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
    pub trackers: Vec<String>,
    pub private: Option<bool>,
    pub total_length: u64,
    pub is_directory: bool,
    pub comment: String,
    pub created_by: String,
    pub creation_date: Option<SystemTime>,
}

/**
Splits the concatenated SHA-1 digests of the `pieces` string.

The `pieces` value inside `info` is one long byte string: 20 bytes per
piece, in piece-index order. Anything that is not a multiple of 20 bytes
cannot be a valid digest list and is rejected.
*/
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let mut hashes = Vec::with_capacity(pieces_bytes.len() / 20);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }
    Ok(hashes)
}

/// Parses the tiered `announce-list` (a list of lists of URL strings).
fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<String>> {
    let tiers = match value {
        BencodeValue::List(tiers) => tiers,
        _ => {
            return Err(TorrentError::InvalidFormat(
                "announce-list is not a list".to_string(),
            ))
        }
    };
    let mut urls = Vec::new();
    for tier in tiers {
        let trackers = match tier {
            BencodeValue::List(trackers) => trackers,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "announce tier is not a list".to_string(),
                ))
            }
        };
        for tracker in trackers {
            let url = tracker
                .as_bytes()
                .ok_or_else(|| {
                    TorrentError::InvalidFormat("tracker URL is not a string".to_string())
                })
                .and_then(|s| {
                    String::from_utf8(s.to_vec()).map_err(|e| {
                        TorrentError::InvalidFormat(format!("tracker URL is not UTF-8: {e}"))
                    })
                })?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    Ok(urls)
}

/// Validates one path component of a multi-file entry. Empty components,
/// `.`/`..`, and embedded separators would escape the download directory.
fn checked_component(raw: &[u8]) -> TorrentResult<String> {
    let component = String::from_utf8(raw.to_vec())
        .map_err(|e| TorrentError::InvalidPath(format!("not UTF-8: {e}")))?;
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(TorrentError::InvalidPath(component));
    }
    Ok(component)
}

/// Builds the ordered file list with running offsets from the `info`
/// dictionary: either the single `length` form or the multi-file `files`
/// list of `{path, length}` entries.
fn parse_files(
    info: &HashMap<Vec<u8>, BencodeValue>,
    name: &str,
) -> TorrentResult<(Vec<FileEntry>, bool)> {
    if let Some(value) = info.get(b"length".as_slice()) {
        let length = value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| TorrentError::MissingField("length".to_string()))?;
        let entry = FileEntry {
            path: PathBuf::from(name),
            length,
            offset: 0,
        };
        return Ok((vec![entry], false));
    }

    let list = match info.get(b"files".as_slice()) {
        Some(BencodeValue::List(list)) => list,
        _ => return Err(TorrentError::MissingField("length or files".to_string())),
    };
    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;
    for entry in list {
        let dict = match entry {
            BencodeValue::Dict(dict) => dict,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "file entry is not a dictionary".to_string(),
                ))
            }
        };
        let length = dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;
        let components = match dict.get(b"path".as_slice()) {
            Some(BencodeValue::List(components)) if !components.is_empty() => components,
            _ => return Err(TorrentError::MissingField("file path".to_string())),
        };
        let mut path = PathBuf::new();
        for component in components {
            let raw = component.as_bytes().ok_or_else(|| {
                TorrentError::InvalidFormat("path component is not a string".to_string())
            })?;
            path.push(checked_component(raw)?);
        }
        files.push(FileEntry {
            path,
            length,
            offset,
        });
        offset += length;
    }
    if files.is_empty() {
        return Err(TorrentError::InvalidFormat("empty file list".to_string()));
    }
    Ok((files, true))
}

impl Metainfo {
    /// Reads and parses a .torrent file from disk.
    pub fn load(path: &Path) -> TorrentResult<Metainfo> {
        let bytes = std::fs::read(path)?;
        Metainfo::from_bytes(&bytes)
    }

    /**
    Parses the raw bytes of a .torrent file into a descriptor.

    The infohash is computed over the original `info` byte range before
    the structural walk, so it never depends on re-encoding. Validation
    covers the required fields (`info`, `name`, `piece length`, `pieces`,
    one of `length`/`files`), the digest-list shape, and that the piece
    count matches the total length.
    */
    #[tracing::instrument(skip(bytes), level = "debug")]
    pub fn from_bytes(bytes: &[u8]) -> TorrentResult<Metainfo> {
        let info_hash = info_hash::compute(bytes)?;

        let root = match bencode::decode(bytes)? {
            BencodeValue::Dict(root) => root,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "root is not a dictionary".to_string(),
                ))
            }
        };
        let info = match root.get(b"info".as_slice()) {
            Some(BencodeValue::Dict(info)) => info,
            _ => return Err(TorrentError::MissingField("info".to_string())),
        };

        let name = info
            .get(b"name".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .ok_or_else(|| TorrentError::MissingField("name".to_string()))?;

        let piece_length = info
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|i| u32::try_from(i).ok())
            .filter(|len| *len > 0)
            .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;

        let piece_hashes = match info.get(b"pieces".as_slice()) {
            Some(BencodeValue::String(pieces)) => parse_pieces(pieces)?,
            _ => return Err(TorrentError::MissingField("pieces".to_string())),
        };

        let private = info
            .get(b"private".as_slice())
            .and_then(|v| v.as_integer())
            .map(|i| i == 1);

        let (files, is_directory) = parse_files(info, &name)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        let expected_pieces = total_length.div_ceil(u64::from(piece_length)) as usize;
        if expected_pieces != piece_hashes.len() {
            return Err(TorrentError::PieceCountMismatch {
                expected: expected_pieces,
                actual: piece_hashes.len(),
            });
        }

        // announce-list wins over the scalar announce when both exist.
        let mut trackers = match root.get(b"announce-list".as_slice()) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };
        if trackers.is_empty() {
            if let Some(url) = root.get(b"announce".as_slice()).and_then(|v| v.as_bytes()) {
                trackers.push(String::from_utf8_lossy(url).into_owned());
            }
        }
        if trackers.is_empty() {
            return Err(TorrentError::MissingField("announce".to_string()));
        }

        let comment = root
            .get(b"comment".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        let created_by = root
            .get(b"created by".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        let creation_date = root
            .get(b"creation date".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|secs| u64::try_from(secs).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        Ok(Metainfo {
            name,
            files,
            piece_length,
            piece_hashes,
            info_hash,
            trackers,
            private,
            total_length,
            is_directory,
            comment,
            created_by,
            creation_date,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size in bytes of piece `index`; the last piece covers whatever the
    /// total length leaves over.
    pub fn piece_size(&self, index: usize) -> u32 {
        if index + 1 < self.num_pieces() {
            return self.piece_length;
        }
        let full = (self.num_pieces().saturating_sub(1)) as u64 * u64::from(self.piece_length);
        (self.total_length - full) as u32
    }

    /// Number of 16 KiB blocks in piece `index` (the last one may be short).
    pub fn blocks_in_piece(&self, index: usize) -> u32 {
        self.piece_size(index).div_ceil(BLOCK_SIZE)
    }

    /// Length of block `block` inside piece `piece`.
    pub fn block_len(&self, piece: usize, block: u32) -> u32 {
        let piece_size = self.piece_size(piece);
        (piece_size - block * BLOCK_SIZE).min(BLOCK_SIZE)
    }

    /// Logical offset of the start of piece `index`.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * u64::from(self.piece_length)
    }
}
