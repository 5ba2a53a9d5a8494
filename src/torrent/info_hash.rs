use super::TorrentError;
use crate::bencode;
use sha1::{Digest, Sha1};

/// Computes the infohash of a torrent file: the SHA-1 digest of the raw
/// `info` dictionary bytes.
///
/// The digest is taken over the original source slice rather than a
/// re-encoding, so it is stable regardless of how the in-memory value
/// would serialize. The hasher is constructed per call; nothing is shared.
pub fn compute(torrent_bytes: &[u8]) -> Result<[u8; 20], TorrentError> {
    let info = bencode::raw_slice_for_key(torrent_bytes, b"info")?
        .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
    Ok(Sha1::digest(info).into())
}
