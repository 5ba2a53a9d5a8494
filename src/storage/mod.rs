//! On-disk piece store.
//!
//! Presents the torrent's file set as one contiguous logical byte vector:
//! block writes and piece reads are translated into per-file ranges by
//! walking the ordered file list. Tracks which blocks have been written
//! and which pieces have passed SHA-1 verification, and announces every
//! newly verified piece over an event channel.
use crate::bitfield::Bitfield;
use crate::torrent::{Metainfo, BLOCK_SIZE};
use sha1::{Digest, Sha1};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {block} of piece {piece} is out of range")]
    BlockOutOfRange { piece: u32, block: u32 },

    #[error("block carries {len} bytes, expected {expected}")]
    BlockLengthMismatch { len: usize, expected: u32 },

    #[error("read of {length} bytes at offset {begin} overruns piece {piece}")]
    ReadOutOfRange { piece: u32, begin: u32, length: u32 },
}

/// Emitted once per unverified-to-verified transition of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    PieceVerified(u32),
}

struct StoreFile {
    path: PathBuf,
    offset: u64,
    length: u64,
    write_lock: Mutex<()>,
}

struct StoreState {
    piece_verified: Bitfield,
    block_acquired: Vec<Bitfield>,
    uploaded: u64,
    downloaded: u64,
}

pub struct PieceStore {
    meta: Arc<Metainfo>,
    files: Vec<StoreFile>,
    state: Mutex<StoreState>,
    events: mpsc::UnboundedSender<StoreEvent>,
}

impl PieceStore {
    /// Builds a store rooted at `download_dir`. Multi-file torrents get a
    /// `<name>/` directory component; single-file torrents sit directly in
    /// the download directory. Returns the store and the event receiver.
    pub fn new(
        meta: Arc<Metainfo>,
        download_dir: &Path,
    ) -> (Arc<PieceStore>, mpsc::UnboundedReceiver<StoreEvent>) {
        let base = if meta.is_directory {
            download_dir.join(&meta.name)
        } else {
            download_dir.to_path_buf()
        };
        let files = meta
            .files
            .iter()
            .map(|entry| StoreFile {
                path: base.join(&entry.path),
                offset: entry.offset,
                length: entry.length,
                write_lock: Mutex::new(()),
            })
            .collect();
        let block_acquired = (0..meta.num_pieces())
            .map(|piece| Bitfield::new(meta.blocks_in_piece(piece) as usize))
            .collect();
        let (events, receiver) = mpsc::unbounded_channel();
        let store = Arc::new(PieceStore {
            state: Mutex::new(StoreState {
                piece_verified: Bitfield::new(meta.num_pieces()),
                block_acquired,
                uploaded: 0,
                downloaded: 0,
            }),
            meta,
            files,
            events,
        });
        (store, receiver)
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.meta
    }

    /// Reads the logical range starting at `start` into `buf`, walking the
    /// files that intersect it. Fails if any backing file is absent or too
    /// short.
    fn read_range(&self, start: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let end = start + buf.len() as u64;
        for file in &self.files {
            if file.offset + file.length <= start || file.offset >= end {
                continue;
            }
            let file_start = start.saturating_sub(file.offset);
            let file_end = (end - file.offset).min(file.length);
            let buf_start = file.offset.saturating_sub(start) as usize;
            let len = (file_end - file_start) as usize;
            let mut handle = fs::File::open(&file.path)?;
            handle.seek(SeekFrom::Start(file_start))?;
            handle.read_exact(&mut buf[buf_start..buf_start + len])?;
        }
        Ok(())
    }

    /// Writes `data` at logical offset `start`. Each touched file is
    /// written under its own lock; parent directories are created on first
    /// contact.
    fn write_range(&self, start: u64, data: &[u8]) -> std::io::Result<()> {
        let end = start + data.len() as u64;
        for file in &self.files {
            if file.offset + file.length <= start || file.offset >= end {
                continue;
            }
            let file_start = start.saturating_sub(file.offset);
            let file_end = (end - file.offset).min(file.length);
            let buf_start = file.offset.saturating_sub(start) as usize;
            let len = (file_end - file_start) as usize;
            let _guard = file.write_lock.lock().unwrap();
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&file.path)?;
            handle.seek(SeekFrom::Start(file_start))?;
            handle.write_all(&data[buf_start..buf_start + len])?;
        }
        Ok(())
    }

    /// Deposits one block received from the wire, then attempts to verify
    /// the piece it belongs to.
    pub fn write_block(&self, piece: u32, block: u32, data: &[u8]) -> Result<(), StorageError> {
        let piece_index = piece as usize;
        if piece_index >= self.meta.num_pieces() || block >= self.meta.blocks_in_piece(piece_index)
        {
            return Err(StorageError::BlockOutOfRange { piece, block });
        }
        let expected = self.meta.block_len(piece_index, block);
        if data.len() != expected as usize {
            return Err(StorageError::BlockLengthMismatch {
                len: data.len(),
                expected,
            });
        }

        let start = self.meta.piece_offset(piece_index) + u64::from(block) * u64::from(BLOCK_SIZE);
        self.write_range(start, data)?;

        {
            let mut state = self.state.lock().unwrap();
            state.block_acquired[piece_index].set(block as usize);
            state.downloaded += data.len() as u64;
        }
        self.verify(piece);
        Ok(())
    }

    /// Reads a sub-range of a piece to serve an upload request, counting
    /// the bytes against the `uploaded` total.
    pub fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>, StorageError> {
        let piece_index = piece as usize;
        if piece_index >= self.meta.num_pieces()
            || u64::from(begin) + u64::from(length) > u64::from(self.meta.piece_size(piece_index))
        {
            return Err(StorageError::ReadOutOfRange {
                piece,
                begin,
                length,
            });
        }
        let mut buf = vec![0u8; length as usize];
        self.read_range(self.meta.piece_offset(piece_index) + u64::from(begin), &mut buf)?;
        self.state.lock().unwrap().uploaded += u64::from(length);
        Ok(buf)
    }

    /// Hashes piece `piece` against its expected digest.
    ///
    /// A read failure (file absent, short) leaves all state untouched: the
    /// piece is simply unverifiable right now. On a match the piece is
    /// marked verified with every block bit set, and `PieceVerified` fires
    /// if the piece was not already verified. On a mismatch after a full
    /// acquire every block bit is cleared, since any of them may be the
    /// corrupt one; a mid-download mismatch leaves the block bits alone.
    pub fn verify(&self, piece: u32) -> bool {
        let piece_index = piece as usize;
        if piece_index >= self.meta.num_pieces() {
            return false;
        }
        let mut buf = vec![0u8; self.meta.piece_size(piece_index) as usize];
        if let Err(e) = self.read_range(self.meta.piece_offset(piece_index), &mut buf) {
            debug!(piece, error = %e, "piece not verifiable yet");
            return false;
        }
        let digest: [u8; 20] = Sha1::digest(&buf).into();
        let matches = digest == self.meta.piece_hashes[piece_index];

        let mut state = self.state.lock().unwrap();
        if matches {
            let newly_verified = !state.piece_verified.has(piece_index);
            state.piece_verified.set(piece_index);
            state.block_acquired[piece_index].set_all();
            drop(state);
            if newly_verified {
                debug!(piece, "piece verified");
                let _ = self.events.send(StoreEvent::PieceVerified(piece));
            }
        } else {
            state.piece_verified.unset(piece_index);
            if state.block_acquired[piece_index].all_set() {
                debug!(piece, "hash mismatch after full acquire, dropping all blocks");
                state.block_acquired[piece_index].clear_all();
            }
        }
        matches
    }

    /// Re-verifies every piece against what is already on disk, reifying
    /// progress from an earlier run.
    pub fn scan(&self) {
        for piece in 0..self.meta.num_pieces() as u32 {
            self.verify(piece);
        }
        info!(
            verified = self.verified_count(),
            total = self.meta.num_pieces(),
            "startup scan complete"
        );
    }

    /// Snapshot of the verified-piece bitmap, in wire bit order.
    pub fn verified_bitfield(&self) -> Bitfield {
        self.state.lock().unwrap().piece_verified.clone()
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.state.lock().unwrap().piece_verified.has(piece as usize)
    }

    /// True when `block` of `piece` still has to be fetched.
    pub fn needs(&self, piece: u32, block: u32) -> bool {
        let state = self.state.lock().unwrap();
        !state.piece_verified.has(piece as usize)
            && !state.block_acquired[piece as usize].has(block as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().piece_verified.all_set()
    }

    pub fn verified_count(&self) -> usize {
        self.state.lock().unwrap().piece_verified.count_set()
    }

    /// Bytes still missing, summing the actual size of every unverified
    /// piece (the last piece counts its true, possibly short, size).
    pub fn bytes_left(&self) -> u64 {
        let state = self.state.lock().unwrap();
        (0..self.meta.num_pieces())
            .filter(|piece| !state.piece_verified.has(*piece))
            .map(|piece| u64::from(self.meta.piece_size(piece)))
            .sum()
    }

    pub fn uploaded(&self) -> u64 {
        self.state.lock().unwrap().uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.state.lock().unwrap().downloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Builds a descriptor whose piece hashes match `content`, split over
    /// `files` (path, length) entries.
    fn meta_for(files: &[(&str, u64)], piece_length: u32, content: &[u8]) -> Arc<Metainfo> {
        let total: u64 = files.iter().map(|(_, len)| len).sum();
        assert_eq!(total as usize, content.len());
        let mut entries = Vec::new();
        let mut offset = 0;
        for (path, length) in files {
            entries.push(FileEntry {
                path: PathBuf::from(path),
                length: *length,
                offset,
            });
            offset += length;
        }
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        Arc::new(Metainfo {
            name: "testdata".to_string(),
            files: entries,
            piece_length,
            piece_hashes,
            info_hash: [7u8; 20],
            trackers: vec!["http://tracker.example/announce".to_string()],
            private: None,
            total_length: total,
            is_directory: files.len() > 1,
            comment: String::new(),
            created_by: String::new(),
            creation_date: None,
        })
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_all_blocks(store: &PieceStore, meta: &Metainfo, data: &[u8]) {
        for piece in 0..meta.num_pieces() {
            for block in 0..meta.blocks_in_piece(piece) {
                let start = meta.piece_offset(piece) as usize
                    + (block * BLOCK_SIZE) as usize;
                let len = meta.block_len(piece, block) as usize;
                store
                    .write_block(piece as u32, block, &data[start..start + len])
                    .unwrap();
            }
        }
    }

    #[test]
    fn single_file_download_verifies_all_pieces() {
        let dir = TempDir::new().unwrap();
        let data = content(65_537);
        let meta = meta_for(&[("payload.bin", 65_537)], 32_768, &data);
        assert_eq!(meta.num_pieces(), 3);
        let (store, mut events) = PieceStore::new(meta.clone(), dir.path());

        write_all_blocks(&store, &meta, &data);

        assert!(store.is_complete());
        assert_eq!(store.bytes_left(), 0);
        assert_eq!(store.downloaded(), 65_537);
        assert_eq!(store.verified_bitfield().as_bytes(), &[0b1110_0000]);

        let mut verified = Vec::new();
        while let Ok(StoreEvent::PieceVerified(piece)) = events.try_recv() {
            verified.push(piece);
        }
        verified.sort_unstable();
        assert_eq!(verified, vec![0, 1, 2]);

        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), data);
    }

    #[test]
    fn cross_file_write_lands_in_both_files() {
        let dir = TempDir::new().unwrap();
        let data = content(3000);
        let meta = meta_for(&[("a", 1000), ("b", 2000)], 1500, &data);
        let (store, _events) = PieceStore::new(meta, dir.path());

        let payload = content(500);
        store.write_range(800, &payload).unwrap();

        let mut roundtrip = vec![0u8; 500];
        store.read_range(800, &mut roundtrip).unwrap();
        assert_eq!(roundtrip, payload);

        let file_a = std::fs::read(dir.path().join("testdata/a")).unwrap();
        assert_eq!(&file_a[800..1000], &payload[..200]);
        let file_b = std::fs::read(dir.path().join("testdata/b")).unwrap();
        assert_eq!(&file_b[..300], &payload[200..]);
    }

    #[test]
    fn block_spanning_two_files_writes_verifies_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let data = content(3000);
        let meta = meta_for(&[("a", 1000), ("b", 2000)], 1500, &data);
        let (store, mut events) = PieceStore::new(meta, dir.path());

        // Piece 0 is one 1500-byte block covering all of `a` and the
        // start of `b`.
        store.write_block(0, 0, &data[..1500]).unwrap();
        assert!(store.is_verified(0));
        assert_eq!(store.read_block(0, 0, 1500).unwrap(), &data[..1500]);
        assert_eq!(events.try_recv().unwrap(), StoreEvent::PieceVerified(0));
    }

    #[test]
    fn corruption_clears_every_block_and_stays_silent() {
        let dir = TempDir::new().unwrap();
        let data = content(40_000);
        let meta = meta_for(&[("payload.bin", 40_000)], 32_768, &data);
        let (store, mut events) = PieceStore::new(meta.clone(), dir.path());

        write_all_blocks(&store, &meta, &data);
        assert!(store.is_verified(0));

        // Flip one byte of piece 0 on disk, then re-verify.
        let path = dir.path().join("payload.bin");
        let mut on_disk = std::fs::read(&path).unwrap();
        on_disk[100] ^= 0xff;
        std::fs::write(&path, &on_disk).unwrap();

        assert!(!store.verify(0));
        assert!(!store.is_verified(0));
        for block in 0..meta.blocks_in_piece(0) {
            assert!(store.needs(0, block));
        }

        // Only the two original verifications ever fired.
        let mut fired = Vec::new();
        while let Ok(StoreEvent::PieceVerified(piece)) = events.try_recv() {
            fired.push(piece);
        }
        fired.sort_unstable();
        assert_eq!(fired, vec![0, 1]);
    }

    #[test]
    fn partial_piece_mismatch_keeps_block_bits() {
        let dir = TempDir::new().unwrap();
        let data = content(32_768);
        let meta = meta_for(&[("payload.bin", 32_768)], 32_768, &data);
        let (store, _events) = PieceStore::new(meta.clone(), dir.path());

        store.write_block(0, 0, &data[..BLOCK_SIZE as usize]).unwrap();
        assert!(!store.is_verified(0));
        assert!(!store.needs(0, 0));
        assert!(store.needs(0, 1));
    }

    #[test]
    fn absent_file_defers_verification() {
        let dir = TempDir::new().unwrap();
        let data = content(100);
        let meta = meta_for(&[("payload.bin", 100)], 100, &data);
        let (store, mut events) = PieceStore::new(meta, dir.path());

        assert!(!store.verify(0));
        assert!(events.try_recv().is_err());
        assert!(store.needs(0, 0));
    }

    #[test]
    fn startup_scan_reifies_existing_data() {
        let dir = TempDir::new().unwrap();
        let data = content(65_537);
        let meta = meta_for(&[("payload.bin", 65_537)], 32_768, &data);
        std::fs::write(dir.path().join("payload.bin"), &data).unwrap();

        let (store, mut events) = PieceStore::new(meta, dir.path());
        store.scan();

        assert!(store.is_complete());
        assert_eq!(store.bytes_left(), 0);
        let mut fired = 0;
        while events.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn read_block_counts_upload_and_checks_bounds() {
        let dir = TempDir::new().unwrap();
        let data = content(2000);
        let meta = meta_for(&[("payload.bin", 2000)], 1000, &data);
        let (store, _events) = PieceStore::new(meta, dir.path());
        std::fs::write(dir.path().join("payload.bin"), &data).unwrap();

        let block = store.read_block(1, 200, 300).unwrap();
        assert_eq!(block, &data[1200..1500]);
        assert_eq!(store.uploaded(), 300);

        assert!(matches!(
            store.read_block(1, 900, 200),
            Err(StorageError::ReadOutOfRange { .. })
        ));
        assert!(matches!(
            store.write_block(9, 0, &[0u8; 100]),
            Err(StorageError::BlockOutOfRange { .. })
        ));
    }
}
