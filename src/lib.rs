//! Library root for rustybt.
//!
//! Re-exports the core modules: bencode, torrent metainfo, piece storage,
//! tracker client, peer wire protocol, and the client orchestrator.
pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;
