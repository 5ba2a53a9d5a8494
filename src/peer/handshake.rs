//! The BitTorrent peer handshake.
//!
//! The handshake is the first traffic on a fresh connection in either
//! direction. It pins the protocol identifier and proves both ends are
//! talking about the same torrent via the infohash; the session closes the
//! connection when that proof fails.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A fixed 68-byte handshake frame: length byte `19`, the protocol string,
/// 8 reserved bytes, the infohash, and the sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes into the 68-byte wire form.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a handshake from the stream.
    ///
    /// The remote hash and peer id are copied into buffers allocated here,
    /// never into borrowed or reused storage, before any comparison.
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> PeerResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;

        if buf[0] != PROTOCOL.len() as u8 || &buf[1..20] != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Checks that the remote is on the same torrent.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}
