//! Peer-wire protocol: handshake, message codec, and the per-connection
//! session state machine.
use thiserror::Error;
pub mod handshake;
pub mod message;
pub mod session;

pub use handshake::Handshake;
pub use message::Message;
pub use session::{PeerSession, SessionCommand, SessionEvent};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid handshake header")]
    InvalidProtocol,

    #[error("handshake info hash mismatch")]
    InfoHashMismatch,

    #[error("frame of {0} bytes exceeds the wire limit")]
    FrameTooLarge(u32),

    #[error("malformed message: id {id} with {len} payload bytes")]
    MalformedMessage { id: u8, len: usize },

    #[error("bitfield of {got} bytes, expected {expected}")]
    BitfieldLength { got: usize, expected: usize },

    #[error("request for {length} bytes at {begin} overruns piece {piece}")]
    InvalidRequest { piece: u32, begin: u32, length: u32 },

    #[error("peer idle past the liveness deadline")]
    IdleTimeout,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
