//! Peer-wire message framing.
//!
//! Every message after the handshake is a 4-byte big-endian length prefix
//! followed by that many payload bytes; a zero length is a keep-alive and
//! the first payload byte otherwise selects the message. Ids nobody
//! recognizes still parse (as [`Message::Unknown`]) so that extensions do
//! not kill the connection; structurally wrong payload lengths do.
use super::{PeerError, PeerResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest block a peer may request: 128 KiB.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Frame cap: a full-size `Piece` payload plus its header.
const MAX_FRAME_LEN: u32 = 9 + MAX_REQUEST_LEN;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { piece: u32, begin: u32, length: u32 },
    Piece { piece: u32, begin: u32, data: Vec<u8> },
    Cancel { piece: u32, begin: u32, length: u32 },
    Port(u16),
    Unknown(u8),
}

impl Message {
    /// Encodes the full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            Message::Have(piece) => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request {
                piece,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { piece, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            Message::Unknown(id) => {
                buf.put_u32(1);
                buf.put_u8(*id);
            }
        }
        buf.to_vec()
    }

    /// Decodes a frame payload (everything after the length prefix). An
    /// empty payload is a keep-alive.
    pub fn decode(payload: &[u8]) -> PeerResult<Message> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = payload[0];
        let len = payload.len();
        let malformed = || PeerError::MalformedMessage { id, len };
        let msg = match id {
            0..=3 => {
                if len != 1 {
                    return Err(malformed());
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if len != 5 {
                    return Err(malformed());
                }
                Message::Have(BigEndian::read_u32(&payload[1..5]))
            }
            5 => Message::Bitfield(payload[1..].to_vec()),
            6 | 8 => {
                if len != 13 {
                    return Err(malformed());
                }
                let piece = BigEndian::read_u32(&payload[1..5]);
                let begin = BigEndian::read_u32(&payload[5..9]);
                let length = BigEndian::read_u32(&payload[9..13]);
                if id == 6 {
                    Message::Request {
                        piece,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        piece,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if len < 9 {
                    return Err(malformed());
                }
                Message::Piece {
                    piece: BigEndian::read_u32(&payload[1..5]),
                    begin: BigEndian::read_u32(&payload[5..9]),
                    data: payload[9..].to_vec(),
                }
            }
            9 => {
                if len != 3 {
                    return Err(malformed());
                }
                Message::Port(BigEndian::read_u16(&payload[1..3]))
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

/// Reads one length-prefixed frame from the stream.
///
/// Frames wider than a full-size `Piece` are refused before the payload is
/// allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> PeerResult<Message> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix);
    if len == 0 {
        return Ok(Message::KeepAlive);
    }
    if len > MAX_FRAME_LEN {
        return Err(PeerError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Message::decode(&payload)
}

/// Writes one frame and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> PeerResult<()> {
    stream.write_all(&msg.encode()).await?;
    stream.flush().await?;
    Ok(())
}
