//! Per-connection peer session.
//!
//! One session owns one TCP connection for its whole life: handshake,
//! bitfield exchange, then the read loop that drives the four-quadrant
//! choke/interest state machine, deposits incoming blocks into the piece
//! store, and serves the orchestrator's commands. A session that errors,
//! idles out, or is told to close always reports `Disconnected` exactly
//! once and then terminates.
use super::handshake::Handshake;
use super::message::{self, Message, MAX_REQUEST_LEN};
use super::{PeerError, PeerResult};
use crate::bitfield::Bitfield;
use crate::storage::{PieceStore, StorageError};
use crate::torrent::BLOCK_SIZE;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, timeout, Instant};
use tracing::{debug, trace};

/// The whole handshake exchange must finish within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer that has sent nothing for this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Keep-alives go out after this much send-side silence...
const KEEPALIVE_AFTER: Duration = Duration::from_secs(90);

/// ...but never more often than this.
const KEEPALIVE_MIN_GAP: Duration = Duration::from_secs(30);

/// Request pipeline depth while the remote is not choking us.
const MAX_OUTSTANDING: usize = 8;

/// Notifications a session sends up to the orchestrator, paired with the
/// session's remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A choke/interest flag or the remote piece set changed.
    StateChanged,
    /// The remote asked for a block and we are not choking it.
    BlockRequested { piece: u32, begin: u32, length: u32 },
    /// The remote withdrew an earlier request.
    BlockCancelled { piece: u32, begin: u32, length: u32 },
    /// Terminal; the session task is about to exit.
    Disconnected,
}

/// Instructions the orchestrator sends down to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SendHave(u32),
    SendPiece { piece: u32, begin: u32, data: Vec<u8> },
    Close,
}

enum Wake {
    Incoming(std::io::Result<usize>),
    Command(Option<SessionCommand>),
    Tick,
}

pub struct PeerSession {
    addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    store: Arc<PieceStore>,
    our_peer_id: [u8; 20],
    remote_has: Bitfield,
    block_requested: Vec<Bitfield>,
    we_choke_them: bool,
    they_choke_us: bool,
    we_interested: bool,
    they_interested: bool,
    outstanding: usize,
    last_active: Instant,
    last_send: Instant,
    last_keepalive: Instant,
    bytes_up: u64,
    bytes_down: u64,
    events: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl PeerSession {
    /// Wraps an established TCP connection (either direction) in a
    /// session. Returns the session and the command handle the
    /// orchestrator keeps.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<PieceStore>,
        our_peer_id: [u8; 20],
        events: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    ) -> (PeerSession, mpsc::UnboundedSender<SessionCommand>) {
        let (reader, writer) = stream.into_split();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let meta = store.metainfo();
        let num_pieces = meta.num_pieces();
        let block_requested = (0..num_pieces)
            .map(|piece| Bitfield::new(meta.blocks_in_piece(piece) as usize))
            .collect();
        let now = Instant::now();
        let session = PeerSession {
            addr,
            reader,
            writer,
            read_buf: BytesMut::with_capacity(4096),
            store,
            our_peer_id,
            remote_has: Bitfield::new(num_pieces),
            block_requested,
            we_choke_them: true,
            they_choke_us: true,
            we_interested: false,
            they_interested: false,
            outstanding: 0,
            last_active: now,
            last_send: now,
            last_keepalive: now,
            bytes_up: 0,
            bytes_down: 0,
            events,
            commands,
        };
        (session, command_tx)
    }

    /// Runs the session to completion and reports `Disconnected`.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!(
                peer = %self.addr,
                up = self.bytes_up,
                down = self.bytes_down,
                remote_interested = self.they_interested,
                "session closed"
            ),
            Err(e) => debug!(peer = %self.addr, error = %e, "session closed"),
        }
        let _ = self.events.send((self.addr, SessionEvent::Disconnected));
    }

    async fn drive(&mut self) -> PeerResult<()> {
        timeout(HANDSHAKE_TIMEOUT, self.exchange_handshakes())
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let bitfield = self.store.verified_bitfield();
        self.send(Message::Bitfield(bitfield.into_bytes())).await?;

        loop {
            let idle_deadline = self.last_active + IDLE_TIMEOUT;
            let keepalive_deadline = self.last_send + KEEPALIVE_AFTER;
            let deadline = idle_deadline.min(keepalive_deadline);

            // The read arm only pulls bytes into the buffer (a single
            // cancel-safe read); frames are cut out of the buffer after
            // the select resolves.
            let wake = tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => Wake::Incoming(read),
                command = self.commands.recv() => Wake::Command(command),
                _ = time::sleep_until(deadline) => Wake::Tick,
            };
            match wake {
                Wake::Incoming(read) => {
                    if read? == 0 {
                        // Remote hung up.
                        return Ok(());
                    }
                    self.last_active = Instant::now();
                    while let Some(msg) = self.extract_frame()? {
                        self.handle_message(msg).await?;
                    }
                }
                Wake::Command(None) | Wake::Command(Some(SessionCommand::Close)) => return Ok(()),
                Wake::Command(Some(command)) => self.handle_command(command).await?,
                Wake::Tick => {
                    if Instant::now() >= idle_deadline {
                        return Err(PeerError::IdleTimeout);
                    }
                    self.send_keepalive().await?;
                }
            }
        }
    }

    /// Both directions run the same exchange: send ours first, then read
    /// and validate the remote's.
    async fn exchange_handshakes(&mut self) -> PeerResult<()> {
        let ours = Handshake::new(self.store.metainfo().info_hash, self.our_peer_id);
        self.writer.write_all(&ours.serialize()).await?;
        let theirs = Handshake::read(&mut self.reader).await?;
        theirs.validate(&self.store.metainfo().info_hash)?;
        debug!(peer = %self.addr, remote_id = %hex::encode(theirs.peer_id), "handshake complete");
        Ok(())
    }

    /// Cuts one complete frame out of the read buffer, if present.
    fn extract_frame(&mut self) -> PeerResult<Option<Message>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.read_buf[..4].try_into().unwrap());
        if len > 9 + MAX_REQUEST_LEN {
            return Err(PeerError::FrameTooLarge(len));
        }
        if self.read_buf.len() < 4 + len as usize {
            return Ok(None);
        }
        self.read_buf.advance(4);
        let payload = self.read_buf.split_to(len as usize);
        Message::decode(&payload).map(Some)
    }

    async fn handle_message(&mut self, msg: Message) -> PeerResult<()> {
        trace!(peer = %self.addr, ?msg, "received");
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.they_choke_us = true;
                self.emit(SessionEvent::StateChanged);
            }
            Message::Unchoke => {
                self.they_choke_us = false;
                self.emit(SessionEvent::StateChanged);
                self.fill_requests().await?;
            }
            Message::Interested => {
                self.they_interested = true;
                self.emit(SessionEvent::StateChanged);
                self.send_unchoke().await?;
            }
            Message::NotInterested => {
                self.they_interested = false;
                self.emit(SessionEvent::StateChanged);
                self.send_choke().await?;
            }
            Message::Have(piece) => {
                self.remote_has.set(piece as usize);
                self.emit(SessionEvent::StateChanged);
                self.update_interest().await?;
                self.fill_requests().await?;
            }
            Message::Bitfield(bytes) => {
                let field = Bitfield::from_bytes(&bytes, self.remote_has.len()).ok_or(
                    PeerError::BitfieldLength {
                        got: bytes.len(),
                        expected: self.remote_has.as_bytes().len(),
                    },
                )?;
                // Tolerate a Have that arrived before the bitfield.
                self.remote_has.union(&field);
                self.emit(SessionEvent::StateChanged);
                self.update_interest().await?;
                self.fill_requests().await?;
            }
            Message::Request {
                piece,
                begin,
                length,
            } => self.handle_request(piece, begin, length)?,
            Message::Piece { piece, begin, data } => {
                self.handle_piece(piece, begin, data).await?;
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => {
                self.emit(SessionEvent::BlockCancelled {
                    piece,
                    begin,
                    length,
                });
            }
            Message::Port(_) | Message::Unknown(_) => {}
        }
        Ok(())
    }

    /// Validates an upload request and surfaces it to the orchestrator.
    /// Oversized or boundary-crossing requests end the session; requests
    /// from a peer we are choking are dropped on the floor.
    fn handle_request(&mut self, piece: u32, begin: u32, length: u32) -> PeerResult<()> {
        let meta = self.store.metainfo();
        if length > MAX_REQUEST_LEN
            || piece as usize >= meta.num_pieces()
            || u64::from(begin) + u64::from(length) > u64::from(meta.piece_size(piece as usize))
        {
            return Err(PeerError::InvalidRequest {
                piece,
                begin,
                length,
            });
        }
        if self.we_choke_them {
            trace!(peer = %self.addr, piece, "request from choked peer dropped");
            return Ok(());
        }
        self.emit(SessionEvent::BlockRequested {
            piece,
            begin,
            length,
        });
        Ok(())
    }

    async fn handle_piece(&mut self, piece: u32, begin: u32, data: Vec<u8>) -> PeerResult<()> {
        let block = begin / BLOCK_SIZE;
        self.bytes_down += data.len() as u64;
        if let Some(requested) = self.block_requested.get_mut(piece as usize) {
            if requested.has(block as usize) {
                requested.unset(block as usize);
                self.outstanding = self.outstanding.saturating_sub(1);
            }
        }
        match self.store.write_block(piece, block, &data) {
            Ok(()) => {}
            Err(StorageError::Io(e)) => return Err(PeerError::Io(e)),
            Err(e) => {
                debug!(peer = %self.addr, error = %e, "peer sent an unusable block");
                return Err(PeerError::InvalidRequest {
                    piece,
                    begin,
                    length: data.len() as u32,
                });
            }
        }
        self.fill_requests().await?;
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) -> PeerResult<()> {
        match command {
            SessionCommand::SendHave(piece) => self.send(Message::Have(piece)).await?,
            SessionCommand::SendPiece { piece, begin, data } => {
                self.bytes_up += data.len() as u64;
                self.send(Message::Piece { piece, begin, data }).await?;
            }
            // Close never reaches here; the read loop returns on it.
            SessionCommand::Close => {}
        }
        Ok(())
    }

    async fn send(&mut self, msg: Message) -> PeerResult<()> {
        trace!(peer = %self.addr, ?msg, "sending");
        message::write_frame(&mut self.writer, &msg).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn send_keepalive(&mut self) -> PeerResult<()> {
        if self.last_keepalive.elapsed() < KEEPALIVE_MIN_GAP {
            return Ok(());
        }
        self.send(Message::KeepAlive).await?;
        self.last_keepalive = Instant::now();
        Ok(())
    }

    async fn send_choke(&mut self) -> PeerResult<()> {
        if self.we_choke_them {
            return Ok(());
        }
        self.send(Message::Choke).await?;
        self.we_choke_them = true;
        Ok(())
    }

    async fn send_unchoke(&mut self) -> PeerResult<()> {
        if !self.we_choke_them {
            return Ok(());
        }
        self.send(Message::Unchoke).await?;
        self.we_choke_them = false;
        Ok(())
    }

    async fn send_interested(&mut self) -> PeerResult<()> {
        if self.we_interested {
            return Ok(());
        }
        self.send(Message::Interested).await?;
        self.we_interested = true;
        Ok(())
    }

    async fn send_not_interested(&mut self) -> PeerResult<()> {
        if !self.we_interested {
            return Ok(());
        }
        self.send(Message::NotInterested).await?;
        self.we_interested = false;
        Ok(())
    }

    /// Declares interest whenever the remote advertises a piece the store
    /// still needs, and withdraws it when nothing is left to want.
    async fn update_interest(&mut self) -> PeerResult<()> {
        let verified = self.store.verified_bitfield();
        let wants_any = (0..self.remote_has.len())
            .any(|piece| self.remote_has.has(piece) && !verified.has(piece));
        if wants_any {
            self.send_interested().await
        } else {
            self.send_not_interested().await
        }
    }

    /// Tops the request pipeline up to its depth with the next sequential
    /// blocks the store is missing and the remote has.
    async fn fill_requests(&mut self) -> PeerResult<()> {
        if self.they_choke_us || !self.we_interested {
            return Ok(());
        }
        while self.outstanding < MAX_OUTSTANDING {
            let Some((piece, block)) = self.next_wanted_block() else {
                return Ok(());
            };
            let length = self.store.metainfo().block_len(piece as usize, block);
            self.block_requested[piece as usize].set(block as usize);
            self.outstanding += 1;
            self.send(Message::Request {
                piece,
                begin: block * BLOCK_SIZE,
                length,
            })
            .await?;
        }
        Ok(())
    }

    fn next_wanted_block(&self) -> Option<(u32, u32)> {
        let meta = self.store.metainfo();
        for piece in 0..meta.num_pieces() {
            if !self.remote_has.has(piece) || self.store.is_verified(piece as u32) {
                continue;
            }
            for block in 0..meta.blocks_in_piece(piece) {
                if self.block_requested[piece].has(block as usize) {
                    continue;
                }
                if self.store.needs(piece as u32, block) {
                    return Some((piece as u32, block));
                }
            }
        }
        None
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send((self.addr, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::{read_frame, write_frame};
    use crate::torrent::{FileEntry, Metainfo};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn meta_for(content: &[u8], piece_length: u32) -> Arc<Metainfo> {
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        Arc::new(Metainfo {
            name: "payload.bin".to_string(),
            files: vec![FileEntry {
                path: PathBuf::from("payload.bin"),
                length: content.len() as u64,
                offset: 0,
            }],
            piece_length,
            piece_hashes,
            info_hash: [7u8; 20],
            trackers: vec!["http://tracker.example/announce".to_string()],
            private: None,
            total_length: content.len() as u64,
            is_directory: false,
            comment: String::new(),
            created_by: String::new(),
            creation_date: None,
        })
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn spawn_session(
        store: Arc<PieceStore>,
        addr: SocketAddr,
    ) -> (
        mpsc::UnboundedReceiver<(SocketAddr, SessionEvent)>,
        mpsc::UnboundedSender<SessionCommand>,
        tokio::task::JoinHandle<()>,
    ) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (session, commands) = PeerSession::new(stream, addr, store, [9u8; 20], events_tx);
        let task = tokio::spawn(session.run());
        (events_rx, commands, task)
    }

    #[tokio::test]
    async fn wrong_infohash_disconnects_without_state_events() {
        let dir = TempDir::new().unwrap();
        let meta = meta_for(&content(100), 100);
        let (store, _store_events) = PieceStore::new(meta, dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let bogus = Handshake::new([0xee; 20], [1u8; 20]);
            sock.write_all(&bogus.serialize()).await.unwrap();
            let _ = Handshake::read(&mut sock).await;
        });

        let (mut events, _commands, task) = spawn_session(store, addr).await;
        task.await.unwrap();
        remote.await.unwrap();

        let (_, first) = events.recv().await.unwrap();
        assert_eq!(first, SessionEvent::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn downloads_and_verifies_a_piece_from_a_seeder() {
        let dir = TempDir::new().unwrap();
        let data = content(40);
        let meta = meta_for(&data, 40);
        let (store, mut store_events) = PieceStore::new(meta, dir.path());
        let info_hash = store.metainfo().info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed_data = data.clone();
        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&Handshake::new(info_hash, [1u8; 20]).serialize())
                .await
                .unwrap();
            Handshake::read(&mut sock).await.unwrap();

            assert!(matches!(
                read_frame(&mut sock).await.unwrap(),
                Message::Bitfield(_)
            ));
            write_frame(&mut sock, &Message::Bitfield(vec![0b1000_0000]))
                .await
                .unwrap();
            write_frame(&mut sock, &Message::Unchoke).await.unwrap();

            assert_eq!(read_frame(&mut sock).await.unwrap(), Message::Interested);
            match read_frame(&mut sock).await.unwrap() {
                Message::Request {
                    piece: 0,
                    begin: 0,
                    length: 40,
                } => {}
                other => panic!("expected a request, got {other:?}"),
            }
            write_frame(
                &mut sock,
                &Message::Piece {
                    piece: 0,
                    begin: 0,
                    data: seed_data,
                },
            )
            .await
            .unwrap();
            // Hold the socket open until the session is told to close.
            let _ = read_frame(&mut sock).await;
        });

        let (mut events, commands, task) = spawn_session(store.clone(), addr).await;

        let verified = timeout(Duration::from_secs(5), store_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verified, crate::storage::StoreEvent::PieceVerified(0));
        assert!(store.is_complete());

        commands.send(SessionCommand::Close).unwrap();
        task.await.unwrap();
        remote.await.unwrap();

        let seen: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|(_, event)| event)
            .collect();
        assert!(seen.contains(&SessionEvent::StateChanged));
        assert_eq!(seen.last(), Some(&SessionEvent::Disconnected));
    }

    #[tokio::test]
    async fn serves_blocks_through_the_orchestrator_path() {
        let dir = TempDir::new().unwrap();
        let data = content(40);
        let meta = meta_for(&data, 40);
        std::fs::write(dir.path().join("payload.bin"), &data).unwrap();
        let (store, _store_events) = PieceStore::new(meta, dir.path());
        store.scan();
        let info_hash = store.metainfo().info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let expected = data.clone();
        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&Handshake::new(info_hash, [1u8; 20]).serialize())
                .await
                .unwrap();
            Handshake::read(&mut sock).await.unwrap();

            match read_frame(&mut sock).await.unwrap() {
                Message::Bitfield(bits) => assert_eq!(bits, vec![0b1000_0000]),
                other => panic!("expected the seed bitfield, got {other:?}"),
            }
            write_frame(&mut sock, &Message::Interested).await.unwrap();
            assert_eq!(read_frame(&mut sock).await.unwrap(), Message::Unchoke);
            write_frame(
                &mut sock,
                &Message::Request {
                    piece: 0,
                    begin: 8,
                    length: 16,
                },
            )
            .await
            .unwrap();
            match read_frame(&mut sock).await.unwrap() {
                Message::Piece {
                    piece: 0,
                    begin: 8,
                    data,
                } => assert_eq!(data, &expected[8..24]),
                other => panic!("expected the block back, got {other:?}"),
            }
        });

        let (mut events, commands, task) = spawn_session(store.clone(), addr).await;

        // The orchestrator's role, played inline: answer the request
        // event with a store read.
        let request = loop {
            let (_, event) = timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::BlockRequested {
                piece,
                begin,
                length,
            } = event
            {
                break (piece, begin, length);
            }
        };
        assert_eq!(request, (0, 8, 16));
        let block = store.read_block(0, 8, 16).unwrap();
        commands
            .send(SessionCommand::SendPiece {
                piece: 0,
                begin: 8,
                data: block,
            })
            .unwrap();

        remote.await.unwrap();
        // The remote hanging up may already have ended the session.
        let _ = commands.send(SessionCommand::Close);
        task.await.unwrap();
        assert_eq!(store.uploaded(), 16);
    }

    #[tokio::test]
    async fn oversized_request_closes_the_session() {
        let dir = TempDir::new().unwrap();
        let meta = meta_for(&content(100), 100);
        let (store, _store_events) = PieceStore::new(meta, dir.path());
        let info_hash = store.metainfo().info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&Handshake::new(info_hash, [1u8; 20]).serialize())
                .await
                .unwrap();
            Handshake::read(&mut sock).await.unwrap();
            let _ = read_frame(&mut sock).await.unwrap();
            write_frame(
                &mut sock,
                &Message::Request {
                    piece: 0,
                    begin: 0,
                    length: MAX_REQUEST_LEN + 1,
                },
            )
            .await
            .unwrap();
            // The session should hang up on us.
            assert!(read_frame(&mut sock).await.is_err());
        });

        let (mut events, _commands, task) = spawn_session(store, addr).await;
        task.await.unwrap();
        remote.await.unwrap();

        let seen: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|(_, event)| event)
            .collect();
        assert!(!seen
            .iter()
            .any(|event| matches!(event, SessionEvent::BlockRequested { .. })));
        assert_eq!(seen.last(), Some(&SessionEvent::Disconnected));
    }
}
