//! Client orchestrator.
//!
//! Owns the metainfo descriptor, the piece store, the tracker set, and the
//! live peer sessions. Wires the event streams together: tracker announces
//! feed the dialer, verified pieces fan out as `Have` messages, and upload
//! requests are answered from the store. All peer and tracker failures are
//! contained here; nothing a single remote does can take the supervisor
//! down.
use crate::peer::{PeerSession, SessionCommand, SessionEvent};
use crate::storage::{PieceStore, StoreEvent};
use crate::torrent::Metainfo;
use crate::tracker::{self, AnnounceEvent, Tracker, MIN_BACKOFF};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub struct Config {
    pub port: u16,
    pub download_dir: PathBuf,
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

pub struct Client {
    meta: Arc<Metainfo>,
    store: Arc<PieceStore>,
    store_events: mpsc::UnboundedReceiver<StoreEvent>,
    peer_id: [u8; 20],
    port: u16,
    sessions: HashMap<SocketAddr, SessionHandle>,
    session_events_tx: mpsc::UnboundedSender<(SocketAddr, SessionEvent)>,
    session_events: mpsc::UnboundedReceiver<(SocketAddr, SessionEvent)>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

enum Tick {
    Shutdown,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Peers(Option<Vec<SocketAddr>>),
    Dialed(Option<(SocketAddr, std::io::Result<TcpStream>)>),
    Store(Option<StoreEvent>),
    Session(Option<(SocketAddr, SessionEvent)>),
}

impl Client {
    /// Builds the store, reifies any data already on disk, and prepares
    /// the supervisor. Nothing touches the network until [`run`].
    ///
    /// [`run`]: Client::run
    pub fn new(meta: Arc<Metainfo>, config: Config) -> Result<Client> {
        let (store, store_events) = PieceStore::new(meta.clone(), &config.download_dir);
        store.scan();
        let (session_events_tx, session_events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Client {
            meta,
            store,
            store_events,
            peer_id: tracker::generate_peer_id(),
            port: config.port,
            sessions: HashMap::new(),
            session_events_tx,
            session_events,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    /// Runs until the `shutdown` future resolves: accepts inbound peers,
    /// dials tracker-provided endpoints, and relays events between the
    /// store and the sessions. On shutdown every tracker gets a `Stopped`
    /// announce and every session a close.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("cannot listen on port {}", self.port))?;
        info!(
            port = self.port,
            peer_id = %String::from_utf8_lossy(&self.peer_id[..8]),
            "listening for peers"
        );

        let (peers_tx, mut peers_rx) = mpsc::unbounded_channel();
        let tracker_tasks: Vec<JoinHandle<()>> = self
            .meta
            .trackers
            .iter()
            .map(|url| self.spawn_tracker(url.clone(), peers_tx.clone()))
            .collect();

        let (dial_tx, mut dial_rx) = mpsc::unbounded_channel();
        let mut dialing: HashSet<SocketAddr> = HashSet::new();

        tokio::pin!(shutdown);
        loop {
            let tick = tokio::select! {
                _ = &mut shutdown => Tick::Shutdown,
                accepted = listener.accept() => Tick::Accepted(accepted),
                peers = peers_rx.recv() => Tick::Peers(peers),
                dialed = dial_rx.recv() => Tick::Dialed(dialed),
                event = self.store_events.recv() => Tick::Store(event),
                event = self.session_events.recv() => Tick::Session(event),
            };
            match tick {
                Tick::Shutdown => {
                    self.stop(tracker_tasks).await;
                    return Ok(());
                }
                Tick::Accepted(Ok((stream, addr))) => self.add_session(stream, addr),
                Tick::Accepted(Err(e)) => warn!(error = %e, "accept failed"),
                Tick::Peers(Some(peers)) => {
                    for addr in peers {
                        if self.sessions.contains_key(&addr) || !dialing.insert(addr) {
                            continue;
                        }
                        let dial_tx = dial_tx.clone();
                        tokio::spawn(async move {
                            let result = TcpStream::connect(addr).await;
                            let _ = dial_tx.send((addr, result));
                        });
                    }
                }
                Tick::Dialed(Some((addr, result))) => {
                    dialing.remove(&addr);
                    match result {
                        Ok(stream) => self.add_session(stream, addr),
                        Err(e) => debug!(peer = %addr, error = %e, "outbound connect failed"),
                    }
                }
                Tick::Store(Some(StoreEvent::PieceVerified(piece))) => {
                    self.broadcast_have(piece);
                }
                Tick::Session(Some((addr, event))) => self.handle_session_event(addr, event),
                // The senders for these channels live in `self` or this
                // frame, so they never close while the loop runs.
                Tick::Peers(None)
                | Tick::Dialed(None)
                | Tick::Store(None)
                | Tick::Session(None) => {}
            }
        }
    }

    fn spawn_tracker(
        &self,
        url: String,
        peers_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    ) -> JoinHandle<()> {
        let meta = self.meta.clone();
        let store = self.store.clone();
        let peer_id = self.peer_id;
        let port = self.port;
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tracker = match Tracker::new(url) {
                Ok(tracker) => tracker,
                Err(e) => {
                    warn!(error = %e, "tracker client unavailable");
                    return;
                }
            };
            loop {
                let outcome = tracker
                    .announce(
                        &meta,
                        AnnounceEvent::Started,
                        &peer_id,
                        port,
                        store.uploaded(),
                        store.downloaded(),
                        store.bytes_left(),
                    )
                    .await;
                let delay = match &outcome {
                    Ok(Some(announce)) => announce.interval,
                    _ => MIN_BACKOFF,
                };
                match outcome {
                    Ok(Some(announce)) => {
                        debug!(
                            tracker = tracker.url(),
                            peers = announce.peers.len(),
                            "announce ok"
                        );
                        let _ = peers_tx.send(announce.peers);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(tracker = tracker.url(), error = %e, "announce failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        let _ = tracker
                            .announce(
                                &meta,
                                AnnounceEvent::Stopped,
                                &peer_id,
                                port,
                                store.uploaded(),
                                store.downloaded(),
                                store.bytes_left(),
                            )
                            .await;
                        return;
                    }
                }
            }
        })
    }

    /// Registers a session for a fresh connection, inbound or outbound.
    fn add_session(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sessions.contains_key(&addr) {
            debug!(peer = %addr, "already connected, dropping duplicate");
            return;
        }
        let (session, commands) = PeerSession::new(
            stream,
            addr,
            self.store.clone(),
            self.peer_id,
            self.session_events_tx.clone(),
        );
        let task = tokio::spawn(session.run());
        self.sessions.insert(addr, SessionHandle { commands, task });
        info!(peer = %addr, active = self.sessions.len(), "peer session started");
    }

    fn handle_session_event(&mut self, addr: SocketAddr, event: SessionEvent) {
        match event {
            SessionEvent::Disconnected => {
                self.sessions.remove(&addr);
                info!(peer = %addr, active = self.sessions.len(), "peer session ended");
            }
            SessionEvent::BlockRequested {
                piece,
                begin,
                length,
            } => self.serve_block(addr, piece, begin, length),
            SessionEvent::BlockCancelled { piece, begin, .. } => {
                // Blocks are served inline, so there is nothing queued to
                // drop by the time a cancel arrives.
                trace!(peer = %addr, piece, begin, "cancel for an already-served block");
            }
            SessionEvent::StateChanged => trace!(peer = %addr, "peer state changed"),
        }
    }

    /// Answers an upload request with bytes from the store.
    fn serve_block(&mut self, addr: SocketAddr, piece: u32, begin: u32, length: u32) {
        let data = match self.store.read_block(piece, begin, length) {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %addr, piece, begin, error = %e, "cannot serve block");
                return;
            }
        };
        if let Some(handle) = self.sessions.get(&addr) {
            let _ = handle
                .commands
                .send(SessionCommand::SendPiece { piece, begin, data });
        }
    }

    /// Tells every live session about a freshly verified piece, once each.
    fn broadcast_have(&self, piece: u32) {
        debug!(piece, sessions = self.sessions.len(), "broadcasting have");
        for handle in self.sessions.values() {
            let _ = handle.commands.send(SessionCommand::SendHave(piece));
        }
    }

    async fn stop(&mut self, tracker_tasks: Vec<JoinHandle<()>>) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        let mut session_tasks = Vec::new();
        for (_, handle) in self.sessions.drain() {
            let _ = handle.commands.send(SessionCommand::Close);
            session_tasks.push(handle.task);
        }
        for task in session_tasks {
            if timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("session did not close in time");
            }
        }
        for task in tracker_tasks {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                debug!("tracker task did not finish its stopped announce");
            }
        }
    }
}
