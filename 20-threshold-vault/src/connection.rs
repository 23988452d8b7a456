//! One persistent, lazily opened TCP connection per peer.
//!
//! Outbound links are created on the first [`ConnectionManager::send`] to a
//! peer and announce themselves with an [`Intro`] frame. Inbound sockets must
//! present an `Intro` within the configured timeout before anything they send
//! is delivered; after that the socket doubles as our link to that peer if we
//! did not dial one ourselves.
//!
//! Intros are not signed, so any TCP client can claim a server id. Messages
//! are still authenticated end to end, but an impostor socket could swallow
//! our sends to that id. A newer inbound intro therefore replaces an earlier
//! adopted link for the same id, and links we dialed are never displaced.
//!
//! A link moves `Connecting -> AwaitingIntro -> Ready`. Outbound links wait
//! on our own intro being written; inbound sockets wait on the peer's and are
//! only entered into the table once it arrives. Losing the socket removes the
//! link; the next send re-dials.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, PeerAddress, PeerId};
use crate::framing::{FrameBuffer, write_frame};
use crate::message::{Intro, Message};

pub const DEFAULT_INTRO_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("peer {0} is not in the cluster configuration")]
    UnknownPeer(PeerId),
    #[error("refusing to open a connection to ourselves")]
    SelfConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    AwaitingIntro,
    Ready,
}

/// A payload received from an identified peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

struct Link {
    id: u64,
    state: LinkState,
    /// Adopted from a peer's connection rather than dialed by us.
    inbound: bool,
    outbox: UnboundedSender<Vec<u8>>,
}

struct Inner {
    self_id: PeerId,
    peers: HashMap<PeerId, PeerAddress>,
    links: Mutex<HashMap<PeerId, Link>>,
    inbound_tx: UnboundedSender<InboundFrame>,
    intro_timeout: Duration,
    next_link_id: AtomicU64,
    dialed: AtomicU64,
    accepted: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(task));
    }

    fn set_state(&self, peer: PeerId, link_id: u64, state: LinkState) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = links.get_mut(&peer).filter(|link| link.id == link_id) {
            link.state = state;
        }
    }

    /// Removes the link only if it is still the one identified by `link_id`.
    fn remove_link(&self, peer: PeerId, link_id: u64) {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if links.get(&peer).is_some_and(|link| link.id == link_id) {
            links.remove(&peer);
            debug!(peer, link_id, "link closed");
        }
    }
}

/// Cheaply cloneable handle to the process's connection table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates the manager and the channel every identified inbound frame is delivered on.
    pub fn new(
        self_id: PeerId,
        cluster: &ClusterConfig,
        intro_timeout: Duration,
    ) -> (Self, UnboundedReceiver<InboundFrame>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peers = cluster
            .peers
            .iter()
            .map(|peer| (peer.id, peer.clone()))
            .collect();
        let inner = Inner {
            self_id,
            peers,
            links: Mutex::new(HashMap::new()),
            inbound_tx,
            intro_timeout,
            next_link_id: AtomicU64::new(1),
            dialed: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            inbound_rx,
        )
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_id
    }

    /// Binds our configured address and starts accepting peers in the background.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let me = self
            .inner
            .peers
            .get(&self.inner.self_id)
            .ok_or(ConnectionError::UnknownPeer(self.inner.self_id))?;
        let listener = TcpListener::bind(me.addr())
            .await
            .with_context(|| format!("failed to bind {}", me.addr()))?;
        let addr = listener.local_addr()?;
        info!(id = self.inner.self_id, %addr, "listening for peers");

        let inner = Arc::clone(&self.inner);
        self.inner.spawn(accept_loop(inner, listener));
        Ok(addr)
    }

    /// Queues `message` for `to`, opening a connection first if there is none.
    pub fn send(&self, to: PeerId, message: &Message) -> Result<(), ConnectionError> {
        if to == self.inner.self_id {
            return Err(ConnectionError::SelfConnection);
        }
        let payload = message.to_wire();
        let mut links = self.inner.links.lock().unwrap_or_else(PoisonError::into_inner);
        let payload = match links.get(&to) {
            Some(link) => match link.outbox.send(payload) {
                Ok(()) => return Ok(()),
                Err(SendError(payload)) => {
                    links.remove(&to);
                    payload
                }
            },
            None => payload,
        };
        let outbox = self.open_link(&mut links, to)?;
        // The writer task holds the receiver until it exits, and it has not been spawned yet.
        let _ = outbox.send(payload);
        Ok(())
    }

    /// Sends to every server except ourselves; unreachable peers are logged and skipped.
    pub fn broadcast(&self, message: &Message) {
        let mut servers: Vec<PeerId> = self
            .inner
            .peers
            .values()
            .filter(|peer| peer.is_server && peer.id != self.inner.self_id)
            .map(|peer| peer.id)
            .collect();
        servers.sort_unstable();
        for id in servers {
            if let Err(err) = self.send(id, message) {
                warn!(to = id, error = %err, "broadcast send failed");
            }
        }
    }

    /// Opens links to every server whose port is lower than ours.
    pub fn connect_lower_ports(&self) {
        let Some(own_port) = self.inner.peers.get(&self.inner.self_id).map(|me| me.port) else {
            return;
        };
        let mut links = self.inner.links.lock().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<PeerId> = self
            .inner
            .peers
            .values()
            .filter(|peer| peer.is_server && peer.port < own_port)
            .map(|peer| peer.id)
            .collect();
        targets.sort_unstable();
        for id in targets {
            if links.contains_key(&id) {
                continue;
            }
            if let Err(err) = self.open_link(&mut links, id) {
                warn!(to = id, error = %err, "failed to open startup link");
            }
        }
    }

    fn open_link(
        &self,
        links: &mut HashMap<PeerId, Link>,
        to: PeerId,
    ) -> Result<UnboundedSender<Vec<u8>>, ConnectionError> {
        let addr = self
            .inner
            .peers
            .get(&to)
            .ok_or(ConnectionError::UnknownPeer(to))?
            .addr();
        let link_id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::unbounded_channel();
        links.insert(
            to,
            Link {
                id: link_id,
                state: LinkState::Connecting,
                inbound: false,
                outbox: outbox.clone(),
            },
        );
        self.inner.dialed.fetch_add(1, Ordering::Relaxed);
        debug!(to, link_id, %addr, "opening link");
        self.inner
            .spawn(run_outbound(Arc::clone(&self.inner), to, addr, link_id, rx));
        Ok(outbox)
    }

    pub fn link_state(&self, peer: PeerId) -> Option<LinkState> {
        self.inner
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .map(|link| link.state)
    }

    /// Outbound connections this manager has started.
    pub fn connections_opened(&self) -> u64 {
        self.inner.dialed.load(Ordering::Relaxed)
    }

    /// Inbound connections that completed the intro handshake.
    pub fn connections_accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Stops accepting, closes every link, and aborts all connection tasks.
    pub fn shutdown(&self) {
        self.inner
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                let task_inner = Arc::clone(&inner);
                inner.spawn(async move {
                    if let Err(err) = run_inbound(task_inner, stream).await {
                        debug!(%addr, error = ?err, "inbound connection closed");
                    }
                });
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

async fn run_outbound(
    inner: Arc<Inner>,
    peer: PeerId,
    addr: String,
    link_id: u64,
    mut outbox: UnboundedReceiver<Vec<u8>>,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(peer, %addr, error = %err, "failed to connect");
            inner.remove_link(peer, link_id);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    inner.set_state(peer, link_id, LinkState::AwaitingIntro);
    let (reader, mut writer) = stream.into_split();

    let intro = Message::Intro(Intro {
        peer_id: inner.self_id,
    });
    if let Err(err) = write_frame(&mut writer, &intro.to_wire()).await {
        warn!(peer, error = %err, "failed to send intro");
        inner.remove_link(peer, link_id);
        return;
    }
    inner.set_state(peer, link_id, LinkState::Ready);
    debug!(peer, link_id, "link ready");

    let reader_inner = Arc::clone(&inner);
    inner.spawn(async move {
        let mut buffer = FrameBuffer::new();
        let mut reader = reader;
        if let Err(err) = read_frames(&reader_inner, peer, &mut reader, &mut buffer).await {
            debug!(peer, error = ?err, "outbound link read side closed");
        }
        reader_inner.remove_link(peer, link_id);
    });

    pump(&mut writer, &mut outbox, peer).await;
    inner.remove_link(peer, link_id);
}

async fn run_inbound(inner: Arc<Inner>, stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let mut buffer = FrameBuffer::new();

    let peer = tokio::time::timeout(inner.intro_timeout, read_intro(&mut reader, &mut buffer))
        .await
        .context("peer did not introduce itself in time")??;
    if peer == inner.self_id {
        bail!("peer claimed our own id {peer}");
    }
    if !inner.peers.contains_key(&peer) {
        bail!("peer introduced itself with unknown id {peer}");
    }
    inner.accepted.fetch_add(1, Ordering::Relaxed);

    let registered = register_inbound(&inner, peer, writer);
    let result = read_frames(&inner, peer, &mut reader, &mut buffer).await;
    match registered {
        Ok(link_id) => inner.remove_link(peer, link_id),
        // Keep the write half open until the read side ends so the peer's link stays up.
        Err(writer) => drop(writer),
    }
    result
}

/// Makes an identified inbound socket our link to `peer`.
///
/// A link we dialed ourselves is kept and the write half is handed back.
/// An earlier adopted inbound link is replaced: intros are unsigned, so the
/// newest socket claiming an id wins over a stale or impostor one.
fn register_inbound(
    inner: &Arc<Inner>,
    peer: PeerId,
    writer: OwnedWriteHalf,
) -> Result<u64, OwnedWriteHalf> {
    let mut links = inner.links.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = links.get(&peer) {
        if !existing.inbound {
            return Err(writer);
        }
        debug!(peer, replaced = existing.id, "newer inbound socket replaces adopted link");
    }
    let link_id = inner.next_link_id.fetch_add(1, Ordering::Relaxed);
    let (outbox, mut rx) = mpsc::unbounded_channel();
    links.insert(
        peer,
        Link {
            id: link_id,
            state: LinkState::Ready,
            inbound: true,
            outbox,
        },
    );
    drop(links);
    info!(peer, link_id, "peer introduced itself");

    let writer_inner = Arc::clone(inner);
    inner.spawn(async move {
        let mut writer = writer;
        pump(&mut writer, &mut rx, peer).await;
        writer_inner.remove_link(peer, link_id);
    });
    Ok(link_id)
}

async fn read_intro(reader: &mut OwnedReadHalf, buffer: &mut FrameBuffer) -> Result<PeerId> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(payload) = buffer.try_read()? {
            return match Message::from_wire(&payload)? {
                Message::Intro(intro) => Ok(intro.peer_id),
                other => bail!("expected INTRO as first frame, got {}", other.type_name()),
            };
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before intro");
        }
        buffer.write(&chunk[..n]);
    }
}

async fn read_frames<R>(
    inner: &Inner,
    peer: PeerId,
    reader: &mut R,
    buffer: &mut FrameBuffer,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        while let Some(payload) = buffer.try_read()? {
            if inner
                .inbound_tx
                .send(InboundFrame {
                    from: peer,
                    payload,
                })
                .is_err()
            {
                return Ok(());
            }
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.write(&chunk[..n]);
    }
}

async fn pump(writer: &mut OwnedWriteHalf, outbox: &mut UnboundedReceiver<Vec<u8>>, peer: PeerId) {
    while let Some(payload) = outbox.recv().await {
        if let Err(err) = write_frame(writer, &payload).await {
            warn!(peer, error = %err, "write failed, closing link");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Intro;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn cluster(base_port: u16) -> ClusterConfig {
        ClusterConfig::local(1, 2, base_port, &[]).expect("local cluster")
    }

    fn intro(id: PeerId) -> Message {
        Message::Intro(Intro { peer_id: id })
    }

    async fn recv(rx: &mut UnboundedReceiver<InboundFrame>) -> InboundFrame {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn sends_to_one_peer_share_a_single_connection() {
        let cluster = cluster(19_410);
        let (a, _a_rx) = ConnectionManager::new(0, &cluster, DEFAULT_INTRO_TIMEOUT);
        let (b, mut b_rx) = ConnectionManager::new(1, &cluster, DEFAULT_INTRO_TIMEOUT);
        b.listen().await.expect("listen");

        a.send(1, &intro(7)).expect("first send");
        a.send(1, &intro(8)).expect("second send");

        assert_eq!(recv(&mut b_rx).await, InboundFrame { from: 0, payload: intro(7).to_wire() });
        assert_eq!(recv(&mut b_rx).await, InboundFrame { from: 0, payload: intro(8).to_wire() });
        assert_eq!(a.connections_opened(), 1);
        assert_eq!(b.connections_accepted(), 1);
        assert_eq!(a.link_state(1), Some(LinkState::Ready));
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn inbound_link_is_reused_for_replies() {
        let cluster = cluster(19_420);
        let (a, mut a_rx) = ConnectionManager::new(0, &cluster, DEFAULT_INTRO_TIMEOUT);
        let (b, mut b_rx) = ConnectionManager::new(1, &cluster, DEFAULT_INTRO_TIMEOUT);
        b.listen().await.expect("listen");

        a.send(1, &intro(7)).expect("send");
        recv(&mut b_rx).await;
        b.send(0, &intro(9)).expect("reply");

        assert_eq!(recv(&mut a_rx).await.from, 1);
        assert_eq!(b.connections_opened(), 0, "reply rides the inbound socket");
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn silent_inbound_socket_is_dropped_after_timeout() {
        let cluster = cluster(19_430);
        let (b, _b_rx) = ConnectionManager::new(1, &cluster, Duration::from_millis(100));
        let addr = b.listen().await.expect("listen");

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("closed in time");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(b.connections_accepted(), 0);
        b.shutdown();
    }

    async fn read_one_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    #[tokio::test]
    async fn newer_intro_replaces_an_adopted_link() {
        let cluster = cluster(19_480);
        let (b, _b_rx) = ConnectionManager::new(1, &cluster, DEFAULT_INTRO_TIMEOUT);
        let addr = b.listen().await.expect("listen");

        let mut impostor = TcpStream::connect(addr).await.expect("connect");
        write_frame(&mut impostor, &intro(0).to_wire()).await.expect("intro");
        let mut genuine = TcpStream::connect(addr).await.expect("connect");
        write_frame(&mut genuine, &intro(0).to_wire()).await.expect("intro");
        timeout(Duration::from_secs(5), async {
            while b.connections_accepted() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both sockets introduced");
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.send(0, &intro(6)).expect("send");
        let frame = timeout(Duration::from_secs(5), read_one_frame(&mut genuine))
            .await
            .expect("frame in time")
            .expect("frame");
        assert_eq!(frame, intro(6).to_wire());
        let stale = timeout(Duration::from_millis(300), read_one_frame(&mut impostor)).await;
        assert!(!matches!(stale, Ok(Ok(_))), "stale socket must not receive the send");
        assert_eq!(b.connections_opened(), 0);
        b.shutdown();
    }

    #[tokio::test]
    async fn unknown_intro_id_is_rejected() {
        let cluster = cluster(19_440);
        let (b, mut b_rx) = ConnectionManager::new(1, &cluster, DEFAULT_INTRO_TIMEOUT);
        let addr = b.listen().await.expect("listen");

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        write_frame(&mut stream, &intro(99).to_wire()).await.expect("intro");
        write_frame(&mut stream, &intro(3).to_wire()).await.expect("payload");
        stream.flush().await.expect("flush");

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("closed in time");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(b_rx.try_recv().is_err());
        b.shutdown();
    }

    #[tokio::test]
    async fn sending_to_ourselves_or_strangers_fails() {
        let cluster = cluster(19_450);
        let (a, _rx) = ConnectionManager::new(0, &cluster, DEFAULT_INTRO_TIMEOUT);
        assert_eq!(a.send(0, &intro(0)), Err(ConnectionError::SelfConnection));
        assert_eq!(a.send(42, &intro(0)), Err(ConnectionError::UnknownPeer(42)));
        assert_eq!(a.connections_opened(), 0);
    }

    #[tokio::test]
    async fn failed_dial_clears_the_link_for_a_later_retry() {
        let cluster = cluster(19_460);
        let (a, _rx) = ConnectionManager::new(0, &cluster, DEFAULT_INTRO_TIMEOUT);
        a.send(2, &intro(0)).expect("queued");
        timeout(Duration::from_secs(5), async {
            while a.link_state(2).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link removed after refused connect");

        let (c, mut c_rx) = ConnectionManager::new(2, &cluster, DEFAULT_INTRO_TIMEOUT);
        c.listen().await.expect("listen");
        a.send(2, &intro(5)).expect("redial");
        assert_eq!(recv(&mut c_rx).await.payload, intro(5).to_wire());
        assert_eq!(a.connections_opened(), 2);
        a.shutdown();
        c.shutdown();
    }

    #[tokio::test]
    async fn startup_dials_only_lower_ports() {
        let cluster = cluster(19_470);
        let (low, mut low_rx) = ConnectionManager::new(0, &cluster, DEFAULT_INTRO_TIMEOUT);
        low.listen().await.expect("listen");
        let (high, _rx) = ConnectionManager::new(3, &cluster, DEFAULT_INTRO_TIMEOUT);
        high.connect_lower_ports();
        assert_eq!(high.connections_opened(), 3);
        low.connect_lower_ports();
        assert_eq!(low.connections_opened(), 0);

        high.send(0, &intro(1)).expect("send");
        assert_eq!(recv(&mut low_rx).await.from, 3);
        assert_eq!(high.connections_opened(), 3);
        low.shutdown();
        high.shutdown();
    }
}
