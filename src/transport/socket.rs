//! TCP sockets with ZeroMQ-like family semantics.
//!
//! A [Socket] owns a listener and / or outgoing connections. Every connection
//!  gets a `u32` token from a per-socket counter; a background task per
//!  connection reads wire messages into a shared channel, sends write straight
//!  to the connection's write half.
//!
//! The [SocketFamily] decides how logical message parts map to wire frames:
//! * `Server` / `Client` pack all parts into a single frame. `Server` sends
//!    and receives with an explicit [RemoteId], `Client` talks to its one
//!    connected peer.
//! * `Router` / `Dealer` keep parts as separate frames behind an empty
//!    delimiter frame. `Router` is the addressed side, `Dealer` the implicit
//!    one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::select;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::wire;
use crate::util::buf::{encode_parts, try_decode_parts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Server,
    Client,
    Router,
    Dealer,
}

impl SocketFamily {
    pub fn is_serverish(self) -> bool {
        matches!(self, SocketFamily::Server | SocketFamily::Router)
    }

    pub fn is_clientish(self) -> bool {
        !self.is_serverish()
    }
}

/// Token for one connection of a socket. Valid as long as the connection
///  lives, never reused within a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteId(pub u32);

impl RemoteId {
    /// Identity frame representation, e.g. for embedding a reply address in a
    ///  protocol message.
    pub fn to_frame(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    pub fn try_from_frame(frame: &Bytes) -> anyhow::Result<RemoteId> {
        match <[u8; 4]>::try_from(frame.as_ref()) {
            Ok(raw) => Ok(RemoteId(u32::from_be_bytes(raw))),
            Err(_) => bail!("identity frame must be 4 bytes, got {}", frame.len()),
        }
    }
}

const RECV_BUFFER_MESSAGES: usize = 1024;

type Writers = Arc<RwLock<FxHashMap<u32, OwnedWriteHalf>>>;

pub struct Socket {
    family: SocketFamily,
    next_token: Arc<AtomicU32>,
    writers: Writers,
    /// kept so the channel stays open while connections come and go
    incoming_tx: mpsc::Sender<(u32, Vec<Bytes>)>,
    incoming: mpsc::Receiver<(u32, Vec<Bytes>)>,
    /// message peeked by [poll](Socket::poll) but not consumed yet
    pending: Option<(u32, Vec<Bytes>)>,
    /// implicit peer of a client-like socket, the most recent connect
    peer: Option<u32>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Socket {
    pub fn new(family: SocketFamily) -> Socket {
        let (incoming_tx, incoming) = mpsc::channel(RECV_BUFFER_MESSAGES);
        let (shutdown_tx, _) = broadcast::channel(1);
        Socket {
            family,
            next_token: Arc::new(AtomicU32::new(1)),
            writers: Default::default(),
            incoming_tx,
            incoming,
            pending: None,
            peer: None,
            local_addr: None,
            shutdown_tx,
            accept_handle: None,
        }
    }

    pub fn family(&self) -> SocketFamily {
        self.family
    }

    /// The bound address, with the actual port when bound to an ephemeral one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn bind(&mut self, addr: &str) -> anyhow::Result<SocketAddr> {
        if self.accept_handle.is_some() {
            bail!("socket is already bound to {:?}", self.local_addr);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow!("bind to {} failed: {}", addr, e))?;
        let local_addr = listener.local_addr()?;
        debug!("listening on {}", local_addr);

        self.local_addr = Some(local_addr);
        self.accept_handle = Some(tokio::spawn(accept_loop(
            listener,
            self.next_token.clone(),
            self.writers.clone(),
            self.incoming_tx.clone(),
            self.shutdown_tx.clone(),
        )));
        Ok(local_addr)
    }

    pub async fn connect(&mut self, addr: &str) -> anyhow::Result<RemoteId> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| anyhow!("connect to {} failed: {}", addr, e))?;
        let _ = stream.set_nodelay(true);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        debug!("connection #{} to {}", token, addr);

        let (read_half, write_half) = stream.into_split();
        self.writers.write().await.insert(token, write_half);
        tokio::spawn(reader_loop(
            token,
            read_half,
            self.incoming_tx.clone(),
            self.writers.clone(),
            self.shutdown_tx.subscribe(),
        ));

        if self.family.is_clientish() {
            self.peer = Some(token);
        }
        Ok(RemoteId(token))
    }

    /// Drop all connections. Peers see a regular close.
    pub async fn disconnect(&mut self) {
        self.writers.write().await.clear();
        self.peer = None;
    }

    /// Send one logical message. Server-like sockets require `remote`,
    ///  client-like ones address their connected peer.
    pub async fn send_parts(&mut self, parts: Vec<Bytes>, remote: Option<RemoteId>) -> anyhow::Result<()> {
        let token = match (self.family.is_serverish(), remote) {
            (true, Some(remote)) => remote.0,
            (true, None) => bail!("send on a server-like socket requires a remote id"),
            (false, _) => match self.peer {
                Some(token) => token,
                None => bail!("socket is not connected"),
            },
        };

        let frames = match self.family {
            SocketFamily::Server | SocketFamily::Client => vec![encode_parts(&parts)],
            SocketFamily::Router | SocketFamily::Dealer => {
                let mut frames = Vec::with_capacity(parts.len() + 1);
                frames.push(Bytes::new());
                frames.extend(parts);
                frames
            }
        };

        let mut writers = self.writers.write().await;
        let Some(writer) = writers.get_mut(&token) else {
            bail!("no connection #{}", token);
        };
        if let Err(e) = wire::write_frames(writer, &frames).await {
            writers.remove(&token);
            return Err(e);
        }
        Ok(())
    }

    /// Receive one logical message. `None` timeout waits forever, a zero
    ///  timeout just drains an already arrived message. Returns `Ok(None)` on
    ///  timeout.
    pub async fn recv_parts(&mut self, timeout: Option<Duration>) -> anyhow::Result<Option<(Vec<Bytes>, RemoteId)>> {
        let Some((token, mut frames)) = self.recv_raw(timeout).await else {
            return Ok(None);
        };

        let parts = match self.family {
            SocketFamily::Server | SocketFamily::Client => {
                if frames.len() != 1 {
                    bail!("expected a single packed frame, got {}", frames.len());
                }
                let mut buf = frames.remove(0);
                let parts = try_decode_parts(&mut buf)?;
                if buf.has_remaining() {
                    bail!("{} trailing bytes in packed frame", buf.remaining());
                }
                parts
            }
            SocketFamily::Router | SocketFamily::Dealer => {
                if frames.first().map(|f| f.is_empty()) != Some(true) {
                    bail!("missing delimiter frame");
                }
                frames.remove(0);
                frames
            }
        };
        Ok(Some((parts, RemoteId(token))))
    }

    /// Check for an incoming message without consuming it. A `true` result
    ///  means the next [recv_parts](Socket::recv_parts) has input waiting.
    pub async fn poll(&mut self, timeout: Option<Duration>) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.recv_raw_inner(timeout).await {
            Some(raw) => {
                self.pending = Some(raw);
                true
            }
            None => false,
        }
    }

    async fn recv_raw(&mut self, timeout: Option<Duration>) -> Option<(u32, Vec<Bytes>)> {
        match self.pending.take() {
            Some(raw) => Some(raw),
            None => self.recv_raw_inner(timeout).await,
        }
    }

    async fn recv_raw_inner(&mut self, timeout: Option<Duration>) -> Option<(u32, Vec<Bytes>)> {
        match timeout {
            None => self.incoming.recv().await,
            Some(t) if t.is_zero() => self.incoming.try_recv().ok(),
            Some(t) => tokio::time::timeout(t, self.incoming.recv())
                .await
                .ok()
                .flatten(),
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(handle) = &self.accept_handle {
            handle.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    next_token: Arc<AtomicU32>,
    writers: Writers,
    incoming_tx: mpsc::Sender<(u32, Vec<Bytes>)>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown = shutdown_tx.subscribe();
    loop {
        select! {
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let token = next_token.fetch_add(1, Ordering::Relaxed);
                    debug!("connection #{} from {}", token, peer_addr);

                    let (read_half, write_half) = stream.into_split();
                    writers.write().await.insert(token, write_half);
                    tokio::spawn(reader_loop(
                        token,
                        read_half,
                        incoming_tx.clone(),
                        writers.clone(),
                        shutdown_tx.subscribe(),
                    ));
                }
                Err(e) => {
                    warn!("accept failed: {:#}", e);
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}

async fn reader_loop(
    token: u32,
    mut read_half: OwnedReadHalf,
    incoming_tx: mpsc::Sender<(u32, Vec<Bytes>)>,
    writers: Writers,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        select! {
            result = wire::read_frames(&mut read_half) => match result {
                Ok(frames) => {
                    if incoming_tx.send((token, frames)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("connection #{} closed: {:#}", token, e);
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
    writers.write().await.remove(&token);
}


#[cfg(test)]
mod test {
    use super::*;

    async fn bound_pair(server: SocketFamily, client: SocketFamily) -> (Socket, Socket) {
        let mut s = Socket::new(server);
        let addr = s.bind("127.0.0.1:0").await.unwrap();
        let mut c = Socket::new(client);
        c.connect(&addr.to_string()).await.unwrap();
        (s, c)
    }

    fn parts(raw: &[&'static [u8]]) -> Vec<Bytes> {
        raw.iter().map(|r| Bytes::from_static(r)).collect()
    }

    #[tokio::test]
    async fn test_server_client_roundtrip() {
        let (mut server, mut client) = bound_pair(SocketFamily::Server, SocketFamily::Client).await;

        client.send_parts(parts(&[b"ping", b""]), None).await.unwrap();
        let (received, remote) = server.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"ping", b""]));

        server.send_parts(parts(&[b"pong"]), Some(remote)).await.unwrap();
        let (received, _) = client.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"pong"]));
    }

    #[tokio::test]
    async fn test_router_dealer_roundtrip() {
        let (mut router, mut dealer) = bound_pair(SocketFamily::Router, SocketFamily::Dealer).await;

        dealer.send_parts(parts(&[b"MDPW01", b"\x01", b"echo"]), None).await.unwrap();
        let (received, remote) = router.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"MDPW01", b"\x01", b"echo"]));

        router.send_parts(parts(&[b"reply"]), Some(remote)).await.unwrap();
        let (received, _) = dealer.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"reply"]));
    }

    #[tokio::test]
    async fn test_router_routes_to_the_addressed_dealer() {
        let mut router = Socket::new(SocketFamily::Router);
        let addr = router.bind("127.0.0.1:0").await.unwrap().to_string();

        let mut dealer_a = Socket::new(SocketFamily::Dealer);
        dealer_a.connect(&addr).await.unwrap();
        let mut dealer_b = Socket::new(SocketFamily::Dealer);
        dealer_b.connect(&addr).await.unwrap();

        dealer_a.send_parts(parts(&[b"from a"]), None).await.unwrap();
        dealer_b.send_parts(parts(&[b"from b"]), None).await.unwrap();

        let mut remotes = FxHashMap::default();
        for _ in 0..2 {
            let (received, remote) = router.recv_parts(None).await.unwrap().unwrap();
            remotes.insert(received[0].clone(), remote);
        }
        let remote_b = remotes[&Bytes::from_static(b"from b")];
        router.send_parts(parts(&[b"for b"]), Some(remote_b)).await.unwrap();

        let (received, _) = dealer_b.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"for b"]));
        assert!(dealer_a.recv_parts(Some(Duration::from_millis(50))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_none() {
        let (mut server, _client) = bound_pair(SocketFamily::Server, SocketFamily::Client).await;
        let received = server.recv_parts(Some(Duration::from_millis(20))).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_poll_buffers_the_message() {
        let (mut server, mut client) = bound_pair(SocketFamily::Server, SocketFamily::Client).await;
        assert!(!server.poll(Some(Duration::ZERO)).await);

        client.send_parts(parts(&[b"hello"]), None).await.unwrap();
        assert!(server.poll(Some(Duration::from_secs(5))).await);
        assert!(server.poll(Some(Duration::ZERO)).await);

        let (received, _) = server.recv_parts(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"hello"]));
        assert!(!server.poll(Some(Duration::ZERO)).await);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let mut client = Socket::new(SocketFamily::Client);
        assert!(client.send_parts(parts(&[b"x"]), None).await.is_err());

        let (mut server, _client) = bound_pair(SocketFamily::Server, SocketFamily::Client).await;
        assert!(server.send_parts(parts(&[b"x"]), None).await.is_err());
        assert!(server.send_parts(parts(&[b"x"]), Some(RemoteId(4711))).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnect_moves_the_implicit_peer() {
        let mut server = Socket::new(SocketFamily::Server);
        let addr = server.bind("127.0.0.1:0").await.unwrap().to_string();

        let mut client = Socket::new(SocketFamily::Client);
        let first = client.connect(&addr).await.unwrap();
        client.disconnect().await;
        let second = client.connect(&addr).await.unwrap();
        assert_ne!(first, second);

        client.send_parts(parts(&[b"again"]), None).await.unwrap();
        let (received, _) = server.recv_parts(None).await.unwrap().unwrap();
        assert_eq!(received, parts(&[b"again"]));
    }

    #[test]
    fn test_remote_id_frame_roundtrip() {
        let id = RemoteId(0x01020304);
        assert_eq!(id.to_frame().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(RemoteId::try_from_frame(&id.to_frame()).unwrap(), id);
        assert!(RemoteId::try_from_frame(&Bytes::from_static(b"abc")).is_err());
    }
}
