//! A [Port] is the message level view of a socket: it sends and receives
//!  whole [Message]s, stamping the coordinate header on the way out and
//!  carrying the routing id between message and socket in both directions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::message::Message;
use crate::transport::socket::{RemoteId, Socket, SocketFamily};

pub struct Port {
    socket: Socket,
    origin: u64,
}

impl Port {
    pub fn new(socket: Socket, origin: u64) -> Port {
        Port { socket, origin }
    }

    pub fn family(&self) -> SocketFamily {
        self.socket.family()
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub async fn bind(&mut self, addr: &str) -> anyhow::Result<std::net::SocketAddr> {
        self.socket.bind(addr).await
    }

    pub async fn connect(&mut self, addr: &str) -> anyhow::Result<RemoteId> {
        self.socket.connect(addr).await
    }

    /// Send a message, stamping origin and granule. A non-zero routing id
    ///  addresses the peer on server-like sockets.
    pub async fn send(&mut self, msg: &mut Message) -> anyhow::Result<()> {
        msg.set_coord(self.origin, granule_now());
        let remote = (msg.routing_id != 0).then_some(RemoteId(msg.routing_id));
        self.socket.send_parts(msg.to_parts(), remote).await
    }

    /// Receive a message, `None` on timeout. The sender's routing id is set
    ///  on the result.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> anyhow::Result<Option<Message>> {
        match self.socket.recv_parts(timeout).await? {
            None => Ok(None),
            Some((parts, remote)) => {
                let mut msg = Message::try_from_parts(parts)?;
                msg.routing_id = remote.0;
                Ok(Some(msg))
            }
        }
    }

    pub async fn poll(&mut self, timeout: Option<Duration>) -> bool {
        self.socket.poll(timeout).await
    }
}

/// Microseconds since the epoch, the "granule" message timestamp.
fn granule_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
