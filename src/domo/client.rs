//! Client side of the service protocol: frames requests for the broker and
//!  unpacks the service-tagged replies.
//!
//! `mmi.` queries are answered by the broker with a bare status frame
//!  outside the reply envelope; query those on a raw socket instead.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tracing::debug;

use crate::domo::domo_config::DomoConfig;
use crate::domo::protocol;
use crate::transport::socket::Socket;

pub struct Client {
    socket: Socket,
    config: DomoConfig,
}

impl Client {
    /// Connects to the broker. The socket must be client-like.
    pub async fn new(mut socket: Socket, broker_addr: &str, config: DomoConfig) -> anyhow::Result<Client> {
        if !socket.family().is_clientish() {
            bail!("client requires a client-like socket, got {:?}", socket.family());
        }
        socket.connect(broker_addr).await?;
        Ok(Client { socket, config })
    }

    /// Send a request body to a named service. Fire and forget; replies
    ///  arrive through [Client::recv].
    pub async fn send(&mut self, service: &str, body: Vec<Bytes>) -> anyhow::Result<()> {
        debug!("sending request for '{}'", service);
        self.socket.send_parts(protocol::client_envelope(service, body), None).await
    }

    /// Await the next reply: the service it answers for plus the reply body.
    ///  `None` when the broker stays silent for a heartbeat interval.
    pub async fn recv(&mut self) -> anyhow::Result<Option<(String, Vec<Bytes>)>> {
        let Some((parts, _)) = self.socket.recv_parts(Some(self.recv_timeout())).await? else {
            return Ok(None);
        };
        let mut parts = VecDeque::from(parts);
        let header = protocol::pop_frame(&mut parts)?;
        if header != protocol::CLIENT_IDENT {
            bail!("reply with unexpected protocol header");
        }
        let service = protocol::pop_str(&mut parts)?;
        Ok(Some((service, parts.into())))
    }

    fn recv_timeout(&self) -> Duration {
        self.config.heartbeat_interval
    }
}


#[cfg(test)]
mod test {
    use std::time::Instant;

    use tokio::sync::broadcast;

    use super::*;
    use crate::domo::broker::Broker;
    use crate::domo::worker::Worker;
    use crate::test_util::fast_config;
    use crate::transport::socket::SocketFamily;

    /// broker plus one "echo" worker that replies "pong", all on real tasks
    async fn started_stack(
        broker_family: SocketFamily,
        peer_family: SocketFamily,
    ) -> (Client, broadcast::Sender<()>) {
        let mut broker_socket = Socket::new(broker_family);
        let addr = broker_socket.bind("127.0.0.1:0").await.unwrap().to_string();
        let mut broker = Broker::new(broker_socket, fast_config()).unwrap();
        let (shutdown_tx, broker_shutdown) = broadcast::channel(1);
        tokio::spawn(async move { broker.run(broker_shutdown).await });

        let mut worker = Worker::new(Socket::new(peer_family), &addr, "echo", fast_config())
            .await
            .unwrap();
        let worker_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            worker
                .run(|_| vec![Bytes::from_static(b"pong")], worker_shutdown)
                .await
        });

        let client = Client::new(Socket::new(peer_family), &addr, fast_config()).await.unwrap();
        (client, shutdown_tx)
    }

    async fn recv_reply(client: &mut Client) -> (String, Vec<Bytes>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(reply) = client.recv().await.unwrap() {
                return reply;
            }
            assert!(Instant::now() < deadline, "no reply within the deadline");
        }
    }

    #[tokio::test]
    async fn test_client_rejects_server_like_socket() {
        let socket = Socket::new(SocketFamily::Router);
        assert!(Client::new(socket, "127.0.0.1:9", fast_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_echo() {
        let (mut client, _shutdown) = started_stack(SocketFamily::Router, SocketFamily::Dealer).await;

        client.send("echo", vec![Bytes::from_static(b"ping")]).await.unwrap();
        let (service, body) = recv_reply(&mut client).await;

        // the reply names the service, the worker identity stays hidden
        assert_eq!(service, "echo");
        assert_eq!(body, vec![Bytes::from_static(b"pong")]);
    }

    #[tokio::test]
    async fn test_end_to_end_echo_over_packed_sockets() {
        let (mut client, _shutdown) = started_stack(SocketFamily::Server, SocketFamily::Client).await;

        client.send("echo", vec![Bytes::from_static(b"ping")]).await.unwrap();
        let (service, body) = recv_reply(&mut client).await;

        assert_eq!(service, "echo");
        assert_eq!(body, vec![Bytes::from_static(b"pong")]);
    }

    #[tokio::test]
    async fn test_consecutive_requests_reuse_the_session() {
        let (mut client, _shutdown) = started_stack(SocketFamily::Router, SocketFamily::Dealer).await;

        for _ in 0..3 {
            client.send("echo", vec![Bytes::from_static(b"ping")]).await.unwrap();
            let (service, _) = recv_reply(&mut client).await;
            assert_eq!(service, "echo");
        }
    }

    #[tokio::test]
    async fn test_recv_times_out_without_a_broker_reply() {
        let mut silent = Socket::new(SocketFamily::Router);
        let addr = silent.bind("127.0.0.1:0").await.unwrap().to_string();

        let mut client = Client::new(Socket::new(SocketFamily::Dealer), &addr, fast_config())
            .await
            .unwrap();
        client.send("echo", vec![Bytes::from_static(b"ping")]).await.unwrap();
        assert!(client.recv().await.unwrap().is_none());
    }
}
