//! Worker side of the service protocol. A worker registers with the broker
//!  for exactly one service, then alternates between receiving request
//!  bodies and sending replies, one request in flight at a time.
//!
//! Liveness works in both directions: the worker heartbeats the broker on
//!  a fixed cadence, and when the broker goes silent for too many intervals
//!  the worker tears the session down and registers again.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::bail;
use bytes::Bytes;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domo::domo_config::DomoConfig;
use crate::domo::protocol::{self, WorkerCommand};
use crate::transport::socket::Socket;

pub struct Worker {
    socket: Socket,
    broker_addr: String,
    service: String,
    config: DomoConfig,
    /// intervals without broker traffic before the session counts as dead
    liveness: u32,
    heartbeat_at: Instant,
    /// return address of the request currently being worked on
    reply_to: Option<Bytes>,
}

impl Worker {
    /// Connects to the broker and registers for `service`. The socket must
    ///  be client-like.
    pub async fn new(
        socket: Socket,
        broker_addr: &str,
        service: &str,
        config: DomoConfig,
    ) -> anyhow::Result<Worker> {
        if !socket.family().is_clientish() {
            bail!("worker requires a client-like socket, got {:?}", socket.family());
        }
        let mut worker = Worker {
            socket,
            broker_addr: broker_addr.to_string(),
            service: service.to_string(),
            liveness: config.heartbeat_liveness,
            heartbeat_at: Instant::now() + config.heartbeat_interval,
            config,
            reply_to: None,
        };
        worker.connect_to_broker(false).await?;
        Ok(worker)
    }

    /// (Re)establish the broker session: fresh connection plus READY.
    async fn connect_to_broker(&mut self, reconnect: bool) -> anyhow::Result<()> {
        if reconnect {
            info!("reconnecting to broker {}", self.broker_addr);
            let _ = self.socket.send_parts(protocol::worker_disconnect(), None).await;
            self.socket.disconnect().await;
        }
        self.socket.connect(&self.broker_addr).await?;
        self.socket.send_parts(protocol::worker_ready(&self.service), None).await?;
        self.liveness = self.config.heartbeat_liveness;
        self.heartbeat_at = Instant::now() + self.config.heartbeat_interval;
        Ok(())
    }

    /// One protocol cycle: wait up to a heartbeat interval for broker
    ///  traffic and keep the session alive. Returns the next request body
    ///  when one arrived in this cycle.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Vec<Bytes>>> {
        let request = match self.socket.recv_parts(Some(self.config.heartbeat_interval)).await? {
            Some((parts, _)) => {
                self.liveness = self.config.heartbeat_liveness;
                self.handle(parts).await?
            }
            None => {
                self.liveness = self.liveness.saturating_sub(1);
                if self.liveness == 0 {
                    warn!("broker went silent, reconnecting after backoff");
                    tokio::time::sleep(self.config.reconnect_delay).await;
                    self.connect_to_broker(true).await?;
                }
                None
            }
        };

        if Instant::now() >= self.heartbeat_at {
            debug!("heartbeating the broker");
            self.socket.send_parts(protocol::worker_heartbeat(), None).await?;
            self.heartbeat_at += self.config.heartbeat_interval;
        }
        Ok(request)
    }

    async fn handle(&mut self, parts: Vec<Bytes>) -> anyhow::Result<Option<Vec<Bytes>>> {
        let mut parts = VecDeque::from(parts);
        let Some(header) = parts.pop_front() else {
            warn!("dropping empty message from broker");
            return Ok(None);
        };
        if header != protocol::WORKER_IDENT {
            warn!("dropping message with unexpected protocol header");
            return Ok(None);
        }
        let command = match parts.pop_front().as_ref().and_then(WorkerCommand::try_from_frame) {
            Some(command) => command,
            None => {
                warn!("dropping message with bad command frame");
                return Ok(None);
            }
        };

        match command {
            WorkerCommand::Request => {
                let client = protocol::pop_frame(&mut parts)?;
                let delimiter = protocol::pop_frame(&mut parts)?;
                if !delimiter.is_empty() {
                    bail!("request without empty delimiter");
                }
                self.reply_to = Some(client);
                Ok(Some(parts.into()))
            }
            WorkerCommand::Heartbeat => Ok(None),
            WorkerCommand::Disconnect => {
                info!("broker cut us loose, registering again");
                self.connect_to_broker(true).await?;
                Ok(None)
            }
            _ => {
                warn!("dropping unexpected {:?} from broker", command);
                Ok(None)
            }
        }
    }

    /// Send the reply for the request most recently handed out by
    ///  [Worker::recv]. A no-op when no request is pending.
    pub async fn send(&mut self, body: Vec<Bytes>) -> anyhow::Result<()> {
        let Some(reply_to) = self.reply_to.take() else {
            return Ok(());
        };
        self.socket.send_parts(protocol::worker_reply(reply_to, body), None).await
    }

    /// Serve until shutdown: every request body goes through `handler`, its
    ///  return value goes back as the reply.
    pub async fn run(
        &mut self,
        mut handler: impl FnMut(Vec<Bytes>) -> Vec<Bytes>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("worker serving '{}'", self.service);
        loop {
            select! {
                request = self.recv() => {
                    if let Some(body) = request? {
                        let reply = handler(body);
                        self.send(reply).await?;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        let _ = self.socket.send_parts(protocol::worker_disconnect(), None).await;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{bound_router, fast_config};
    use crate::transport::socket::{RemoteId, SocketFamily};

    const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    async fn connected_worker(addr: &str) -> Worker {
        Worker::new(Socket::new(SocketFamily::Dealer), addr, "echo", fast_config())
            .await
            .unwrap()
    }

    /// skip heartbeats and other chatter until `command` shows up
    async fn recv_command(router: &mut Socket, command: WorkerCommand) -> (Vec<Bytes>, RemoteId) {
        loop {
            let (parts, sender) = router.recv_parts(RECV_TIMEOUT).await.unwrap().unwrap();
            if parts.len() >= 2 && WorkerCommand::try_from_frame(&parts[1]) == Some(command) {
                return (parts, sender);
            }
        }
    }

    #[tokio::test]
    async fn test_worker_rejects_server_like_socket() {
        let socket = Socket::new(SocketFamily::Router);
        assert!(Worker::new(socket, "127.0.0.1:9", "echo", fast_config()).await.is_err());
    }

    #[tokio::test]
    async fn test_request_reply_cycle() {
        let (mut router, addr) = bound_router().await;
        let mut worker = connected_worker(&addr).await;

        let (ready, worker_id) = recv_command(&mut router, WorkerCommand::Ready).await;
        assert_eq!(ready, protocol::worker_ready("echo"));

        let request = protocol::worker_request(
            Bytes::from_static(&[0, 0, 0, 9]),
            vec![Bytes::from_static(b"ping")],
        );
        router.send_parts(request, Some(worker_id)).await.unwrap();

        let body = loop {
            if let Some(body) = worker.recv().await.unwrap() {
                break body;
            }
        };
        assert_eq!(body, vec![Bytes::from_static(b"ping")]);

        worker.send(vec![Bytes::from_static(b"pong")]).await.unwrap();
        let (reply, _) = recv_command(&mut router, WorkerCommand::Reply).await;
        assert_eq!(
            reply,
            protocol::worker_reply(Bytes::from_static(&[0, 0, 0, 9]), vec![Bytes::from_static(b"pong")]),
        );

        // a second send without a pending request goes nowhere
        worker.send(vec![Bytes::from_static(b"again")]).await.unwrap();
        assert!(router.recv_parts(Some(Duration::from_millis(50))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_after_broker_silence() {
        let (mut router, addr) = bound_router().await;
        let worker = connected_worker(&addr).await;
        tokio::spawn(async move {
            let mut worker = worker;
            loop {
                let _ = worker.recv().await;
            }
        });

        let (ready, first_id) = recv_command(&mut router, WorkerCommand::Ready).await;
        assert_eq!(ready, protocol::worker_ready("echo"));

        // stay silent; the worker must heartbeat, give up and register again
        let mut saw_heartbeat = false;
        let mut saw_disconnect = false;
        loop {
            let (parts, sender) = router.recv_parts(RECV_TIMEOUT).await.unwrap().unwrap();
            match WorkerCommand::try_from_frame(&parts[1]) {
                Some(WorkerCommand::Heartbeat) => saw_heartbeat = true,
                Some(WorkerCommand::Disconnect) => saw_disconnect = true,
                Some(WorkerCommand::Ready) => {
                    assert_ne!(sender, first_id, "expected the session to be rebuilt");
                    break;
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
        assert!(saw_heartbeat);
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_broker_disconnect_triggers_rejoin() {
        let (mut router, addr) = bound_router().await;
        let worker = connected_worker(&addr).await;
        tokio::spawn(async move {
            let mut worker = worker;
            loop {
                let _ = worker.recv().await;
            }
        });

        let (_, first_id) = recv_command(&mut router, WorkerCommand::Ready).await;
        router.send_parts(protocol::worker_disconnect(), Some(first_id)).await.unwrap();

        let (_, second_id) = recv_command(&mut router, WorkerCommand::Ready).await;
        assert_ne!(second_id, first_id);
    }
}
