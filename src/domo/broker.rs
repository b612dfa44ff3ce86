//! The service broker: routes client requests to idle workers by service
//!  name, enforces worker liveness through heartbeats and answers `mmi.`
//!  introspection queries itself.
//!
//! All state lives in plain tables keyed by connection token and service
//!  name; a single task owns the broker, so there is no locking. Peer input
//!  can never bring the broker down: malformed traffic is logged and dropped,
//!  protocol violations by workers are answered with DISCONNECT.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domo::domo_config::DomoConfig;
use crate::domo::protocol::{self, WorkerCommand};
use crate::transport::socket::{RemoteId, Socket};

struct Service {
    requests: VecDeque<Vec<Bytes>>,
    /// idle workers of this service, insertion order
    idle: Vec<u32>,
    /// all workers bound to this service, idle or busy
    worker_count: u32,
}

struct Worker {
    service: String,
    /// presumed dead when this passes without a sign of life
    expiry: Instant,
}

pub struct Broker {
    socket: Socket,
    config: DomoConfig,
    services: FxHashMap<String, Service>,
    workers: FxHashMap<u32, Worker>,
    /// workers currently waiting for work, across all services
    waiting: FxHashSet<u32>,
}

impl Broker {
    /// The socket must be server-like and already bound.
    pub fn new(socket: Socket, config: DomoConfig) -> anyhow::Result<Broker> {
        if !socket.family().is_serverish() {
            bail!("broker requires a server-like socket, got {:?}", socket.family());
        }
        if socket.local_addr().is_none() {
            bail!("broker requires an already bound socket");
        }
        Ok(Broker {
            socket,
            config,
            services: Default::default(),
            workers: Default::default(),
            waiting: Default::default(),
        })
    }

    /// Event loop: pump messages, keep the heartbeat cadence, exit on the
    ///  shutdown signal. On exit all known workers are told to disconnect.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!("broker serving on {:?}", self.socket.local_addr());
        let mut deadline = Instant::now() + self.config.heartbeat_interval;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            select! {
                ready = self.socket.poll(Some(timeout)) => {
                    if ready {
                        self.process_one().await?;
                    }
                }
                _ = shutdown.recv() => break,
            }
            deadline = self.process_heartbeat(deadline).await;
        }

        info!("broker shutting down, disconnecting {} workers", self.workers.len());
        let tokens: Vec<u32> = self.workers.keys().copied().collect();
        for token in tokens {
            self.send_best_effort(RemoteId(token), protocol::worker_disconnect()).await;
        }
        Ok(())
    }

    /// Take one already waiting message off the socket and route it. Does
    ///  not block; a no-op when nothing is pending.
    pub async fn process_one(&mut self) -> anyhow::Result<()> {
        let received = match self.socket.recv_parts(Some(Duration::ZERO)).await {
            Ok(received) => received,
            Err(e) => {
                warn!("dropping malformed message: {:#}", e);
                return Ok(());
            }
        };
        let Some((parts, sender)) = received else {
            return Ok(());
        };

        let mut parts = VecDeque::from(parts);
        let Some(header) = parts.pop_front() else {
            warn!("dropping empty message from connection #{}", sender.0);
            return Ok(());
        };
        if header == protocol::CLIENT_IDENT {
            self.client_process(sender, parts).await
        } else if header == protocol::WORKER_IDENT {
            self.worker_process(sender, parts).await
        } else {
            warn!("dropping message with unknown protocol header from connection #{}", sender.0);
            Ok(())
        }
    }

    /// Once `deadline` is reached: purge expired workers, heartbeat the idle
    ///  ones and advance the deadline by one interval. Returns the deadline
    ///  to use next.
    pub async fn process_heartbeat(&mut self, deadline: Instant) -> Instant {
        if Instant::now() < deadline {
            return deadline;
        }
        self.purge().await;
        let idle: Vec<u32> = self.waiting.iter().copied().collect();
        for token in idle {
            self.send_best_effort(RemoteId(token), protocol::worker_heartbeat()).await;
        }
        deadline + self.config.heartbeat_interval
    }

    async fn client_process(&mut self, client: RemoteId, mut parts: VecDeque<Bytes>) -> anyhow::Result<()> {
        let service_name = match protocol::pop_str(&mut parts) {
            Ok(name) => name,
            Err(e) => {
                warn!("dropping client request without service name: {:#}", e);
                return Ok(());
            }
        };
        if service_name.starts_with(protocol::INTERNAL_SERVICE_PREFIX) {
            return self.service_internal(client, &service_name, parts).await;
        }

        debug!("queueing request for '{}' from connection #{}", service_name, client.0);
        let request = protocol::worker_request(client.to_frame(), parts.into());
        self.require_service(&service_name).requests.push_back(request);
        self.dispatch(&service_name).await;
        Ok(())
    }

    /// Answer an `mmi.` query directly. The reply is a bare status frame.
    async fn service_internal(
        &mut self,
        client: RemoteId,
        service_name: &str,
        mut parts: VecDeque<Bytes>,
    ) -> anyhow::Result<()> {
        let code: &'static [u8] = if service_name == protocol::SERVICE_QUERY {
            let queried = protocol::pop_str(&mut parts).unwrap_or_default();
            match self.services.get(&queried) {
                Some(service) if service.worker_count > 0 => b"200",
                _ => b"404",
            }
        } else {
            b"501"
        };
        self.send_best_effort(client, vec![Bytes::from_static(code)]).await;
        Ok(())
    }

    async fn worker_process(&mut self, sender: RemoteId, mut parts: VecDeque<Bytes>) -> anyhow::Result<()> {
        let Some(command_frame) = parts.pop_front() else {
            warn!("dropping worker message without command from connection #{}", sender.0);
            return Ok(());
        };
        let Some(command) = WorkerCommand::try_from_frame(&command_frame) else {
            warn!("dropping worker message with bad command frame from connection #{}", sender.0);
            return Ok(());
        };
        let known = self.workers.contains_key(&sender.0);

        match command {
            WorkerCommand::Ready => self.worker_ready(sender, known, parts).await,
            WorkerCommand::Reply => self.worker_reply(sender, known, parts).await,
            WorkerCommand::Heartbeat => {
                if !known {
                    self.delete_worker(sender.0, true).await;
                    return Ok(());
                }
                let expiry = Instant::now() + self.config.heartbeat_expiry();
                if let Some(worker) = self.workers.get_mut(&sender.0) {
                    worker.expiry = expiry;
                }
                Ok(())
            }
            WorkerCommand::Disconnect => {
                // no disconnect reply, that would ping-pong forever
                self.delete_worker(sender.0, false).await;
                Ok(())
            }
            WorkerCommand::Request => {
                warn!("dropping REQUEST sent by worker connection #{}", sender.0);
                Ok(())
            }
        }
    }

    async fn worker_ready(
        &mut self,
        sender: RemoteId,
        known: bool,
        mut parts: VecDeque<Bytes>,
    ) -> anyhow::Result<()> {
        let service_name = match protocol::pop_str(&mut parts) {
            Ok(name) => name,
            Err(e) => {
                warn!("dropping READY without service name from connection #{}: {:#}", sender.0, e);
                return Ok(());
            }
        };
        if known || service_name.starts_with(protocol::INTERNAL_SERVICE_PREFIX) {
            warn!(
                "disconnecting worker connection #{}: READY {} for '{}'",
                sender.0,
                if known { "while registered" } else { "under a reserved name" },
                service_name,
            );
            self.delete_worker(sender.0, true).await;
            return Ok(());
        }

        info!("worker connection #{} ready for '{}'", sender.0, service_name);
        self.workers.insert(
            sender.0,
            Worker {
                service: service_name.clone(),
                expiry: Instant::now() + self.config.heartbeat_expiry(),
            },
        );
        self.require_service(&service_name).worker_count += 1;
        self.worker_waiting(sender.0).await;
        Ok(())
    }

    async fn worker_reply(
        &mut self,
        sender: RemoteId,
        known: bool,
        parts: VecDeque<Bytes>,
    ) -> anyhow::Result<()> {
        if !known {
            warn!("disconnecting connection #{}: REPLY without READY", sender.0);
            self.delete_worker(sender.0, true).await;
            return Ok(());
        }
        match parse_reply(parts) {
            Ok((client, body)) => {
                let Some(worker) = self.workers.get(&sender.0) else {
                    return Ok(());
                };
                let service_name = worker.service.clone();
                debug!(
                    "relaying '{}' reply from worker connection #{} to connection #{}",
                    service_name, sender.0, client.0,
                );
                self.send_best_effort(client, protocol::client_envelope(&service_name, body)).await;
                self.worker_waiting(sender.0).await;
            }
            Err(e) => {
                warn!("disconnecting worker connection #{}: malformed reply: {:#}", sender.0, e);
                self.delete_worker(sender.0, true).await;
            }
        }
        Ok(())
    }

    /// Put a worker back into the idle set, refresh its expiry and try to
    ///  hand it work.
    async fn worker_waiting(&mut self, token: u32) {
        self.waiting.insert(token);
        let Some(worker) = self.workers.get_mut(&token) else {
            return;
        };
        worker.expiry = Instant::now() + self.config.heartbeat_expiry();
        let service_name = worker.service.clone();
        if let Some(service) = self.services.get_mut(&service_name) {
            if !service.idle.contains(&token) {
                service.idle.push(token);
            }
        }
        self.dispatch(&service_name).await;
    }

    /// Match queued requests with idle workers. The idle worker with the
    ///  farthest expiry wins, i.e. the one that confirmed life most recently;
    ///  requests go out in arrival order.
    async fn dispatch(&mut self, service_name: &str) {
        self.purge().await;
        loop {
            let picked = {
                let Some(service) = self.services.get_mut(service_name) else {
                    return;
                };
                if service.requests.is_empty() || service.idle.is_empty() {
                    return;
                }

                let mut best: Option<(usize, Instant)> = None;
                for (i, token) in service.idle.iter().enumerate() {
                    let Some(worker) = self.workers.get(token) else {
                        continue;
                    };
                    match best {
                        Some((_, expiry)) if worker.expiry <= expiry => {}
                        _ => best = Some((i, worker.expiry)),
                    }
                }
                let Some((idx, _)) = best else {
                    return;
                };
                let token = service.idle.remove(idx);
                let Some(request) = service.requests.pop_front() else {
                    return;
                };
                (token, request)
            };

            let (token, request) = picked;
            self.waiting.remove(&token);
            debug!("dispatching '{}' request to worker connection #{}", service_name, token);
            self.send_best_effort(RemoteId(token), request).await;
        }
    }

    /// Disconnect and forget every waiting worker whose expiry has passed.
    async fn purge(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .waiting
            .iter()
            .filter(|token| {
                self.workers
                    .get(*token)
                    .map(|worker| worker.expiry <= now)
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        for token in expired {
            info!("purging expired worker connection #{}", token);
            self.delete_worker(token, true).await;
        }
    }

    async fn delete_worker(&mut self, token: u32, disconnect: bool) {
        if disconnect {
            self.send_best_effort(RemoteId(token), protocol::worker_disconnect()).await;
        }
        self.waiting.remove(&token);
        let Some(worker) = self.workers.remove(&token) else {
            return;
        };
        if let Some(service) = self.services.get_mut(&worker.service) {
            service.idle.retain(|t| *t != token);
            service.worker_count = service.worker_count.saturating_sub(1);
        }
    }

    fn require_service(&mut self, name: &str) -> &mut Service {
        self.services.entry(name.to_string()).or_insert_with(|| Service {
            requests: VecDeque::new(),
            idle: Vec::new(),
            worker_count: 0,
        })
    }

    /// The broker outlives its peers; a failed send is their problem.
    async fn send_best_effort(&mut self, remote: RemoteId, parts: Vec<Bytes>) {
        if let Err(e) = self.socket.send_parts(parts, Some(remote)).await {
            debug!("send to connection #{} failed: {:#}", remote.0, e);
        }
    }
}

fn parse_reply(mut parts: VecDeque<Bytes>) -> anyhow::Result<(RemoteId, Vec<Bytes>)> {
    let client = RemoteId::try_from_frame(&protocol::pop_frame(&mut parts)?)?;
    let delimiter = protocol::pop_frame(&mut parts)?;
    if !delimiter.is_empty() {
        bail!("reply without empty delimiter");
    }
    Ok((client, parts.into()))
}
