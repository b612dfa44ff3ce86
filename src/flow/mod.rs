//! Credit based flow protocol on top of a [Port].
//!
//! Two ports establish a flow with a BOT handshake that states each side's
//!  data direction and negotiates the total credit. The `extract` side (the
//!  giver) spends one credit per DAT message it sends; the `inject` side (the
//!  taker) accumulates credit for every DAT it takes in and grants it back
//!  with PAY messages. The giver can thus never have more messages in flight
//!  than the taker agreed to buffer. Either side ends the flow with an EOT
//!  handshake; whoever receives the first EOT is expected to answer with its
//!  own.
//!
//! The server-like side (bound port) services the handshake passively: it
//!  waits for the peer's BOT and answers with its own, carrying the credit
//!  total that from then on is authoritative for both sides. A client-like
//!  BOT offering zero credit leaves the choice to the server-like side.
//!
//! Blocking operations use the flow's nominal timeout, set with
//!  [Flow::set_timeout] (`None` waits forever). A lapsed timeout is reported
//!  as a value, never as an error: errors mean the flow is broken, not slow.

mod flow_machine;
pub mod flow_label;

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::message::Message;
use crate::transport::port::Port;
use flow_label::FlowLabel;
use flow_machine::{FlowMachine, FlowState};

pub use flow_label::{Direction, MsgType};

/// Form tag of all flow protocol messages.
pub const FLOW_FORM: &str = "FLOW";

#[derive(Debug, Error)]
pub enum FlowError {
    /// This side used the flow against the protocol rules.
    #[error("local protocol violation: {0}")]
    LocalProtocol(String),
    /// The peer sent something the protocol forbids.
    #[error("remote protocol violation: {0}")]
    RemoteProtocol(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Sent,
    Timeout,
    /// The peer ended the flow; answer with [eot_ack](Flow::eot_ack).
    Eot(Message),
}

#[derive(Debug, PartialEq, Eq)]
pub enum GetOutcome {
    Msg(Message),
    Timeout,
    /// The peer ended the flow; answer with [eot_ack](Flow::eot_ack).
    Eot(Message),
}

pub struct Flow {
    port: Port,
    machine: FlowMachine,
    timeout: Option<Duration>,
    peer_eot: Option<Message>,
}

impl Flow {
    /// The server-like or client-like role follows from the port's socket
    ///  family.
    pub fn new(port: Port, direction: Direction, total_credit: u32) -> Flow {
        let serverish = port.family().is_serverish();
        Flow {
            machine: FlowMachine::new(direction, total_credit, serverish),
            port,
            timeout: None,
            peer_eot: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn direction(&self) -> Direction {
        self.machine.direction()
    }

    pub fn credit(&self) -> u32 {
        self.machine.credit()
    }

    pub fn total_credit(&self) -> u32 {
        self.machine.total_credit()
    }

    pub fn remote_id(&self) -> u32 {
        self.machine.remote_id()
    }

    /// Run this side of the BOT handshake. Client-like flows send their BOT
    ///  and await the peer's, server-like flows await the peer's BOT and
    ///  answer. `msg` serves as template for the own BOT; `None` uses an
    ///  empty message (client-like) or echoes the peer's BOT (server-like).
    ///
    /// Returns the peer's BOT, or `None` when the handshake timed out.
    pub async fn bot(&mut self, msg: Option<Message>) -> Result<Option<Message>, FlowError> {
        if self.machine.state() != FlowState::Idle {
            return Err(FlowError::LocalProtocol(format!(
                "BOT handshake attempted in state {:?}",
                self.machine.state(),
            )));
        }
        let deadline = deadline_after(self.timeout);

        if self.machine.is_serverish() {
            let peer_bot = match self.recv_accepted(deadline).await? {
                Some(msg) => msg,
                None => return Ok(None),
            };
            let mut reply = msg.unwrap_or_else(|| peer_bot.clone());
            self.compose_and_send_bot(&mut reply).await?;
            Ok(Some(peer_bot))
        } else {
            let mut own = msg.unwrap_or_else(|| Message::new(FLOW_FORM));
            self.compose_and_send_bot(&mut own).await?;
            self.recv_accepted(deadline).await
        }
    }

    /// Send an EOT without waiting for the peer's. This is both the ack for
    ///  a received EOT and the fire-and-forget way to initiate termination.
    pub async fn eot_ack(&mut self, msg: Option<Message>) -> Result<(), FlowError> {
        let mut msg = msg.unwrap_or_else(|| Message::new(FLOW_FORM));
        let mut label = local_label(&msg)?;
        label.set_msg_type(MsgType::Eot);
        label.commit(&mut msg);

        if !self.send(&mut msg).await? {
            return Err(FlowError::LocalProtocol(format!(
                "EOT not valid in state {:?}",
                self.machine.state(),
            )));
        }
        Ok(())
    }

    /// Initiate (or complete) the EOT handshake and await the peer's EOT,
    ///  consuming in-flight messages on the way. `false` when the peer's EOT
    ///  did not arrive within the timeout.
    pub async fn eot(&mut self, msg: Option<Message>) -> Result<bool, FlowError> {
        let deadline = deadline_after(self.timeout);
        self.eot_ack(msg).await?;
        loop {
            if self.machine.state() == FlowState::Fin {
                return Ok(true);
            }
            let Some(timeout) = remaining(deadline) else {
                return Ok(false);
            };
            self.recv(timeout).await?;
        }
    }

    /// Send one payload message as the giver. Waits for credit up to the
    ///  nominal timeout when broke.
    pub async fn put(&mut self, mut msg: Message) -> Result<PutOutcome, FlowError> {
        if !self.machine.is_giver() {
            return Err(FlowError::LocalProtocol("put on the taking side".to_string()));
        }
        self.drain_pay().await?;

        let deadline = deadline_after(self.timeout);
        loop {
            match self.machine.state() {
                FlowState::Giving(_) => {}
                FlowState::FinAck | FlowState::Fin => return Ok(PutOutcome::Eot(self.peer_eot())),
                state => {
                    return Err(FlowError::LocalProtocol(format!("put in state {:?}", state)));
                }
            }
            if self.machine.credit() > 0 {
                break;
            }
            let Some(timeout) = remaining(deadline) else {
                return Ok(PutOutcome::Timeout);
            };
            self.recv(timeout).await?;
        }

        let mut label = local_label(&msg)?;
        label.set_msg_type(MsgType::Dat);
        label.commit(&mut msg);
        if !self.send(&mut msg).await? {
            return Err(FlowError::LocalProtocol(
                "DAT rejected although credit is available".to_string(),
            ));
        }
        Ok(PutOutcome::Sent)
    }

    /// Receive one payload message as the taker, granting accumulated credit
    ///  back first.
    pub async fn get(&mut self) -> Result<GetOutcome, FlowError> {
        if self.machine.is_giver() {
            return Err(FlowError::LocalProtocol("get on the giving side".to_string()));
        }
        match self.machine.state() {
            FlowState::Taking(_) => {}
            FlowState::FinAck | FlowState::Fin => return Ok(GetOutcome::Eot(self.peer_eot())),
            state => {
                return Err(FlowError::LocalProtocol(format!("get in state {:?}", state)));
            }
        }
        self.send_pay().await?;

        let deadline = deadline_after(self.timeout);
        loop {
            let Some(timeout) = remaining(deadline) else {
                return Ok(GetOutcome::Timeout);
            };
            if let Some(msg) = self.recv(timeout).await? {
                if matches!(self.machine.state(), FlowState::FinAck | FlowState::Fin) {
                    return Ok(GetOutcome::Eot(msg));
                }
                return Ok(GetOutcome::Msg(msg));
            }
        }
    }

    /// Credit maintenance for users of the low-level API: the giver takes in
    ///  pending PAY grants, the taker flushes accumulated credit. Returns the
    ///  credit on hand afterwards.
    pub async fn pay(&mut self) -> Result<u32, FlowError> {
        if self.machine.is_giver() {
            self.drain_pay().await?;
        } else {
            self.send_pay().await?;
        }
        Ok(self.machine.credit())
    }

    /// Low-level guarded send. The message's label must carry the flow type;
    ///  seqno and routing are stamped here. `false` means the state machine
    ///  rejected the message and nothing was sent.
    pub async fn send(&mut self, msg: &mut Message) -> Result<bool, FlowError> {
        msg.set_form(FLOW_FORM);
        let label = local_label(msg)?;
        if !self.machine.on_send(&label)? {
            return Ok(false);
        }
        msg.seqno = self.machine.send_seqno() as u64;
        msg.routing_id = self.machine.remote_id();
        self.port.send(msg).await?;
        Ok(true)
    }

    /// Low-level guarded receive. `None` on timeout and for messages the
    ///  state machine dropped.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, FlowError> {
        let Some(msg) = self.port.recv(timeout).await? else {
            return Ok(None);
        };
        let label = FlowLabel::try_from_message(&msg)
            .map_err(|e| FlowError::RemoteProtocol(format!("unparseable label: {:#}", e)))?;
        if !self.machine.on_recv(&label, msg.routing_id)? {
            return Ok(None);
        }
        if label.msg_type() == Some(MsgType::Eot) {
            self.peer_eot = Some(msg.clone());
        }
        Ok(Some(msg))
    }

    /// Receive until the machine accepts a message or the deadline lapses.
    async fn recv_accepted(&mut self, deadline: Option<Instant>) -> Result<Option<Message>, FlowError> {
        loop {
            let Some(timeout) = remaining(deadline) else {
                return Ok(None);
            };
            if let Some(msg) = self.recv(timeout).await? {
                return Ok(Some(msg));
            }
        }
    }

    async fn compose_and_send_bot(&mut self, msg: &mut Message) -> Result<(), FlowError> {
        let mut label = local_label(msg)?;
        label.set_msg_type(MsgType::Bot);
        label.set_direction(self.machine.direction());
        label.set_credit(self.machine.total_credit());
        label.commit(msg);

        if !self.send(msg).await? {
            return Err(FlowError::LocalProtocol("BOT send rejected".to_string()));
        }
        Ok(())
    }

    /// Consume all PAY messages already waiting, without blocking.
    async fn drain_pay(&mut self) -> Result<(), FlowError> {
        while self.port.poll(Some(Duration::ZERO)).await {
            self.recv(Some(Duration::ZERO)).await?;
        }
        Ok(())
    }

    /// Flush accumulated taker credit as a PAY message, if any.
    async fn send_pay(&mut self) -> Result<(), FlowError> {
        let Some(grant) = self.machine.flush_pay() else {
            return Ok(());
        };
        let mut msg = Message::new(FLOW_FORM);
        let mut label = FlowLabel::default();
        label.set_msg_type(MsgType::Pay);
        label.set_credit(grant);
        label.commit(&mut msg);
        msg.seqno = self.machine.send_seqno() as u64;
        msg.routing_id = self.machine.remote_id();
        self.port.send(&mut msg).await?;
        Ok(())
    }

    fn peer_eot(&self) -> Message {
        match &self.peer_eot {
            Some(msg) => msg.clone(),
            None => {
                let mut msg = Message::new(FLOW_FORM);
                let mut label = FlowLabel::default();
                label.set_msg_type(MsgType::Eot);
                label.commit(&mut msg);
                msg
            }
        }
    }
}

fn local_label(msg: &Message) -> Result<FlowLabel, FlowError> {
    FlowLabel::try_from_message(msg)
        .map_err(|e| FlowError::LocalProtocol(format!("unparseable label: {:#}", e)))
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// `None` when the deadline lapsed, otherwise the timeout for the next
///  blocking call (`Some(None)` = no deadline, wait forever).
fn remaining(deadline: Option<Instant>) -> Option<Option<Duration>> {
    match deadline {
        None => Some(None),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                None
            } else {
                Some(Some(left))
            }
        }
    }
}
