//! The credit flow state machine. Pure bookkeeping, no IO: callers report
//!  every message they want to send or have received, the machine says
//!  whether it takes part in the protocol and keeps state, credit and seqno
//!  counters.
//!
//! A message that does not match any transition is rejected quietly (`false`)
//!  and changes nothing. Only a malformed BOT from the peer and locally
//!  composed messages without flow metadata are hard errors.

use tracing::debug;

use super::FlowError;
use super::flow_label::{Direction, FlowLabel, MsgType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    BotSent,
    BotRecvd,
    Giving(Giving),
    Taking(Taking),
    /// own EOT sent, awaiting the peer's
    AckFin,
    /// peer EOT received, own ack still to send
    FinAck,
    Fin,
}

/// Giver sub-state, by credit left to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Giving {
    Generous,
    Broke,
}

/// Taker sub-state, by credit accumulated for the next PAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taking {
    Rich,
    HandsOut,
}

pub struct FlowMachine {
    state: FlowState,
    direction: Direction,
    serverish: bool,
    total_credit: u32,
    credit: u32,
    send_seqno: i64,
    recv_seqno: i64,
    remote_id: u32,
}

impl FlowMachine {
    pub fn new(direction: Direction, total_credit: u32, serverish: bool) -> FlowMachine {
        FlowMachine {
            state: FlowState::Idle,
            direction,
            serverish,
            total_credit,
            credit: 0,
            send_seqno: -1,
            recv_seqno: -1,
            remote_id: 0,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_giver(&self) -> bool {
        self.direction == Direction::Extract
    }

    pub fn is_serverish(&self) -> bool {
        self.serverish
    }

    pub fn total_credit(&self) -> u32 {
        self.total_credit
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    pub fn send_seqno(&self) -> i64 {
        self.send_seqno
    }

    pub fn recv_seqno(&self) -> i64 {
        self.recv_seqno
    }

    /// Routing id of the peer, latched from its BOT. Zero on client-like
    ///  flows.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Report an outgoing message before it is sent. `true` allows the send
    ///  and has `send_seqno` stamped, `false` means the message must not go
    ///  out.
    pub fn on_send(&mut self, label: &FlowLabel) -> Result<bool, FlowError> {
        let Some(msg_type) = label.msg_type() else {
            return Err(FlowError::LocalProtocol(
                "outgoing message carries no flow type".to_string(),
            ));
        };

        match (self.state, msg_type) {
            (FlowState::Idle, MsgType::Bot) if self.bot_label_ok(label) => {
                self.send_seqno += 1;
                self.state = FlowState::BotSent;
                Ok(true)
            }
            (FlowState::BotRecvd, MsgType::Bot) if self.bot_label_ok(label) => {
                self.send_seqno += 1;
                self.flowing_init();
                Ok(true)
            }
            (FlowState::Giving(Giving::Generous), MsgType::Dat) if self.credit > 0 => {
                self.credit -= 1;
                self.send_seqno += 1;
                if self.credit == 0 {
                    self.state = FlowState::Giving(Giving::Broke);
                }
                Ok(true)
            }
            (FlowState::Giving(_) | FlowState::Taking(_), MsgType::Eot) => {
                self.send_seqno += 1;
                self.state = FlowState::AckFin;
                Ok(true)
            }
            (FlowState::FinAck, MsgType::Eot) => {
                self.send_seqno += 1;
                self.state = FlowState::Fin;
                Ok(true)
            }
            (state, msg_type) => {
                debug!("rejecting {:?} send in state {:?}", msg_type, state);
                Ok(false)
            }
        }
    }

    /// Report a received message. `true` means it was accepted and counted,
    ///  `false` that it was dropped.
    pub fn on_recv(&mut self, label: &FlowLabel, routing_id: u32) -> Result<bool, FlowError> {
        let Some(msg_type) = label.msg_type() else {
            debug!("dropping received message without flow type");
            return Ok(false);
        };

        match (self.state, msg_type) {
            (FlowState::Idle, MsgType::Bot) => {
                self.recv_bot(label, routing_id)?;
                self.state = FlowState::BotRecvd;
                Ok(true)
            }
            (FlowState::BotSent, MsgType::Bot) => {
                self.recv_bot(label, routing_id)?;
                self.flowing_init();
                Ok(true)
            }
            (FlowState::Giving(_), MsgType::Pay) => {
                let Some(grant) = label.credit() else {
                    debug!("dropping PAY without a usable credit amount");
                    return Ok(false);
                };
                match self.credit.checked_add(grant) {
                    Some(credit) if credit <= self.total_credit => {
                        self.credit = credit;
                        self.recv_seqno += 1;
                        self.state = FlowState::Giving(Giving::Generous);
                        Ok(true)
                    }
                    _ => {
                        debug!(
                            "dropping PAY: {} + {} exceeds total credit {}",
                            self.credit, grant, self.total_credit
                        );
                        Ok(false)
                    }
                }
            }
            (FlowState::Taking(_), MsgType::Dat) => {
                if self.credit >= self.total_credit {
                    debug!("dropping DAT beyond total credit {}", self.total_credit);
                    return Ok(false);
                }
                self.credit += 1;
                self.recv_seqno += 1;
                self.state = if self.credit == self.total_credit {
                    FlowState::Taking(Taking::Rich)
                } else {
                    FlowState::Taking(Taking::HandsOut)
                };
                Ok(true)
            }
            (FlowState::Giving(_) | FlowState::Taking(_), MsgType::Eot) => {
                self.recv_seqno += 1;
                self.state = FlowState::FinAck;
                Ok(true)
            }
            (FlowState::AckFin, MsgType::Eot) => {
                self.recv_seqno += 1;
                self.state = FlowState::Fin;
                Ok(true)
            }
            (state, msg_type) => {
                debug!("dropping {:?} received in state {:?}", msg_type, state);
                Ok(false)
            }
        }
    }

    /// Turn accumulated taker credit into a PAY grant. Moves `Rich` to
    ///  `HandsOut` in any case; returns the amount to send (with `send_seqno`
    ///  stamped) or `None` when there is nothing to pay.
    pub fn flush_pay(&mut self) -> Option<u32> {
        let FlowState::Taking(_) = self.state else {
            return None;
        };
        self.state = FlowState::Taking(Taking::HandsOut);
        if self.credit == 0 {
            return None;
        }
        let grant = self.credit;
        self.credit = 0;
        self.send_seqno += 1;
        Some(grant)
    }

    fn bot_label_ok(&self, label: &FlowLabel) -> bool {
        if label.direction() != Some(self.direction) {
            debug!("rejecting BOT send without own direction");
            return false;
        }
        if label.credit().is_none() {
            debug!("rejecting BOT send without credit");
            return false;
        }
        true
    }

    fn recv_bot(&mut self, label: &FlowLabel, routing_id: u32) -> Result<(), FlowError> {
        let Some(direction) = label.direction() else {
            return Err(FlowError::RemoteProtocol(
                "BOT without a valid direction".to_string(),
            ));
        };
        if direction != self.direction.complement() {
            return Err(FlowError::RemoteProtocol(format!(
                "BOT with direction {} instead of {}",
                direction.as_str(),
                self.direction.complement().as_str(),
            )));
        }
        let Some(offer) = label.credit() else {
            return Err(FlowError::RemoteProtocol(
                "BOT without a credit amount".to_string(),
            ));
        };

        if self.serverish {
            // zero asks the server-like side to decide
            if offer > 0 {
                self.total_credit = offer;
            }
        } else {
            self.total_credit = offer;
        }
        self.recv_seqno += 1;
        self.remote_id = routing_id;
        Ok(())
    }

    fn flowing_init(&mut self) {
        match self.direction {
            Direction::Extract => {
                self.credit = self.total_credit;
                self.state = if self.credit > 0 {
                    FlowState::Giving(Giving::Generous)
                } else {
                    FlowState::Giving(Giving::Broke)
                };
            }
            Direction::Inject => {
                self.credit = 0;
                self.state = FlowState::Taking(Taking::Rich);
            }
        }
    }
}
