//! Wire constants and frame layouts of the service protocol, shared by
//!  broker, client and worker. The identifier strings and command bytes are
//!  fixed by the protocol and must not change.

use std::collections::VecDeque;

use anyhow::anyhow;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol header of client traffic, both directions.
pub const CLIENT_IDENT: &[u8] = b"MDPC01";
/// Protocol header of worker traffic, both directions.
pub const WORKER_IDENT: &[u8] = b"MDPW01";

/// Service names with this prefix are answered by the broker itself and can
///  never be registered by a worker.
pub const INTERNAL_SERVICE_PREFIX: &str = "mmi.";
/// The one supported internal query: is a service known and served?
pub const SERVICE_QUERY: &str = "mmi.service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum WorkerCommand {
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,
}

impl WorkerCommand {
    pub fn to_frame(self) -> Bytes {
        Bytes::copy_from_slice(&[u8::from(self)])
    }

    pub fn try_from_frame(frame: &Bytes) -> Option<WorkerCommand> {
        match frame.as_ref() {
            [raw] => WorkerCommand::try_from(*raw).ok(),
            _ => None,
        }
    }
}

/// `[MDPC01][service][body..]`: client request and broker reply alike.
pub fn client_envelope(service: &str, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut parts = Vec::with_capacity(2 + body.len());
    parts.push(Bytes::from_static(CLIENT_IDENT));
    parts.push(Bytes::copy_from_slice(service.as_bytes()));
    parts.extend(body);
    parts
}

/// `[MDPW01][READY][service]`
pub fn worker_ready(service: &str) -> Vec<Bytes> {
    vec![
        Bytes::from_static(WORKER_IDENT),
        WorkerCommand::Ready.to_frame(),
        Bytes::copy_from_slice(service.as_bytes()),
    ]
}

/// `[MDPW01][REQUEST][client identity][empty][body..]`: a request as the
///  broker relays it to a worker.
pub fn worker_request(client: Bytes, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut parts = Vec::with_capacity(4 + body.len());
    parts.push(Bytes::from_static(WORKER_IDENT));
    parts.push(WorkerCommand::Request.to_frame());
    parts.push(client);
    parts.push(Bytes::new());
    parts.extend(body);
    parts
}

/// `[MDPW01][REPLY][client identity][empty][body..]`
pub fn worker_reply(client: Bytes, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut parts = Vec::with_capacity(4 + body.len());
    parts.push(Bytes::from_static(WORKER_IDENT));
    parts.push(WorkerCommand::Reply.to_frame());
    parts.push(client);
    parts.push(Bytes::new());
    parts.extend(body);
    parts
}

/// `[MDPW01][HEARTBEAT]`
pub fn worker_heartbeat() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER_IDENT), WorkerCommand::Heartbeat.to_frame()]
}

/// `[MDPW01][DISCONNECT]`
pub fn worker_disconnect() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER_IDENT), WorkerCommand::Disconnect.to_frame()]
}

pub fn pop_frame(parts: &mut VecDeque<Bytes>) -> anyhow::Result<Bytes> {
    parts.pop_front().ok_or_else(|| anyhow!("message is missing a frame"))
}

pub fn pop_str(parts: &mut VecDeque<Bytes>) -> anyhow::Result<String> {
    let frame = pop_frame(parts)?;
    Ok(String::from_utf8(frame.to_vec())?)
}
