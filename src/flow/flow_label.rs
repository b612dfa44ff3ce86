//! Typed access to the flow metadata in a message's JSON label: the `flow`
//!  message type, the `direction` stated in BOT messages and the `credit`
//!  amount. Other label keys are kept untouched so application metadata can
//!  ride along.

use anyhow::bail;
use serde_json::{Map, Value};

use crate::message::Message;

const FLOW_KEY: &str = "flow";
const DIRECTION_KEY: &str = "direction";
const CREDIT_KEY: &str = "credit";

/// Data direction from the perspective of the port stating it: `extract`
///  sends payload out (gives), `inject` takes payload in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Extract,
    Inject,
}

impl Direction {
    pub fn complement(self) -> Direction {
        match self {
            Direction::Extract => Direction::Inject,
            Direction::Inject => Direction::Extract,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Extract => "extract",
            Direction::Inject => "inject",
        }
    }

    fn from_str(raw: &str) -> Option<Direction> {
        match raw {
            "extract" => Some(Direction::Extract),
            "inject" => Some(Direction::Inject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Bot,
    Dat,
    Pay,
    Eot,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Bot => "BOT",
            MsgType::Dat => "DAT",
            MsgType::Pay => "PAY",
            MsgType::Eot => "EOT",
        }
    }

    fn from_str(raw: &str) -> Option<MsgType> {
        match raw {
            "BOT" => Some(MsgType::Bot),
            "DAT" => Some(MsgType::Dat),
            "PAY" => Some(MsgType::Pay),
            "EOT" => Some(MsgType::Eot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowLabel {
    fields: Map<String, Value>,
}

impl FlowLabel {
    /// Parse a message's label. An empty label is an empty object, anything
    ///  else must be a JSON object.
    pub fn try_from_message(msg: &Message) -> anyhow::Result<FlowLabel> {
        if msg.label.is_empty() {
            return Ok(FlowLabel::default());
        }
        match serde_json::from_str(&msg.label)? {
            Value::Object(fields) => Ok(FlowLabel { fields }),
            other => bail!("label must be a JSON object, got {}", other),
        }
    }

    /// Serialize back into the message's label, keeping non-flow keys.
    pub fn commit(self, msg: &mut Message) {
        msg.label = Value::Object(self.fields).to_string();
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_str(self.fields.get(FLOW_KEY)?.as_str()?)
    }

    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.fields.insert(FLOW_KEY.to_string(), Value::from(msg_type.as_str()));
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_str(self.fields.get(DIRECTION_KEY)?.as_str()?)
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.fields.insert(DIRECTION_KEY.to_string(), Value::from(direction.as_str()));
    }

    /// The credit amount, `None` when missing, negative or not an integer.
    pub fn credit(&self) -> Option<u32> {
        self.fields.get(CREDIT_KEY)?.as_u64()?.try_into().ok()
    }

    pub fn set_credit(&mut self, credit: u32) {
        self.fields.insert(CREDIT_KEY.to_string(), Value::from(credit));
    }
}
