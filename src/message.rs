//! The message model: a structured unit with a prefix header (level, four
//!  character form tag, free form label), a coordinate header (origin,
//!  granule, seqno) and zero or more binary payload parts.
//!
//! On the wire a message is a list of parts: part 0 is the prefix header as
//!  text (`ZIO` + level digit + form + label), part 1 the coordinate header
//!  (three big endian u64), all further parts are payload. Socket families
//!  that carry one buffer per logical message pack the parts with
//!  [encode](Message::encode) / [try_decode](Message::try_decode).

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{encode_parts, try_decode_parts};

/// Severity-like tag carried in the prefix header. Single decimal digit on
///  the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageLevel {
    Undefined = 0,
    Trace = 1,
    Verbose = 2,
    Debug = 3,
    Info = 4,
    Summary = 5,
    Warning = 6,
    Error = 7,
    Fatal = 8,
}

const PREFIX_MAGIC: &[u8; 3] = b"ZIO";
const COORD_LEN: usize = 3 * 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub level: MessageLevel,
    form: [u8; 4],
    pub label: String,
    pub origin: u64,
    pub granule: u64,
    pub seqno: u64,
    pub payload: Vec<Bytes>,
    /// Addressing token for server-like sockets. Transient: set from the
    ///  receiving socket, consumed by the sending one, never serialized.
    pub routing_id: u32,
}

impl Message {
    pub fn new(form: &str) -> Message {
        Message {
            level: MessageLevel::Undefined,
            form: pack_form(form),
            label: String::new(),
            origin: 0,
            granule: 0,
            seqno: 0,
            payload: Vec::new(),
            routing_id: 0,
        }
    }

    /// The form tag, exactly four bytes (space padded).
    pub fn form(&self) -> [u8; 4] {
        self.form
    }

    pub fn set_form(&mut self, form: &str) {
        self.form = pack_form(form);
    }

    pub fn set_coord(&mut self, origin: u64, granule: u64) {
        self.origin = origin;
        self.granule = granule;
    }

    fn prefix_part(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.label.len());
        buf.put_slice(PREFIX_MAGIC);
        buf.put_u8(b'0' + u8::from(self.level));
        buf.put_slice(&self.form);
        buf.put_slice(self.label.as_bytes());
        buf.freeze()
    }

    fn coord_part(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COORD_LEN);
        buf.put_u64(self.origin);
        buf.put_u64(self.granule);
        buf.put_u64(self.seqno);
        buf.freeze()
    }

    pub fn to_parts(&self) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(2 + self.payload.len());
        parts.push(self.prefix_part());
        parts.push(self.coord_part());
        parts.extend(self.payload.iter().cloned());
        parts
    }

    pub fn try_from_parts(parts: Vec<Bytes>) -> anyhow::Result<Message> {
        let mut parts = parts.into_iter();
        let (Some(prefix), Some(coord)) = (parts.next(), parts.next()) else {
            bail!("message needs at least prefix and coord parts");
        };

        if prefix.len() < 8 || &prefix[..3] != PREFIX_MAGIC {
            bail!("bad prefix header");
        }
        let digit = prefix[3].wrapping_sub(b'0');
        let level = MessageLevel::try_from(digit)
            .map_err(|_| anyhow!("bad message level digit {:?}", prefix[3] as char))?;
        let mut form = [0u8; 4];
        form.copy_from_slice(&prefix[4..8]);
        let label = String::from_utf8(prefix[8..].to_vec())?;

        if coord.len() != COORD_LEN {
            bail!("bad coord header: {} bytes", coord.len());
        }
        let mut coord = coord;
        let origin = TryGetFixedSupport::try_get_u64(&mut coord)?;
        let granule = TryGetFixedSupport::try_get_u64(&mut coord)?;
        let seqno = TryGetFixedSupport::try_get_u64(&mut coord)?;

        Ok(Message {
            level,
            form,
            label,
            origin,
            granule,
            seqno,
            payload: parts.collect(),
            routing_id: 0,
        })
    }

    /// Pack all parts into a single buffer.
    pub fn encode(&self) -> Bytes {
        encode_parts(&self.to_parts())
    }

    pub fn try_decode(buf: Bytes) -> anyhow::Result<Message> {
        let mut buf = buf;
        let parts = try_decode_parts(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after message", buf.remaining());
        }
        Message::try_from_parts(parts)
    }
}

fn pack_form(form: &str) -> [u8; 4] {
    let mut result = *b"    ";
    for (i, b) in form.bytes().take(4).enumerate() {
        result[i] = b;
    }
    result
}
