//! Buffer helpers shared by the message codec and the wire framing: strings
//!  and byte blobs are length-prefixed with varints, and a whole multipart
//!  message can be packed into (and unpacked from) a single buffer.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let b = try_get_bytes(buf)?;
    Ok(String::from_utf8(b.to_vec())?)
}

pub fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_usize_varint(b.len());
    buf.put_slice(b);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("length prefix {} exceeds remaining buffer {}", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

/// Pack a list of message parts into one buffer, varint part count first.
pub fn encode_parts(parts: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_usize_varint(parts.len());
    for part in parts {
        put_bytes(&mut buf, part);
    }
    buf.freeze()
}

pub fn try_decode_parts(buf: &mut impl Buf) -> anyhow::Result<Vec<Bytes>> {
    let n = buf.try_get_usize_varint()?;
    if n > buf.remaining() {
        // each part costs at least its one-byte length prefix
        bail!("part count {} exceeds remaining buffer {}", n, buf.remaining());
    }
    let mut parts = Vec::with_capacity(n);
    for _ in 0..n {
        parts.push(try_get_bytes(buf)?);
    }
    Ok(parts)
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::empty("")]
    #[case::simple("abc")]
    #[case::umlaut("Hällo wörld")]
    fn test_string_roundtrip(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut b: Bytes = buf.freeze();
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(!b.has_remaining());
    }

    #[test]
    fn test_string_wire_format() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abc");
        assert_eq!(buf.as_ref(), &[3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_get_bytes_truncated() {
        let mut b = Bytes::from_static(&[5, b'x', b'y']);
        assert!(try_get_bytes(&mut b).is_err());
    }

    #[rstest]
    #[case::none(vec![])]
    #[case::one(vec![Bytes::from_static(b"abc")])]
    #[case::with_empty_part(vec![Bytes::new(), Bytes::from_static(b"xyz"), Bytes::new()])]
    fn test_parts_roundtrip(#[case] parts: Vec<Bytes>) {
        let mut buf = encode_parts(&parts);
        let decoded = try_decode_parts(&mut buf).unwrap();
        assert_eq!(decoded, parts);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_parts_wire_format() {
        let parts = vec![Bytes::from_static(b"ab"), Bytes::new()];
        let buf = encode_parts(&parts);
        assert_eq!(buf.as_ref(), &[2, 2, b'a', b'b', 0]);
    }

    #[test]
    fn test_parts_bogus_count() {
        let mut b = Bytes::from_static(&[200, 1, 0]);
        assert!(try_decode_parts(&mut b).is_err());
    }
}
