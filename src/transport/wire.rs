//! Stream framing for logical messages. Each wire message is a u32 big endian
//!  body length followed by the body, which holds the message's frames packed
//!  with the varint part framing from [crate::util::buf].

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::buf::{encode_parts, try_decode_parts};

/// Upper bound for a wire message body. Anything bigger is treated as a
///  protocol violation rather than an allocation request.
pub const MAX_WIRE_BYTES: usize = 64 * 1024 * 1024;

pub fn encode_frames(frames: &[Bytes]) -> anyhow::Result<Bytes> {
    let body = encode_parts(frames);
    if body.len() > MAX_WIRE_BYTES {
        bail!("wire message body of {} bytes exceeds cap", body.len());
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

pub async fn write_frames(stream: &mut (impl AsyncWrite + Unpin), frames: &[Bytes]) -> anyhow::Result<()> {
    let buf = encode_frames(frames)?;
    stream.write_all(&buf).await?;
    Ok(())
}

pub async fn read_frames(stream: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Vec<Bytes>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_WIRE_BYTES {
        bail!("wire message body of {} bytes exceeds cap", len);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    let mut body = Bytes::from(body);
    let frames = try_decode_parts(&mut body)?;
    if body.has_remaining() {
        bail!("{} trailing bytes in wire message body", body.remaining());
    }
    Ok(frames)
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::single(vec![Bytes::from_static(b"abc")])]
    #[case::multipart(vec![Bytes::new(), Bytes::from_static(b"x"), Bytes::from_static(b"yz")])]
    #[case::empty(vec![])]
    fn test_wire_roundtrip(#[case] frames: Vec<Bytes>) {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async {
                let (mut a, mut b) = tokio::io::duplex(1024);
                write_frames(&mut a, &frames).await.unwrap();
                assert_eq!(read_frames(&mut b).await.unwrap(), frames);
            });
    }

    #[tokio::test]
    async fn test_wire_stream_keeps_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frames(&mut a, &[Bytes::from_static(b"first")]).await.unwrap();
        write_frames(&mut a, &[Bytes::from_static(b"second"), Bytes::new()]).await.unwrap();

        assert_eq!(read_frames(&mut b).await.unwrap(), vec![Bytes::from_static(b"first")]);
        assert_eq!(
            read_frames(&mut b).await.unwrap(),
            vec![Bytes::from_static(b"second"), Bytes::new()],
        );
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_header() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        assert!(read_frames(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_read_rejects_trailing_bytes() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // body: one empty part, then a stray byte
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 0, 7]).await.unwrap();
        assert!(read_frames(&mut b).await.is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let frames = vec![Bytes::from(vec![0u8; MAX_WIRE_BYTES])];
        assert!(encode_frames(&frames).is_err());
    }
}
