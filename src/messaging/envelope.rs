use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// `i32` kind plus `u32` body size, in host byte order. Both ends of a channel are
///  assumed to share endianness - a known portability limitation that is preserved
///  deliberately.
pub const HEADER_SIZE: usize = size_of::<i32>() + size_of::<u32>();

/// Message kinds of the control channel. Shares the envelope format with
///  [ReplicationKind] but the two kind spaces never flow on the same channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum RequestKind {
    Socket = 0,
    Bind = 1,
    Accept = 2,
    Connect = 3,
}

/// Message kinds of the gossip channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ReplicationKind {
    NewMapping = 0,
    DeleteMapping = 1,
}

/// The generic envelope used identically by the control protocol and the gossip
///  transport: a fixed header followed by an opaque body whose decoding depends on
///  the kind and the channel it arrived on. Zero-length bodies are legal.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub kind: i32,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: impl Into<i32>, body: Bytes) -> Message {
        Message {
            kind: kind.into(),
            body,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_ne(self.kind);
        buf.put_u32_ne(self.body.len() as u32);
        buf.extend_from_slice(&self.body);
    }

    /// Decodes a complete message from an in-memory buffer (one UDP datagram). Fails
    ///  if the buffer is shorter than the header, if the declared size exceeds
    ///  `max_body_size`, or if the declared size exceeds the actually present payload.
    pub fn try_decode(buf: &mut impl Buf, max_body_size: usize) -> anyhow::Result<Message> {
        if buf.remaining() < HEADER_SIZE {
            bail!("datagram shorter than the message header: {} bytes", buf.remaining());
        }
        let kind = buf.get_i32_ne();
        let size = buf.get_u32_ne() as usize;
        if size > max_body_size {
            bail!("declared body size {} exceeds the maximum of {}", size, max_body_size);
        }
        if size > buf.remaining() {
            bail!("declared body size {} exceeds the actual payload of {} bytes", size, buf.remaining());
        }
        Ok(Message {
            kind,
            body: buf.copy_to_bytes(size),
        })
    }

    /// Reads one complete message from a stream, waiting for a full header and then a
    ///  full body. Returns `Ok(None)` if the peer closed the stream cleanly at a
    ///  message boundary; a close in the middle of a message is a truncated-stream
    ///  failure.
    pub async fn read_from<S>(stream: &mut S, max_body_size: usize) -> anyhow::Result<Option<Message>>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = stream.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("truncated stream: peer closed inside a message header");
            }
            filled += n;
        }

        let mut header_buf = &header[..];
        let kind = header_buf.get_i32_ne();
        let size = header_buf.get_u32_ne() as usize;
        if size > max_body_size {
            bail!("declared body size {} exceeds the maximum of {}", size, max_body_size);
        }

        let mut body = vec![0u8; size];
        if let Err(e) = stream.read_exact(&mut body).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                bail!("truncated stream: peer closed inside a message body");
            }
            return Err(e.into());
        }

        Ok(Some(Message {
            kind,
            body: body.into(),
        }))
    }

    pub async fn write_to<S>(&self, stream: &mut S) -> anyhow::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        self.encode(&mut buf);
        stream.write_all(&buf).await?;
        Ok(())
    }
}
