use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Packet header: kind (1) + payload length (4, big-endian) = 5 bytes.
pub const HEADER_SIZE: usize = 5;

/// Upper bound on how much buffer space is reserved ahead of a payload that
/// has not arrived yet.
const MAX_RESERVE: usize = 64 * 1024;

/// Packet kinds understood by the supervisor and its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Human-readable error message, sent in either direction.
    Error = 0x00,
    /// Start a build; payload is a shell-quoted argument string.
    Compile = 0x01,
    /// Cancel the running build; no payload.
    Cancel = 0x02,
    /// Reserved.
    Started = 0x80,
    /// One line of build output, without its newline.
    Running = 0x81,
    /// Build finished; payload is the exit code as a big-endian `i32`.
    Complete = 0x82,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Map a wire tag to a known kind, or `None` for tags this version does
    /// not recognize.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Self::Error),
            0x01 => Some(Self::Compile),
            0x02 => Some(Self::Cancel),
            0x80 => Some(Self::Started),
            0x81 => Some(Self::Running),
            0x82 => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "ERROR",
            Self::Compile => "COMPILE",
            Self::Cancel => "CANCEL",
            Self::Started => "STARTED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// One framed unit of the wire protocol.
///
/// The raw tag is kept rather than a [`PacketKind`] so that packets with
/// unknown tags survive decoding and can be reported back to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tag: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: kind.tag(),
            payload: payload.into(),
        }
    }

    /// A COMPLETE packet carrying `code`.
    pub fn complete(code: i32) -> Self {
        Self::new(PacketKind::Complete, Bytes::copy_from_slice(&code.to_be_bytes()))
    }

    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_tag(self.tag)
    }

    /// Interpret the payload as a COMPLETE exit code.
    pub fn exit_code(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    /// The payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// The total wire size of this packet (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Codec for the packet wire format.
///
/// ```text
/// ┌───────────┬──────────────┬──────────────────┐
/// │ Kind (1B) │ Length (4B)  │ Payload          │
/// │           │ big-endian   │ (Length bytes)   │
/// └───────────┴──────────────┴──────────────────┘
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let tag = src[0];
        let payload_len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        let total = HEADER_SIZE.saturating_add(payload_len);
        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Packet { tag, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::StreamClosed),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(packet.payload.len()).map_err(|_| Error::PayloadTooLarge {
            size: packet.payload.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(packet.wire_size());
        dst.put_u8(packet.tag);
        dst.put_u32(len);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Serializes packets onto a shared outbound stream.
///
/// Clones share one lock, which is held across the whole header + payload
/// write and the flush, so packets from concurrent writers never interleave.
#[derive(Clone)]
pub struct PacketWriter {
    inner: SharedWriter,
}

impl PacketWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn write_packet(&self, kind: PacketKind, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Packet::new(kind, payload)).await
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet, &mut buf)?;

        let mut writer = self.inner.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}
