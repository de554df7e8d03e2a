//! Frame envelope: the unit of transmission.
//!
//! Every frame is a 7-byte envelope (kind octet, big-endian channel id,
//! big-endian payload size), the payload, and a single 0xCE trailer byte.
//! The envelope layout is compile-time verified via `zerocopy`; the size
//! field counts payload bytes only, never the envelope or the trailer.
//!
//! [`Frame::decode`] is the one place frame boundaries are determined.
//! Everything above this module operates on whole, validated frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errors::{Result, WireError};

/// The fixed 8-byte greeting sent first on every connection:
/// `"AMQP" 0x00 0x00 0x09 0x01`.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Frame-end trailer byte.
pub const FRAME_END: u8 = 0xCE;

/// Envelope plus trailer bytes around every payload.
pub const FRAME_OVERHEAD: usize = FrameEnvelope::SIZE + 1;

/// What a frame's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A class/method id pair and method arguments.
    Method = 1,
    /// A content header: declared body size and properties.
    Header = 2,
    /// A slice of content body bytes.
    Body = 3,
    /// An empty liveness frame.
    Heartbeat = 8,
}

impl FrameKind {
    /// Map a wire octet to a kind.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Method),
            2 => Ok(Self::Header),
            3 => Ok(Self::Body),
            8 => Ok(Self::Heartbeat),
            _ => Err(WireError::InvalidValue { context: "frame kind" }),
        }
    }
}

/// The fixed envelope at the head of every frame.
///
/// Field order and endianness are the wire layout; `zerocopy` guarantees the
/// struct can be read straight off the byte stream with no hand-rolled
/// offset arithmetic.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FrameEnvelope {
    kind: u8,
    channel: U16,
    size: U32,
}

impl FrameEnvelope {
    const SIZE: usize = 7;
}

/// A whole, validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload discriminator.
    pub kind: FrameKind,
    /// Channel the frame belongs to; 0 is the connection itself.
    pub channel: u16,
    /// Payload bytes, shape determined by `kind`.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from parts.
    pub fn new(kind: FrameKind, channel: u16, payload: Bytes) -> Self {
        Self { kind, channel, payload }
    }

    /// The empty liveness frame (always on channel 0).
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, 0, Bytes::new())
    }

    /// Payload byte count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Write envelope, payload and trailer.
    pub fn encode(&self, buf: &mut BytesMut) {
        let envelope = FrameEnvelope {
            kind: self.kind as u8,
            channel: U16::new(self.channel),
            size: U32::new(self.payload.len() as u32),
        };
        buf.put_slice(envelope.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse one frame from the start of `input`.
    ///
    /// Returns the frame and the total bytes it occupied. Fails with
    /// [`WireError::FrameTruncated`] when `input` holds fewer bytes than the
    /// envelope declares and [`WireError::FrameCorrupt`] when the trailer is
    /// not 0xCE.
    pub fn parse(input: &[u8]) -> Result<(Self, usize)> {
        if input.len() < FrameEnvelope::SIZE {
            return Err(WireError::FrameTruncated {
                declared: FrameEnvelope::SIZE,
                available: input.len(),
            });
        }
        let envelope = FrameEnvelope::read_from_bytes(&input[..FrameEnvelope::SIZE])
            .map_err(|_| WireError::InvalidValue { context: "frame envelope" })?;

        let size = envelope.size.get() as usize;
        let total = FRAME_OVERHEAD + size;
        if input.len() < total {
            return Err(WireError::FrameTruncated { declared: total, available: input.len() });
        }

        let kind = FrameKind::from_byte(envelope.kind)?;
        let trailer = input[total - 1];
        if trailer != FRAME_END {
            return Err(WireError::FrameCorrupt { trailer });
        }

        let payload = Bytes::copy_from_slice(&input[FrameEnvelope::SIZE..total - 1]);
        Ok((Self::new(kind, envelope.channel.get(), payload), total))
    }

    /// Pop one whole frame off a streaming buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame
    /// — the caller must read more bytes and retry; this is the transport's
    /// backpressure point, not an error. Corruption is still fatal.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        match Self::parse(src) {
            Ok((frame, total)) => {
                src.advance(total);
                Ok(Some(frame))
            },
            Err(WireError::FrameTruncated { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
