//! Content header: the frame that precedes a message body.
//!
//! A published message travels as a method frame, then exactly one content
//! header declaring the total body size and the message properties, then as
//! many body frames as the negotiated frame size requires. The header
//! payload is: class id, a reserved weight word (always 0), the body size as
//! 64 bits, a 16-bit property-flags word, and the property values for every
//! flag that is set, in flag-bit order.
//!
//! Only the property subset this client sets is modeled; a flags word with
//! bits outside that subset cannot be skipped (the widths of unknown
//! properties are unknowable) and is rejected.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Decoder;
use crate::errors::{Result, WireError};
use crate::frame::{Frame, FrameKind};
use crate::method::CLASS_BASIC;
use crate::value::{FieldTable, ShortStr};

bitflags! {
    /// Which properties are present, one bit each, assigned from the high
    /// bit downward.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PropertyFlags: u16 {
        /// MIME content type short string.
        const CONTENT_TYPE = 1 << 15;
        /// Application headers table.
        const HEADERS = 1 << 13;
        /// Delivery mode octet (1 transient, 2 persistent).
        const DELIVERY_MODE = 1 << 12;
    }
}

/// Message properties carried by a content header.
///
/// The flags word is derived from which fields are populated; the two can
/// never disagree on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type.
    pub content_type: Option<ShortStr>,
    /// Application headers.
    pub headers: Option<FieldTable>,
    /// 1 transient, 2 persistent.
    pub delivery_mode: Option<u8>,
}

impl BasicProperties {
    /// The flags word for the populated fields.
    #[must_use]
    pub fn flags(&self) -> PropertyFlags {
        let mut flags = PropertyFlags::empty();
        if self.content_type.is_some() {
            flags |= PropertyFlags::CONTENT_TYPE;
        }
        if self.headers.is_some() {
            flags |= PropertyFlags::HEADERS;
        }
        if self.delivery_mode.is_some() {
            flags |= PropertyFlags::DELIVERY_MODE;
        }
        flags
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.flags().bits());
        if let Some(content_type) = &self.content_type {
            content_type.encode(buf);
        }
        if let Some(headers) = &self.headers {
            headers.encode(buf);
        }
        if let Some(delivery_mode) = self.delivery_mode {
            buf.put_u8(delivery_mode);
        }
    }

    fn decode(cur: &mut Decoder<'_>) -> Result<Self> {
        let bits = cur.u16("property flags")?;
        let flags = PropertyFlags::from_bits(bits)
            .ok_or(WireError::InvalidValue { context: "property flags" })?;

        let content_type = if flags.contains(PropertyFlags::CONTENT_TYPE) {
            Some(ShortStr::decode(cur)?)
        } else {
            None
        };
        let headers = if flags.contains(PropertyFlags::HEADERS) {
            Some(FieldTable::decode(cur)?)
        } else {
            None
        };
        let delivery_mode = if flags.contains(PropertyFlags::DELIVERY_MODE) {
            Some(cur.u8("delivery-mode")?)
        } else {
            None
        };
        Ok(Self { content_type, headers, delivery_mode })
    }
}

/// The decoded payload of a content-header frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Content class; publishing always uses the basic class.
    pub class: u16,
    /// Total body byte count across all body frames that follow.
    pub body_size: u64,
    /// Message properties.
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// A basic-class header for a body of `body_size` bytes.
    #[must_use]
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self { class: CLASS_BASIC, body_size, properties }
    }

    /// Write the header payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.class);
        buf.put_u16(0); // weight, reserved
        buf.put_u64(self.body_size);
        self.properties.encode(buf);
    }

    /// Wrap the header in a frame for `channel`.
    #[must_use]
    pub fn into_frame(self, channel: u16) -> Frame {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        Frame::new(FrameKind::Header, channel, buf.freeze())
    }

    /// Decode a content-header frame's payload.
    pub fn decode_payload(payload: &Bytes) -> Result<Self> {
        let mut cur = Decoder::new(payload);
        let class = cur.u16("header.class")?;
        let _weight = cur.u16("header.weight")?;
        let body_size = cur.u64("header.body-size")?;
        let properties = BasicProperties::decode(&mut cur)?;
        Ok(Self { class, body_size, properties })
    }

    /// Decode the payload of a frame already known to be a header frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.kind != FrameKind::Header {
            return Err(WireError::InvalidValue { context: "content-header frame kind" });
        }
        Self::decode_payload(&frame.payload)
    }
}
