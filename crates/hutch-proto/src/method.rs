//! Method catalog: the class/method id registry and typed argument schemas.
//!
//! A method frame's payload is a 2-byte class id, a 2-byte method id, then
//! the method's arguments in a fixed order. This module is the only place
//! those ids and schemas live; state machines above it match on [`Method`]
//! variants and log through descriptor names, never on raw id literals.
//!
//! Ids the catalog does not recognize decode to [`Method::Unknown`] carrying
//! the raw argument bytes — a peer speaking a newer dialect must never crash
//! the decoder.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Decoder;
use crate::errors::{Result, WireError};
use crate::frame::{Frame, FrameKind};
use crate::value::{BitSet, FieldTable, ShortStr};

/// A class id / method id pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassMethod {
    /// Protocol class (10 connection, 20 channel, 50 queue, 60 basic).
    pub class: u16,
    /// Method within the class.
    pub method: u16,
}

impl ClassMethod {
    /// Construct from the two wire integers.
    #[must_use]
    pub const fn new(class: u16, method: u16) -> Self {
        Self { class, method }
    }

    /// The catalog name, or `"unknown"` for ids outside the catalog.
    #[must_use]
    pub fn name(self) -> &'static str {
        descriptor(self).map_or("unknown", |d| d.name)
    }
}

impl std::fmt::Display for ClassMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.name(), self.class, self.method)
    }
}

/// Connection class id.
pub const CLASS_CONNECTION: u16 = 10;
/// Channel class id.
pub const CLASS_CHANNEL: u16 = 20;
/// Queue class id.
pub const CLASS_QUEUE: u16 = 50;
/// Basic (content) class id.
pub const CLASS_BASIC: u16 = 60;

/// connection.start
pub const CONNECTION_START: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 10);
/// connection.start-ok
pub const CONNECTION_START_OK: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 11);
/// connection.tune
pub const CONNECTION_TUNE: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 30);
/// connection.tune-ok
pub const CONNECTION_TUNE_OK: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 31);
/// connection.open
pub const CONNECTION_OPEN: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 40);
/// connection.open-ok
pub const CONNECTION_OPEN_OK: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 41);
/// connection.close
pub const CONNECTION_CLOSE: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 50);
/// connection.close-ok
pub const CONNECTION_CLOSE_OK: ClassMethod = ClassMethod::new(CLASS_CONNECTION, 51);
/// channel.open
pub const CHANNEL_OPEN: ClassMethod = ClassMethod::new(CLASS_CHANNEL, 10);
/// channel.open-ok
pub const CHANNEL_OPEN_OK: ClassMethod = ClassMethod::new(CLASS_CHANNEL, 11);
/// channel.close
pub const CHANNEL_CLOSE: ClassMethod = ClassMethod::new(CLASS_CHANNEL, 40);
/// channel.close-ok
pub const CHANNEL_CLOSE_OK: ClassMethod = ClassMethod::new(CLASS_CHANNEL, 41);
/// queue.declare
pub const QUEUE_DECLARE: ClassMethod = ClassMethod::new(CLASS_QUEUE, 10);
/// queue.declare-ok
pub const QUEUE_DECLARE_OK: ClassMethod = ClassMethod::new(CLASS_QUEUE, 11);
/// basic.publish
pub const BASIC_PUBLISH: ClassMethod = ClassMethod::new(CLASS_BASIC, 40);

/// Catalog entry: id pair and symbolic name.
#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    /// The id pair.
    pub id: ClassMethod,
    /// Dotted symbolic name, e.g. `connection.start-ok`.
    pub name: &'static str,
}

const CATALOG: &[MethodDescriptor] = &[
    MethodDescriptor { id: CONNECTION_START, name: "connection.start" },
    MethodDescriptor { id: CONNECTION_START_OK, name: "connection.start-ok" },
    MethodDescriptor { id: CONNECTION_TUNE, name: "connection.tune" },
    MethodDescriptor { id: CONNECTION_TUNE_OK, name: "connection.tune-ok" },
    MethodDescriptor { id: CONNECTION_OPEN, name: "connection.open" },
    MethodDescriptor { id: CONNECTION_OPEN_OK, name: "connection.open-ok" },
    MethodDescriptor { id: CONNECTION_CLOSE, name: "connection.close" },
    MethodDescriptor { id: CONNECTION_CLOSE_OK, name: "connection.close-ok" },
    MethodDescriptor { id: CHANNEL_OPEN, name: "channel.open" },
    MethodDescriptor { id: CHANNEL_OPEN_OK, name: "channel.open-ok" },
    MethodDescriptor { id: CHANNEL_CLOSE, name: "channel.close" },
    MethodDescriptor { id: CHANNEL_CLOSE_OK, name: "channel.close-ok" },
    MethodDescriptor { id: QUEUE_DECLARE, name: "queue.declare" },
    MethodDescriptor { id: QUEUE_DECLARE_OK, name: "queue.declare-ok" },
    MethodDescriptor { id: BASIC_PUBLISH, name: "basic.publish" },
];

/// Look up the catalog entry for an id pair.
#[must_use]
pub fn descriptor(id: ClassMethod) -> Option<&'static MethodDescriptor> {
    CATALOG.iter().find(|d| d.id == id)
}

/// connection.start arguments (server → client).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStart {
    /// Protocol major version the server speaks.
    pub version_major: u8,
    /// Protocol minor version.
    pub version_minor: u8,
    /// Server identification table.
    pub server_properties: FieldTable,
    /// Space-separated security mechanisms, as a long string.
    pub mechanisms: Bytes,
    /// Space-separated locales, as a long string.
    pub locales: Bytes,
}

/// connection.start-ok arguments (client → server).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStartOk {
    /// Client identification table.
    pub client_properties: FieldTable,
    /// Chosen security mechanism.
    pub mechanism: ShortStr,
    /// Opaque mechanism response bytes.
    pub response: Bytes,
    /// Chosen locale.
    pub locale: ShortStr,
}

/// connection.tune / tune-ok arguments: the three tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTune {
    /// Highest channel id either side may use; 0 = no limit.
    pub channel_max: u16,
    /// Largest whole frame either side may send; 0 = no limit.
    pub frame_max: u32,
    /// Desired heartbeat interval in seconds; 0 disables.
    pub heartbeat: u16,
}

/// connection.open arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOpen {
    /// Virtual host to attach to.
    pub vhost: ShortStr,
}

/// connection.close / channel.close arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code (200 for a normal close).
    pub reply_code: u16,
    /// Human-readable reason.
    pub reply_text: ShortStr,
    /// Class id of the method that provoked the close, 0 if none.
    pub class_id: u16,
    /// Method id of the method that provoked the close, 0 if none.
    pub method_id: u16,
}

/// queue.declare arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclare {
    /// Queue name; empty asks the server to generate one.
    pub queue: ShortStr,
    /// Assert existence without creating.
    pub passive: bool,
    /// Survive broker restart.
    pub durable: bool,
    /// Restrict to this connection.
    pub exclusive: bool,
    /// Delete when the last consumer departs.
    pub auto_delete: bool,
    /// Do not wait for declare-ok.
    pub no_wait: bool,
    /// Extension arguments.
    pub arguments: FieldTable,
}

/// queue.declare-ok arguments (server → client).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclareOk {
    /// The declared queue's name (server-generated when asked).
    pub queue: ShortStr,
    /// Messages currently in the queue.
    pub message_count: u32,
    /// Active consumers on the queue.
    pub consumer_count: u32,
}

/// basic.publish arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicPublish {
    /// Target exchange; empty routes via the default exchange.
    pub exchange: ShortStr,
    /// Routing key the exchange matches on.
    pub routing_key: ShortStr,
    /// Require the message to be routable.
    pub mandatory: bool,
    /// Require an immediate consumer.
    pub immediate: bool,
}

/// A decoded method.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// connection.start
    ConnectionStart(ConnectionStart),
    /// connection.start-ok
    ConnectionStartOk(ConnectionStartOk),
    /// connection.tune
    ConnectionTune(ConnectionTune),
    /// connection.tune-ok
    ConnectionTuneOk(ConnectionTune),
    /// connection.open
    ConnectionOpen(ConnectionOpen),
    /// connection.open-ok
    ConnectionOpenOk,
    /// connection.close
    ConnectionClose(Close),
    /// connection.close-ok
    ConnectionCloseOk,
    /// channel.open
    ChannelOpen,
    /// channel.open-ok
    ChannelOpenOk,
    /// channel.close
    ChannelClose(Close),
    /// channel.close-ok
    ChannelCloseOk,
    /// queue.declare
    QueueDeclare(QueueDeclare),
    /// queue.declare-ok
    QueueDeclareOk(QueueDeclareOk),
    /// basic.publish
    BasicPublish(BasicPublish),
    /// A method outside the catalog; kept whole for forward compatibility.
    Unknown {
        /// The unrecognized id pair.
        id: ClassMethod,
        /// Raw argument bytes.
        payload: Bytes,
    },
}

impl Method {
    /// The id pair this method encodes as.
    #[must_use]
    pub fn id(&self) -> ClassMethod {
        match self {
            Self::ConnectionStart(_) => CONNECTION_START,
            Self::ConnectionStartOk(_) => CONNECTION_START_OK,
            Self::ConnectionTune(_) => CONNECTION_TUNE,
            Self::ConnectionTuneOk(_) => CONNECTION_TUNE_OK,
            Self::ConnectionOpen(_) => CONNECTION_OPEN,
            Self::ConnectionOpenOk => CONNECTION_OPEN_OK,
            Self::ConnectionClose(_) => CONNECTION_CLOSE,
            Self::ConnectionCloseOk => CONNECTION_CLOSE_OK,
            Self::ChannelOpen => CHANNEL_OPEN,
            Self::ChannelOpenOk => CHANNEL_OPEN_OK,
            Self::ChannelClose(_) => CHANNEL_CLOSE,
            Self::ChannelCloseOk => CHANNEL_CLOSE_OK,
            Self::QueueDeclare(_) => QUEUE_DECLARE,
            Self::QueueDeclareOk(_) => QUEUE_DECLARE_OK,
            Self::BasicPublish(_) => BASIC_PUBLISH,
            Self::Unknown { id, .. } => *id,
        }
    }

    /// The catalog name (`"unknown"` outside the catalog).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Write the method arguments (not the id pair).
    pub fn encode_args(&self, buf: &mut BytesMut) {
        match self {
            Self::ConnectionStart(args) => {
                buf.put_u8(args.version_major);
                buf.put_u8(args.version_minor);
                args.server_properties.encode(buf);
                buf.put_u32(args.mechanisms.len() as u32);
                buf.put_slice(&args.mechanisms);
                buf.put_u32(args.locales.len() as u32);
                buf.put_slice(&args.locales);
            },
            Self::ConnectionStartOk(args) => {
                args.client_properties.encode(buf);
                args.mechanism.encode(buf);
                buf.put_u32(args.response.len() as u32);
                buf.put_slice(&args.response);
                args.locale.encode(buf);
            },
            Self::ConnectionTune(args) | Self::ConnectionTuneOk(args) => {
                buf.put_u16(args.channel_max);
                buf.put_u32(args.frame_max);
                buf.put_u16(args.heartbeat);
            },
            Self::ConnectionOpen(args) => {
                args.vhost.encode(buf);
                // Two reserved octets follow the vhost in this dialect.
                buf.put_u8(0);
                buf.put_u8(0);
            },
            Self::ConnectionClose(args) | Self::ChannelClose(args) => {
                buf.put_u16(args.reply_code);
                args.reply_text.encode(buf);
                buf.put_u16(args.class_id);
                buf.put_u16(args.method_id);
            },
            Self::ChannelOpen => {
                // Reserved octet.
                buf.put_u8(0);
            },
            Self::ChannelOpenOk => {
                // Reserved long string.
                buf.put_u32(0);
            },
            Self::QueueDeclare(args) => {
                buf.put_u16(0); // reserved
                args.queue.encode(buf);
                BitSet::from_flags(&[
                    args.passive,
                    args.durable,
                    args.exclusive,
                    args.auto_delete,
                    args.no_wait,
                ])
                .encode(buf);
                args.arguments.encode(buf);
            },
            Self::QueueDeclareOk(args) => {
                args.queue.encode(buf);
                buf.put_u32(args.message_count);
                buf.put_u32(args.consumer_count);
            },
            Self::BasicPublish(args) => {
                buf.put_u16(0); // reserved
                args.exchange.encode(buf);
                args.routing_key.encode(buf);
                BitSet::from_flags(&[args.mandatory, args.immediate]).encode(buf);
            },
            Self::ConnectionOpenOk | Self::ConnectionCloseOk | Self::ChannelCloseOk => {},
            Self::Unknown { payload, .. } => buf.put_slice(payload),
        }
    }

    /// Build the whole method-frame payload: id pair plus arguments.
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let id = self.id();
        buf.put_u16(id.class);
        buf.put_u16(id.method);
        self.encode_args(&mut buf);
        buf.freeze()
    }

    /// Wrap the method in a frame for `channel`.
    #[must_use]
    pub fn into_frame(self, channel: u16) -> Frame {
        Frame::new(FrameKind::Method, channel, self.encode_payload())
    }

    /// Decode a method-frame payload.
    pub fn decode_payload(payload: Bytes) -> Result<Self> {
        let mut cur = Decoder::new(&payload);
        let id = ClassMethod::new(cur.u16("class id")?, cur.u16("method id")?);
        Self::decode_args(id, &mut cur, &payload)
    }

    /// Decode the payload of a frame already known to be a method frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.kind != FrameKind::Method {
            return Err(WireError::InvalidValue { context: "method frame kind" });
        }
        Self::decode_payload(frame.payload.clone())
    }

    fn decode_args(id: ClassMethod, cur: &mut Decoder<'_>, payload: &Bytes) -> Result<Self> {
        match id {
            CONNECTION_START => Ok(Self::ConnectionStart(ConnectionStart {
                version_major: cur.u8("start.version-major")?,
                version_minor: cur.u8("start.version-minor")?,
                server_properties: FieldTable::decode(cur)?,
                mechanisms: cur.long_bytes("start.mechanisms")?,
                locales: cur.long_bytes("start.locales")?,
            })),
            CONNECTION_START_OK => Ok(Self::ConnectionStartOk(ConnectionStartOk {
                client_properties: FieldTable::decode(cur)?,
                mechanism: ShortStr::decode(cur)?,
                response: cur.long_bytes("start-ok.response")?,
                locale: ShortStr::decode(cur)?,
            })),
            CONNECTION_TUNE => Ok(Self::ConnectionTune(Self::decode_tune(cur)?)),
            CONNECTION_TUNE_OK => Ok(Self::ConnectionTuneOk(Self::decode_tune(cur)?)),
            CONNECTION_OPEN => {
                let vhost = ShortStr::decode(cur)?;
                // Reserved octets; peers may omit them.
                Ok(Self::ConnectionOpen(ConnectionOpen { vhost }))
            },
            CONNECTION_OPEN_OK => Ok(Self::ConnectionOpenOk),
            CONNECTION_CLOSE => Ok(Self::ConnectionClose(Self::decode_close(cur)?)),
            CONNECTION_CLOSE_OK => Ok(Self::ConnectionCloseOk),
            CHANNEL_OPEN => Ok(Self::ChannelOpen),
            CHANNEL_OPEN_OK => Ok(Self::ChannelOpenOk),
            CHANNEL_CLOSE => Ok(Self::ChannelClose(Self::decode_close(cur)?)),
            CHANNEL_CLOSE_OK => Ok(Self::ChannelCloseOk),
            QUEUE_DECLARE => {
                let _reserved = cur.u16("declare.reserved")?;
                let queue = ShortStr::decode(cur)?;
                let bits = BitSet::decode(cur, 5)?;
                let flags = bits.flags();
                Ok(Self::QueueDeclare(QueueDeclare {
                    queue,
                    passive: flags[0],
                    durable: flags[1],
                    exclusive: flags[2],
                    auto_delete: flags[3],
                    no_wait: flags[4],
                    arguments: FieldTable::decode(cur)?,
                }))
            },
            QUEUE_DECLARE_OK => Ok(Self::QueueDeclareOk(QueueDeclareOk {
                queue: ShortStr::decode(cur)?,
                message_count: cur.u32("declare-ok.message-count")?,
                consumer_count: cur.u32("declare-ok.consumer-count")?,
            })),
            BASIC_PUBLISH => {
                let _reserved = cur.u16("publish.reserved")?;
                let exchange = ShortStr::decode(cur)?;
                let routing_key = ShortStr::decode(cur)?;
                let bits = BitSet::decode(cur, 2)?;
                let flags = bits.flags();
                Ok(Self::BasicPublish(BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: flags[0],
                    immediate: flags[1],
                }))
            },
            _ => Ok(Self::Unknown { id, payload: payload.slice(4..) }),
        }
    }

    fn decode_tune(cur: &mut Decoder<'_>) -> Result<ConnectionTune> {
        Ok(ConnectionTune {
            channel_max: cur.u16("tune.channel-max")?,
            frame_max: cur.u32("tune.frame-max")?,
            heartbeat: cur.u16("tune.heartbeat")?,
        })
    }

    fn decode_close(cur: &mut Decoder<'_>) -> Result<Close> {
        Ok(Close {
            reply_code: cur.u16("close.reply-code")?,
            reply_text: ShortStr::decode(cur)?,
            class_id: cur.u16("close.class-id")?,
            method_id: cur.u16("close.method-id")?,
        })
    }
}
