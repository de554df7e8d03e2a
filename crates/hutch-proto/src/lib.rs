//! Wire format for the AMQP 0-9-1 subset spoken by hutch.
//!
//! Everything on the wire is a frame: a fixed 7-byte envelope (kind, channel,
//! payload size) followed by a variable payload and a single trailer byte.
//! Method payloads carry a class/method id pair and a fixed argument schema
//! built from tagged field values; content payloads carry a header (declared
//! body size plus properties) and raw body bytes.
//!
//! The envelope is parsed through a compile-time verified layout via
//! `zerocopy`; everything behind it goes through a bounds-checked cursor. A
//! corrupt trailer or a truncated declared length can never be resynchronized,
//! so decode errors here are fatal to the connection that produced them — no
//! partial-frame recovery is attempted.
//!
//! This crate is pure data: no I/O, no state, no async.

pub mod content;
pub mod cursor;
pub mod errors;
pub mod frame;
pub mod method;
pub mod value;

pub use content::{BasicProperties, ContentHeader, PropertyFlags};
pub use cursor::Decoder;
pub use errors::{Result, WireError};
pub use frame::{FRAME_OVERHEAD, Frame, FrameKind, PROTOCOL_HEADER};
pub use method::{ClassMethod, Method};
pub use value::{BitSet, FieldTable, FieldValue, ShortStr};
