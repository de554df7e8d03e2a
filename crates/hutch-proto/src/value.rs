//! Tagged field values, field tables and packed bit flags.
//!
//! Field values appear in two positions with slightly different wire forms:
//! as method arguments they are written bare in a fixed, schema-determined
//! order; inside a [`FieldTable`] each value is preceded by a one-byte type
//! tag so tables stay self-describing and extensible.
//!
//! Tag bytes are the ones this protocol dialect actually uses on the wire:
//! `s` short string, `S` long string, `U` octet, `I` 16-bit, `L` 32-bit,
//! `l` 64-bit, `B` boolean, `T` nested table. The single-letter names do not
//! line up with the published grammar's width names; the bytes are what
//! matters.
//!
//! Packed boolean flags ([`BitSet`]) are a method-argument form only: a run
//! of consecutive bit arguments shares octets, eight flags per octet, first
//! flag in the lowest bit, final octet zero-padded. A table cannot carry one
//! (there is no tag that declares a flag count), which is also why the type
//! lives beside [`FieldValue`] rather than inside it.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Decoder;
use crate::errors::{Result, WireError};

/// A length-prefixed string of at most 255 UTF-8 bytes.
///
/// The limit is enforced at construction so encoding is total: a value of
/// this type always fits its one-byte length prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShortStr(String);

impl ShortStr {
    /// Validate and wrap a string.
    ///
    /// # Errors
    /// Returns [`WireError::StringTooLong`] when the UTF-8 byte length
    /// exceeds 255.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() > 255 {
            return Err(WireError::StringTooLong { length: value.len() });
        }
        Ok(Self(value))
    }

    /// The wrapped string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// UTF-8 byte length (0..=255).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write the one-byte length prefix and the bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0.len() as u8);
        buf.put_slice(self.0.as_bytes());
    }

    /// Read a length prefix and that many UTF-8 bytes.
    pub fn decode(cur: &mut Decoder<'_>) -> Result<Self> {
        let len = cur.u8("short-string length")? as usize;
        let raw = cur.bytes(len, "short-string")?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| WireError::InvalidValue { context: "short-string utf-8" })?;
        Ok(Self(text.to_owned()))
    }
}

impl TryFrom<&str> for ShortStr {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl fmt::Display for ShortStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A run of boolean flags packed eight per octet, first flag in the lowest
/// bit, final octet zero-padded.
///
/// Decoding needs the flag count from the method schema; the wire carries no
/// count of its own, and padding bits are never materialized as flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet(Vec<bool>);

impl BitSet {
    /// Pack the given flags in order.
    #[must_use]
    pub fn from_flags(flags: &[bool]) -> Self {
        Self(flags.to_vec())
    }

    /// The flags in declaration order.
    #[must_use]
    pub fn flags(&self) -> &[bool] {
        &self.0
    }

    /// Number of flags (not octets).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no flags are present (zero octets on the wire).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write `ceil(len / 8)` packed octets.
    pub fn encode(&self, buf: &mut BytesMut) {
        for chunk in self.0.chunks(8) {
            let mut octet = 0u8;
            for (bit, flag) in chunk.iter().enumerate() {
                if *flag {
                    octet |= 1 << bit;
                }
            }
            buf.put_u8(octet);
        }
    }

    /// Read exactly `count` flags from the packed octets.
    pub fn decode(cur: &mut Decoder<'_>, count: usize) -> Result<Self> {
        let octets = cur.bytes(count.div_ceil(8), "packed flags")?;
        let flags =
            (0..count).map(|i| octets[i / 8] & (1 << (i % 8)) != 0).collect();
        Ok(Self(flags))
    }
}

/// A tagged wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Unsigned 8-bit integer, tag `U`.
    Octet(u8),
    /// Unsigned 16-bit integer, big-endian, tag `I`.
    Short(u16),
    /// Signed 32-bit integer, big-endian, tag `L`.
    Long(i32),
    /// Unsigned 64-bit integer, big-endian, tag `l`.
    LongLong(u64),
    /// Short string, tag `s`.
    ShortStr(ShortStr),
    /// Length-prefixed byte string (4-byte length), tag `S`.
    LongStr(Bytes),
    /// Single boolean octet, tag `B`.
    Bool(bool),
    /// Nested table, tag `T`.
    Table(FieldTable),
}

impl FieldValue {
    /// The one-byte type tag used when this value sits in a table.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Octet(_) => b'U',
            Self::Short(_) => b'I',
            Self::Long(_) => b'L',
            Self::LongLong(_) => b'l',
            Self::ShortStr(_) => b's',
            Self::LongStr(_) => b'S',
            Self::Bool(_) => b'B',
            Self::Table(_) => b'T',
        }
    }

    /// Write the bare value (no tag), as in a method argument position.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Octet(v) => buf.put_u8(*v),
            Self::Short(v) => buf.put_u16(*v),
            Self::Long(v) => buf.put_i32(*v),
            Self::LongLong(v) => buf.put_u64(*v),
            Self::ShortStr(v) => v.encode(buf),
            Self::LongStr(v) => {
                buf.put_u32(v.len() as u32);
                buf.put_slice(v);
            },
            Self::Bool(v) => buf.put_u8(u8::from(*v)),
            Self::Table(v) => v.encode(buf),
        }
    }

    /// Write the tag byte followed by the value, as in a table entry.
    pub fn encode_tagged(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        self.encode(buf);
    }

    /// Read the value the given tag byte declares.
    pub fn decode(tag: u8, cur: &mut Decoder<'_>) -> Result<Self> {
        match tag {
            b'U' => Ok(Self::Octet(cur.u8("octet value")?)),
            b'I' => Ok(Self::Short(cur.u16("short value")?)),
            b'L' => Ok(Self::Long(cur.i32("long value")?)),
            b'l' => Ok(Self::LongLong(cur.u64("long-long value")?)),
            b's' => Ok(Self::ShortStr(ShortStr::decode(cur)?)),
            b'S' => Ok(Self::LongStr(cur.long_bytes("long-string")?)),
            b'B' => Ok(Self::Bool(cur.u8("boolean value")? != 0)),
            b'T' => Ok(Self::Table(FieldTable::decode(cur)?)),
            _ => Err(WireError::InvalidValue { context: "field-value tag" }),
        }
    }
}

impl From<ShortStr> for FieldValue {
    fn from(v: ShortStr) -> Self {
        Self::ShortStr(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// An ordered table of named, tagged values.
///
/// Entries keep caller insertion order; re-ordering input changes the wire
/// bytes but not the semantic content, so round trips must preserve order
/// exactly. The wire form is a 4-byte byte-length prefix covering the encoded
/// entries only, then for each entry a short-string name, a tag byte and the
/// value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(Vec<(ShortStr, FieldValue)>);

impl FieldTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a value, replacing in place when the name already exists
    /// (position is preserved on replace).
    pub fn insert(&mut self, name: ShortStr, value: impl Into<FieldValue>) {
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    /// Look up a value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(n, _)| n.as_str() == name).map(|(_, v)| v)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(ShortStr, FieldValue)> {
        self.0.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write the length prefix and the encoded entries.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut entries = BytesMut::new();
        for (name, value) in &self.0 {
            name.encode(&mut entries);
            value.encode_tagged(&mut entries);
        }
        buf.put_u32(entries.len() as u32);
        buf.put_slice(&entries);
    }

    /// Read a length prefix and every entry within it.
    pub fn decode(cur: &mut Decoder<'_>) -> Result<Self> {
        let len = cur.u32("table length")? as usize;
        let mut inner = cur.sub(len, "table entries")?;
        let mut entries = Vec::new();
        while !inner.is_empty() {
            let name = ShortStr::decode(&mut inner)?;
            let tag = inner.u8("table entry tag")?;
            let value = FieldValue::decode(tag, &mut inner)?;
            entries.push((name, value));
        }
        Ok(Self(entries))
    }
}

impl FromIterator<(ShortStr, FieldValue)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (ShortStr, FieldValue)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, value) in iter {
            table.insert(name, value);
        }
        table
    }
}
