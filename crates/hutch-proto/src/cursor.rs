//! Bounds-checked read cursor over a byte slice.
//!
//! All payload parsing in this crate goes through [`Decoder`]: every read is
//! length-checked up front and reports a [`WireError::MalformedValue`] naming
//! what was being decoded. Nothing in the crate indexes payload bytes by hand.

use bytes::Bytes;

use crate::errors::{Result, WireError};

/// Read cursor over an immutable byte slice.
///
/// All multi-byte integers are read big-endian, as everywhere on the wire.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::MalformedValue {
                context,
                needed: n - self.remaining(),
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read a single octet.
    pub fn u8(&mut self, context: &'static str) -> Result<u8> {
        Ok(self.take(1, context)?[0])
    }

    /// Read a big-endian unsigned 16-bit integer.
    pub fn u16(&mut self, context: &'static str) -> Result<u16> {
        let b = self.take(2, context)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian unsigned 32-bit integer.
    pub fn u32(&mut self, context: &'static str) -> Result<u32> {
        let b = self.take(4, context)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian signed 32-bit integer.
    pub fn i32(&mut self, context: &'static str) -> Result<i32> {
        let b = self.take(4, context)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian unsigned 64-bit integer.
    pub fn u64(&mut self, context: &'static str) -> Result<u64> {
        let b = self.take(8, context)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read exactly `n` raw bytes.
    pub fn bytes(&mut self, n: usize, context: &'static str) -> Result<&'a [u8]> {
        self.take(n, context)
    }

    /// Read a 4-byte length prefix followed by that many raw bytes.
    pub fn long_bytes(&mut self, context: &'static str) -> Result<Bytes> {
        let len = self.u32(context)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, context)?))
    }

    /// Split off a sub-decoder over the next `n` bytes.
    ///
    /// Used for length-delimited composites (field tables) so their contents
    /// cannot read past the declared extent.
    pub fn sub(&mut self, n: usize, context: &'static str) -> Result<Decoder<'a>> {
        Ok(Decoder::new(self.take(n, context)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_big_endian() {
        let mut d = Decoder::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(d.u8("a").unwrap(), 0x01);
        assert_eq!(d.u16("b").unwrap(), 0x0203);
        assert_eq!(d.u32("c").unwrap(), 0x0405_0607);
        assert!(d.is_empty());
    }

    #[test]
    fn under_run_reports_context_and_counts() {
        let mut d = Decoder::new(&[0x01]);
        let err = d.u32("tune.frame-max").unwrap_err();
        assert_eq!(
            err,
            WireError::MalformedValue { context: "tune.frame-max", needed: 3, available: 1 }
        );
    }

    #[test]
    fn sub_decoder_is_bounded() {
        let mut d = Decoder::new(&[0xAA, 0xBB, 0xCC]);
        let mut inner = d.sub(2, "table").unwrap();
        assert_eq!(inner.u16("entry").unwrap(), 0xAABB);
        assert!(inner.u8("past-end").is_err());
        // Outer cursor resumes after the sub-range.
        assert_eq!(d.u8("tail").unwrap(), 0xCC);
    }
}
