//! Wire-level error types.
//!
//! These cover the codec layer only. A `MalformedValue`, `FrameTruncated` or
//! `FrameCorrupt` on the inbound path means the byte stream cannot be trusted
//! past the failure point; callers must close the connection that produced
//! it. `StringTooLong` is a caller precondition failure and never reaches the
//! wire.

use thiserror::Error;

/// Result alias for wire codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Bytes did not match the expected shape of a value.
    #[error("malformed {context}: need {needed} more bytes, {available} available")]
    MalformedValue {
        /// What was being decoded when the buffer ran short.
        context: &'static str,
        /// Bytes the value still required.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A declared value did not parse (bad UTF-8, unknown tag, bad flag).
    #[error("invalid {context}")]
    InvalidValue {
        /// What was being decoded.
        context: &'static str,
    },

    /// A frame declared more payload bytes than the input holds.
    ///
    /// When reading from a streaming transport this is the signal to buffer
    /// more bytes and retry, not a hard failure; on a fixed input it is
    /// fatal.
    #[error("frame truncated: declared {declared} bytes, {available} available")]
    FrameTruncated {
        /// Total frame length the envelope declared (envelope + payload +
        /// trailer).
        declared: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The frame trailer byte was not the frame-end marker.
    #[error("frame corrupt: trailer byte {trailer:#04x}, expected 0xce")]
    FrameCorrupt {
        /// The byte found where 0xCE was required.
        trailer: u8,
    },

    /// A short string exceeded the 255-byte wire limit.
    ///
    /// This is a precondition check at construction time, reported to the
    /// caller; it is never a connection-level fault.
    #[error("short string is {length} bytes, limit is 255")]
    StringTooLong {
        /// UTF-8 byte length of the rejected string.
        length: usize,
    },
}
