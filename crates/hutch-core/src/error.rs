//! Protocol error taxonomy.
//!
//! Two severities exist and the split matters: errors that poison the whole
//! connection (sequence violations, codec failures — the stream cannot be
//! resynchronized) and errors returned to one caller while the connection
//! stays usable (`ChannelBusy`, or a content mismatch that only kills the
//! in-flight delivery). [`ProtocolError::is_fatal`] encodes the distinction
//! so drivers do not re-derive it.

use hutch_proto::WireError;
use thiserror::Error;

use crate::channels::ChannelState;
use crate::handshake::HandshakeState;

/// Result alias for protocol state machine operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the protocol state machines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A frame arrived out of the expected sequence. Fatal: the connection
    /// must close.
    #[error("unexpected {got} while {expecting}")]
    UnexpectedMethod {
        /// What the state machine was waiting for.
        expecting: &'static str,
        /// Catalog name of the method that arrived instead.
        got: &'static str,
    },

    /// An operation was attempted in a state that does not allow it.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// The handshake state at the time.
        state: HandshakeState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A second synchronous method was attempted on a channel with one
    /// outstanding. Reported to the caller; the connection remains usable.
    #[error("channel {channel} already has an outstanding synchronous method")]
    ChannelBusy {
        /// The busy channel.
        channel: u16,
    },

    /// The referenced channel id is not open.
    #[error("channel {channel} is {state:?}, not open")]
    ChannelUnavailable {
        /// The channel id.
        channel: u16,
        /// Its current state, `None` when the id is unknown entirely.
        state: Option<ChannelState>,
    },

    /// Every usable channel id up to the negotiated maximum is taken.
    #[error("no free channel ids below channel-max {channel_max}")]
    ChannelsExhausted {
        /// The negotiated cap.
        channel_max: u16,
    },

    /// Reassembled body frames disagree with the declared content size.
    /// Fatal to the in-flight delivery; the connection may continue.
    #[error("content size mismatch: header declared {declared}, received {received}")]
    ContentSizeMismatch {
        /// Size the content header declared.
        declared: u64,
        /// Bytes actually accumulated.
        received: u64,
    },

    /// A codec failure on the inbound path. Fatal: the byte stream cannot be
    /// resynchronized past it.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ProtocolError {
    /// True when the connection must be torn down, false when only the
    /// calling operation failed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnexpectedMethod { .. } | Self::Wire(_) => true,
            Self::InvalidState { .. }
            | Self::ChannelBusy { .. }
            | Self::ChannelUnavailable { .. }
            | Self::ChannelsExhausted { .. }
            | Self::ContentSizeMismatch { .. } => false,
        }
    }
}
