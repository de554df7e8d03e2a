//! Client-facing error type.

use std::time::Duration;

use hutch_core::ProtocolError;
use thiserror::Error;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced to callers of the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A protocol state machine rejected the exchange.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The socket failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A synchronous call's deadline elapsed.
    ///
    /// The connection must be treated as unusable afterwards: the pending
    /// reply may still arrive and there is no way to resynchronize with it.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The call that expired.
        operation: &'static str,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The connection ended, gracefully or otherwise.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why it ended.
        reason: String,
    },

    /// The server closed one channel; the connection remains usable.
    #[error("channel {channel} closed by server: {reply_code} {reply_text}")]
    ChannelClosed {
        /// The channel that was closed.
        channel: u16,
        /// Server reply code.
        reply_code: u16,
        /// Server reason text.
        reply_text: String,
    },

    /// A previous timeout or fatal error left the connection unusable;
    /// reconnect to continue.
    #[error("connection is unusable after an earlier failure")]
    ConnectionPoisoned,
}
