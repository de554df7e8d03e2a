//! Actions returned by the state machines.
//!
//! Transitions never perform I/O; they return a list of actions for the
//! driver to execute in order. Keeping effects declarative is what lets the
//! same state machines run under production tokio and deterministic unit
//! tests.

use hutch_proto::Frame;

use crate::handshake::Tuning;

/// An intended effect of a state transition.
///
/// The driver executes these in the order returned: frames must hit the
/// transport in transition order or the peer observes an illegal sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the fixed 8-byte protocol greeting to the transport.
    SendProtocolHeader,

    /// Write this frame to the transport (through the single write path).
    SendFrame(Frame),

    /// Negotiation finished; the connection is usable with these parameters.
    HandshakeDone(Tuning),

    /// Close the transport with the given reason.
    CloseTransport {
        /// Human-readable close reason for logs and pending callers.
        reason: String,
    },
}
