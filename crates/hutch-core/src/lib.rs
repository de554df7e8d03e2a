//! Protocol state machines for hutch.
//!
//! Pure session-layer logic for the AMQP 0-9-1 subset, completely decoupled
//! from I/O. Connection negotiation, channel multiplexing, content framing
//! and heartbeat scheduling are implemented as deterministic state machines;
//! time is passed in as parameters and transitions return declarative
//! [`Action`]s describing intended effects rather than executing them.
//!
//! A runtime (the `hutch-client` crate in production, plain unit tests here)
//! is responsible for interpreting actions: writing frames to a socket,
//! arming timers, waking blocked callers. This separation keeps protocol
//! correctness independent of execution concerns and lets the same
//! transitions run under production tokio and deterministic tests.
//!
//! # Components
//!
//! - [`handshake`]: connection negotiation state machine
//! - [`channels`]: channel id allocation and synchronous-reply dispatch
//! - [`content`]: splitting and reassembling message bodies
//! - [`heartbeat`]: liveness frame scheduling
//! - [`error`]: the protocol error taxonomy

pub mod action;
pub mod channels;
pub mod content;
pub mod error;
pub mod handshake;
pub mod heartbeat;

pub use action::Action;
pub use channels::{ChannelEvent, ChannelMux, ChannelState};
pub use content::{Assembler, Delivery, PublishArgs, frame_publish};
pub use error::ProtocolError;
pub use handshake::{ClientIdentity, Handshake, HandshakeState, Tuning};
pub use heartbeat::Heartbeats;
