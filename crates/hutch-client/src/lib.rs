//! Tokio client for the hutch protocol stack.
//!
//! This crate owns the I/O: it connects a TCP stream, drives the pure state
//! machines from `hutch-core` over it, and exposes the blocking-style API a
//! caller actually wants — open a connection, open channels, declare
//! queues, publish, close.
//!
//! # Example
//!
//! ```no_run
//! use hutch_client::{ClientConfig, Connection, PublishArgs};
//! use hutch_proto::BasicProperties;
//!
//! # async fn example() -> hutch_client::Result<()> {
//! let connection = Connection::open("127.0.0.1:5672", ClientConfig::default()).await?;
//! let channel = connection.open_channel().await?;
//!
//! let args = PublishArgs::to_queue("tasks")?;
//! channel.publish(&args, BasicProperties::default(), "hello".as_bytes().to_vec()).await?;
//!
//! channel.close().await?;
//! connection.close().await
//! # }
//! ```
//!
//! # Concurrency
//!
//! One dispatch task per connection reads and routes every inbound frame in
//! wire order; one writer task serializes every outbound frame onto the
//! socket. Channel handles may be used from different tasks; a channel
//! allows at most one outstanding synchronous call at a time and fails the
//! second one fast. Deadlines apply to every synchronous call, and an
//! expired deadline leaves the connection unusable by design — reconnect
//! rather than guess at stream state.

mod channel;
mod connection;
mod error;

pub use channel::{Channel, QueueInfo, QueueOptions};
pub use connection::{ClientConfig, Connection};
pub use error::{ClientError, Result};

pub use hutch_core::{ClientIdentity, ProtocolError, PublishArgs, Tuning};
pub use hutch_proto::{BasicProperties, FieldTable, FieldValue, ShortStr};
