//! Channel handles: the per-channel slice of the public API.
//!
//! A handle is a thin wrapper over the shared connection state; it holds no
//! socket and no task. Synchronous calls (declare, close) go through the
//! multiplexer's single pending-expectation slot, so two concurrent calls
//! on one handle fail fast rather than interleave. Publishing is
//! fire-and-forget and never blocks on the server.

use std::sync::Arc;

use bytes::Bytes;
use hutch_core::{ChannelEvent, ProtocolError, frame_publish};
use hutch_proto::method::QueueDeclare;
use hutch_proto::{BasicProperties, ClassMethod, FieldTable, ShortStr};
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Inner;
use crate::error::{ClientError, Result};

pub use hutch_core::PublishArgs;

/// Options for queue.declare.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Assert existence without creating.
    pub passive: bool,
    /// Survive broker restart.
    pub durable: bool,
    /// Restrict to this connection.
    pub exclusive: bool,
    /// Delete when the last consumer departs.
    pub auto_delete: bool,
}

/// The server's answer to queue.declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Declared queue name (server-generated when requested empty).
    pub queue: String,
    /// Messages currently queued.
    pub message_count: u32,
    /// Active consumers.
    pub consumer_count: u32,
}

/// An open channel on a live connection.
pub struct Channel {
    id: u16,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Channel {
    pub(crate) fn new(id: u16, inner: Arc<Inner>) -> Self {
        Self { id, inner }
    }

    /// The channel id this handle owns.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Publish a message body.
    ///
    /// Emits the method frame, a content header, and as many body frames as
    /// the negotiated frame size requires, written back to back on the
    /// single write path. No broker reply is awaited.
    pub async fn publish(
        &self,
        args: &PublishArgs,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.inner.ensure_usable()?;
        {
            let state = self.inner.lock_state()?;
            let channel_state = state.mux.state(self.id);
            if channel_state != Some(hutch_core::ChannelState::Open) {
                return Err(ProtocolError::ChannelUnavailable {
                    channel: self.id,
                    state: channel_state,
                }
                .into());
            }
        }

        let body = body.into();
        debug!(channel = self.id, bytes = body.len(), "publishing");
        let frames =
            frame_publish(self.id, args, properties, body, self.inner.tuning.frame_max);
        self.inner.send_frames(frames).await
    }

    /// Declare a queue and wait for the server's confirmation.
    pub async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo> {
        self.inner.ensure_usable()?;
        let declare = QueueDeclare {
            queue: ShortStr::new(queue).map_err(ProtocolError::from)?,
            passive: options.passive,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            no_wait: false,
            arguments: FieldTable::new(),
        };

        let (frames, rx) = {
            let mut state = self.inner.lock_state()?;
            let actions =
                state.mux.declare_queue(self.id, declare).map_err(ClientError::from)?;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(self.id, tx);
            (crate::connection::frames_of(actions), rx)
        };
        self.inner.send_frames(frames).await?;

        match self.inner.await_call(rx, "queue.declare").await? {
            ChannelEvent::Declared { queue, message_count, consumer_count, .. } => Ok(QueueInfo {
                queue: queue.to_string(),
                message_count,
                consumer_count,
            }),
            event => {
                self.inner.poison("queue.declare resolved with the wrong event");
                Err(ClientError::ConnectionClosed {
                    reason: format!("queue.declare resolved with {event:?}"),
                })
            },
        }
    }

    /// Close the channel gracefully and recycle its id.
    pub async fn close(self) -> Result<()> {
        self.inner.ensure_usable()?;
        let (frames, rx) = {
            let mut state = self.inner.lock_state()?;
            let actions = state
                .mux
                .close_channel(self.id, 200, "client closed channel", ClassMethod::new(0, 0))
                .map_err(ClientError::from)?;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(self.id, tx);
            (crate::connection::frames_of(actions), rx)
        };
        self.inner.send_frames(frames).await?;

        match self.inner.await_call(rx, "channel.close").await? {
            ChannelEvent::Closed { .. } => Ok(()),
            event => {
                self.inner.poison("channel.close resolved with the wrong event");
                Err(ClientError::ConnectionClosed {
                    reason: format!("channel.close resolved with {event:?}"),
                })
            },
        }
    }
}
