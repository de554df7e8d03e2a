//! Channel id allocation and synchronous-reply dispatch.
//!
//! Channels are logical, independently-sequenced sub-streams multiplexed
//! over one connection. The multiplexer owns the only mutable shared state
//! in the session: the channel-id table and each channel's single pending
//! expectation. Drivers must mutate it under one per-connection lock (or
//! from the one task that owns it).
//!
//! Two invariants are enforced here and nowhere else:
//!
//! - A channel has at most one outstanding synchronous method. A second
//!   synchronous call while one is pending fails fast with `ChannelBusy`
//!   rather than silently interleaving, because method frames on one
//!   channel are strictly ordered.
//! - A reply must match the pending expectation. A channel awaiting
//!   `channel.open-ok` that receives anything else has desynchronized from
//!   the server, which is fatal to the connection.
//!
//! Ids are handed out monotonically from 1 and recycled only after a full
//! close/close-ok round trip; the smallest free id is reused first.

use std::collections::{BTreeSet, HashMap};

use hutch_proto::method::{CHANNEL_CLOSE_OK, CHANNEL_OPEN_OK, Close, QUEUE_DECLARE_OK, QueueDeclare};
use hutch_proto::{ClassMethod, Method, ShortStr};
use tracing::{debug, warn};

use crate::action::Action;
use crate::error::{ProtocolError, Result};

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// channel.open sent, waiting for open-ok.
    Opening,
    /// Open and usable.
    Open,
    /// channel.close sent, waiting for close-ok.
    Closing,
}

/// The reply a channel is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    OpenOk,
    CloseOk,
    DeclareOk,
}

impl Expectation {
    fn reply_id(self) -> ClassMethod {
        match self {
            Self::OpenOk => CHANNEL_OPEN_OK,
            Self::CloseOk => CHANNEL_CLOSE_OK,
            Self::DeclareOk => QUEUE_DECLARE_OK,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::OpenOk => "awaiting channel.open-ok",
            Self::CloseOk => "awaiting channel.close-ok",
            Self::DeclareOk => "awaiting queue.declare-ok",
        }
    }
}

/// What an inbound frame resolved to, for the driver to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// channel.open-ok arrived; the channel is usable.
    Opened {
        /// The now-open channel.
        channel: u16,
    },
    /// channel.close-ok arrived; the id has been recycled.
    Closed {
        /// The closed channel.
        channel: u16,
    },
    /// queue.declare-ok arrived.
    Declared {
        /// The channel the declare ran on.
        channel: u16,
        /// Declared queue name (server-generated when requested empty).
        queue: ShortStr,
        /// Messages currently queued.
        message_count: u32,
        /// Active consumers.
        consumer_count: u32,
    },
    /// The server closed the channel; close-ok has been queued in response.
    ClosedByServer {
        /// The channel being closed.
        channel: u16,
        /// Server's reply code.
        reply_code: u16,
        /// Server's reason text.
        reply_text: String,
    },
    /// A method outside the catalog arrived with nothing pending; ignored
    /// for forward compatibility.
    Ignored,
}

struct ChannelEntry {
    state: ChannelState,
    pending: Option<Expectation>,
}

/// Allocates channel ids and routes synchronous replies.
pub struct ChannelMux {
    channel_max: u16,
    next_id: u16,
    recycled: BTreeSet<u16>,
    channels: HashMap<u16, ChannelEntry>,
}

impl ChannelMux {
    /// A multiplexer bounded by the negotiated channel maximum.
    #[must_use]
    pub fn new(channel_max: u16) -> Self {
        Self { channel_max, next_id: 1, recycled: BTreeSet::new(), channels: HashMap::new() }
    }

    /// Ids currently alive (opening, open or closing).
    #[must_use]
    pub fn live_channels(&self) -> usize {
        self.channels.len()
    }

    /// A channel's current state.
    #[must_use]
    pub fn state(&self, channel: u16) -> Option<ChannelState> {
        self.channels.get(&channel).map(|entry| entry.state)
    }

    fn allocate_id(&mut self) -> Result<u16> {
        if let Some(id) = self.recycled.pop_first() {
            return Ok(id);
        }
        if self.next_id > self.channel_max {
            return Err(ProtocolError::ChannelsExhausted { channel_max: self.channel_max });
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Allocate an id and send channel.open on it.
    ///
    /// The returned id is in `Opening` state until
    /// [`ChannelEvent::Opened`] resolves it.
    pub fn open_channel(&mut self) -> Result<(u16, Vec<Action>)> {
        let id = self.allocate_id()?;
        self.channels.insert(
            id,
            ChannelEntry { state: ChannelState::Opening, pending: Some(Expectation::OpenOk) },
        );
        debug!(channel = id, "opening channel");
        Ok((id, vec![Action::SendFrame(Method::ChannelOpen.into_frame(id))]))
    }

    fn begin(&mut self, channel: u16, expectation: Expectation) -> Result<&mut ChannelEntry> {
        let entry = self.channels.get_mut(&channel).ok_or(
            ProtocolError::ChannelUnavailable { channel, state: None },
        )?;
        if entry.state != ChannelState::Open {
            return Err(ProtocolError::ChannelUnavailable { channel, state: Some(entry.state) });
        }
        if entry.pending.is_some() {
            return Err(ProtocolError::ChannelBusy { channel });
        }
        entry.pending = Some(expectation);
        Ok(entry)
    }

    /// Send queue.declare on an open channel.
    pub fn declare_queue(&mut self, channel: u16, declare: QueueDeclare) -> Result<Vec<Action>> {
        self.begin(channel, Expectation::DeclareOk)?;
        Ok(vec![Action::SendFrame(Method::QueueDeclare(declare).into_frame(channel))])
    }

    /// Send channel.close and await close-ok.
    ///
    /// `cause` names the method that provoked the close (0/0 when the close
    /// is client-initiated).
    pub fn close_channel(
        &mut self,
        channel: u16,
        reply_code: u16,
        reply_text: &str,
        cause: ClassMethod,
    ) -> Result<Vec<Action>> {
        let entry = self.begin(channel, Expectation::CloseOk)?;
        entry.state = ChannelState::Closing;
        let close = Method::ChannelClose(Close {
            reply_code,
            reply_text: ShortStr::new(reply_text)?,
            class_id: cause.class,
            method_id: cause.method,
        });
        debug!(channel, reply_code, "closing channel");
        Ok(vec![Action::SendFrame(close.into_frame(channel))])
    }

    /// Dispatch an inbound method for channel `channel` (> 0).
    ///
    /// Resolves the pending expectation, answers a server-initiated close,
    /// or ignores unknown methods when nothing is pending.
    ///
    /// # Errors
    /// A reply that does not match the pending expectation, or an
    /// unexpected known method with nothing pending, is a fatal violation.
    pub fn handle_method(
        &mut self,
        channel: u16,
        method: Method,
    ) -> Result<(Vec<Action>, ChannelEvent)> {
        // Server-initiated close preempts whatever was pending.
        if let Method::ChannelClose(close) = &method {
            warn!(
                channel,
                reply_code = close.reply_code,
                reply_text = %close.reply_text,
                "server closed channel"
            );
            self.channels.remove(&channel);
            self.recycled.insert(channel);
            return Ok((
                vec![Action::SendFrame(Method::ChannelCloseOk.into_frame(channel))],
                ChannelEvent::ClosedByServer {
                    channel,
                    reply_code: close.reply_code,
                    reply_text: close.reply_text.to_string(),
                },
            ));
        }

        let Some(entry) = self.channels.get_mut(&channel) else {
            return match method {
                // Nothing known lives here; tolerate only methods we do not
                // recognize at all.
                Method::Unknown { .. } => Ok((Vec::new(), ChannelEvent::Ignored)),
                method => Err(ProtocolError::UnexpectedMethod {
                    expecting: "no open channel",
                    got: method.name(),
                }),
            };
        };

        match entry.pending {
            Some(expectation) if method.id() == expectation.reply_id() => {
                entry.pending = None;
                let event = match (expectation, method) {
                    (Expectation::OpenOk, _) => {
                        entry.state = ChannelState::Open;
                        debug!(channel, "channel open");
                        ChannelEvent::Opened { channel }
                    },
                    (Expectation::CloseOk, _) => {
                        self.channels.remove(&channel);
                        self.recycled.insert(channel);
                        debug!(channel, "channel closed");
                        ChannelEvent::Closed { channel }
                    },
                    (Expectation::DeclareOk, Method::QueueDeclareOk(ok)) => {
                        ChannelEvent::Declared {
                            channel,
                            queue: ok.queue,
                            message_count: ok.message_count,
                            consumer_count: ok.consumer_count,
                        }
                    },
                    // reply_id matched, so the variant matches too.
                    (Expectation::DeclareOk, _) => ChannelEvent::Ignored,
                };
                Ok((Vec::new(), event))
            },
            Some(expectation) => {
                let violation = ProtocolError::UnexpectedMethod {
                    expecting: expectation.describe(),
                    got: method.name(),
                };
                warn!(channel, %violation, "channel violation");
                Err(violation)
            },
            None => match method {
                Method::Unknown { id, .. } => {
                    debug!(channel, class = id.class, method = id.method, "ignoring unknown method");
                    Ok((Vec::new(), ChannelEvent::Ignored))
                },
                method => Err(ProtocolError::UnexpectedMethod {
                    expecting: "no outstanding synchronous method",
                    got: method.name(),
                }),
            },
        }
    }
}
