//! Connection runtime: socket ownership, negotiation, and the two tasks
//! that drive an established session.
//!
//! A connection owns exactly one TCP stream. Negotiation runs inline on the
//! calling task; once established the stream splits into:
//!
//! - a **dispatch task** owning the read half: decodes frames from the
//!   accumulation buffer, echoes heartbeats, routes channel 0 to the
//!   handshake machine and channels above it to the multiplexer, and wakes
//!   whichever caller was blocked on the resolved reply;
//! - a **writer task** owning the write half: the single write path every
//!   outbound frame funnels through. Callers never touch the socket, so two
//!   publishes can never interleave mid-frame. The writer also owns the
//!   heartbeat schedule, since every write it performs resets the timer.
//!
//! Synchronous calls register a oneshot waiter under the per-connection
//! lock, send their frames, and block on the waiter with a deadline. A
//! deadline expiry poisons the whole connection: the reply may still be in
//! flight and there is no way to resynchronize with it, so every later call
//! fails fast and the caller must reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use hutch_core::{
    Action, Assembler, ChannelEvent, ChannelMux, ClientIdentity, Handshake, Heartbeats,
    ProtocolError, Tuning,
};
use hutch_proto::method::Close;
use hutch_proto::{ContentHeader, Frame, FrameKind, Method, PROTOCOL_HEADER, ShortStr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{ClientError, Result};

/// Caller-supplied connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identification and credentials presented during negotiation.
    pub identity: ClientIdentity,
    /// Virtual host to open.
    pub vhost: String,
    /// Deadline applied to negotiation and to every synchronous call.
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            vhost: "/".to_owned(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) enum WriteCmd {
    /// Write these frames back to back.
    Frames(Vec<Frame>),
    /// Flush and shut the socket down.
    Shutdown,
}

type ReplyTx = oneshot::Sender<Result<ChannelEvent>>;

pub(crate) struct DispatchState {
    pub(crate) mux: ChannelMux,
    pub(crate) waiters: HashMap<u16, ReplyTx>,
    conn_close: Option<oneshot::Sender<Result<()>>>,
}

/// State shared between the public handles and the two tasks.
pub(crate) struct Inner {
    writer: mpsc::Sender<WriteCmd>,
    pub(crate) tuning: Tuning,
    call_timeout: Duration,
    poisoned: AtomicBool,
    state: Mutex<DispatchState>,
}

impl Inner {
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionPoisoned);
        }
        Ok(())
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, DispatchState>> {
        self.state.lock().map_err(|_| ClientError::ConnectionPoisoned)
    }

    pub(crate) async fn send_frames(&self, frames: Vec<Frame>) -> Result<()> {
        self.writer.send(WriteCmd::Frames(frames)).await.map_err(|_| {
            ClientError::ConnectionClosed { reason: "writer task ended".to_owned() }
        })
    }

    /// Block on a registered waiter with the connection's call deadline.
    pub(crate) async fn await_call(
        &self,
        rx: oneshot::Receiver<Result<ChannelEvent>>,
        operation: &'static str,
    ) -> Result<ChannelEvent> {
        match tokio::time::timeout(self.call_timeout, rx).await {
            Err(_elapsed) => {
                // The reply may still arrive later; nothing downstream can
                // tell it apart from the next call's reply. Poison.
                self.poison("synchronous call timed out");
                Err(ClientError::Timeout { operation, timeout: self.call_timeout })
            },
            Ok(Err(_recv)) => Err(ClientError::ConnectionClosed {
                reason: "connection tasks ended".to_owned(),
            }),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Mark the connection unusable and fail every blocked caller.
    pub(crate) fn poison(&self, reason: &str) {
        if self.poisoned.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "connection poisoned");
        if let Ok(mut state) = self.state.lock() {
            for (_, waiter) in state.waiters.drain() {
                let _ = waiter
                    .send(Err(ClientError::ConnectionClosed { reason: reason.to_owned() }));
            }
            if let Some(tx) = state.conn_close.take() {
                let _ =
                    tx.send(Err(ClientError::ConnectionClosed { reason: reason.to_owned() }));
            }
        }
        let _ = self.writer.try_send(WriteCmd::Shutdown);
    }
}

pub(crate) fn frames_of(actions: Vec<Action>) -> Vec<Frame> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            Action::SendFrame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

/// A negotiated session over one TCP stream.
///
/// Explicitly constructed and owned; drop it (or call
/// [`Connection::close`]) to end the session. Cloning the handle is cheap
/// and shares the underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect, negotiate, and return a usable session.
    ///
    /// Runs the full opening sequence — protocol header, start/start-ok,
    /// tune/tune-ok, open/open-ok — under the configured call deadline.
    pub async fn open(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;

        let mut handshake =
            Handshake::new(config.identity.clone(), &config.vhost).map_err(ClientError::from)?;
        for action in handshake.start().map_err(ClientError::from)? {
            if action == Action::SendProtocolHeader {
                stream.write_all(&PROTOCOL_HEADER).await?;
            }
        }

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let tuning =
            tokio::time::timeout(config.call_timeout, negotiate(&mut stream, &mut handshake, &mut buf))
                .await
                .map_err(|_| ClientError::Timeout {
                    operation: "connection negotiation",
                    timeout: config.call_timeout,
                })??;
        info!(
            vhost = %config.vhost,
            channel_max = tuning.channel_max,
            frame_max = tuning.frame_max,
            heartbeat = tuning.heartbeat,
            "connection established"
        );

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let heartbeats = Heartbeats::new(tuning.heartbeat, Instant::now());

        let inner = Arc::new(Inner {
            writer: writer_tx,
            tuning,
            call_timeout: config.call_timeout,
            poisoned: AtomicBool::new(false),
            state: Mutex::new(DispatchState {
                mux: ChannelMux::new(tuning.channel_max),
                waiters: HashMap::new(),
                conn_close: None,
            }),
        });

        tokio::spawn(run_writer(write_half, writer_rx, heartbeats));
        // The buffer may already hold frames read past open-ok; the
        // dispatch task inherits them.
        tokio::spawn(run_dispatch(read_half, buf, handshake, Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// The tuning parameters adopted during negotiation.
    #[must_use]
    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }

    /// Open a channel and wait for the server to confirm it.
    pub async fn open_channel(&self) -> Result<Channel> {
        self.inner.ensure_usable()?;
        let (id, frames, rx) = {
            let mut state = self.inner.lock_state()?;
            let (id, actions) = state.mux.open_channel().map_err(ClientError::from)?;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);
            (id, frames_of(actions), rx)
        };
        self.inner.send_frames(frames).await?;

        match self.inner.await_call(rx, "channel.open").await? {
            ChannelEvent::Opened { .. } => Ok(Channel::new(id, Arc::clone(&self.inner))),
            event => {
                self.inner.poison("channel.open resolved with the wrong event");
                Err(ClientError::ConnectionClosed {
                    reason: format!("channel.open resolved with {event:?}"),
                })
            },
        }
    }

    /// Close the connection gracefully: connection.close, await close-ok,
    /// drop the transport.
    pub async fn close(&self) -> Result<()> {
        self.inner.ensure_usable()?;
        let rx = {
            let mut state = self.inner.lock_state()?;
            if state.conn_close.is_some() {
                // Channel 0 obeys the same one-outstanding rule as any
                // other channel.
                return Err(ProtocolError::ChannelBusy { channel: 0 }.into());
            }
            let (tx, rx) = oneshot::channel();
            state.conn_close = Some(tx);
            rx
        };

        let close = Method::ConnectionClose(Close {
            reply_code: 200,
            reply_text: ShortStr::new("goodbye").map_err(ProtocolError::from)?,
            class_id: 0,
            method_id: 0,
        });
        self.inner.send_frames(vec![close.into_frame(0)]).await?;

        match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Err(_elapsed) => {
                self.inner.poison("connection.close timed out");
                Err(ClientError::Timeout {
                    operation: "connection.close",
                    timeout: self.inner.call_timeout,
                })
            },
            Ok(Err(_recv)) => Err(ClientError::ConnectionClosed {
                reason: "connection tasks ended".to_owned(),
            }),
            Ok(Ok(result)) => result,
        }
    }
}

/// Drive the opening sequence until the handshake reports completion.
async fn negotiate(
    stream: &mut TcpStream,
    handshake: &mut Handshake,
    buf: &mut BytesMut,
) -> Result<Tuning> {
    loop {
        while let Some(frame) = Frame::decode(buf).map_err(ProtocolError::from)? {
            match frame.kind {
                FrameKind::Heartbeat => {
                    stream.write_all(&Frame::heartbeat().to_bytes()).await?;
                },
                FrameKind::Method if frame.channel == 0 => {
                    let method = Method::from_frame(&frame).map_err(ProtocolError::from)?;
                    debug!(method = method.name(), "negotiation frame");
                    for action in handshake.handle_method(method).map_err(ClientError::from)? {
                        match action {
                            Action::SendFrame(reply) => {
                                stream.write_all(&reply.to_bytes()).await?;
                            },
                            Action::HandshakeDone(tuning) => return Ok(tuning),
                            Action::CloseTransport { reason } => {
                                return Err(ClientError::ConnectionClosed { reason });
                            },
                            Action::SendProtocolHeader => {},
                        }
                    }
                },
                _ => {
                    return Err(ProtocolError::UnexpectedMethod {
                        expecting: "a channel-0 method during negotiation",
                        got: "a content or channel frame",
                    }
                    .into());
                },
            }
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ClientError::ConnectionClosed {
                reason: "server closed during negotiation".to_owned(),
            });
        }
    }
}

/// The single write path. Owns the write half and the heartbeat schedule.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteCmd>,
    mut heartbeats: Heartbeats,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCmd::Frames(frames)) => {
                        buf.clear();
                        for frame in &frames {
                            frame.encode(&mut buf);
                        }
                        if let Err(err) = write_half.write_all(&buf).await {
                            warn!(%err, "write failed");
                            break;
                        }
                        heartbeats.record_outbound(Instant::now());
                    },
                    Some(WriteCmd::Shutdown) | None => break,
                }
            },
            () = idle_until(heartbeats.next_deadline()) => {
                if let Some(frame) = heartbeats.tick(Instant::now()) {
                    debug!("sending heartbeat");
                    buf.clear();
                    frame.encode(&mut buf);
                    if let Err(err) = write_half.write_all(&buf).await {
                        warn!(%err, "heartbeat write failed");
                        break;
                    }
                }
            },
        }
    }
    let _ = write_half.shutdown().await;
}

async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending::<()>().await,
    }
}

/// The single inbound path. Owns the read half; every inbound frame is
/// decoded and routed here, in wire order.
async fn run_dispatch(
    mut read_half: OwnedReadHalf,
    mut buf: BytesMut,
    mut handshake: Handshake,
    inner: Arc<Inner>,
) {
    let mut assemblers: HashMap<u16, Assembler> = HashMap::new();
    let reason = loop {
        match drain(&mut buf, &mut handshake, &mut assemblers, &inner).await {
            Ok(None) => {},
            Ok(Some(reason)) => break reason,
            Err(err) => break err.to_string(),
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break "server closed the connection".to_owned(),
            Ok(_) => {},
            Err(err) => break format!("read failed: {err}"),
        }
    };
    debug!(%reason, "dispatch ending");
    inner.poison(&reason);
}

/// Process every complete frame in the buffer. Returns an orderly-shutdown
/// reason when the connection is done.
async fn drain(
    buf: &mut BytesMut,
    handshake: &mut Handshake,
    assemblers: &mut HashMap<u16, Assembler>,
    inner: &Arc<Inner>,
) -> Result<Option<String>> {
    while let Some(frame) = Frame::decode(buf).map_err(ProtocolError::from)? {
        match frame.kind {
            FrameKind::Heartbeat => {
                // Liveness probe: echo immediately.
                inner.send_frames(vec![Frame::heartbeat()]).await?;
            },
            FrameKind::Method if frame.channel == 0 => {
                let method = Method::from_frame(&frame).map_err(ProtocolError::from)?;
                let actions = handshake.handle_method(method).map_err(ClientError::from)?;
                for action in actions {
                    match action {
                        Action::SendFrame(reply) => inner.send_frames(vec![reply]).await?,
                        Action::CloseTransport { reason } => {
                            if let Ok(mut state) = inner.state.lock() {
                                if let Some(tx) = state.conn_close.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                            return Ok(Some(reason));
                        },
                        Action::SendProtocolHeader | Action::HandshakeDone(_) => {},
                    }
                }
            },
            FrameKind::Method => {
                let method = Method::from_frame(&frame).map_err(ProtocolError::from)?;
                let (frames, event, waiter) = {
                    let mut state = inner.lock_state()?;
                    let (actions, event) = state
                        .mux
                        .handle_method(frame.channel, method)
                        .map_err(ClientError::from)?;
                    let waiter =
                        event_channel(&event).and_then(|ch| state.waiters.remove(&ch));
                    (frames_of(actions), event, waiter)
                };
                if !frames.is_empty() {
                    inner.send_frames(frames).await?;
                }
                resolve(frame.channel, event, waiter);
            },
            FrameKind::Header => {
                let header =
                    ContentHeader::from_frame(&frame).map_err(ProtocolError::from)?;
                debug!(
                    channel = frame.channel,
                    size = header.body_size,
                    "inbound content with no consumer; will be discarded"
                );
                let assembler = Assembler::new(header);
                if !assembler.is_complete() {
                    assemblers.insert(frame.channel, assembler);
                }
            },
            FrameKind::Body => match assemblers.get_mut(&frame.channel) {
                Some(assembler) => match assembler.push(frame.payload.clone()) {
                    Ok(Some(_delivery)) => {
                        assemblers.remove(&frame.channel);
                    },
                    Ok(None) => {},
                    Err(err) => {
                        // Fatal to the delivery only; the connection goes on.
                        warn!(channel = frame.channel, %err, "discarding broken delivery");
                        assemblers.remove(&frame.channel);
                    },
                },
                None => {
                    warn!(channel = frame.channel, "body frame without a content header");
                },
            },
        }
    }
    Ok(None)
}

fn event_channel(event: &ChannelEvent) -> Option<u16> {
    match event {
        ChannelEvent::Opened { channel }
        | ChannelEvent::Closed { channel }
        | ChannelEvent::Declared { channel, .. }
        | ChannelEvent::ClosedByServer { channel, .. } => Some(*channel),
        ChannelEvent::Ignored => None,
    }
}

fn resolve(channel: u16, event: ChannelEvent, waiter: Option<ReplyTx>) {
    let outcome = match event {
        ChannelEvent::ClosedByServer { channel, reply_code, reply_text } => {
            Err(ClientError::ChannelClosed { channel, reply_code, reply_text })
        },
        event => Ok(event),
    };
    match waiter {
        Some(tx) => {
            let _ = tx.send(outcome);
        },
        None => {
            if let Err(err) = outcome {
                // Nobody was waiting; the handle finds out on its next use.
                warn!(channel, %err, "unsolicited channel close");
            }
        },
    }
}
