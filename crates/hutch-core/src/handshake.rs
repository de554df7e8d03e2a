//! Connection negotiation state machine.
//!
//! The opening exchange is fixed by the protocol definition and runs
//! entirely on channel 0:
//!
//! ```text
//! client                                server
//!   │── protocol header ──────────────────>│
//!   │<───────────────────── connection.start│
//!   │── connection.start-ok ──────────────>│
//!   │<────────────────────── connection.tune│
//!   │── connection.tune-ok ───────────────>│
//!   │── connection.open ──────────────────>│
//!   │<─────────────────── connection.open-ok│
//! ```
//!
//! Because the order is fixed, any deviation from the expected next method
//! is fatal — the machine never retries and never resynchronizes. The one
//! exception is `connection.close`, which the server may send at any point
//! and which is answered with `close-ok` before the transport drops.
//!
//! The client adopts the server's proposed tuning values verbatim: accepting
//! the server's limits is always legal, and negotiating downward buys
//! nothing for a client this size.

use hutch_proto::method::{Close, ConnectionOpen, ConnectionStartOk, ConnectionTune};
use hutch_proto::{FieldTable, FieldValue, Method, ShortStr};
use tracing::{debug, warn};

use crate::action::Action;
use crate::error::{ProtocolError, Result};

/// Smallest frame size a peer is allowed to impose.
pub const MIN_FRAME_MAX: u32 = 4096;

/// Connection negotiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Idle,
    /// Protocol header written; the next inbound method must be start.
    AwaitingStart,
    /// start-ok sent; waiting for tune.
    AwaitingTune,
    /// tune-ok and open sent; waiting for open-ok.
    AwaitingOpenOk,
    /// Negotiation complete; the connection is usable.
    Established,
    /// Connection terminated (gracefully or by violation).
    Closed,
}

/// Who the client claims to be and how it authenticates.
///
/// All of this is caller-supplied configuration; nothing is baked into the
/// exchange itself. The default identifies the crate and carries the
/// conventional guest credentials for a local broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Product name reported in the client-properties table.
    pub product: String,
    /// Product version reported in the client-properties table.
    pub version: String,
    /// Security mechanism to answer with.
    pub mechanism: String,
    /// User name for the credential response.
    pub username: String,
    /// Password for the credential response.
    pub password: String,
    /// Message locale.
    pub locale: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            product: "hutch".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            mechanism: "PLAIN".to_owned(),
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            locale: "en_US".to_owned(),
        }
    }
}

impl ClientIdentity {
    /// The SASL PLAIN response: NUL, user name, NUL, password.
    #[must_use]
    pub fn sasl_response(&self) -> Vec<u8> {
        let mut response = Vec::with_capacity(2 + self.username.len() + self.password.len());
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        response
    }

    fn client_properties(&self) -> Result<FieldTable> {
        let mut properties = FieldTable::new();
        properties.insert(
            ShortStr::new("product")?,
            FieldValue::LongStr(self.product.clone().into_bytes().into()),
        );
        properties.insert(
            ShortStr::new("version")?,
            FieldValue::LongStr(self.version.clone().into_bytes().into()),
        );
        Ok(properties)
    }
}

/// Negotiated connection parameters, adopted from the server's proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Highest usable channel id.
    pub channel_max: u16,
    /// Largest whole frame either side may send.
    pub frame_max: u32,
    /// Heartbeat interval in seconds; 0 disables heartbeats.
    pub heartbeat: u16,
}

impl Tuning {
    /// Adopt a server proposal, resolving the "0 = no limit" encodings into
    /// workable bounds.
    #[must_use]
    pub fn adopt(proposed: ConnectionTune) -> Self {
        Self {
            channel_max: if proposed.channel_max == 0 { u16::MAX } else { proposed.channel_max },
            frame_max: if proposed.frame_max == 0 { MIN_FRAME_MAX } else { proposed.frame_max },
            heartbeat: proposed.heartbeat,
        }
    }
}

/// The connection negotiation state machine.
///
/// Drive it with [`Handshake::start`] once, then feed every channel-0 method
/// through [`Handshake::handle_method`] until an action reports
/// [`Action::HandshakeDone`].
#[derive(Debug, Clone)]
pub struct Handshake {
    state: HandshakeState,
    identity: ClientIdentity,
    vhost: ShortStr,
    tuning: Option<Tuning>,
}

impl Handshake {
    /// Create a machine that will open `vhost` as `identity`.
    pub fn new(identity: ClientIdentity, vhost: &str) -> Result<Self> {
        Ok(Self { state: HandshakeState::Idle, identity, vhost: ShortStr::new(vhost)?, tuning: None })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The adopted tuning values, once tune has been received.
    #[must_use]
    pub fn tuning(&self) -> Option<Tuning> {
        self.tuning
    }

    /// Begin negotiation by sending the protocol greeting.
    ///
    /// # Errors
    /// Returns `InvalidState` unless the machine is still idle.
    pub fn start(&mut self) -> Result<Vec<Action>> {
        if self.state != HandshakeState::Idle {
            return Err(ProtocolError::InvalidState { state: self.state, operation: "start" });
        }
        self.state = HandshakeState::AwaitingStart;
        Ok(vec![Action::SendProtocolHeader])
    }

    /// What the machine is waiting for, for violation reports.
    fn expecting(&self) -> &'static str {
        match self.state {
            HandshakeState::Idle => "idle",
            HandshakeState::AwaitingStart => "awaiting connection.start",
            HandshakeState::AwaitingTune => "awaiting connection.tune",
            HandshakeState::AwaitingOpenOk => "awaiting connection.open-ok",
            HandshakeState::Established => "established",
            HandshakeState::Closed => "closed",
        }
    }

    /// Advance on an inbound channel-0 method.
    ///
    /// # Errors
    /// Any method other than the one the current state expects (or a server
    /// `connection.close`) is a fatal violation; the machine moves to
    /// `Closed` and the caller must drop the transport.
    pub fn handle_method(&mut self, method: Method) -> Result<Vec<Action>> {
        // A server may close at any point in the sequence.
        if let Method::ConnectionClose(close) = &method {
            return Ok(self.server_close(close.clone()));
        }

        match (self.state, method) {
            (HandshakeState::AwaitingStart, Method::ConnectionStart(start)) => {
                debug!(
                    version_major = start.version_major,
                    version_minor = start.version_minor,
                    "received connection.start"
                );
                let start_ok = Method::ConnectionStartOk(ConnectionStartOk {
                    client_properties: self.identity.client_properties()?,
                    mechanism: ShortStr::new(self.identity.mechanism.clone())?,
                    response: self.identity.sasl_response().into(),
                    locale: ShortStr::new(self.identity.locale.clone())?,
                });
                self.state = HandshakeState::AwaitingTune;
                Ok(vec![Action::SendFrame(start_ok.into_frame(0))])
            },
            (HandshakeState::AwaitingTune, Method::ConnectionTune(proposed)) => {
                let tuning = Tuning::adopt(proposed);
                debug!(
                    channel_max = tuning.channel_max,
                    frame_max = tuning.frame_max,
                    heartbeat = tuning.heartbeat,
                    "adopting server tuning"
                );
                self.tuning = Some(tuning);
                self.state = HandshakeState::AwaitingOpenOk;

                // The reply carries the server's numbers unchanged; the
                // resolved bounds above are a local concern.
                let tune_ok = Method::ConnectionTuneOk(proposed);
                let open = Method::ConnectionOpen(ConnectionOpen { vhost: self.vhost.clone() });
                Ok(vec![
                    Action::SendFrame(tune_ok.into_frame(0)),
                    Action::SendFrame(open.into_frame(0)),
                ])
            },
            (HandshakeState::Established, Method::Unknown { id, .. }) => {
                // Connection-level methods we do not act on; tolerated.
                debug!(class = id.class, method = id.method, "ignoring unknown method");
                Ok(vec![])
            },
            (HandshakeState::Established, Method::ConnectionCloseOk) => {
                // Reply to a close this side initiated; the driver sent the
                // close frame itself.
                self.state = HandshakeState::Closed;
                Ok(vec![Action::CloseTransport { reason: "closed by this side".to_owned() }])
            },
            (HandshakeState::AwaitingOpenOk, Method::ConnectionOpenOk) => {
                self.state = HandshakeState::Established;
                let tuning = self.tuning.ok_or(ProtocolError::InvalidState {
                    state: self.state,
                    operation: "complete without tuning",
                })?;
                debug!(vhost = %self.vhost, "connection established");
                Ok(vec![Action::HandshakeDone(tuning)])
            },
            (_, method) => {
                let violation = ProtocolError::UnexpectedMethod {
                    expecting: self.expecting(),
                    got: method.name(),
                };
                warn!(%violation, "handshake violation");
                self.state = HandshakeState::Closed;
                Err(violation)
            },
        }
    }

    fn server_close(&mut self, close: Close) -> Vec<Action> {
        warn!(
            reply_code = close.reply_code,
            reply_text = %close.reply_text,
            "server closed the connection"
        );
        self.state = HandshakeState::Closed;
        vec![
            Action::SendFrame(Method::ConnectionCloseOk.into_frame(0)),
            Action::CloseTransport {
                reason: format!("server close {}: {}", close.reply_code, close.reply_text),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use hutch_proto::Frame;
    use hutch_proto::method::{
        CONNECTION_OPEN, CONNECTION_START_OK, CONNECTION_TUNE_OK, ConnectionStart,
    };

    use super::*;

    fn start_method() -> Method {
        Method::ConnectionStart(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        })
    }

    fn sent_frame(action: &Action) -> &Frame {
        match action {
            Action::SendFrame(frame) => frame,
            other => panic!("expected SendFrame, got {other:?}"),
        }
    }

    #[test]
    fn start_is_answered_with_start_ok_before_anything_else() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
        assert_eq!(hs.start().unwrap(), vec![Action::SendProtocolHeader]);
        assert_eq!(hs.state(), HandshakeState::AwaitingStart);

        let actions = hs.handle_method(start_method()).unwrap();
        assert_eq!(actions.len(), 1, "start-ok must be the only response");

        let frame = sent_frame(&actions[0]);
        assert_eq!(frame.channel, 0);
        let reply = Method::from_frame(frame).unwrap();
        assert_eq!(reply.id(), CONNECTION_START_OK);
        match reply {
            Method::ConnectionStartOk(args) => {
                assert_eq!(args.mechanism.as_str(), "PLAIN");
                assert_eq!(&args.response[..], b"\0guest\0guest");
                assert_eq!(args.locale.as_str(), "en_US");
                assert!(args.client_properties.get("product").is_some());
            },
            other => panic!("expected start-ok, got {other:?}"),
        }
        assert_eq!(hs.state(), HandshakeState::AwaitingTune);
    }

    #[test]
    fn tune_is_adopted_and_followed_by_open() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/staging").unwrap();
        hs.start().unwrap();
        hs.handle_method(start_method()).unwrap();

        let proposed = ConnectionTune { channel_max: 2047, frame_max: 131_072, heartbeat: 60 };
        let actions = hs.handle_method(Method::ConnectionTune(proposed)).unwrap();
        assert_eq!(actions.len(), 2);

        let tune_ok = Method::from_frame(sent_frame(&actions[0])).unwrap();
        assert_eq!(tune_ok.id(), CONNECTION_TUNE_OK);
        match tune_ok {
            Method::ConnectionTuneOk(echoed) => assert_eq!(echoed, proposed),
            other => panic!("expected tune-ok, got {other:?}"),
        }

        let open = Method::from_frame(sent_frame(&actions[1])).unwrap();
        assert_eq!(open.id(), CONNECTION_OPEN);
        match open {
            Method::ConnectionOpen(args) => assert_eq!(args.vhost.as_str(), "/staging"),
            other => panic!("expected open, got {other:?}"),
        }

        assert_eq!(hs.state(), HandshakeState::AwaitingOpenOk);
        assert_eq!(
            hs.tuning(),
            Some(Tuning { channel_max: 2047, frame_max: 131_072, heartbeat: 60 })
        );
    }

    #[test]
    fn zero_tuning_values_resolve_to_workable_bounds() {
        let tuning =
            Tuning::adopt(ConnectionTune { channel_max: 0, frame_max: 0, heartbeat: 0 });
        assert_eq!(tuning.channel_max, u16::MAX);
        assert_eq!(tuning.frame_max, MIN_FRAME_MAX);
        assert_eq!(tuning.heartbeat, 0);
    }

    #[test]
    fn open_ok_establishes() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
        hs.start().unwrap();
        hs.handle_method(start_method()).unwrap();
        hs.handle_method(Method::ConnectionTune(ConnectionTune {
            channel_max: 0,
            frame_max: 4096,
            heartbeat: 0,
        }))
        .unwrap();

        let actions = hs.handle_method(Method::ConnectionOpenOk).unwrap();
        assert_eq!(hs.state(), HandshakeState::Established);
        assert!(matches!(actions.as_slice(), [Action::HandshakeDone(_)]));
    }

    #[test]
    fn close_ok_ends_an_established_connection() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
        hs.start().unwrap();
        hs.handle_method(start_method()).unwrap();
        hs.handle_method(Method::ConnectionTune(ConnectionTune {
            channel_max: 0,
            frame_max: 0,
            heartbeat: 0,
        }))
        .unwrap();
        hs.handle_method(Method::ConnectionOpenOk).unwrap();

        let actions = hs.handle_method(Method::ConnectionCloseOk).unwrap();
        assert!(matches!(actions.as_slice(), [Action::CloseTransport { .. }]));
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn out_of_sequence_method_is_a_fatal_violation() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
        hs.start().unwrap();

        // open-ok before start: the fixed sequence is broken.
        let err = hs.handle_method(Method::ConnectionOpenOk).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedMethod {
                expecting: "awaiting connection.start",
                got: "connection.open-ok",
            }
        );
        assert!(err.is_fatal());
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn server_close_is_honored_in_any_state() {
        for advance in 0..3usize {
            let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
            hs.start().unwrap();
            if advance >= 1 {
                hs.handle_method(start_method()).unwrap();
            }
            if advance >= 2 {
                hs.handle_method(Method::ConnectionTune(ConnectionTune {
                    channel_max: 0,
                    frame_max: 0,
                    heartbeat: 0,
                }))
                .unwrap();
            }

            let actions = hs
                .handle_method(Method::ConnectionClose(Close {
                    reply_code: 320,
                    reply_text: ShortStr::new("shutting down").unwrap(),
                    class_id: 0,
                    method_id: 0,
                }))
                .unwrap();

            let close_ok = Method::from_frame(sent_frame(&actions[0])).unwrap();
            assert_eq!(close_ok, Method::ConnectionCloseOk);
            assert!(matches!(actions[1], Action::CloseTransport { .. }));
            assert_eq!(hs.state(), HandshakeState::Closed);
        }
    }

    #[test]
    fn start_twice_is_an_invalid_state() {
        let mut hs = Handshake::new(ClientIdentity::default(), "/").unwrap();
        hs.start().unwrap();
        assert!(matches!(hs.start(), Err(ProtocolError::InvalidState { .. })));
    }

    #[test]
    fn oversized_vhost_is_a_precondition_failure() {
        let vhost = "v".repeat(300);
        assert!(matches!(
            Handshake::new(ClientIdentity::default(), &vhost),
            Err(ProtocolError::Wire(_))
        ));
    }
}
