//! Splitting outbound message bodies into frames and reassembling inbound
//! ones.
//!
//! A published message is always three things on the wire, in order and
//! without interleaving on its channel: a basic.publish method frame, one
//! content-header frame declaring the total body size, and zero or more
//! body frames none of which may exceed the negotiated frame size. The
//! receiving side must verify that the body frames add up to exactly the
//! declared size; a mismatch kills the delivery.
//!
//! Publishing is fire-and-forget at the protocol level — no broker reply is
//! awaited — so nothing here suspends or registers expectations.

use bytes::Bytes;
use hutch_proto::method::BasicPublish;
use hutch_proto::{
    BasicProperties, ContentHeader, FRAME_OVERHEAD, Frame, FrameKind, Method, ShortStr,
};

use crate::error::{ProtocolError, Result};

/// Addressing and delivery flags for one publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishArgs {
    /// Target exchange; empty routes through the default exchange.
    pub exchange: ShortStr,
    /// Routing key the exchange matches on.
    pub routing_key: ShortStr,
    /// Require the message to be routable to at least one queue.
    pub mandatory: bool,
    /// Require an immediately available consumer.
    pub immediate: bool,
}

impl PublishArgs {
    /// Publish to the default exchange with the given routing key.
    pub fn to_queue(routing_key: &str) -> Result<Self> {
        Ok(Self {
            exchange: ShortStr::default(),
            routing_key: ShortStr::new(routing_key)?,
            mandatory: false,
            immediate: false,
        })
    }
}

/// Produce the full outbound frame sequence for one message.
///
/// Body frames are bounded so that no whole frame exceeds `frame_max`
/// bytes: each carries at most `frame_max` minus the envelope/trailer
/// overhead of payload. An empty body produces no body frames at all.
#[must_use]
pub fn frame_publish(
    channel: u16,
    args: &PublishArgs,
    properties: BasicProperties,
    body: Bytes,
    frame_max: u32,
) -> Vec<Frame> {
    let publish = Method::BasicPublish(BasicPublish {
        exchange: args.exchange.clone(),
        routing_key: args.routing_key.clone(),
        mandatory: args.mandatory,
        immediate: args.immediate,
    });
    let header = ContentHeader::basic(body.len() as u64, properties);

    let max_payload = (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);
    let mut frames = Vec::with_capacity(2 + body.len().div_ceil(max_payload));
    frames.push(publish.into_frame(channel));
    frames.push(header.into_frame(channel));

    let mut rest = body;
    while !rest.is_empty() {
        let chunk = rest.split_to(rest.len().min(max_payload));
        frames.push(Frame::new(FrameKind::Body, channel, chunk));
    }
    frames
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Properties from the content header.
    pub properties: BasicProperties,
    /// The complete body.
    pub body: Bytes,
}

/// Reassembles a content header plus body frames into one delivery.
///
/// Create one per in-flight delivery from the header frame, then feed body
/// payloads until a delivery pops out. Over- or under-shooting the declared
/// size is a `ContentSizeMismatch`.
#[derive(Debug)]
pub struct Assembler {
    declared: u64,
    properties: BasicProperties,
    chunks: Vec<Bytes>,
    received: u64,
}

impl Assembler {
    /// Start reassembly from a decoded content header.
    #[must_use]
    pub fn new(header: ContentHeader) -> Self {
        Self {
            declared: header.body_size,
            properties: header.properties,
            chunks: Vec::new(),
            received: 0,
        }
    }

    /// Bytes still missing.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.declared - self.received
    }

    /// True once every declared byte has arrived (immediately so for an
    /// empty body).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.declared
    }

    /// Feed one body frame's payload.
    ///
    /// Returns the finished delivery when the declared size is reached.
    ///
    /// # Errors
    /// Accumulating past the declared size fails with
    /// `ContentSizeMismatch`; the delivery is unusable but the connection
    /// may continue.
    pub fn push(&mut self, payload: Bytes) -> Result<Option<Delivery>> {
        self.received += payload.len() as u64;
        if self.received > self.declared {
            return Err(ProtocolError::ContentSizeMismatch {
                declared: self.declared,
                received: self.received,
            });
        }
        self.chunks.push(payload);

        if !self.is_complete() {
            return Ok(None);
        }
        let mut body = Vec::with_capacity(self.declared as usize);
        for chunk in self.chunks.drain(..) {
            body.extend_from_slice(&chunk);
        }
        Ok(Some(Delivery { properties: std::mem::take(&mut self.properties), body: body.into() }))
    }

    /// Finish an assembly the peer abandoned; errors unless complete.
    pub fn expect_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(ProtocolError::ContentSizeMismatch {
                declared: self.declared,
                received: self.received,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use hutch_proto::method::BASIC_PUBLISH;

    use super::*;

    fn args() -> PublishArgs {
        PublishArgs {
            exchange: ShortStr::new("logs").unwrap(),
            routing_key: ShortStr::new("info").unwrap(),
            mandatory: false,
            immediate: false,
        }
    }

    #[test]
    fn ten_thousand_bytes_at_4096_make_three_body_frames() {
        let body = Bytes::from(vec![0x42u8; 10_000]);
        let frames = frame_publish(1, &args(), BasicProperties::default(), body, 4096);

        // method + header + ceil(10000 / (4096 - 8)) = 3 body frames
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].kind, FrameKind::Method);
        assert_eq!(Method::from_frame(&frames[0]).unwrap().id(), BASIC_PUBLISH);
        assert_eq!(frames[1].kind, FrameKind::Header);
        assert_eq!(ContentHeader::from_frame(&frames[1]).unwrap().body_size, 10_000);

        let body_frames = &frames[2..];
        assert_eq!(body_frames.len(), 3);
        assert!(body_frames.iter().all(|f| f.kind == FrameKind::Body));
        // No whole frame exceeds the negotiated maximum.
        assert!(body_frames.iter().all(|f| FRAME_OVERHEAD + f.size() <= 4096));
        let total: usize = body_frames.iter().map(Frame::size).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn every_frame_lands_on_the_publishing_channel() {
        let frames =
            frame_publish(7, &args(), BasicProperties::default(), Bytes::from_static(b"hi"), 4096);
        assert!(frames.iter().all(|f| f.channel == 7));
    }

    #[test]
    fn empty_body_sends_no_body_frames() {
        let frames = frame_publish(1, &args(), BasicProperties::default(), Bytes::new(), 4096);
        assert_eq!(frames.len(), 2);
        assert_eq!(ContentHeader::from_frame(&frames[1]).unwrap().body_size, 0);
    }

    #[test]
    fn assembler_round_trips_a_framed_body() {
        let body = Bytes::from(vec![7u8; 9_000]);
        let frames = frame_publish(1, &args(), BasicProperties::default(), body.clone(), 4096);

        let header = ContentHeader::from_frame(&frames[1]).unwrap();
        let mut assembler = Assembler::new(header);

        let mut delivery = None;
        for frame in &frames[2..] {
            assert!(delivery.is_none(), "completed before the final frame");
            delivery = assembler.push(frame.payload.clone()).unwrap();
        }
        let delivery = delivery.expect("assembly completes on the final frame");
        assert_eq!(delivery.body, body);
    }

    #[test]
    fn overshooting_the_declared_size_is_a_mismatch() {
        let mut assembler = Assembler::new(ContentHeader::basic(4, BasicProperties::default()));
        assembler.push(Bytes::from_static(&[0; 3])).unwrap();
        assert_eq!(
            assembler.push(Bytes::from_static(&[0; 3])).unwrap_err(),
            ProtocolError::ContentSizeMismatch { declared: 4, received: 6 }
        );
    }

    #[test]
    fn undershooting_is_caught_at_finish() {
        let mut assembler = Assembler::new(ContentHeader::basic(10, BasicProperties::default()));
        assembler.push(Bytes::from_static(&[0; 4])).unwrap();
        assert!(!assembler.is_complete());
        assert_eq!(assembler.remaining(), 6);
        assert_eq!(
            assembler.expect_complete().unwrap_err(),
            ProtocolError::ContentSizeMismatch { declared: 10, received: 4 }
        );
    }

    #[test]
    fn zero_length_body_completes_immediately() {
        let assembler = Assembler::new(ContentHeader::basic(0, BasicProperties::default()));
        assert!(assembler.is_complete());
        assert!(assembler.expect_complete().is_ok());
    }

    proptest::proptest! {
        #[test]
        fn split_bodies_always_reassemble(
            len in 0usize..60_000,
            frame_max in 4096u32..65_536,
        ) {
            let body = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>());
            let frames = frame_publish(1, &args(), BasicProperties::default(), body.clone(), frame_max);

            // Every frame respects the negotiated bound.
            for frame in &frames[2..] {
                proptest::prop_assert!(FRAME_OVERHEAD + frame.size() <= frame_max as usize);
            }

            let header = ContentHeader::from_frame(&frames[1]).unwrap();
            let mut assembler = Assembler::new(header);
            let mut delivery = None;
            for frame in &frames[2..] {
                delivery = assembler.push(frame.payload.clone()).unwrap();
            }
            if body.is_empty() {
                proptest::prop_assert!(assembler.is_complete());
            } else {
                let delivery = delivery.expect("assembly completes");
                proptest::prop_assert_eq!(delivery.body, body);
            }
        }
    }
}
