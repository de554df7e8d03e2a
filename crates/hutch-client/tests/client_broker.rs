//! End-to-end tests against a scripted broker.
//!
//! Each test binds a loopback listener and plays the server side of the
//! exchange by hand, asserting the exact frame sequence the client puts on
//! the wire: negotiation ordering, channel lifecycle, content framing
//! bounds, heartbeat echo, and deadline behavior.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hutch_client::{ClientConfig, ClientError, Connection, PublishArgs, QueueOptions, Tuning};
use hutch_proto::method::{ConnectionStart, ConnectionTune, QueueDeclareOk};
use hutch_proto::{
    BasicProperties, ContentHeader, FRAME_OVERHEAD, FieldTable, Frame, FrameKind, Method,
    PROTOCOL_HEADER, ShortStr,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> ConnectionTune {
    ConnectionTune { channel_max, frame_max, heartbeat }
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
    loop {
        if let Some(frame) = Frame::decode(buf).expect("well-formed frame from client") {
            return frame;
        }
        let n = stream.read_buf(buf).await.expect("read");
        assert!(n > 0, "client closed the connection mid-script");
    }
}

async fn read_method(stream: &mut TcpStream, buf: &mut BytesMut) -> (u16, Method) {
    let frame = read_frame(stream, buf).await;
    assert_eq!(frame.kind, FrameKind::Method, "expected a method frame");
    let method = Method::from_frame(&frame).expect("decodable method");
    (frame.channel, method)
}

async fn send_method(stream: &mut TcpStream, channel: u16, method: Method) {
    stream.write_all(&method.into_frame(channel).to_bytes()).await.expect("write");
}

/// Play the server side of the opening sequence, asserting the client's
/// frame ordering at each step.
async fn accept_and_negotiate(
    listener: TcpListener,
    proposal: ConnectionTune,
) -> (TcpStream, BytesMut) {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let mut buf = BytesMut::new();

    let mut greeting = [0u8; 8];
    stream.read_exact(&mut greeting).await.expect("protocol header");
    assert_eq!(greeting, PROTOCOL_HEADER);

    send_method(
        &mut stream,
        0,
        Method::ConnectionStart(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: Bytes::from_static(b"PLAIN"),
            locales: Bytes::from_static(b"en_US"),
        }),
    )
    .await;

    // The very first frame out of the client after start must be start-ok.
    let (channel, reply) = read_method(&mut stream, &mut buf).await;
    assert_eq!(channel, 0);
    match reply {
        Method::ConnectionStartOk(start_ok) => {
            assert_eq!(start_ok.mechanism.as_str(), "PLAIN");
            assert_eq!(&start_ok.response[..], b"\0guest\0guest");
        },
        other => panic!("expected start-ok first, got {other:?}"),
    }

    send_method(&mut stream, 0, Method::ConnectionTune(proposal)).await;

    // The client adopts the proposal verbatim and echoes it back.
    let (channel, reply) = read_method(&mut stream, &mut buf).await;
    assert_eq!(channel, 0);
    assert_eq!(reply, Method::ConnectionTuneOk(proposal));

    let (channel, reply) = read_method(&mut stream, &mut buf).await;
    assert_eq!(channel, 0);
    match reply {
        Method::ConnectionOpen(open) => assert_eq!(open.vhost.as_str(), "/"),
        other => panic!("expected open after tune-ok, got {other:?}"),
    }
    send_method(&mut stream, 0, Method::ConnectionOpenOk).await;

    (stream, buf)
}

#[tokio::test]
async fn negotiates_opens_a_channel_and_closes() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) =
            accept_and_negotiate(listener, tune(2047, 131_072, 0)).await;

        let (channel, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!((channel, method), (1, Method::ChannelOpen));
        send_method(&mut stream, 1, Method::ChannelOpenOk).await;

        let (channel, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(channel, 1);
        match method {
            Method::ChannelClose(close) => {
                assert_eq!(close.reply_code, 200);
                assert_eq!((close.class_id, close.method_id), (0, 0));
            },
            other => panic!("expected channel.close, got {other:?}"),
        }
        send_method(&mut stream, 1, Method::ChannelCloseOk).await;

        let (channel, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(channel, 0);
        assert!(matches!(method, Method::ConnectionClose(_)));
        send_method(&mut stream, 0, Method::ConnectionCloseOk).await;
    });

    let connection = Connection::open(addr, ClientConfig::default()).await.unwrap();
    assert_eq!(
        connection.tuning(),
        Tuning { channel_max: 2047, frame_max: 131_072, heartbeat: 0 }
    );

    let channel = connection.open_channel().await.unwrap();
    assert_eq!(channel.id(), 1);

    channel.close().await.unwrap();
    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn publish_is_split_into_bounded_body_frames() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_negotiate(listener, tune(0, 4096, 0)).await;

        let (_, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(method, Method::ChannelOpen);
        send_method(&mut stream, 1, Method::ChannelOpenOk).await;

        let (channel, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(channel, 1);
        match method {
            Method::BasicPublish(publish) => {
                assert_eq!(publish.exchange.as_str(), "");
                assert_eq!(publish.routing_key.as_str(), "tasks");
            },
            other => panic!("expected basic.publish, got {other:?}"),
        }

        let header_frame = read_frame(&mut stream, &mut buf).await;
        assert_eq!(header_frame.kind, FrameKind::Header);
        let header = ContentHeader::from_frame(&header_frame).unwrap();
        assert_eq!(header.body_size, 10_000);

        let mut received = 0usize;
        let mut body_frames = 0usize;
        while received < 10_000 {
            let frame = read_frame(&mut stream, &mut buf).await;
            assert_eq!(frame.kind, FrameKind::Body);
            assert_eq!(frame.channel, 1);
            assert!(
                FRAME_OVERHEAD + frame.size() <= 4096,
                "frame of {} bytes exceeds the negotiated maximum",
                FRAME_OVERHEAD + frame.size()
            );
            received += frame.size();
            body_frames += 1;
        }
        assert_eq!(received, 10_000);
        assert_eq!(body_frames, 3);
    });

    let connection = Connection::open(addr, ClientConfig::default()).await.unwrap();
    let channel = connection.open_channel().await.unwrap();

    let args = PublishArgs::to_queue("tasks").unwrap();
    channel
        .publish(&args, BasicProperties::default(), vec![0x42u8; 10_000])
        .await
        .unwrap();

    broker.await.unwrap();
}

#[tokio::test]
async fn queue_declare_round_trips() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_negotiate(listener, tune(0, 131_072, 0)).await;

        let (_, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(method, Method::ChannelOpen);
        send_method(&mut stream, 1, Method::ChannelOpenOk).await;

        let (channel, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(channel, 1);
        match method {
            Method::QueueDeclare(declare) => {
                assert_eq!(declare.queue.as_str(), "tasks");
                assert!(declare.durable);
                assert!(!declare.passive);
            },
            other => panic!("expected queue.declare, got {other:?}"),
        }
        send_method(
            &mut stream,
            1,
            Method::QueueDeclareOk(QueueDeclareOk {
                queue: ShortStr::new("tasks").unwrap(),
                message_count: 3,
                consumer_count: 1,
            }),
        )
        .await;
    });

    let connection = Connection::open(addr, ClientConfig::default()).await.unwrap();
    let channel = connection.open_channel().await.unwrap();

    let info = channel
        .queue_declare("tasks", QueueOptions { durable: true, ..QueueOptions::default() })
        .await
        .unwrap();
    assert_eq!(info.queue, "tasks");
    assert_eq!(info.message_count, 3);
    assert_eq!(info.consumer_count, 1);

    broker.await.unwrap();
}

#[tokio::test]
async fn heartbeat_frames_are_echoed() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_negotiate(listener, tune(0, 131_072, 0)).await;

        stream.write_all(&Frame::heartbeat().to_bytes()).await.unwrap();

        let echo = read_frame(&mut stream, &mut buf).await;
        assert_eq!(echo, Frame::heartbeat());
    });

    let _connection = Connection::open(addr, ClientConfig::default()).await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn timed_out_call_poisons_the_connection() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, mut buf) = accept_and_negotiate(listener, tune(0, 131_072, 0)).await;

        // Swallow channel.open and never answer.
        let (_, method) = read_method(&mut stream, &mut buf).await;
        assert_eq!(method, Method::ChannelOpen);

        // Hold the socket open until the client gives up and drops it.
        let mut sink = [0u8; 1024];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {},
            }
        }
    });

    let config = ClientConfig { call_timeout: Duration::from_millis(200), ..Default::default() };
    let connection = Connection::open(addr, config).await.unwrap();

    let err = connection.open_channel().await.unwrap_err();
    assert!(
        matches!(err, ClientError::Timeout { operation: "channel.open", .. }),
        "expected a timeout, got {err:?}"
    );

    // The deadline expiry poisoned the whole connection.
    let err = connection.open_channel().await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionPoisoned), "got {err:?}");

    broker.await.unwrap();
}
