//! Connection-level behavior over an in-memory duplex transport: the
//! preface/SETTINGS exchange, PING acks, header-block coalescing and the
//! protocol errors that must kill a connection.

use h2wire::{Bytes, Connection, Error, ErrorType, Frame, FrameType, HeaderField};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};

const BUF: usize = 1 << 20;

async fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (c, s) = tokio::io::duplex(BUF);
    let client = Connection::new(c, false).await.unwrap();
    let server = Connection::new(s, true).await.unwrap();
    (client, server)
}

async fn pump_until<T, F>(conn: &Connection<T>, mut pred: F) -> Frame
where
    T: AsyncRead + AsyncWrite + Send,
    F: FnMut(&Frame) -> bool,
{
    loop {
        let frame = conn.read_frame().await.unwrap();
        if pred(&frame) {
            return frame;
        }
    }
}

fn request_fields() -> Vec<HeaderField> {
    vec![
        HeaderField::new(&b":method"[..], &b"GET"[..]),
        HeaderField::new(&b":scheme"[..], &b"http"[..]),
        HeaderField::new(&b":path"[..], &b"/"[..]),
        HeaderField::new(&b":authority"[..], &b"example.test"[..]),
    ]
}

#[tokio::test]
async fn settings_handshake_and_acks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client, server) = pair().await;

    let frame = client.read_frame().await.unwrap();
    assert!(matches!(frame, Frame::Settings { ack: false, .. }));
    let frame = server.read_frame().await.unwrap();
    assert!(matches!(frame, Frame::Settings { ack: false, .. }));

    // each side now sees the other's ACK of its opening SETTINGS
    let frame = server.read_frame().await.unwrap();
    assert!(matches!(frame, Frame::Settings { ack: true, .. }));
    let frame = client.read_frame().await.unwrap();
    assert!(matches!(frame, Frame::Settings { ack: true, .. }));
}

#[tokio::test]
async fn ping_is_answered() {
    let (client, server) = pair().await;
    client
        .write_frame(Frame::Ping {
            ack: false,
            data: *b"pingpong",
        })
        .await
        .unwrap();

    // the server answers from inside its read path
    let frame = pump_until(&server, |f| f.ty() == FrameType::Ping).await;
    assert_eq!(
        frame,
        Frame::Ping {
            ack: false,
            data: *b"pingpong"
        }
    );
    let frame = pump_until(&client, |f| f.ty() == FrameType::Ping).await;
    assert_eq!(
        frame,
        Frame::Ping {
            ack: true,
            data: *b"pingpong"
        }
    );
}

#[tokio::test]
async fn headers_roundtrip_with_response() {
    let (client, server) = pair().await;
    let id = client
        .open_stream(&request_fields(), None, 0, true)
        .await
        .unwrap();
    assert_eq!(id.get(), 1);

    let frame = pump_until(&server, |f| f.ty() == FrameType::Headers).await;
    match frame {
        Frame::Headers {
            stream,
            fields,
            end_stream,
            ..
        } => {
            assert_eq!(stream, id);
            assert_eq!(fields, request_fields());
            assert!(end_stream);
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    server
        .write_frame(Frame::Headers {
            stream: id,
            fields: vec![HeaderField::new(&b":status"[..], &b"204"[..])],
            priority: None,
            pad_length: 0,
            end_stream: true,
        })
        .await
        .unwrap();
    let frame = pump_until(&client, |f| f.ty() == FrameType::Headers).await;
    match frame {
        Frame::Headers { fields, .. } => {
            assert_eq!(fields, vec![HeaderField::new(&b":status"[..], &b"204"[..])]);
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn oversized_header_block_is_coalesced() {
    let (client, server) = pair().await;
    let id = client.next_stream_id().unwrap();

    // far bigger than MAX_FRAME_SIZE even after Huffman coding, so the
    // block must travel as HEADERS + CONTINUATION
    let mut fields = request_fields();
    fields.push(HeaderField::new(
        &b"x-blob"[..],
        Bytes::from(vec![b'a'; 40_000]),
    ));
    client
        .write_frame(Frame::Headers {
            stream: id,
            fields: fields.clone(),
            priority: None,
            pad_length: 0,
            end_stream: true,
        })
        .await
        .unwrap();

    let frame = pump_until(&server, |f| f.ty() == FrameType::Headers).await;
    match frame {
        Frame::Headers {
            fields: decoded, ..
        } => assert_eq!(decoded, fields),
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn sensitive_fields_stay_sensitive() {
    let (client, server) = pair().await;
    let id = client.next_stream_id().unwrap();
    let mut fields = request_fields();
    fields.push(HeaderField::sensitive(
        &b"authorization"[..],
        &b"Bearer hunter2"[..],
    ));
    client
        .write_frame(Frame::Headers {
            stream: id,
            fields,
            priority: None,
            pad_length: 0,
            end_stream: true,
        })
        .await
        .unwrap();

    let frame = pump_until(&server, |f| f.ty() == FrameType::Headers).await;
    match frame {
        Frame::Headers { fields, .. } => {
            let auth = fields
                .iter()
                .find(|f| f.name.as_ref() == b"authorization")
                .unwrap();
            assert!(auth.sensitive);
            assert_eq!(auth.value.as_ref(), b"Bearer hunter2");
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn padded_data_is_delivered_without_padding() {
    let (client, server) = pair().await;
    let id = client.next_stream_id().unwrap();
    client
        .write_frame(Frame::Headers {
            stream: id,
            fields: request_fields(),
            priority: None,
            pad_length: 0,
            end_stream: false,
        })
        .await
        .unwrap();
    client
        .write_frame(Frame::Data {
            stream: id,
            data: Bytes::from_static(b"payload"),
            pad_length: 9,
            end_stream: true,
        })
        .await
        .unwrap();

    pump_until(&server, |f| f.ty() == FrameType::Headers).await;
    let frame = pump_until(&server, |f| f.ty() == FrameType::Data).await;
    match frame {
        Frame::Data {
            data,
            pad_length,
            end_stream,
            ..
        } => {
            assert_eq!(data.as_ref(), b"payload");
            assert_eq!(pad_length, 9);
            assert!(end_stream);
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn goaway_refuses_new_streams() {
    let (client, server) = pair().await;
    assert!(client.next_stream_id().is_ok());
    server.close().await.unwrap();

    let frame = pump_until(&client, |f| f.ty() == FrameType::GoAway).await;
    assert!(matches!(
        frame,
        Frame::GoAway {
            error: ErrorType::NoError,
            ..
        }
    ));
    assert!(matches!(
        client.next_stream_id(),
        Err(Error::Refused { .. })
    ));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, _server) = pair().await;
    assert!(!client.closed());
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(client.closed());
    assert!(matches!(client.read_frame().await, Err(Error::Closed)));
    assert!(matches!(client.next_stream_id(), Err(Error::Closed)));
}

#[tokio::test]
async fn bad_preface_kills_the_connection() {
    let (mut raw, s) = tokio::io::duplex(BUF);
    let server = Connection::new(s, true).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    match server.read_frame().await {
        Err(Error::Connection { error, .. }) => assert_eq!(error, ErrorType::ProtocolError),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(server.closed());
}

#[tokio::test]
async fn first_frame_must_be_settings() {
    let (mut raw, c) = tokio::io::duplex(BUF);
    let client = Connection::new(c, false).await.unwrap();
    // a well-formed PING instead of the mandatory SETTINGS
    raw.write_all(&[0, 0, 8, 0x6, 0, 0, 0, 0, 0]).await.unwrap();
    raw.write_all(&[0; 8]).await.unwrap();
    match client.read_frame().await {
        Err(Error::Connection { error, .. }) => assert_eq!(error, ErrorType::ProtocolError),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn reset_stream_is_surfaced() {
    let (client, server) = pair().await;
    let id = client.next_stream_id().unwrap();
    client
        .write_frame(Frame::Headers {
            stream: id,
            fields: request_fields(),
            priority: None,
            pad_length: 0,
            end_stream: false,
        })
        .await
        .unwrap();
    pump_until(&server, |f| f.ty() == FrameType::Headers).await;
    server
        .write_frame(Frame::ResetStream {
            stream: id,
            error: ErrorType::Cancel,
        })
        .await
        .unwrap();

    let frame = pump_until(&client, |f| f.ty() == FrameType::ResetStream).await;
    assert_eq!(
        frame,
        Frame::ResetStream {
            stream: id,
            error: ErrorType::Cancel
        }
    );
    // the stream is gone; sending on it reports locally
    let result = client
        .write_frame(Frame::Data {
            stream: id,
            data: Bytes::from_static(b"late"),
            pad_length: 0,
            end_stream: true,
        })
        .await;
    assert!(matches!(
        result,
        Err(Error::Stream {
            error: ErrorType::StreamClosed,
            ..
        })
    ));
}
