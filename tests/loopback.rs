//! Echo traffic between a real client/server connection pair over TCP:
//! many concurrent producers, byte-for-byte accounting in both directions,
//! flow-control windows refilling under pressure.

use h2wire::{Bytes, Connection, Frame, HeaderField, NonZeroStreamId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::net::{TcpListener, TcpStream};

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client.unwrap();
    let (server, _) = accepted.unwrap();
    client.set_nodelay(true).unwrap();
    server.set_nodelay(true).unwrap();
    (client, server)
}

fn request_fields() -> Vec<HeaderField> {
    vec![
        HeaderField::new(&b":method"[..], &b"POST"[..]),
        HeaderField::new(&b":scheme"[..], &b"http"[..]),
        HeaderField::new(&b":path"[..], &b"/echo"[..]),
        HeaderField::new(&b":authority"[..], &b"loopback.test"[..]),
    ]
}

fn response_fields() -> Vec<HeaderField> {
    vec![HeaderField::new(&b":status"[..], &b"200"[..])]
}

/// Server loop: accumulate DATA per stream and echo the same number of
/// octets back once the stream half-closes.
async fn serve_echo(conn: Arc<Connection<TcpStream>>, rx: Arc<AtomicU64>, tx: Arc<AtomicU64>) {
    let mut pending: HashMap<NonZeroStreamId, usize> = HashMap::new();
    while !conn.closed() {
        let frame = match conn.read_frame().await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if let Frame::Data {
            stream,
            data,
            end_stream,
            ..
        } = frame
        {
            rx.fetch_add(data.len() as u64, Ordering::SeqCst);
            *pending.entry(stream).or_default() += data.len();
            if end_stream {
                let n = pending.remove(&stream).unwrap_or(0);
                let conn = conn.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let headers = Frame::Headers {
                        stream,
                        fields: response_fields(),
                        priority: None,
                        pad_length: 0,
                        end_stream: n == 0,
                    };
                    if conn.write_frame(headers).await.is_err() || n == 0 {
                        return;
                    }
                    let data = Frame::Data {
                        stream,
                        data: Bytes::from(vec![0_u8; n]),
                        pad_length: 0,
                        end_stream: true,
                    };
                    if conn.write_frame(data).await.is_ok() {
                        tx.fetch_add(n as u64, Ordering::SeqCst);
                    }
                });
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_across_many_concurrent_streams() {
    let _ = env_logger::builder().is_test(true).try_init();
    const STREAMS: usize = 64;
    const SIZE: usize = 1024;

    let (c, s) = tcp_pair().await;
    let client = Arc::new(Connection::new(c, false).await.unwrap());
    let server = Arc::new(Connection::new(s, true).await.unwrap());

    let server_rx = Arc::new(AtomicU64::new(0));
    let server_tx = Arc::new(AtomicU64::new(0));
    let server_task = tokio::spawn(serve_echo(
        server.clone(),
        server_rx.clone(),
        server_tx.clone(),
    ));

    // client read loop: count echoed octets, signal finished streams
    let client_rx = Arc::new(AtomicU64::new(0));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let reader = client.clone();
    let counted = client_rx.clone();
    let client_task = tokio::spawn(async move {
        loop {
            match reader.read_frame().await {
                Ok(Frame::Data {
                    data, end_stream, ..
                }) => {
                    counted.fetch_add(data.len() as u64, Ordering::SeqCst);
                    if end_stream && done_tx.send(()).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    let mut producers = Vec::with_capacity(STREAMS);
    for _ in 0..STREAMS {
        let conn = client.clone();
        producers.push(tokio::spawn(async move {
            // allocates the id and sends HEADERS atomically; a standalone
            // next_stream_id would let a later id overtake on the wire
            let stream = conn
                .open_stream(&request_fields(), None, 0, false)
                .await
                .unwrap();
            assert_eq!(stream.get() % 2, 1);
            conn.write_frame(Frame::Data {
                stream,
                data: Bytes::from(vec![0_u8; SIZE]),
                pad_length: 0,
                end_stream: true,
            })
            .await
            .unwrap();
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let mut completed = 0;
    while completed < STREAMS {
        done_rx.recv().await.unwrap();
        completed += 1;
    }

    let total = (STREAMS * SIZE) as u64;
    assert_eq!(server_rx.load(Ordering::SeqCst), total, "server lost data");
    assert_eq!(server_tx.load(Ordering::SeqCst), total, "echo lost data");
    assert_eq!(client_rx.load(Ordering::SeqCst), total, "client lost data");

    client.close().await.unwrap();
    server.close().await.unwrap();
    assert!(client.closed() && server.closed());
    let _ = client_task.await;
    let _ = server_task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_stream_larger_than_the_flow_window() {
    let _ = env_logger::builder().is_test(true).try_init();
    // bigger than both the 65535-octet windows and MAX_FRAME_SIZE, so the
    // sender must chunk and wait for WINDOW_UPDATE refills
    const SIZE: usize = 300 * 1024;

    let (c, s) = tcp_pair().await;
    let client = Arc::new(Connection::new(c, false).await.unwrap());
    let server = Arc::new(Connection::new(s, true).await.unwrap());

    let received = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let sink = server.clone();
    let counted = received.clone();
    tokio::spawn(async move {
        let mut done_tx = Some(done_tx);
        loop {
            match sink.read_frame().await {
                Ok(Frame::Data {
                    data, end_stream, ..
                }) => {
                    counted.fetch_add(data.len() as u64, Ordering::SeqCst);
                    if end_stream {
                        if let Some(done) = done_tx.take() {
                            let _ = done.send(());
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    // the client read loop only needs to run so WINDOW_UPDATEs apply
    let pump = client.clone();
    tokio::spawn(async move { while pump.read_frame().await.is_ok() {} });

    let stream = client
        .open_stream(&request_fields(), None, 0, false)
        .await
        .unwrap();
    client
        .write_frame(Frame::Data {
            stream,
            data: Bytes::from(vec![0_u8; SIZE]),
            pad_length: 0,
            end_stream: true,
        })
        .await
        .unwrap();

    done_rx.await.unwrap();
    assert_eq!(received.load(Ordering::SeqCst), SIZE as u64);

    client.close().await.unwrap();
    server.close().await.unwrap();
}
