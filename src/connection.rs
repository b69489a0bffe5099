use crate::{
    flags::*,
    frame::{
        encode_frame, Frame, FrameHeader, HeaderField, Payload, Priority, FRAME_HEADER_LEN,
        PREFACE,
    },
    hpack,
    stream::StreamState,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::{BufMut, Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use log::{debug, error, trace, warn};
use num_traits::ToPrimitive;
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex, MutexGuard,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, Notify},
};

fn default_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
        SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// A header block being assembled from HEADERS/PUSH_PROMISE plus
/// CONTINUATION frames. While one is open, no other frame may arrive.
struct PendingBlock {
    stream: NonZeroStreamId,
    promised: Option<NonZeroStreamId>,
    priority: Option<Priority>,
    pad_length: u8,
    end_stream: bool,
    fragment: BytesMut,
}

/// Reader-task state: the read half, the HPACK decoder (touched by the
/// reader only, so it needs no lock of its own), and the handshake and
/// CONTINUATION bookkeeping.
struct Reader<T> {
    io: ReadHalf<T>,
    decoder: hpack::Decoder,
    preface_done: bool,
    peer_settings_seen: bool,
    pending_block: Option<PendingBlock>,
}

/// Everything that must change atomically with bytes hitting the wire: the
/// write half and the HPACK encoder live under one lock so the encoder's
/// dynamic table evolves in exactly the order the peer will observe.
struct Writer<T> {
    io: WriteHalf<T>,
    encoder: hpack::Encoder,
    buf: BytesMut,
}

impl<T: AsyncWrite> Writer<T> {
    async fn send(
        &mut self,
        ty: FrameType,
        flags: u8,
        stream: StreamId,
        payload: &[u8],
    ) -> io::Result<()> {
        trace!(
            "send {:?} flags={:#04x} stream={} len={}",
            ty,
            flags,
            stream,
            payload.len()
        );
        self.buf.clear();
        encode_frame(&mut self.buf, ty, flags, stream, payload);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await
    }

    /// Encodes one header block and emits it as HEADERS plus as many
    /// CONTINUATIONs as the peer's MAX_FRAME_SIZE demands. Runs entirely
    /// under the caller's hold of the writer lock, so the encoder's table
    /// and the frame sequence stay atomic.
    async fn send_headers(
        &mut self,
        id: NonZeroStreamId,
        fields: &[HeaderField],
        priority: Option<Priority>,
        pad_length: u8,
        end_stream: bool,
        max_frame: usize,
    ) -> io::Result<()> {
        let mut block = BytesMut::new();
        self.encoder.encode_block(fields, &mut block);
        let mut block = block.freeze();

        let pad_overhead = if pad_length > 0 {
            1 + usize::from(pad_length)
        } else {
            0
        };
        let priority_len = if priority.is_some() { 5 } else { 0 };
        let first_capacity = max_frame.saturating_sub(pad_overhead + priority_len).max(1);
        let first = block.split_to(block.len().min(first_capacity));

        let mut flags = HeadersFlags::empty();
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        if block.is_empty() {
            flags |= HeadersFlags::END_HEADERS;
        }
        if pad_length > 0 {
            flags |= HeadersFlags::PADDED;
        }
        if priority.is_some() {
            flags |= HeadersFlags::PRIORITY;
        }

        let mut payload = BytesMut::with_capacity(pad_overhead + priority_len + first.len());
        if pad_length > 0 {
            payload.put_u8(pad_length);
        }
        if let Some(priority) = priority {
            put_priority(&mut payload, priority);
        }
        payload.put_slice(&first);
        if pad_length > 0 {
            payload.put_bytes(0, usize::from(pad_length));
        }
        self.send(FrameType::Headers, flags.bits(), id.get(), &payload)
            .await?;

        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max_frame));
            let flags = if block.is_empty() {
                ContinuationFlags::END_HEADERS.bits()
            } else {
                0
            };
            self.send(FrameType::Continuation, flags, id.get(), &chunk)
                .await?;
        }
        Ok(())
    }
}

/// Registry, windows and settings, all guarded by one non-async mutex that
/// is never held across an await point.
struct State {
    streams: StreamCoordinator,
    send_window: i64,
    recv_window: i64,
    recv_consumed: i64,
    local: EnumMap<SettingsParameter, u32>,
    peer: EnumMap<SettingsParameter, u32>,
    /// Locally-sent SETTINGS awaiting the peer's ACK, oldest first.
    sent_settings: VecDeque<Vec<(SettingsParameter, u32)>>,
    goaway_received: bool,
    goaway_sent: bool,
}

impl State {
    /// Allocates (and reserves) the next locally-initiated stream id,
    /// refusing once GOAWAY arrived or the peer's concurrent-stream limit
    /// is saturated.
    fn allocate_stream_id(&mut self) -> Result<NonZeroStreamId> {
        if self.goaway_received {
            return Err(Error::Refused {
                reason: "peer has sent GOAWAY",
            });
        }
        let limit = self.peer[SettingsParameter::MaxConcurrentStreams];
        if self.streams.active_local() >= limit as usize {
            return Err(Error::Refused {
                reason: "peer concurrent-stream limit reached",
            });
        }
        self.streams.allocate().ok_or(Error::Refused {
            reason: "stream id space exhausted",
        })
    }
}

/// One multiplexed HTTP/2 connection over an established transport.
///
/// Safe for any number of concurrent writers plus a single reader task:
/// [`write_frame`](Self::write_frame) serializes on the writer lock, while
/// [`read_frame`](Self::read_frame) is meant to be driven from one task.
/// New streams are opened with [`open_stream`](Self::open_stream), which
/// allocates the id and emits its HEADERS atomically — the peer requires
/// stream-opening HEADERS to arrive in id order.
pub struct Connection<T> {
    server: bool,
    reader: Mutex<Reader<T>>,
    writer: Mutex<Writer<T>>,
    state: StdMutex<State>,
    /// Signals writers parked on an exhausted flow-control window.
    window_changed: Notify,
    shutdown: Notify,
    closed: AtomicBool,
}

impl<T: AsyncRead + AsyncWrite + Send> Connection<T> {
    /// Wraps an established transport and performs our half of the preface:
    /// the 24-octet client magic (client side only) followed by the
    /// mandatory opening SETTINGS. The peer's preface is consumed by the
    /// read path.
    pub async fn new(io: T, server: bool) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let conn = Self {
            server,
            reader: Mutex::new(Reader {
                io: read_half,
                decoder: hpack::Decoder::new(DEFAULT_HEADER_TABLE_SIZE as usize),
                preface_done: !server,
                peer_settings_seen: false,
                pending_block: None,
            }),
            writer: Mutex::new(Writer {
                io: write_half,
                encoder: hpack::Encoder::new(DEFAULT_HEADER_TABLE_SIZE as usize),
                buf: BytesMut::with_capacity(FRAME_HEADER_LEN + DEFAULT_MAX_FRAME_SIZE as usize),
            }),
            state: StdMutex::new(State {
                streams: StreamCoordinator::new(server),
                send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
                recv_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
                recv_consumed: 0,
                local: default_settings(),
                peer: default_settings(),
                sent_settings: VecDeque::new(),
                goaway_received: false,
                goaway_sent: false,
            }),
            window_changed: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        };

        {
            let mut writer = conn.writer.lock().await;
            if !server {
                writer.io.write_all(PREFACE).await?;
            }
            writer.send(FrameType::Settings, 0, 0, &[]).await?;
        }
        // an empty SETTINGS advertises our defaults; remember it for the ACK
        conn.state().sent_settings.push_back(Vec::new());
        Ok(conn)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("state lock")
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Allocates the next locally-initiated stream id (odd for clients,
    /// even for servers) and reserves its slot against the peer's
    /// MAX_CONCURRENT_STREAMS. Refuses once the peer has sent GOAWAY or
    /// while that limit is saturated.
    ///
    /// The peer requires HEADERS for new streams to arrive in id order, so
    /// when several tasks open streams concurrently use
    /// [`open_stream`](Self::open_stream), which allocates and emits under
    /// one writer-lock hold.
    pub fn next_stream_id(&self) -> Result<NonZeroStreamId> {
        if self.closed() {
            return Err(Error::Closed);
        }
        self.state().allocate_stream_id()
    }

    /// Opens a new locally-initiated stream: allocates the next id and
    /// emits its HEADERS while still holding the writer lock, so concurrent
    /// openers cannot put ids on the wire out of order. Returns the id.
    pub async fn open_stream(
        &self,
        fields: &[HeaderField],
        priority: Option<Priority>,
        pad_length: u8,
        end_stream: bool,
    ) -> Result<NonZeroStreamId> {
        if self.closed() {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock().await;
        let (id, max_frame) = {
            let mut st = self.state();
            let st = &mut *st;
            let id = st.allocate_stream_id()?;
            let stream = st.streams.stream(id);
            if priority.is_some() {
                stream.priority = priority;
            }
            stream.transition(false, FrameType::Headers, end_stream);
            (id, st.peer[SettingsParameter::MaxFrameSize] as usize)
        };
        writer
            .send_headers(id, fields, priority, pad_length, end_stream, max_frame)
            .await?;
        Ok(id)
    }

    /// Shuts the connection down: a best-effort GOAWAY(NO_ERROR), then the
    /// write half is closed, parked writers fail with [`Error::Closed`] and
    /// the reader unblocks. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (last_stream, already_sent) = {
            let mut st = self.state();
            let already_sent = st.goaway_sent;
            st.goaway_sent = true;
            (st.streams.last_peer_id(), already_sent)
        };
        debug!("closing connection, last peer stream {}", last_stream);
        let mut writer = self.writer.lock().await;
        if !already_sent {
            let mut payload = BytesMut::with_capacity(8);
            payload.put_u32(last_stream);
            // unwrap: ErrorType is repr(u32)
            payload.put_u32(ErrorType::NoError.to_u32().unwrap());
            // the peer may already be gone; this is best effort
            let _ = writer.send(FrameType::GoAway, 0, 0, &payload).await;
        }
        let _ = writer.io.shutdown().await;
        drop(writer);
        self.shutdown.notify_waiters();
        self.window_changed.notify_waiters();
        Ok(())
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
            self.window_changed.notify_waiters();
        }
    }

    /// Fails the whole connection: GOAWAY with the error's code, transport
    /// teardown, and every waiter woken.
    async fn fail(&self, err: Error) -> Error {
        if !self.closed.swap(true, Ordering::AcqRel) {
            error!("connection failed: {}", err);
            let (last_stream, already_sent) = {
                let mut st = self.state();
                let already_sent = st.goaway_sent;
                st.goaway_sent = true;
                (st.streams.last_peer_id(), already_sent)
            };
            let mut writer = self.writer.lock().await;
            if !already_sent {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(last_stream);
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(err.error_type().to_u32().unwrap());
                let _ = writer.send(FrameType::GoAway, 0, 0, &payload).await;
            }
            let _ = writer.io.shutdown().await;
            drop(writer);
            self.shutdown.notify_waiters();
            self.window_changed.notify_waiters();
        }
        err
    }

    /// Stream errors reset the stream and let the connection continue;
    /// anything else is fatal.
    async fn recover(&self, err: Error) -> Result<()> {
        match err {
            Error::Stream { stream, error, reason } => {
                warn!("resetting stream {}: {}", stream, reason);
                self.send_reset(stream, error).await
            }
            other => Err(self.fail(other).await),
        }
    }

    /// Reads, dispatches and returns the next frame. Control traffic is
    /// handled on the way through: SETTINGS are applied and ACKed, PING is
    /// answered, WINDOW_UPDATE credits windows, CONTINUATIONs are coalesced
    /// into their HEADERS. Every known, non-CONTINUATION frame is then
    /// handed to the caller.
    pub async fn read_frame(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.closed() {
                return Err(Error::Closed);
            }
            let max_frame_size = self.state().local[SettingsParameter::MaxFrameSize];
            let reader_ref = &mut *reader;
            let raw = tokio::select! {
                raw = read_raw(&mut reader_ref.io, &mut reader_ref.preface_done, max_frame_size) => raw,
                _ = self.shutdown.notified() => return Err(Error::Closed),
            };
            let raw = match raw {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    // clean EOF: the peer is done with us
                    self.mark_closed();
                    return Err(Error::Closed);
                }
                Err(err) => return Err(self.fail(err).await),
            };
            let (header, payload) = raw;
            trace!(
                "recv type={:#04x} flags={:#04x} stream={} len={}",
                header.ty,
                header.flags,
                header.stream,
                header.length
            );

            let payload = match Payload::parse(&header, payload) {
                Ok(payload) => payload,
                Err(err) => {
                    self.recover(err).await?;
                    continue;
                }
            };

            match self.dispatch(&mut reader, &header, payload).await {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(err) => self.recover(err).await?,
            }
        }
    }

    async fn dispatch(
        &self,
        reader: &mut Reader<T>,
        header: &FrameHeader,
        payload: Payload,
    ) -> Result<Option<Frame>> {
        // an open header block admits nothing but its own CONTINUATIONs
        if let Some(pending) = &reader.pending_block {
            let continues = matches!(payload, Payload::Continuation { .. })
                && header.stream == pending.stream.get();
            if !continues {
                return Err(Error::Connection {
                    error: ErrorType::ProtocolError,
                    reason: "frame interleaved into a header block",
                });
            }
        }

        if matches!(payload, Payload::Unknown) {
            return Ok(None);
        }

        // both sides must open with SETTINGS
        if !reader.peer_settings_seen {
            let opening = matches!(payload, Payload::Settings(_))
                && header.flags & SettingsFlags::ACK.bits() == 0;
            if !opening {
                return Err(Error::Connection {
                    error: ErrorType::ProtocolError,
                    reason: "peer did not open with SETTINGS",
                });
            }
            reader.peer_settings_seen = true;
        }

        match payload {
            Payload::Settings(params) => {
                if header.flags & SettingsFlags::ACK.bits() != 0 {
                    let acked = self.state().sent_settings.pop_front();
                    match acked {
                        Some(params) => {
                            self.apply_local_settings(reader, &params);
                            Ok(Some(Frame::Settings { ack: true, params }))
                        }
                        None => {
                            warn!("SETTINGS ACK with nothing outstanding");
                            Ok(Some(Frame::Settings {
                                ack: true,
                                params: Vec::new(),
                            }))
                        }
                    }
                } else {
                    self.apply_peer_settings(&params).await?;
                    Ok(Some(Frame::Settings { ack: false, params }))
                }
            }
            Payload::Ping(data) => {
                let ack = header.flags & PingFlags::ACK.bits() != 0;
                if !ack {
                    let mut writer = self.writer.lock().await;
                    writer
                        .send(FrameType::Ping, PingFlags::ACK.bits(), 0, &data)
                        .await?;
                }
                Ok(Some(Frame::Ping { ack, data }))
            }
            Payload::GoAway {
                last_stream,
                error,
                debug,
            } => {
                error!("peer sent GOAWAY: {:?}", error);
                if !debug.is_empty() {
                    if let Ok(text) = std::str::from_utf8(&debug) {
                        debug!("goaway debug data: {}", text);
                    }
                }
                self.state().goaway_received = true;
                Ok(Some(Frame::GoAway {
                    last_stream,
                    error,
                    debug,
                }))
            }
            Payload::WindowUpdate(increment) => {
                {
                    let mut st = self.state();
                    let st = &mut *st;
                    match NonZeroStreamId::new(header.stream) {
                        None => {
                            if st.send_window + i64::from(increment.get())
                                > i64::from(U31_MAX.get())
                            {
                                return Err(Error::Connection {
                                    error: ErrorType::FlowControlError,
                                    reason: "connection send window overflow",
                                });
                            }
                            st.send_window += i64::from(increment.get());
                        }
                        Some(id) => {
                            if let Some(stream) = st.streams.get(id) {
                                if stream.send_window + i64::from(increment.get())
                                    > i64::from(U31_MAX.get())
                                {
                                    return Err(Error::Stream {
                                        stream: id.get(),
                                        error: ErrorType::FlowControlError,
                                        reason: "stream send window overflow",
                                    });
                                }
                                stream.send_window += i64::from(increment.get());
                            }
                            // late updates for dropped streams are absorbed
                        }
                    }
                }
                self.window_changed.notify_waiters();
                Ok(Some(Frame::WindowUpdate {
                    stream: header.stream,
                    increment,
                }))
            }
            Payload::ResetStream(err) => {
                let id = expect_stream(header);
                warn!("peer reset stream {}: {:?}", id, err);
                {
                    let mut st = self.state();
                    if let Some(stream) = st.streams.get(id) {
                        stream.transition(true, FrameType::ResetStream, false);
                    }
                    st.streams.remove(id);
                }
                self.window_changed.notify_waiters();
                Ok(Some(Frame::ResetStream {
                    stream: id,
                    error: err,
                }))
            }
            Payload::Priority(priority) => {
                let id = expect_stream(header);
                if priority.dependency == id.get() {
                    return Err(Error::Stream {
                        stream: id.get(),
                        error: ErrorType::ProtocolError,
                        reason: "stream depends on itself",
                    });
                }
                if let Some(old) = self.state().streams.stream(id).priority.replace(priority) {
                    trace!("stream {} reprioritized from {:?}", id, old);
                }
                Ok(Some(Frame::Priority {
                    stream: id,
                    priority,
                }))
            }
            Payload::Data { data, pad_length } => {
                self.recv_data(header, data, pad_length).await
            }
            Payload::Headers {
                priority,
                fragment,
                pad_length,
            } => {
                let id = expect_stream(header);
                let flags = HeadersFlags::from_bits_truncate(header.flags);
                if let Some(priority) = priority {
                    if priority.dependency == id.get() {
                        return Err(Error::Stream {
                            stream: id.get(),
                            error: ErrorType::ProtocolError,
                            reason: "stream depends on itself",
                        });
                    }
                }
                {
                    let mut st = self.state();
                    if st.streams.get(id).is_none() {
                        if self.peer_initiated(id) {
                            if !st.streams.note_peer_id(id) {
                                return Err(Error::Connection {
                                    error: ErrorType::ProtocolError,
                                    reason: "HEADERS on an old peer stream id",
                                });
                            }
                        } else {
                            return Err(Error::Connection {
                                error: ErrorType::ProtocolError,
                                reason: "HEADERS on an unopened local stream",
                            });
                        }
                    }
                }
                let end_stream = flags.contains(HeadersFlags::END_STREAM);
                if flags.contains(HeadersFlags::END_HEADERS) {
                    self.finish_block(
                        &mut reader.decoder,
                        id,
                        None,
                        priority,
                        pad_length,
                        end_stream,
                        &fragment,
                    )
                    .map(Some)
                } else {
                    reader.pending_block = Some(PendingBlock {
                        stream: id,
                        promised: None,
                        priority,
                        pad_length,
                        end_stream,
                        fragment: BytesMut::from(&fragment[..]),
                    });
                    Ok(None)
                }
            }
            Payload::PushPromise {
                promised,
                fragment,
                pad_length,
            } => {
                let id = expect_stream(header);
                let flags = PushPromiseFlags::from_bits_truncate(header.flags);
                {
                    let mut st = self.state();
                    if self.server {
                        return Err(Error::Connection {
                            error: ErrorType::ProtocolError,
                            reason: "client sent PUSH_PROMISE",
                        });
                    }
                    if st.local[SettingsParameter::EnablePush] == 0 {
                        return Err(Error::Connection {
                            error: ErrorType::ProtocolError,
                            reason: "push is disabled",
                        });
                    }
                    if st.streams.get(id).is_none() {
                        return Err(Error::Connection {
                            error: ErrorType::ProtocolError,
                            reason: "PUSH_PROMISE on an unopened stream",
                        });
                    }
                    if !st.streams.note_peer_id(promised) {
                        return Err(Error::Connection {
                            error: ErrorType::ProtocolError,
                            reason: "promised stream id does not increase",
                        });
                    }
                }
                if flags.contains(PushPromiseFlags::END_HEADERS) {
                    self.finish_block(
                        &mut reader.decoder,
                        id,
                        Some(promised),
                        None,
                        pad_length,
                        false,
                        &fragment,
                    )
                    .map(Some)
                } else {
                    reader.pending_block = Some(PendingBlock {
                        stream: id,
                        promised: Some(promised),
                        priority: None,
                        pad_length,
                        end_stream: false,
                        fragment: BytesMut::from(&fragment[..]),
                    });
                    Ok(None)
                }
            }
            Payload::Continuation { fragment } => match reader.pending_block.take() {
                Some(mut pending) => {
                    pending.fragment.extend_from_slice(&fragment);
                    let flags = ContinuationFlags::from_bits_truncate(header.flags);
                    if flags.contains(ContinuationFlags::END_HEADERS) {
                        self.finish_block(
                            &mut reader.decoder,
                            pending.stream,
                            pending.promised,
                            pending.priority,
                            pending.pad_length,
                            pending.end_stream,
                            &pending.fragment,
                        )
                        .map(Some)
                    } else {
                        reader.pending_block = Some(pending);
                        Ok(None)
                    }
                }
                None => Err(Error::Connection {
                    error: ErrorType::ProtocolError,
                    reason: "CONTINUATION without an open header block",
                }),
            },
            Payload::Unknown => Ok(None),
        }
    }

    /// Flow-control accounting and stream-state checks for one DATA frame,
    /// plus the WINDOW_UPDATE refills our receive policy owes the peer.
    async fn recv_data(
        &self,
        header: &FrameHeader,
        data: Bytes,
        pad_length: u8,
    ) -> Result<Option<Frame>> {
        let id = expect_stream(header);
        let end_stream =
            DataFlags::from_bits_truncate(header.flags).contains(DataFlags::END_STREAM);
        // padding counts against flow control, so debit the wire length
        let flow = i64::from(header.length);
        let mut refill_conn = 0_i64;
        let mut refill_stream = 0_i64;
        {
            let mut st = self.state();
            let st = &mut *st;
            st.recv_window -= flow;
            if st.recv_window < 0 {
                return Err(Error::Connection {
                    error: ErrorType::FlowControlError,
                    reason: "connection receive window exceeded",
                });
            }
            st.recv_consumed += flow;

            let initial_stream_window = st.streams.initial_recv_window;
            if st.streams.get(id).is_none() {
                if st.streams.is_stale_peer_id(id) || st.streams.is_stale_local_id(id) {
                    // absorbed: the stream closed while this frame was in flight
                    return Err(Error::Stream {
                        stream: id.get(),
                        error: ErrorType::StreamClosed,
                        reason: "DATA on a closed stream",
                    });
                }
                return Err(Error::Connection {
                    error: ErrorType::ProtocolError,
                    reason: "DATA on a stream that was never opened",
                });
            }
            // unwrap: checked for existence just above
            let stream = st.streams.get(id).expect("stream exists");
            if stream.state == StreamState::Idle {
                return Err(Error::Connection {
                    error: ErrorType::ProtocolError,
                    reason: "DATA on an idle stream",
                });
            }
            if !stream.can_recv_data() {
                return Err(Error::Stream {
                    stream: id.get(),
                    error: ErrorType::StreamClosed,
                    reason: "DATA on a half-closed stream",
                });
            }
            stream.recv_window -= flow;
            if stream.recv_window < 0 {
                return Err(Error::Stream {
                    stream: id.get(),
                    error: ErrorType::FlowControlError,
                    reason: "stream receive window exceeded",
                });
            }
            stream.recv_consumed += flow;
            if end_stream {
                stream.transition(true, FrameType::Data, true);
            } else if stream.recv_consumed >= initial_stream_window / 2 {
                refill_stream = stream.recv_consumed;
                stream.recv_consumed = 0;
                stream.recv_window += refill_stream;
            }
            if stream.state == StreamState::Closed {
                st.streams.remove(id);
            }

            if st.recv_consumed >= i64::from(DEFAULT_INITIAL_WINDOW_SIZE) / 2 {
                refill_conn = st.recv_consumed;
                st.recv_consumed = 0;
                st.recv_window += refill_conn;
            }
        }
        if refill_conn > 0 {
            self.send_window_update(0, refill_conn as u32).await?;
        }
        if refill_stream > 0 {
            self.send_window_update(id.get(), refill_stream as u32).await?;
        }
        Ok(Some(Frame::Data {
            stream: id,
            data,
            pad_length,
            end_stream,
        }))
    }

    /// Decodes a finished header block and applies the stream transition it
    /// carries. A decode failure here poisons the compression context.
    #[allow(clippy::too_many_arguments)]
    fn finish_block(
        &self,
        decoder: &mut hpack::Decoder,
        id: NonZeroStreamId,
        promised: Option<NonZeroStreamId>,
        priority: Option<Priority>,
        pad_length: u8,
        end_stream: bool,
        fragment: &[u8],
    ) -> Result<Frame> {
        let mut fields = Vec::new();
        decoder.decode(fragment, |field| fields.push(field))?;
        decoder.reset();

        let mut st = self.state();
        match promised {
            None => {
                let stream = st.streams.stream(id);
                if priority.is_some() {
                    stream.priority = priority;
                }
                stream.transition(true, FrameType::Headers, end_stream);
                if stream.state == StreamState::Closed {
                    st.streams.remove(id);
                }
                Ok(Frame::Headers {
                    stream: id,
                    fields,
                    priority,
                    pad_length,
                    end_stream,
                })
            }
            Some(promised) => {
                st.streams
                    .stream(promised)
                    .transition(true, FrameType::PushPromise, false);
                Ok(Frame::PushPromise {
                    stream: id,
                    promised,
                    fields,
                    pad_length,
                })
            }
        }
    }

    /// Validates and applies a peer SETTINGS frame, then ACKs it.
    async fn apply_peer_settings(&self, params: &[(SettingsParameter, u32)]) -> Result<()> {
        for &(param, value) in params {
            match param {
                SettingsParameter::EnablePush if value > 1 => {
                    return Err(Error::Connection {
                        error: ErrorType::ProtocolError,
                        reason: "ENABLE_PUSH must be 0 or 1",
                    });
                }
                SettingsParameter::InitialWindowSize if value > U31_MAX.get() => {
                    return Err(Error::Connection {
                        error: ErrorType::FlowControlError,
                        reason: "INITIAL_WINDOW_SIZE above 2^31-1",
                    });
                }
                SettingsParameter::MaxFrameSize
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_CEILING).contains(&value) =>
                {
                    return Err(Error::Connection {
                        error: ErrorType::ProtocolError,
                        reason: "MAX_FRAME_SIZE out of range",
                    });
                }
                _ => {}
            }
        }

        let mut header_table = None;
        {
            let mut st = self.state();
            for &(param, value) in params {
                debug!("peer setting {:?} = {}", param, value);
                if param == SettingsParameter::InitialWindowSize {
                    let delta = i64::from(value) - i64::from(st.peer[param]);
                    st.streams.adjust_send_windows(delta);
                    st.streams.initial_send_window = i64::from(value);
                }
                if param == SettingsParameter::HeaderTableSize {
                    header_table = Some(value as usize);
                }
                st.peer[param] = value;
            }
        }

        let mut writer = self.writer.lock().await;
        if let Some(size) = header_table {
            writer.encoder.set_max_size(size);
        }
        writer
            .send(FrameType::Settings, SettingsFlags::ACK.bits(), 0, &[])
            .await?;
        drop(writer);
        // window deltas may have freed a parked writer
        self.window_changed.notify_waiters();
        Ok(())
    }

    /// The peer ACKed settings we sent earlier; they now bind our receive
    /// side.
    fn apply_local_settings(&self, reader: &mut Reader<T>, params: &[(SettingsParameter, u32)]) {
        let mut st = self.state();
        for &(param, value) in params {
            debug!("local setting {:?} = {} acknowledged", param, value);
            match param {
                SettingsParameter::HeaderTableSize => {
                    reader.decoder.allow_resize(value as usize);
                }
                SettingsParameter::InitialWindowSize => {
                    let delta = i64::from(value) - i64::from(st.local[param]);
                    st.streams.adjust_recv_windows(delta);
                    st.streams.initial_recv_window = i64::from(value);
                }
                _ => {}
            }
            st.local[param] = value;
        }
    }

    /// Submits one frame. DATA honors both flow-control windows (waiting on
    /// WINDOW_UPDATE when they are empty) and the peer's MAX_FRAME_SIZE;
    /// HEADERS and PUSH_PROMISE are HPACK-encoded under the writer lock and
    /// split into CONTINUATIONs as needed.
    pub async fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.closed() {
            return Err(Error::Closed);
        }
        match frame {
            Frame::Data {
                stream,
                data,
                pad_length,
                end_stream,
            } => self.write_data(stream, data, pad_length, end_stream).await,
            Frame::Headers {
                stream,
                fields,
                priority,
                pad_length,
                end_stream,
            } => {
                self.write_headers(stream, &fields, priority, pad_length, end_stream)
                    .await
            }
            Frame::PushPromise {
                stream,
                promised,
                fields,
                pad_length,
            } => {
                self.write_push_promise(stream, promised, &fields, pad_length)
                    .await
            }
            Frame::Priority { stream, priority } => {
                let mut payload = BytesMut::with_capacity(5);
                put_priority(&mut payload, priority);
                let mut writer = self.writer.lock().await;
                writer
                    .send(FrameType::Priority, 0, stream.get(), &payload)
                    .await?;
                Ok(())
            }
            Frame::ResetStream { stream, error } => self.send_reset(stream.get(), error).await,
            Frame::Settings { ack, params } => {
                if !ack {
                    self.state().sent_settings.push_back(params.clone());
                }
                let mut payload = BytesMut::with_capacity(params.len() * 6);
                for &(param, value) in &params {
                    // unwrap: SettingsParameter is repr(u16)
                    payload.put_u16(param.to_u16().unwrap());
                    payload.put_u32(value);
                }
                let flags = if ack { SettingsFlags::ACK.bits() } else { 0 };
                let mut writer = self.writer.lock().await;
                writer.send(FrameType::Settings, flags, 0, &payload).await?;
                Ok(())
            }
            Frame::Ping { ack, data } => {
                let flags = if ack { PingFlags::ACK.bits() } else { 0 };
                let mut writer = self.writer.lock().await;
                writer.send(FrameType::Ping, flags, 0, &data).await?;
                Ok(())
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                self.state().goaway_sent = true;
                let mut payload = BytesMut::with_capacity(8 + debug.len());
                payload.put_u32(last_stream);
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                payload.put_slice(&debug);
                let mut writer = self.writer.lock().await;
                writer.send(FrameType::GoAway, 0, 0, &payload).await?;
                Ok(())
            }
            Frame::WindowUpdate { stream, increment } => {
                {
                    let mut st = self.state();
                    let st = &mut *st;
                    match NonZeroStreamId::new(stream) {
                        None => st.recv_window += i64::from(increment.get()),
                        Some(id) => {
                            if let Some(s) = st.streams.get(id) {
                                s.recv_window += i64::from(increment.get());
                            }
                        }
                    }
                }
                self.send_window_update(stream, increment.get()).await
            }
        }
    }

    async fn write_data(
        &self,
        id: NonZeroStreamId,
        data: Bytes,
        pad_length: u8,
        end_stream: bool,
    ) -> Result<()> {
        let mut remaining = data;
        // the pad length octet and the padding ride the final chunk and
        // count against both windows
        let pad_overhead = if pad_length > 0 {
            1 + usize::from(pad_length)
        } else {
            0
        };
        loop {
            let wait = self.window_changed.notified();
            if self.closed() {
                return Err(Error::Closed);
            }
            let claimed = {
                let mut st = self.state();
                let st = &mut *st;
                let max_frame = st.peer[SettingsParameter::MaxFrameSize] as usize;
                let conn_window = st.send_window;
                let stream = st.streams.get(id).ok_or(Error::Stream {
                    stream: id.get(),
                    error: ErrorType::StreamClosed,
                    reason: "stream is closed",
                })?;
                if !stream.can_send_data() {
                    return Err(Error::Stream {
                        stream: id.get(),
                        error: ErrorType::StreamClosed,
                        reason: "stream cannot carry DATA",
                    });
                }
                let window = conn_window.min(stream.send_window).max(0) as usize;
                let budget = window.min(max_frame);
                if remaining.len() + pad_overhead <= budget {
                    let cost = (remaining.len() + pad_overhead) as i64;
                    st.send_window -= cost;
                    stream.send_window -= cost;
                    Some((remaining.len(), true))
                } else if budget > 0 {
                    let len = remaining.len().min(budget);
                    st.send_window -= len as i64;
                    stream.send_window -= len as i64;
                    Some((len, false))
                } else {
                    None
                }
            };
            match claimed {
                Some((len, last)) => {
                    let chunk = remaining.split_to(len);
                    let mut flags = DataFlags::empty();
                    let mut writer = self.writer.lock().await;
                    if last && pad_length > 0 {
                        flags |= DataFlags::PADDED;
                        if end_stream {
                            flags |= DataFlags::END_STREAM;
                        }
                        let mut payload = BytesMut::with_capacity(1 + chunk.len() + pad_overhead);
                        payload.put_u8(pad_length);
                        payload.put_slice(&chunk);
                        payload.put_bytes(0, usize::from(pad_length));
                        writer
                            .send(FrameType::Data, flags.bits(), id.get(), &payload)
                            .await?;
                    } else {
                        if last && end_stream {
                            flags |= DataFlags::END_STREAM;
                        }
                        writer
                            .send(FrameType::Data, flags.bits(), id.get(), &chunk)
                            .await?;
                    }
                    if last {
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        _ = wait => {}
                        _ = self.shutdown.notified() => return Err(Error::Closed),
                    }
                }
            }
        }
        if end_stream {
            let mut st = self.state();
            if let Some(stream) = st.streams.get(id) {
                stream.transition(false, FrameType::Data, true);
                if stream.state == StreamState::Closed {
                    st.streams.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn write_headers(
        &self,
        id: NonZeroStreamId,
        fields: &[HeaderField],
        priority: Option<Priority>,
        pad_length: u8,
        end_stream: bool,
    ) -> Result<()> {
        let max_frame = {
            let mut st = self.state();
            let st = &mut *st;
            let stream = st.streams.stream(id);
            if priority.is_some() {
                stream.priority = priority;
            }
            stream.transition(false, FrameType::Headers, end_stream);
            if stream.state == StreamState::Closed {
                st.streams.remove(id);
            }
            st.peer[SettingsParameter::MaxFrameSize] as usize
        };

        let mut writer = self.writer.lock().await;
        writer
            .send_headers(id, fields, priority, pad_length, end_stream, max_frame)
            .await?;
        Ok(())
    }

    async fn write_push_promise(
        &self,
        id: NonZeroStreamId,
        promised: NonZeroStreamId,
        fields: &[HeaderField],
        pad_length: u8,
    ) -> Result<()> {
        let max_frame = {
            let mut st = self.state();
            if !self.server {
                return Err(Error::Refused {
                    reason: "only servers can promise streams",
                });
            }
            if st.peer[SettingsParameter::EnablePush] == 0 {
                return Err(Error::Refused {
                    reason: "peer disabled push",
                });
            }
            st.streams
                .stream(promised)
                .transition(false, FrameType::PushPromise, false);
            st.peer[SettingsParameter::MaxFrameSize] as usize
        };

        let mut writer = self.writer.lock().await;
        let writer = &mut *writer;
        let mut block = BytesMut::new();
        writer.encoder.encode_block(fields, &mut block);
        let mut block = block.freeze();

        let pad_overhead = if pad_length > 0 {
            1 + usize::from(pad_length)
        } else {
            0
        };
        let first_capacity = max_frame.saturating_sub(pad_overhead + 4).max(1);
        let first = block.split_to(block.len().min(first_capacity));

        let mut flags = PushPromiseFlags::empty();
        if block.is_empty() {
            flags |= PushPromiseFlags::END_HEADERS;
        }
        if pad_length > 0 {
            flags |= PushPromiseFlags::PADDED;
        }

        let mut payload = BytesMut::with_capacity(pad_overhead + 4 + first.len());
        if pad_length > 0 {
            payload.put_u8(pad_length);
        }
        payload.put_u32(promised.get() & U31_MAX.get());
        payload.put_slice(&first);
        if pad_length > 0 {
            payload.put_bytes(0, usize::from(pad_length));
        }
        writer
            .send(FrameType::PushPromise, flags.bits(), id.get(), &payload)
            .await?;

        while !block.is_empty() {
            let chunk = block.split_to(block.len().min(max_frame));
            let flags = if block.is_empty() {
                ContinuationFlags::END_HEADERS.bits()
            } else {
                0
            };
            writer
                .send(FrameType::Continuation, flags, id.get(), &chunk)
                .await?;
        }
        Ok(())
    }

    async fn send_reset(&self, stream: StreamId, error: ErrorType) -> Result<()> {
        {
            let mut st = self.state();
            if let Some(id) = NonZeroStreamId::new(stream) {
                if let Some(s) = st.streams.get(id) {
                    s.transition(false, FrameType::ResetStream, false);
                }
                st.streams.remove(id);
            }
        }
        let mut payload = BytesMut::with_capacity(4);
        // unwrap: ErrorType is repr(u32)
        payload.put_u32(error.to_u32().unwrap());
        let mut writer = self.writer.lock().await;
        writer
            .send(FrameType::ResetStream, 0, stream, &payload)
            .await?;
        drop(writer);
        self.window_changed.notify_waiters();
        Ok(())
    }

    async fn send_window_update(&self, stream: StreamId, increment: u32) -> Result<()> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment & U31_MAX.get());
        let mut writer = self.writer.lock().await;
        writer
            .send(FrameType::WindowUpdate, 0, stream, &payload)
            .await?;
        Ok(())
    }

    fn peer_initiated(&self, id: NonZeroStreamId) -> bool {
        // client streams are odd, server streams even
        let odd = id.get() % 2 == 1;
        odd == self.server
    }
}

fn put_priority(payload: &mut BytesMut, priority: Priority) {
    let mut dependency = priority.dependency & U31_MAX.get();
    if priority.exclusive {
        dependency |= 1 << 31;
    }
    payload.put_u32(dependency);
    payload.put_u8(priority.weight);
}

fn expect_stream(header: &FrameHeader) -> NonZeroStreamId {
    // unwrap: Payload::parse rejects stream 0 for stream-level frames
    NonZeroStreamId::new(header.stream).expect("stream-level frame with stream 0")
}

/// Reads the peer preface (server side, once) and then one raw frame.
/// `Ok(None)` is a clean EOF at a frame boundary.
async fn read_raw<T: AsyncRead>(
    io: &mut ReadHalf<T>,
    preface_done: &mut bool,
    max_frame_size: u32,
) -> Result<Option<(FrameHeader, Bytes)>> {
    if !*preface_done {
        let mut magic = [0_u8; 24];
        match io.read_exact(&mut magic).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        if &magic[..] != PREFACE {
            return Err(Error::Connection {
                error: ErrorType::ProtocolError,
                reason: "bad connection preface",
            });
        }
        *preface_done = true;
    }

    let mut head = [0_u8; FRAME_HEADER_LEN];
    match io.read_exact(&mut head).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::parse(&head);
    if header.length > max_frame_size {
        return Err(Error::Connection {
            error: ErrorType::FrameSizeError,
            reason: "frame exceeds SETTINGS_MAX_FRAME_SIZE",
        });
    }
    let mut payload = vec![0_u8; header.length as usize];
    // truncation mid-frame is a hard transport error
    io.read_exact(&mut payload).await?;
    Ok(Some((header, payload.into())))
}
