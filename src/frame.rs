use crate::{flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

pub(crate) const FRAME_HEADER_LEN: usize = 9;

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One header field as it crosses the compression boundary. `sensitive`
/// selects the never-indexed literal representation on encode and reports it
/// on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#StreamPriority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// The 9-octet header in front of every frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub length: u32,
    pub ty: u8,
    pub flags: u8,
    pub stream: StreamId,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]),
            ty: buf[3],
            flags: buf[4],
            // unwrap: the length of the slice is always 4
            stream: u32::from_be_bytes(buf[5..9].try_into().unwrap()) & (u32::MAX >> 1),
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.ty)
    }
}

/// Serializes one frame header plus payload into `out`.
pub(crate) fn encode_frame(
    out: &mut BytesMut,
    ty: FrameType,
    flags: u8,
    stream: StreamId,
    payload: &[u8],
) {
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_uint(payload.len() as u64, 3);
    // unwrap: FrameType is repr(u8)
    out.put_u8(ty.to_u8().unwrap());
    out.put_u8(flags);
    out.put_u32(stream & (u32::MAX >> 1));
    out.put_slice(payload);
}

/// A parsed frame payload, still carrying raw header-block fragments. The
/// connection turns these into [`Frame`]s once CONTINUATIONs are coalesced
/// and the block is decoded.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Data {
        data: Bytes,
        pad_length: u8,
    },
    Headers {
        priority: Option<Priority>,
        fragment: Bytes,
        pad_length: u8,
    },
    Priority(Priority),
    ResetStream(ErrorType),
    Settings(Vec<(SettingsParameter, u32)>),
    PushPromise {
        promised: NonZeroStreamId,
        fragment: Bytes,
        pad_length: u8,
    },
    Ping([u8; 8]),
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate(NonZeroU32),
    Continuation {
        fragment: Bytes,
    },
    Unknown,
}

impl Payload {
    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        let ty = match header.frame_type() {
            Some(ty) => ty,
            // Unknown frame types must be ignored, not rejected.
            None => return Ok(Self::Unknown),
        };
        match ty {
            FrameType::Data => {
                require_stream(header)?;
                let (data, pad_length) =
                    strip_padding(header, payload, DataFlags::PADDED.bits())?;
                Ok(Self::Data { data, pad_length })
            }
            FrameType::Headers => {
                require_stream(header)?;
                let (mut fragment, pad_length) =
                    strip_padding(header, payload, HeadersFlags::PADDED.bits())?;
                let flags = HeadersFlags::from_bits_truncate(header.flags);
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if fragment.len() < 5 {
                        return Err(frame_size("HEADERS too short for priority"));
                    }
                    Some(parse_priority(&mut fragment))
                } else {
                    None
                };
                Ok(Self::Headers {
                    priority,
                    fragment,
                    pad_length,
                })
            }
            FrameType::Priority => {
                require_stream(header)?;
                if payload.len() != 5 {
                    return Err(frame_size("PRIORITY payload must be 5 octets"));
                }
                Ok(Self::Priority(parse_priority(&mut payload)))
            }
            FrameType::ResetStream => {
                require_stream(header)?;
                if payload.len() != 4 {
                    return Err(frame_size("RST_STREAM payload must be 4 octets"));
                }
                Ok(Self::ResetStream(parse_error_type(payload.get_u32())))
            }
            FrameType::Settings => {
                require_connection(header)?;
                if header.flags & SettingsFlags::ACK.bits() != 0 && !payload.is_empty() {
                    return Err(frame_size("SETTINGS ACK with a payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(frame_size("SETTINGS payload not a multiple of 6"));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    // unknown parameters must be ignored on receipt
                    if let Some(param) = SettingsParameter::from_u16(id) {
                        params.push((param, value));
                    }
                }
                Ok(Self::Settings(params))
            }
            FrameType::PushPromise => {
                require_stream(header)?;
                let (mut fragment, pad_length) =
                    strip_padding(header, payload, PushPromiseFlags::PADDED.bits())?;
                if fragment.len() < 4 {
                    return Err(frame_size("PUSH_PROMISE too short"));
                }
                let promised = NonZeroStreamId::new(fragment.get_u32() & (u32::MAX >> 1))
                    .ok_or(Error::Connection {
                        error: ErrorType::ProtocolError,
                        reason: "PUSH_PROMISE with promised stream 0",
                    })?;
                Ok(Self::PushPromise {
                    promised,
                    fragment,
                    pad_length,
                })
            }
            FrameType::Ping => {
                require_connection(header)?;
                if payload.len() != 8 {
                    return Err(frame_size("PING payload must be 8 octets"));
                }
                let mut data = [0_u8; 8];
                payload.copy_to_slice(&mut data);
                Ok(Self::Ping(data))
            }
            FrameType::GoAway => {
                require_connection(header)?;
                if payload.len() < 8 {
                    return Err(frame_size("GOAWAY shorter than 8 octets"));
                }
                let last_stream = payload.get_u32() & (u32::MAX >> 1);
                let error = parse_error_type(payload.get_u32());
                Ok(Self::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(frame_size("WINDOW_UPDATE payload must be 4 octets"));
                }
                let increment = payload.get_u32() & (u32::MAX >> 1);
                match NonZeroU32::new(increment) {
                    Some(increment) => Ok(Self::WindowUpdate(increment)),
                    None if header.stream == 0 => Err(Error::Connection {
                        error: ErrorType::ProtocolError,
                        reason: "WINDOW_UPDATE with zero increment",
                    }),
                    None => Err(Error::Stream {
                        stream: header.stream,
                        error: ErrorType::ProtocolError,
                        reason: "WINDOW_UPDATE with zero increment",
                    }),
                }
            }
            FrameType::Continuation => {
                require_stream(header)?;
                Ok(Self::Continuation { fragment: payload })
            }
        }
    }
}

/// Unassigned codes are usable as INTERNAL_ERROR rather than being a parse
/// failure; killing a connection over an unassigned code helps nobody.
fn parse_error_type(raw: u32) -> ErrorType {
    ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError)
}

fn parse_priority(buf: &mut Bytes) -> Priority {
    let raw = buf.get_u32();
    Priority {
        dependency: raw & (u32::MAX >> 1),
        exclusive: raw & (1 << 31) != 0,
        weight: buf.get_u8(),
    }
}

fn require_stream(header: &FrameHeader) -> Result<()> {
    if header.stream == 0 {
        return Err(Error::Connection {
            error: ErrorType::ProtocolError,
            reason: "frame requires a stream id",
        });
    }
    Ok(())
}

fn require_connection(header: &FrameHeader) -> Result<()> {
    if header.stream != 0 {
        return Err(Error::Connection {
            error: ErrorType::ProtocolError,
            reason: "connection-level frame with a stream id",
        });
    }
    Ok(())
}

fn frame_size(reason: &'static str) -> Error {
    Error::Connection {
        error: ErrorType::FrameSizeError,
        reason,
    }
}

/// Strips the Pad Length octet and trailing padding when the type's PADDED
/// bit is set. Padding that swallows the whole payload is a PROTOCOL_ERROR.
fn strip_padding(header: &FrameHeader, mut payload: Bytes, padded_bit: u8) -> Result<(Bytes, u8)> {
    if header.flags & padded_bit == 0 {
        return Ok((payload, 0));
    }
    if payload.is_empty() {
        return Err(Error::Connection {
            error: ErrorType::ProtocolError,
            reason: "PADDED frame without a pad length octet",
        });
    }
    let pad_length = payload.get_u8();
    if usize::from(pad_length) >= payload.len() + 1 {
        return Err(Error::Connection {
            error: ErrorType::ProtocolError,
            reason: "padding longer than the frame payload",
        });
    }
    payload.truncate(payload.len() - usize::from(pad_length));
    Ok((payload, pad_length))
}

/// One typed frame, covering every payload byte the wire format defines.
/// HEADERS and PUSH_PROMISE carry decoded header-field lists; CONTINUATION
/// never surfaces because the connection coalesces whole header blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    Data {
        stream: NonZeroStreamId,
        data: Bytes,
        pad_length: u8,
        end_stream: bool,
    },
    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    Headers {
        stream: NonZeroStreamId,
        fields: Vec<HeaderField>,
        priority: Option<Priority>,
        pad_length: u8,
        end_stream: bool,
    },
    /// https://httpwg.org/specs/rfc7540.html#PRIORITY
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    /// https://httpwg.org/specs/rfc7540.html#RST_STREAM
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    Settings {
        ack: bool,
        params: Vec<(SettingsParameter, u32)>,
    },
    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    PushPromise {
        stream: NonZeroStreamId,
        promised: NonZeroStreamId,
        fields: Vec<HeaderField>,
        pad_length: u8,
    },
    /// https://httpwg.org/specs/rfc7540.html#PING
    Ping { ack: bool, data: [u8; 8] },
    /// https://httpwg.org/specs/rfc7540.html#GOAWAY
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    /// https://httpwg.org/specs/rfc7540.html#WINDOW_UPDATE
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
}

impl Frame {
    #[must_use]
    pub fn ty(&self) -> FrameType {
        match self {
            Self::Data { .. } => FrameType::Data,
            Self::Headers { .. } => FrameType::Headers,
            Self::Priority { .. } => FrameType::Priority,
            Self::ResetStream { .. } => FrameType::ResetStream,
            Self::Settings { .. } => FrameType::Settings,
            Self::PushPromise { .. } => FrameType::PushPromise,
            Self::Ping { .. } => FrameType::Ping,
            Self::GoAway { .. } => FrameType::GoAway,
            Self::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }

    /// The stream the frame belongs to; 0 for connection-level frames.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { stream, .. }
            | Self::Headers { stream, .. }
            | Self::Priority { stream, .. }
            | Self::ResetStream { stream, .. }
            | Self::PushPromise { stream, .. } => stream.get(),
            Self::WindowUpdate { stream, .. } => *stream,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }
}
