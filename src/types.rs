use crate::hpack;
use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE_CEILING: u32 = (1 << 24) - 1;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The peer violated the protocol in a way that poisons the whole
    /// connection; a GOAWAY carrying `error` has been (or is being) sent.
    #[error("connection error ({error}): {reason}")]
    Connection {
        error: ErrorType,
        reason: &'static str,
    },
    /// A violation confined to one stream; the connection survives.
    #[error("stream {stream} error ({error}): {reason}")]
    Stream {
        stream: StreamId,
        error: ErrorType,
        reason: &'static str,
    },
    /// A header block could not be decoded, or the compression contexts can
    /// no longer be kept in lockstep. Always fatal to the connection.
    #[error("compression error: {0}")]
    Compression(#[from] hpack::HpackError),
    /// A new stream cannot be opened right now. Local report only; nothing
    /// is sent to the peer.
    #[error("stream refused: {reason}")]
    Refused { reason: &'static str },
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The code this error carries (or would carry) on the wire.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Connection { error, .. } | Self::Stream { error, .. } => *error,
            Self::Compression(_) => ErrorType::CompressionError,
            Self::Refused { .. } => ErrorType::RefusedStream,
            Self::Closed => ErrorType::Cancel,
            Self::Io(_) => ErrorType::InternalError,
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    derive_more::Display,
)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// The associated condition is not a result of an error. For example, a GOAWAY might include this code to indicate graceful shutdown of a connection.
    #[display(fmt = "NO_ERROR")]
    NoError = 0x0,
    /// The endpoint detected an unspecific protocol error. This error is for use when a more specific error code is not available.
    #[display(fmt = "PROTOCOL_ERROR")]
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    #[display(fmt = "INTERNAL_ERROR")]
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    #[display(fmt = "FLOW_CONTROL_ERROR")]
    FlowControlError = 0x3,
    /// The endpoint sent a SETTINGS frame but did not receive a response in a timely manner.
    #[display(fmt = "SETTINGS_TIMEOUT")]
    SettingsTimeout = 0x4,
    /// The endpoint received a frame after a stream was half-closed.
    #[display(fmt = "STREAM_CLOSED")]
    StreamClosed = 0x5,
    /// The endpoint received a frame with an invalid size.
    #[display(fmt = "FRAME_SIZE_ERROR")]
    FrameSizeError = 0x6,
    /// The endpoint refused the stream prior to performing any application processing.
    #[display(fmt = "REFUSED_STREAM")]
    RefusedStream = 0x7,
    /// Used by the endpoint to indicate that the stream is no longer needed.
    #[display(fmt = "CANCEL")]
    Cancel = 0x8,
    /// The endpoint is unable to maintain the header compression context for the connection.
    #[display(fmt = "COMPRESSION_ERROR")]
    CompressionError = 0x9,
    /// The connection established in response to a CONNECT request was reset or abnormally closed.
    #[display(fmt = "CONNECT_ERROR")]
    ConnectError = 0xa,
    /// The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.
    #[display(fmt = "ENHANCE_YOUR_CALM")]
    EnhanceYourCalm = 0xb,
    /// The underlying transport has properties that do not meet minimum security requirements.
    #[display(fmt = "INADEQUATE_SECURITY")]
    InadequateSecurity = 0xc,
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    #[display(fmt = "HTTP_1_1_REQUIRED")]
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode header blocks, in octets. The initial value is 4,096 octets.
    HeaderTableSize = 0x1,
    /// Whether server push is permitted. Any value other than 0 or 1 MUST be treated as a connection error of type PROTOCOL_ERROR. The initial value is 1.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams that the sender will allow the receiver to create. Initially unlimited.
    MaxConcurrentStreams = 0x3,
    /// The sender's initial window size (in octets) for stream-level flow control. The initial value is 2^16-1 (65,535) octets; values above 2^31-1 are a FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Size of the largest frame payload the sender is willing to receive, in octets. Must stay within 2^14 .. 2^24-1; the initial value is 2^14 (16,384) octets.
    MaxFrameSize = 0x5,
    /// Advisory maximum size of a header list, counted uncompressed with 32 octets of overhead per field. Initially unlimited.
    MaxHeaderListSize = 0x6,
}
