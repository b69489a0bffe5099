use crate::{frame::Priority, types::*};
use log::trace;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub id: NonZeroStreamId,
    pub state: StreamState,
    /// Octets we may still send on this stream; can go negative after a
    /// SETTINGS_INITIAL_WINDOW_SIZE decrease.
    pub send_window: i64,
    /// Octets the peer may still send to us.
    pub recv_window: i64,
    /// Receive octets consumed since the last WINDOW_UPDATE we issued.
    pub recv_consumed: i64,
    pub priority: Option<Priority>,
}

impl Stream {
    #[must_use]
    pub fn new(id: NonZeroStreamId, send_window: i64, recv_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            recv_consumed: 0,
            priority: None,
        }
    }

    /// Applies the state transitions for one complete frame (header blocks
    /// are already coalesced when this runs, so HEADERS here means the whole
    /// block).
    pub fn transition(&mut self, recv: bool, ty: FrameType, end_stream: bool) {
        let send = !recv;
        let original = self.state;

        match ty {
            FrameType::ResetStream => {
                self.state = StreamState::Closed;
            }
            FrameType::PushPromise => {
                // the transition of the promised stream; the carrying
                // stream is unaffected
                if self.state == StreamState::Idle {
                    self.state = if send {
                        StreamState::ReservedLocal
                    } else {
                        StreamState::ReservedRemote
                    };
                }
            }
            FrameType::Headers | FrameType::Data => {
                if ty == FrameType::Headers {
                    if self.state == StreamState::Idle {
                        self.state = StreamState::Open;
                    } else if self.state == StreamState::ReservedLocal && send {
                        self.state = StreamState::HalfClosedRemote;
                    } else if self.state == StreamState::ReservedRemote && recv {
                        self.state = StreamState::HalfClosedLocal;
                    }
                }
                if end_stream {
                    if self.state == StreamState::Open {
                        self.state = if send {
                            StreamState::HalfClosedLocal
                        } else {
                            StreamState::HalfClosedRemote
                        };
                    } else if self.state == StreamState::HalfClosedLocal && recv {
                        self.state = StreamState::Closed;
                    } else if self.state == StreamState::HalfClosedRemote && send {
                        self.state = StreamState::Closed;
                    }
                }
            }
            _ => {}
        }

        if self.state != original {
            trace!("stream {} {:?} -> {:?}", self.id, original, self.state);
        }
    }

    /// DATA from the peer is only legal while their sending half is open.
    #[must_use]
    pub fn can_recv_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// DATA to the peer is only legal while our sending half is open.
    #[must_use]
    pub fn can_send_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(NonZeroStreamId::new(1).unwrap(), 65_535, 65_535)
    }

    #[test]
    fn request_response_lifecycle() {
        let mut s = stream();
        s.transition(false, FrameType::Headers, false);
        assert_eq!(s.state, StreamState::Open);
        s.transition(false, FrameType::Data, true);
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.transition(true, FrameType::Headers, false);
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.transition(true, FrameType::Data, true);
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn headers_with_end_stream_skip_open() {
        let mut s = stream();
        s.transition(true, FrameType::Headers, true);
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(!s.can_recv_data());
        assert!(s.can_send_data());
    }

    #[test]
    fn push_promise_reserves() {
        let mut s = stream();
        s.transition(true, FrameType::PushPromise, false);
        assert_eq!(s.state, StreamState::ReservedRemote);
        s.transition(true, FrameType::Headers, false);
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.transition(true, FrameType::Data, true);
        assert_eq!(s.state, StreamState::Closed);
    }

    #[test]
    fn reset_closes_from_any_state() {
        let mut s = stream();
        s.transition(false, FrameType::Headers, false);
        s.transition(true, FrameType::ResetStream, false);
        assert_eq!(s.state, StreamState::Closed);
    }
}
