use crate::{stream::*, types::*};
use log::trace;
use std::collections::HashMap;

/// Owns every live stream plus the id bookkeeping for both sides. Lives
/// under the connection's state mutex; nothing here blocks.
#[derive(Debug)]
pub(crate) struct StreamCoordinator {
    /// Next id we would hand out: odd for clients, even for servers.
    next_id: StreamId,
    /// Highest peer-initiated id seen; peer ids must strictly increase.
    last_peer_id: StreamId,
    streams: HashMap<NonZeroStreamId, Stream>,
    pub initial_send_window: i64,
    pub initial_recv_window: i64,
}

impl StreamCoordinator {
    #[must_use]
    pub fn new(server: bool) -> Self {
        Self {
            next_id: if server { 2 } else { 1 },
            last_peer_id: 0,
            streams: HashMap::new(),
            initial_send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            initial_recv_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
        }
    }

    /// Looks a stream up, creating it lazily with the current initial
    /// windows. Streams exist only virtually until first referenced.
    pub fn stream(&mut self, id: NonZeroStreamId) -> &mut Stream {
        let (send, recv) = (self.initial_send_window, self.initial_recv_window);
        self.streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, send, recv))
    }

    pub fn get(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Records a peer-initiated stream id. Returns false when the id does
    /// not strictly increase (reuse or reordering).
    pub fn note_peer_id(&mut self, id: NonZeroStreamId) -> bool {
        if id.get() <= self.last_peer_id {
            return false;
        }
        self.last_peer_id = id.get();
        true
    }

    /// Whether this id belonged to a peer-initiated stream we have already
    /// seen (and since dropped).
    #[must_use]
    pub fn is_stale_peer_id(&self, id: NonZeroStreamId) -> bool {
        id.get() <= self.last_peer_id && !self.streams.contains_key(&id)
    }

    /// Whether this id belonged to a locally-initiated stream that has
    /// already closed and been dropped.
    #[must_use]
    pub fn is_stale_local_id(&self, id: NonZeroStreamId) -> bool {
        id.get() % 2 == self.next_id % 2
            && id.get() < self.next_id
            && !self.streams.contains_key(&id)
    }

    #[must_use]
    pub fn last_peer_id(&self) -> StreamId {
        self.last_peer_id
    }

    /// Hands out the next locally-initiated stream id and reserves its slot
    /// in the registry, so the allocation counts against the peer's
    /// concurrent-stream limit before any HEADERS goes out. `None` once the
    /// 31-bit id space is exhausted.
    pub fn allocate(&mut self) -> Option<NonZeroStreamId> {
        if self.next_id > U31_MAX.get() {
            return None;
        }
        let id = NonZeroStreamId::new(self.next_id)?;
        self.next_id += 2;
        self.stream(id);
        Some(id)
    }

    /// Streams we initiated that currently count against the peer's
    /// MAX_CONCURRENT_STREAMS, allocated-but-unopened reservations included.
    #[must_use]
    pub fn active_local(&self) -> usize {
        let parity = self.next_id % 2;
        self.streams
            .values()
            .filter(|s| {
                s.id.get() % 2 == parity
                    && s.id.get() < self.next_id
                    && s.state != StreamState::Closed
            })
            .count()
    }

    /// Retroactively applies a SETTINGS_INITIAL_WINDOW_SIZE change from the
    /// peer to every existing stream's send window.
    pub fn adjust_send_windows(&mut self, delta: i64) {
        if delta != 0 {
            trace!("adjusting all stream send windows by {}", delta);
        }
        for stream in self.streams.values_mut() {
            stream.send_window += delta;
        }
    }

    /// The receive-side counterpart, applied when the peer acknowledges our
    /// SETTINGS_INITIAL_WINDOW_SIZE change.
    pub fn adjust_recv_windows(&mut self, delta: i64) {
        for stream in self.streams.values_mut() {
            stream.recv_window += delta;
        }
    }

    /// Drops a stream that has transitioned to closed. Late frames are
    /// absorbed via the id bookkeeping, not by keeping state around.
    pub fn remove(&mut self, id: NonZeroStreamId) {
        self.streams.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NonZeroStreamId {
        NonZeroStreamId::new(n).unwrap()
    }

    #[test]
    fn client_ids_are_odd_and_increasing() {
        let mut streams = StreamCoordinator::new(false);
        assert_eq!(streams.allocate(), Some(id(1)));
        assert_eq!(streams.allocate(), Some(id(3)));
        assert_eq!(streams.allocate(), Some(id(5)));
    }

    #[test]
    fn server_ids_are_even() {
        let mut streams = StreamCoordinator::new(true);
        assert_eq!(streams.allocate(), Some(id(2)));
        assert_eq!(streams.allocate(), Some(id(4)));
    }

    #[test]
    fn peer_ids_must_strictly_increase() {
        let mut streams = StreamCoordinator::new(true);
        assert!(streams.note_peer_id(id(1)));
        assert!(streams.note_peer_id(id(5)));
        assert!(!streams.note_peer_id(id(3)));
        assert!(!streams.note_peer_id(id(5)));
        assert!(streams.is_stale_peer_id(id(3)));
    }

    #[test]
    fn allocations_count_until_closed() {
        let mut streams = StreamCoordinator::new(false);
        let first = streams.allocate().unwrap();
        // reserved as soon as it is handed out, before any HEADERS
        assert_eq!(streams.active_local(), 1);
        streams.stream(first).transition(false, FrameType::Headers, false);
        let second = streams.allocate().unwrap();
        assert_eq!(streams.active_local(), 2);
        // peer-initiated stream is not ours to count
        streams.stream(id(2)).transition(true, FrameType::Headers, false);
        assert_eq!(streams.active_local(), 2);
        streams.stream(first).transition(true, FrameType::ResetStream, false);
        assert_eq!(streams.active_local(), 1);
        assert_eq!(streams.get(second).unwrap().state, StreamState::Idle);
    }

    #[test]
    fn window_adjustment_reaches_every_stream() {
        let mut streams = StreamCoordinator::new(false);
        streams.stream(id(1));
        streams.stream(id(3)).send_window = 10;
        streams.adjust_send_windows(-20);
        assert_eq!(streams.get(id(1)).unwrap().send_window, 65_515);
        assert_eq!(streams.get(id(3)).unwrap().send_window, -10);
    }
}
