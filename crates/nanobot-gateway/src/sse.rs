//! Event-id assignment and replay for the server-to-client stream.

use std::collections::VecDeque;
use std::sync::Mutex;

const RING_CAP: usize = 256;

/// Per-session ring of recently emitted SSE frames.
///
/// Event ids increase monotonically for the life of the session; a
/// reconnect with `Last-Event-ID` replays only frames with greater ids.
#[derive(Default)]
pub struct EventRing {
    inner: Mutex<RingInner>,
}

#[derive(Default)]
struct RingInner {
    next_id: u64,
    frames: VecDeque<(u64, String)>,
}

impl EventRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame, returning its event id.
    pub fn push(&self, data: String) -> u64 {
        let mut inner = self.inner.lock().expect("lock");
        inner.next_id += 1;
        let id = inner.next_id;
        if inner.frames.len() >= RING_CAP {
            inner.frames.pop_front();
        }
        inner.frames.push_back((id, data));
        id
    }

    /// Frames with ids strictly greater than `after`.
    pub fn replay_after(&self, after: u64) -> Vec<(u64, String)> {
        self.inner
            .lock()
            .expect("lock")
            .frames
            .iter()
            .filter(|(id, _)| *id > after)
            .cloned()
            .collect()
    }
}
