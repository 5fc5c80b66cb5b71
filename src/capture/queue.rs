use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

struct QueueState {
    frames: VecDeque<Vec<u8>>,
    dropped: u64,
}

/// Bounded single-producer/single-consumer queue carrying raw captured
/// frames from the sniffer to the analyzer. On overflow the oldest frame is
/// evicted so the capture side never blocks.
pub struct PacketQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, frame: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.frames.len() == self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            warn!(
                "packet queue full, dropping oldest frame (total dropped: {})",
                state.dropped
            );
        }
        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();
    }

    /// Waits up to `timeout` for a frame; `None` when the queue stayed empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.frames.is_empty())
            .unwrap();
        state.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_packets(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }
}
