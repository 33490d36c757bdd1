//! # inflights
//!
//! why: bound the number and size of unacknowledged appends to one follower
//! relations: embedded in progress.rs; freed by node.rs on acks
//! what: Inflights

use std::collections::VecDeque;

/// Sliding window of append messages sent to one follower and not yet
/// acknowledged, bounded by count and optionally by bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflights {
    // (last index carried by the message, payload bytes)
    buffer: VecDeque<(u64, u64)>,
    bytes: u64,
    cap: usize,
    max_bytes: u64,
}

impl Inflights {
    /// `max_bytes == 0` disables the byte bound.
    pub fn new(cap: usize, max_bytes: u64) -> Self {
        Self {
            buffer: VecDeque::with_capacity(cap.min(256)),
            bytes: 0,
            cap,
            max_bytes,
        }
    }

    /// Records a message whose last entry is `index`. Indexes must be added
    /// in increasing order and never while the window is full.
    pub fn add(&mut self, index: u64, bytes: u64) {
        if self.full() {
            crate::fatal!("cannot add into a full inflights");
        }
        if let Some((last, _)) = self.buffer.back() {
            if index <= *last {
                crate::fatal!("inflights added out of order: {} <= {}", index, last);
            }
        }
        self.buffer.push_back((index, bytes));
        self.bytes += bytes;
    }

    /// Frees every message whose last index is `<= to`.
    pub fn free_le(&mut self, to: u64) {
        while let Some(&(index, bytes)) = self.buffer.front() {
            if index > to {
                break;
            }
            self.bytes -= bytes;
            self.buffer.pop_front();
        }
        if self.buffer.is_empty() {
            // drop any capacity grown during a burst
            self.buffer.shrink_to(self.cap.min(256));
        }
    }

    pub fn full(&self) -> bool {
        self.buffer.len() >= self.cap || (self.max_bytes != 0 && self.bytes >= self.max_bytes)
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.bytes = 0;
    }
}
