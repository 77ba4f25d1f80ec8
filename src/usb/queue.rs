//! Bounded FIFO of outbound reports awaiting transmission.
//!
//! Commands encode incremental state changes, so order must be preserved
//! end to end: reports leave in exactly the order they were queued. An
//! append is all-or-nothing — if the whole batch doesn't fit, nothing is
//! added and the caller must retry later or drop.

use std::collections::VecDeque;

use thiserror::Error;

use super::packet::Packet;

/// Capacity of the per-device outbound queue.
pub const QUEUE_LEN: usize = 40;

/// The append would overflow the queue; nothing was added.
#[derive(Debug, Error)]
#[error("queue full ({pending} pending + {requested} requested > {capacity})")]
pub struct QueueFull {
    pub pending: usize,
    pub requested: usize,
    pub capacity: usize,
}

/// Owned ring of pending outbound reports.
pub struct CommandQueue {
    slots: VecDeque<Packet>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append every report or none of them.
    pub fn push_all(&mut self, packets: &[Packet]) -> Result<(), QueueFull> {
        if self.slots.len() + packets.len() > self.capacity {
            return Err(QueueFull {
                pending: self.slots.len(),
                requested: packets.len(),
                capacity: self.capacity,
            });
        }
        self.slots.extend(packets.iter().copied());
        Ok(())
    }

    /// Remove and return the oldest report.
    pub fn pop(&mut self) -> Option<Packet> {
        self.slots.pop_front()
    }

    /// Discard every pending report.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
