//! Bounded FIFO queues backing the per-device command and event pipelines.

use crate::types::Command;
use std::collections::VecDeque;

/// Commands and events queued per peripheral device.
pub(crate) const QUEUE_CAPACITY: usize = 16;

/// A command staged for transmission. Session-internal commands (POLL, ID,
/// CHLNG, ...) carry no body; application commands carry their payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedCmd {
    pub id: u8,
    pub body: Option<Command>,
}

/// Returned when a queue has reached its fixed capacity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueFull;

/// Fixed-capacity FIFO of owned objects. Enqueueing past the capacity is a
/// modeled error rather than an overwrite.
pub(crate) struct Fifo<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Fifo<T> {
        Fifo {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn enqueue(&mut self, item: T) -> Result<(), QueueFull> {
        if self.items.len() == self.capacity {
            return Err(QueueFull);
        }
        self.items.push_back(item);
        Ok(())
    }

    #[inline]
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// The most recently enqueued item, if any.
    #[inline]
    pub fn peek_tail(&self) -> Option<&T> {
        self.items.back()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
