//! Hand-off of tick events from timer interrupts to the main loop.

use crate::config::TICK_BUFFER_SIZE;
use crate::device::DeviceId;
use heapless::spsc::Queue;

use super::TickError;

/// One tick waiting for the main loop.
///
/// `generation` identifies the attachment that was live when the timer fired,
/// so a tick outlives neither a detach nor a later re-attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTick {
    pub observer: DeviceId,
    pub timer: usize,
    pub generation: u32,
}

// heapless keeps one slot free to tell "full" from "empty"
type TickRing = Queue<PendingTick, { TICK_BUFFER_SIZE + 1 }>;

/// Bounded single-producer/single-consumer ring of pending ticks.
///
/// The producer side runs in interrupt context and the consumer side in the
/// main loop; the ring's head and tail are the only state they share and both
/// are atomics inside [`heapless::spsc::Queue`].
#[derive(Debug)]
pub struct PendingTickQueue {
    ring: TickRing,
    overflows: u32,
}

impl PendingTickQueue {
    pub const CAPACITY: usize = TICK_BUFFER_SIZE;

    pub const fn new() -> Self {
        Self { ring: Queue::new(), overflows: 0 }
    }

    /// Interrupt side. A full ring drops the tick and counts it.
    pub fn enqueue(&mut self, tick: PendingTick) -> Result<(), TickError> {
        match self.ring.enqueue(tick) {
            Ok(()) => Ok(()),
            Err(dropped) => {
                self.overflows = self.overflows.wrapping_add(1);
                Err(TickError::QueueOverflow(dropped.observer))
            }
        }
    }

    /// Main loop side, FIFO.
    pub fn dequeue(&mut self) -> Option<PendingTick> {
        self.ring.dequeue()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Total ticks dropped because the ring was full.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Discard everything still pending.
    pub fn clear(&mut self) {
        while self.ring.dequeue().is_some() {}
    }
}

impl Default for PendingTickQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(id: u16) -> PendingTick {
        PendingTick { observer: DeviceId(id), timer: 0, generation: 0 }
    }

    #[test]
    fn test_capacity_matches_buffer_size() {
        let queue = PendingTickQueue::new();
        assert_eq!(queue.capacity(), TICK_BUFFER_SIZE);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingTickQueue::new();
        queue.enqueue(tick(1)).unwrap();
        queue.enqueue(tick(2)).unwrap();
        queue.enqueue(tick(3)).unwrap();

        assert_eq!(queue.dequeue(), Some(tick(1)));
        assert_eq!(queue.dequeue(), Some(tick(2)));
        assert_eq!(queue.dequeue(), Some(tick(3)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let mut queue = PendingTickQueue::new();
        for i in 0..TICK_BUFFER_SIZE as u16 {
            queue.enqueue(tick(i)).unwrap();
        }
        assert!(queue.is_full());

        assert_eq!(queue.enqueue(tick(999)), Err(TickError::QueueOverflow(DeviceId(999))));
        assert_eq!(queue.overflows(), 1);

        // the first hundred survive in order
        for i in 0..TICK_BUFFER_SIZE as u16 {
            assert_eq!(queue.dequeue(), Some(tick(i)));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wraparound_after_drain() {
        let mut queue = PendingTickQueue::new();
        for round in 0..3u16 {
            for i in 0..80u16 {
                queue.enqueue(tick(round * 100 + i)).unwrap();
            }
            for i in 0..80u16 {
                assert_eq!(queue.dequeue(), Some(tick(round * 100 + i)));
            }
        }
        assert_eq!(queue.overflows(), 0);
    }
}
