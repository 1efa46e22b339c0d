//! Periodic callbacks multiplexed onto a handful of hardware timers.
//!
//! All observers asking for the same interval share one timer slot. A timer
//! interrupt only copies the slot's observer ids into the pending queue; the
//! observers' tick handlers run later from [`TickHandler::process`] in the
//! main loop.

use super::queue::{PendingTick, PendingTickQueue};
use super::timer::{SimulatedTimers, TimerDriver};
use super::TickError;
use crate::config::{NUM_TIMERS, TIMER_NUM_OBSERVERS};
use crate::device::DeviceId;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// An observer's membership in a timer slot. Every attach gets a fresh
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub observer: DeviceId,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSlot {
    pub interval_us: u32,
    pub observers: Vec<Attachment, TIMER_NUM_OBSERVERS>,
}

impl TimerSlot {
    pub fn contains(&self, observer: DeviceId) -> bool {
        self.observers.iter().any(|a| a.observer == observer)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TickStats {
    pub ticks_enqueued: u32,
    pub ticks_dispatched: u32,
    pub ticks_dropped: u32,
    pub ticks_skipped: u32,
    pub attach_failures: u32,
    pub active_timers: u8,
}

/// What a device may do with the scheduler while it handles an event.
pub trait TickPort {
    fn attach(&mut self, observer: DeviceId, interval_us: u32) -> Result<usize, TickError>;
    fn detach(&mut self, observer: DeviceId) -> bool;
    fn is_attached(&self, observer: DeviceId) -> bool;
}

#[derive(Debug)]
pub struct TickHandler<T: TimerDriver> {
    driver: T,
    slots: [Option<TimerSlot>; NUM_TIMERS],
    queue: PendingTickQueue,
    stats: TickStats,
    reported_overflows: u32,
    next_generation: u32,
}

impl<T: TimerDriver> TickHandler<T> {
    pub fn new(driver: T) -> Self {
        Self {
            driver,
            slots: core::array::from_fn(|_| None),
            queue: PendingTickQueue::new(),
            stats: TickStats::default(),
            reported_overflows: 0,
            next_generation: 0,
        }
    }

    /// Subscribe `observer` to ticks every `interval_us` microseconds.
    ///
    /// Only an exact interval match shares a timer. Returns the timer number.
    pub fn attach(&mut self, observer: DeviceId, interval_us: u32) -> Result<usize, TickError> {
        if interval_us == 0 {
            self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
            error!(%observer, "tick interval must not be zero");
            return Err(TickError::InvalidInterval);
        }

        if let Some(timer) = self.find_timer(interval_us) {
            let generation = self.next_generation;
            let Some(slot) = self.slots[timer].as_mut() else {
                return Err(TickError::NoFreeTimer { interval_us });
            };
            if slot.contains(observer) {
                return Ok(timer);
            }
            if slot.observers.push(Attachment { observer, generation }).is_err() {
                self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
                error!(%observer, timer, interval_us, "unable to attach to timer, too many observers");
                return Err(TickError::SlotFull { interval_us });
            }
            self.next_generation = generation.wrapping_add(1);
            debug!(%observer, timer, interval_us, "attached to existing timer");
            return Ok(timer);
        }

        let Some(timer) = self.slots.iter().position(Option::is_none) else {
            self.stats.attach_failures = self.stats.attach_failures.wrapping_add(1);
            error!(%observer, interval_us, "no free timer available for interval");
            return Err(TickError::NoFreeTimer { interval_us });
        };

        let generation = self.next_generation;
        self.next_generation = generation.wrapping_add(1);
        let mut observers = Vec::new();
        // a fresh slot always has room for one
        let _ = observers.push(Attachment { observer, generation });
        self.slots[timer] = Some(TimerSlot { interval_us, observers });
        self.driver.start(timer, interval_us);
        self.stats.active_timers = self.active_timers() as u8;

        debug!(%observer, timer, interval_us, "started timer");
        Ok(timer)
    }

    /// Remove `observer` from every slot. The slots stay allocated.
    pub fn detach(&mut self, observer: DeviceId) -> bool {
        let mut removed = false;
        for slot in self.slots.iter_mut().flatten() {
            let before = slot.observers.len();
            slot.observers.retain(|a| a.observer != observer);
            removed |= slot.observers.len() != before;
        }
        if removed {
            debug!(%observer, "detached from tick handler");
        }
        removed
    }

    pub fn is_attached(&self, observer: DeviceId) -> bool {
        self.slots.iter().flatten().any(|slot| slot.contains(observer))
    }

    /// Interrupt service routine body for `timer`.
    ///
    /// Never logs: drops are only counted here and reported from the main loop.
    pub fn handle_interrupt(&mut self, timer: usize) {
        enqueue_slot(&self.slots, &mut self.queue, &mut self.stats, timer);
    }

    /// Next observer whose tick is due.
    ///
    /// A tick is only delivered while the attachment it was queued for still
    /// exists; observers that detached (and possibly re-attached) since are
    /// skipped.
    pub fn next_pending(&mut self) -> Option<DeviceId> {
        self.report_overflows();

        while let Some(tick) = self.queue.dequeue() {
            if self.is_live(&tick) {
                self.stats.ticks_dispatched = self.stats.ticks_dispatched.wrapping_add(1);
                return Some(tick.observer);
            }
            self.stats.ticks_skipped = self.stats.ticks_skipped.wrapping_add(1);
        }
        None
    }

    /// Drain every pending tick into `deliver`, in enqueue order.
    pub fn process<F>(&mut self, mut deliver: F) -> usize
    where
        F: FnMut(DeviceId),
    {
        let mut delivered = 0;
        while let Some(observer) = self.next_pending() {
            deliver(observer);
            delivered += 1;
        }
        delivered
    }

    /// Drop everything still pending.
    pub fn clean_buffer(&mut self) {
        self.queue.clear();
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, &TimerSlot)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|s| (i, s)))
    }

    pub fn active_timers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn driver(&self) -> &T {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut T {
        &mut self.driver
    }

    fn find_timer(&self, interval_us: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.interval_us == interval_us))
    }

    fn is_live(&self, tick: &PendingTick) -> bool {
        let attachment = Attachment { observer: tick.observer, generation: tick.generation };
        matches!(self.slots.get(tick.timer), Some(Some(slot)) if slot.observers.contains(&attachment))
    }

    fn report_overflows(&mut self) {
        let overflows = self.queue.overflows();
        if overflows != self.reported_overflows {
            let dropped = overflows.wrapping_sub(self.reported_overflows);
            warn!(dropped, total = overflows, "tick buffer overflow, ticks were dropped");
            self.reported_overflows = overflows;
        }
    }
}

impl TickHandler<SimulatedTimers> {
    /// Advance simulated time, running the interrupt routine for every expiry.
    pub fn advance(&mut self, elapsed_us: u64) -> u32 {
        let Self { driver, slots, queue, stats, .. } = self;
        driver.advance(elapsed_us, |timer| enqueue_slot(slots, queue, stats, timer))
    }
}

fn enqueue_slot(
    slots: &[Option<TimerSlot>; NUM_TIMERS],
    queue: &mut PendingTickQueue,
    stats: &mut TickStats,
    timer: usize,
) {
    let Some(Some(slot)) = slots.get(timer) else {
        return;
    };

    for attachment in &slot.observers {
        let tick = PendingTick { observer: attachment.observer, timer, generation: attachment.generation };
        match queue.enqueue(tick) {
            Ok(()) => stats.ticks_enqueued = stats.ticks_enqueued.wrapping_add(1),
            Err(_) => stats.ticks_dropped = stats.ticks_dropped.wrapping_add(1),
        }
    }
}

impl<T: TimerDriver> TickPort for TickHandler<T> {
    fn attach(&mut self, observer: DeviceId, interval_us: u32) -> Result<usize, TickError> {
        TickHandler::attach(self, observer, interval_us)
    }

    fn detach(&mut self, observer: DeviceId) -> bool {
        TickHandler::detach(self, observer)
    }

    fn is_attached(&self, observer: DeviceId) -> bool {
        TickHandler::is_attached(self, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> TickHandler<SimulatedTimers> {
        TickHandler::new(SimulatedTimers::new())
    }

    #[test]
    fn test_same_interval_shares_timer() {
        let mut ticks = handler();
        let a = ticks.attach(DeviceId(1), 2_000_000).unwrap();
        let b = ticks.attach(DeviceId(2), 2_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(ticks.active_timers(), 1);
        assert_eq!(ticks.driver().running(), 1);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut ticks = handler();
        assert_eq!(ticks.attach(DeviceId(1), 0), Err(TickError::InvalidInterval));
    }

    #[test]
    fn test_slot_observer_capacity() {
        let mut ticks = handler();
        for i in 0..TIMER_NUM_OBSERVERS as u16 {
            ticks.attach(DeviceId(i), 1000).unwrap();
        }
        assert_eq!(
            ticks.attach(DeviceId(100), 1000),
            Err(TickError::SlotFull { interval_us: 1000 })
        );
    }

    #[test]
    fn test_interrupt_enqueues_slot_observers() {
        let mut ticks = handler();
        let timer = ticks.attach(DeviceId(1), 1000).unwrap();
        ticks.attach(DeviceId(2), 1000).unwrap();

        ticks.handle_interrupt(timer);
        assert_eq!(ticks.pending(), 2);

        let mut seen = std::vec::Vec::new();
        ticks.process(|id| seen.push(id));
        assert_eq!(seen, vec![DeviceId(1), DeviceId(2)]);
    }

    #[test]
    fn test_detached_observer_skipped_at_dequeue() {
        let mut ticks = handler();
        let timer = ticks.attach(DeviceId(1), 1000).unwrap();
        ticks.attach(DeviceId(2), 1000).unwrap();
        ticks.handle_interrupt(timer);

        assert!(ticks.detach(DeviceId(1)));
        assert_eq!(ticks.next_pending(), Some(DeviceId(2)));
        assert_eq!(ticks.next_pending(), None);
        assert_eq!(ticks.stats().ticks_skipped, 1);
    }

    #[test]
    fn test_reattach_does_not_revive_queued_tick() {
        let mut ticks = handler();
        let timer = ticks.attach(DeviceId(1), 1000).unwrap();
        ticks.handle_interrupt(timer);

        ticks.detach(DeviceId(1));
        ticks.attach(DeviceId(1), 5000).unwrap();
        assert_eq!(ticks.next_pending(), None);

        // nor at the original interval
        ticks.detach(DeviceId(1));
        assert_eq!(ticks.attach(DeviceId(1), 1000).unwrap(), timer);
        ticks.handle_interrupt(timer);
        ticks.detach(DeviceId(1));
        ticks.attach(DeviceId(1), 1000).unwrap();
        assert_eq!(ticks.next_pending(), None);
        assert_eq!(ticks.stats().ticks_skipped, 2);

        ticks.handle_interrupt(timer);
        assert_eq!(ticks.next_pending(), Some(DeviceId(1)));
    }

    #[test]
    fn test_emptied_slot_stays_allocated() {
        let mut ticks = handler();
        let timer = ticks.attach(DeviceId(1), 5000).unwrap();
        ticks.detach(DeviceId(1));
        assert_eq!(ticks.active_timers(), 1);

        // the interval keeps its timer
        assert_eq!(ticks.attach(DeviceId(9), 5000).unwrap(), timer);
    }

    #[test]
    fn test_advance_fires_shared_timer() {
        let mut ticks = handler();
        ticks.attach(DeviceId(1), 200_000).unwrap();
        ticks.attach(DeviceId(2), 200_000).unwrap();
        ticks.attach(DeviceId(3), 1_000_000).unwrap();

        assert_eq!(ticks.advance(1_000_000), 6);
        // five expiries of the shared timer, one of the slow one
        assert_eq!(ticks.pending(), 11);
    }

    #[test]
    fn test_interrupt_for_unused_timer_is_ignored() {
        let mut ticks = handler();
        ticks.handle_interrupt(3);
        ticks.handle_interrupt(NUM_TIMERS + 4);
        assert_eq!(ticks.pending(), 0);
    }
}
