use crate::config::NUM_TIMERS;

/// The periodic hardware timers behind the tick scheduler.
pub trait TimerDriver {
    /// Start `timer` firing every `interval_us` microseconds.
    fn start(&mut self, timer: usize, interval_us: u32);
    fn stop(&mut self, timer: usize);
}

#[derive(Debug, Clone, Copy)]
struct SimTimer {
    interval_us: u32,
    next_due_us: u64,
}

/// Timers driven by simulated time instead of a clock peripheral.
#[derive(Debug)]
pub struct SimulatedTimers {
    timers: [Option<SimTimer>; NUM_TIMERS],
    now_us: u64,
}

impl SimulatedTimers {
    pub fn new() -> Self {
        Self { timers: [None; NUM_TIMERS], now_us: 0 }
    }

    /// Move time forward, calling `on_fire` for each expiry in chronological
    /// order (ties are resolved by timer number).
    ///
    /// Returns the number of expiries.
    pub fn advance<F>(&mut self, elapsed_us: u64, mut on_fire: F) -> u32
    where
        F: FnMut(usize),
    {
        let target = self.now_us.saturating_add(elapsed_us);
        let mut fired = 0u32;

        loop {
            let next = self
                .timers
                .iter()
                .enumerate()
                .filter_map(|(index, timer)| timer.map(|t| (t.next_due_us, index)))
                .filter(|(due, _)| *due <= target)
                .min();

            let Some((due, index)) = next else { break };

            self.now_us = due;
            if let Some(timer) = self.timers[index].as_mut() {
                timer.next_due_us = due + u64::from(timer.interval_us);
            }
            on_fire(index);
            fired = fired.wrapping_add(1);
        }

        self.now_us = target;
        fired
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn interval(&self, timer: usize) -> Option<u32> {
        self.timers.get(timer).copied().flatten().map(|t| t.interval_us)
    }

    pub fn running(&self) -> usize {
        self.timers.iter().filter(|t| t.is_some()).count()
    }
}

impl Default for SimulatedTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDriver for SimulatedTimers {
    fn start(&mut self, timer: usize, interval_us: u32) {
        if interval_us == 0 {
            return;
        }
        if let Some(slot) = self.timers.get_mut(timer) {
            *slot = Some(SimTimer {
                interval_us,
                next_due_us: self.now_us + u64::from(interval_us),
            });
        }
    }

    fn stop(&mut self, timer: usize) {
        if let Some(slot) = self.timers.get_mut(timer) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_periodically() {
        let mut timers = SimulatedTimers::new();
        timers.start(0, 200_000);

        let mut fired = 0;
        let count = timers.advance(1_000_000, |_| fired += 1);
        assert_eq!(count, 5);
        assert_eq!(fired, 5);
    }

    #[test]
    fn test_chronological_order_across_timers() {
        let mut timers = SimulatedTimers::new();
        timers.start(0, 300);
        timers.start(1, 200);

        let mut order = std::vec::Vec::new();
        timers.advance(600, |timer| order.push(timer));
        // t=200 (1), t=300 (0), t=400 (1), t=600 (0 then 1)
        assert_eq!(order, vec![1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_partial_periods_carry_over() {
        let mut timers = SimulatedTimers::new();
        timers.start(2, 1000);
        assert_eq!(timers.advance(600, |_| {}), 0);
        assert_eq!(timers.advance(600, |_| {}), 1);
        assert_eq!(timers.now_us(), 1200);
    }

    #[test]
    fn test_stopped_timer_is_silent() {
        let mut timers = SimulatedTimers::new();
        timers.start(0, 100);
        timers.stop(0);
        assert_eq!(timers.advance(1000, |_| {}), 0);
        assert_eq!(timers.running(), 0);
    }
}
