//! Per-detector throttle counters
//!
//! A detector fires at most once every `interval` ticks and never while a
//! previous call is still in flight.

/// Tick counter gating one detector
#[derive(Debug, Clone)]
pub struct DetectorThrottle {
    interval: u32,
    counter: u32,
    in_flight: bool,
}

impl DetectorThrottle {
    /// The first poll fires immediately
    pub fn new(interval: u32) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            counter: interval - 1,
            in_flight: false,
        }
    }

    /// Advance one tick. Returns true when the detector should fire now,
    /// in which case the throttle is marked in flight.
    pub fn poll(&mut self) -> bool {
        self.counter = self.counter.saturating_add(1);
        if self.counter >= self.interval && !self.in_flight {
            self.counter = 0;
            self.in_flight = true;
            true
        } else {
            false
        }
    }

    /// The in-flight call delivered its result (or failed)
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }
}
