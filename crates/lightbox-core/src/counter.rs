//! Event position counter shared with the rendering context.
//!
//! The event position selects which effect the renderer shows. It lives in
//! `[min, max]`, plus the sleep value `0` that only [`EventCounter::set`]
//! can enter.
//!
//! Wrap policy: `adjust(delta)` moves the position by `delta` modulo the
//! range width, so stepping past `max` lands on `min` and stepping below
//! `min` lands on `max`. Adjusting from sleep starts just below `min`, so
//! `+1` wakes the display at `min`.

use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

/// Sleep position; the renderer blanks the panel.
pub const SLEEP_POSITION: i32 = 0;

/// Inclusive bounds of the event position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRange {
    pub min: i32,
    pub max: i32,
}

impl CounterRange {
    /// Create a range; bounds are swapped if given in the wrong order.
    pub fn new(min: i32, max: i32) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Apply the wrap policy to `current + delta`.
    pub fn wrap(&self, current: i32, delta: i32) -> i32 {
        let current = if current < self.min {
            i64::from(self.min) - 1
        } else {
            i64::from(current.min(self.max))
        };
        let span = i64::from(self.max) - i64::from(self.min) + 1;
        let offset = (current - i64::from(self.min) + i64::from(delta)).rem_euclid(span);
        // offset < span, so the sum stays within [min, max]
        (i64::from(self.min) + offset) as i32
    }
}

impl Default for CounterRange {
    fn default() -> Self {
        Self { min: 1, max: 5 }
    }
}

/// Atomic event position with wraparound.
#[derive(Debug)]
pub struct EventCounter {
    value: AtomicI32,
    range: CounterRange,
}

impl EventCounter {
    pub fn new(range: CounterRange, initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
            range,
        }
    }

    pub fn range(&self) -> CounterRange {
        self.range
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Store a position verbatim (used for sleep and error recovery).
    pub fn set(&self, value: i32) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Move by `delta` under the wrap policy and return the new position.
    pub fn adjust(&self, delta: i32) -> i32 {
        let range = self.range;
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(range.wrap(current, delta))
            })
            .unwrap_or_else(|current| current);
        range.wrap(previous, delta)
    }
}

impl Default for EventCounter {
    fn default() -> Self {
        let range = CounterRange::default();
        Self::new(range, range.min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_increment_past_max_wraps_to_min() {
        let counter = EventCounter::default();
        let seen: Vec<i32> = (0..6).map(|_| counter.adjust(1)).collect();
        assert_eq!(seen, vec![2, 3, 4, 5, 1, 2]);
    }

    #[test]
    fn test_decrement_below_min_wraps_to_max() {
        let counter = EventCounter::default();
        assert_eq!(counter.adjust(-1), 5);
        assert_eq!(counter.adjust(-1), 4);
    }

    #[test]
    fn test_large_deltas_wrap_modulo_range() {
        let counter = EventCounter::default();
        assert_eq!(counter.adjust(10), 1);
        assert_eq!(counter.adjust(-11), 5);
        assert_eq!(counter.adjust(i32::MAX), counter.range().wrap(5, i32::MAX));
    }

    #[test]
    fn test_wake_from_sleep() {
        let counter = EventCounter::default();
        counter.set(SLEEP_POSITION);
        assert_eq!(counter.adjust(1), 1);

        counter.set(SLEEP_POSITION);
        assert_eq!(counter.adjust(-1), 4);
    }

    #[test]
    fn test_zero_delta_keeps_position() {
        let counter = EventCounter::new(CounterRange::new(1, 5), 3);
        assert_eq!(counter.adjust(0), 3);
    }

    #[test]
    fn test_range_bounds_are_normalised() {
        assert_eq!(CounterRange::new(5, 1), CounterRange { min: 1, max: 5 });
    }
}
