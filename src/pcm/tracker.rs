//! Ring-buffer position tracking from a free-running hardware byte counter

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use tracing::{trace, warn};

/// Modulus of the hardware counter: it wraps back to zero at this value
pub const COUNTER_SPACE: u64 = 1 << 32;

/// Signal that the position moved and consumers should re-check the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodElapsed {
    /// Offset into the ring buffer after the update
    pub pos: u64,
    /// The counter regressed on this tick (a wrap was folded in)
    pub wrapped: bool,
}

/// Position state for one stream
///
/// The hardware reports an unbounded bytes-consumed count, not a ring offset.
/// The offset is recovered by subtracting `hw_ptr_base`, folding in the number
/// of detected wraps, and reducing modulo `buffer_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionTracker {
    /// Counter value sampled at Open/Prepare
    pub hw_ptr_base: u64,
    /// Last observed counter value
    pub prev_consumed: u64,
    /// Wraps detected since `hw_ptr_base` was last sampled
    pub n_overflow: u32,
    /// Current offset into the ring buffer
    pub pos: u64,
    /// Ring size in bytes (0 until Prepare)
    pub buffer_size: u64,
}

impl PositionTracker {
    /// Create a tracker anchored at the given counter value
    pub fn new(hw_ptr_base: u64, buffer_size: u64) -> Self {
        Self {
            hw_ptr_base,
            prev_consumed: hw_ptr_base,
            n_overflow: 0,
            pos: 0,
            buffer_size,
        }
    }

    /// Re-anchor at a freshly sampled counter value and clear overflow history
    pub fn reset(&mut self, hw_ptr_base: u64, buffer_size: u64) {
        *self = Self::new(hw_ptr_base, buffer_size);
    }

    /// Fold a new counter sample into the position
    ///
    /// Returns `None` when the counter has not moved since the last sample, so
    /// spurious ticks never produce duplicate notifications. Any movement returns
    /// `Some`; deciding whether a whole period elapsed is left to the consumer.
    pub fn update(&mut self, consumed: u64) -> Option<PeriodElapsed> {
        if consumed == self.prev_consumed {
            return None;
        }

        let wrapped = consumed < self.prev_consumed;
        if wrapped {
            self.n_overflow = self.n_overflow.wrapping_add(1);
            warn!(
                "Counter overflow: {} -> {} ({} times)",
                self.prev_consumed, consumed, self.n_overflow
            );
        }
        self.prev_consumed = consumed;
        self.pos = self.ring_offset(consumed);

        trace!(
            "consumed={} base={} overflow={} pos={}",
            consumed,
            self.hw_ptr_base,
            self.n_overflow,
            self.pos
        );

        Some(PeriodElapsed {
            pos: self.pos,
            wrapped,
        })
    }

    /// Offset of `consumed` into the ring, in 128-bit arithmetic so no count of
    /// wraps can overflow the computation itself
    fn ring_offset(&self, consumed: u64) -> u64 {
        if self.buffer_size == 0 {
            return 0;
        }
        let size = self.buffer_size as u128;
        let total = consumed as u128 + self.n_overflow as u128 * COUNTER_SPACE as u128;
        // Modular subtraction: a counter below its base degrades pos instead of trapping
        let offset = (total % size + size - self.hw_ptr_base as u128 % size) % size;
        offset as u64
    }
}

/// Lock-free home of a stream's tracker fields
///
/// The timer thread is the only writer while the timer is armed; the control
/// path writes only after the timer has been stopped and joined. Readers may
/// poll at any time: `load` retries until it sees all fields from one store.
#[derive(Debug, Default)]
pub struct PositionCell {
    /// Odd while a store is in progress
    seq: AtomicU64,
    hw_ptr_base: AtomicU64,
    prev_consumed: AtomicU64,
    n_overflow: AtomicU32,
    pos: AtomicU64,
    buffer_size: AtomicU64,
}

impl PositionCell {
    pub fn new(tracker: PositionTracker) -> Self {
        let cell = Self::default();
        cell.store(&tracker);
        cell
    }

    /// Read a consistent snapshot of all fields
    pub fn load(&self) -> PositionTracker {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let tracker = PositionTracker {
                hw_ptr_base: self.hw_ptr_base.load(Ordering::Relaxed),
                prev_consumed: self.prev_consumed.load(Ordering::Relaxed),
                n_overflow: self.n_overflow.load(Ordering::Relaxed),
                pos: self.pos.load(Ordering::Relaxed),
                buffer_size: self.buffer_size.load(Ordering::Relaxed),
            };

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return tracker;
            }
        }
    }

    /// Publish all fields (single writer)
    pub fn store(&self, tracker: &PositionTracker) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);

        self.hw_ptr_base
            .store(tracker.hw_ptr_base, Ordering::Relaxed);
        self.prev_consumed
            .store(tracker.prev_consumed, Ordering::Relaxed);
        self.n_overflow.store(tracker.n_overflow, Ordering::Relaxed);
        self.buffer_size
            .store(tracker.buffer_size, Ordering::Relaxed);
        self.pos.store(tracker.pos, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Run one tracker update against the stored state (single writer)
    pub fn tick(&self, consumed: u64) -> Option<PeriodElapsed> {
        let mut tracker = self.load();
        let elapsed = tracker.update(consumed);
        if elapsed.is_some() {
            self.store(&tracker);
        }
        elapsed
    }

    /// Current ring offset
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_progress() {
        let mut tracker = PositionTracker::new(0, 1920);
        let mut seen = Vec::new();
        for consumed in [480, 960, 1440, 1920, 2400] {
            seen.push(tracker.update(consumed).map(|e| e.pos));
        }
        assert_eq!(
            seen,
            vec![Some(480), Some(960), Some(1440), Some(0), Some(480)]
        );
        assert_eq!(tracker.n_overflow, 0);
    }

    #[test]
    fn test_offset_from_base() {
        let mut tracker = PositionTracker::new(1000, 1920);
        tracker.update(1480);
        assert_eq!(tracker.pos, 480);
    }

    #[test]
    fn test_overflow_correction() {
        let mut tracker = PositionTracker::new(0, 1920);

        tracker.update(100);
        tracker.update(4_294_967_290);
        assert_eq!(tracker.n_overflow, 0);

        let elapsed = tracker.update(50).unwrap();
        assert!(elapsed.wrapped);
        assert_eq!(tracker.n_overflow, 1);
        assert_eq!(tracker.prev_consumed, 50);
        assert_eq!(tracker.pos, (50 + COUNTER_SPACE) % 1920);
        assert_eq!(elapsed.pos, tracker.pos);
    }

    #[test]
    fn test_continuous_across_wrap() {
        // Anchored just below the wrap point, 480 bytes per tick
        let base = COUNTER_SPACE - 960;
        let mut tracker = PositionTracker::new(base, 1920);
        let mut positions = Vec::new();
        for step in 1..=4u64 {
            let consumed = (base + step * 480) % COUNTER_SPACE;
            tracker.update(consumed);
            positions.push(tracker.pos);
        }
        assert_eq!(positions, vec![480, 960, 1440, 0]);
        assert_eq!(tracker.n_overflow, 1);
    }

    #[test]
    fn test_no_movement_is_noop() {
        let mut tracker = PositionTracker::new(0, 1920);
        assert!(tracker.update(480).is_some());
        let before = tracker;
        assert!(tracker.update(480).is_none());
        assert_eq!(tracker, before);
    }

    #[test]
    fn test_malformed_input_never_traps() {
        // Counter below base with no wrap recorded
        let mut tracker = PositionTracker::new(5000, 1920);
        tracker.prev_consumed = 6000;
        tracker.update(7000);
        tracker.n_overflow = 0;
        tracker.prev_consumed = 0;
        tracker.update(10);
        assert!(tracker.pos < 1920);

        // Unconfigured ring
        let mut tracker = PositionTracker::new(0, 0);
        assert!(tracker.update(123).is_some());
        assert_eq!(tracker.pos, 0);

        // Many wraps
        let mut tracker = PositionTracker::new(0, 1920);
        tracker.n_overflow = u32::MAX - 1;
        tracker.prev_consumed = 10;
        tracker.update(5);
        assert_eq!(tracker.n_overflow, u32::MAX);
        assert!(tracker.pos < 1920);
    }

    #[test]
    fn test_pos_stays_inside_ring() {
        let mut tracker = PositionTracker::new(77, 1536);
        let mut consumed = 77u64;
        for i in 0..2000u64 {
            consumed = (consumed + 1 + (i * 7919) % 3000) % COUNTER_SPACE;
            tracker.update(consumed);
            assert!(tracker.pos < 1536);
        }
    }

    #[test]
    fn test_cell_tick_publishes() {
        let cell = PositionCell::new(PositionTracker::new(0, 1920));
        assert!(cell.tick(0).is_none());
        assert_eq!(cell.tick(480).map(|e| e.pos), Some(480));
        assert_eq!(cell.pos(), 480);
        assert_eq!(cell.load().prev_consumed, 480);
    }

    #[test]
    fn test_cell_load_never_mixes_stores() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;

        let uniform = |i: u64| PositionTracker {
            hw_ptr_base: i,
            prev_consumed: i,
            n_overflow: i as u32,
            pos: i,
            buffer_size: i,
        };
        let cell = Arc::new(PositionCell::new(uniform(0)));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let (cell, done) = (cell.clone(), done.clone());
            thread::spawn(move || {
                for i in 1..=200_000u64 {
                    cell.store(&uniform(i));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut last = 0;
        while !done.load(Ordering::SeqCst) {
            let snapshot = cell.load();
            assert_eq!(snapshot, uniform(snapshot.pos));
            assert!(snapshot.pos >= last);
            last = snapshot.pos;
        }
        writer.join().unwrap();
        assert_eq!(cell.load(), uniform(200_000));
    }
}
