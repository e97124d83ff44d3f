// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Presentation pacing.

use std::thread;
use std::time::{Duration, Instant};

use log::trace;

/// Largest sleep a single frame may request, in microseconds.
pub const MAX_SLEEP_US: u64 = 999_999;

/// Paces a loop to a target frame rate.
///
/// Each call compares the time since the previous call with the ideal frame
/// interval, adds back the sleep it already asked for, and feeds the result
/// through a 2:1 old:new moving average so a single late or early frame
/// cannot make the delay oscillate. Pacing is approximate by design of the
/// filter; no deadline is guaranteed.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    interval_us: Option<u64>,
    last: Option<Instant>,
    sleep_us: u64,
}

impl RateGovernor {
    /// A governor for `fps` frames per second; 0 disables pacing.
    pub fn new(fps: u32) -> Self {
        Self {
            interval_us: (fps > 0).then(|| 1_000_000 / u64::from(fps)),
            last: None,
            sleep_us: 0,
        }
    }

    pub fn is_governed(&self) -> bool {
        self.interval_us.is_some()
    }

    /// The current filtered sleep.
    pub fn sleep(&self) -> Duration {
        Duration::from_micros(self.sleep_us)
    }

    /// Sleep as needed to hold the target rate. Call once per presented
    /// frame.
    pub fn maintain_rate(&mut self) {
        if !self.is_governed() {
            return;
        }
        let now = Instant::now();
        let Some(last) = self.last.replace(now) else {
            return;
        };
        let sleep = self.next_sleep(now.duration_since(last));
        if sleep >= Duration::from_micros(1) {
            thread::sleep(sleep);
        }
    }

    /// Update the filter with the measured frame interval and return the
    /// sleep to apply. Ungoverned instances always return zero.
    pub fn next_sleep(&mut self, elapsed: Duration) -> Duration {
        let Some(interval) = self.interval_us else {
            return Duration::ZERO;
        };
        let elapsed = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
        let raw = (interval as i64)
            .saturating_sub(elapsed)
            .saturating_add(self.sleep_us as i64)
            .clamp(0, MAX_SLEEP_US as i64) as u64;
        self.sleep_us = (2 * self.sleep_us + raw) / 3;
        trace!("frame {elapsed}us, raw sleep {raw}us, filtered {}us", self.sleep_us);
        Duration::from_micros(self.sleep_us)
    }
}

/// A timestamp for measuring intervals between events.
#[derive(Debug, Clone, Copy)]
pub struct Mark(Instant);

impl Mark {
    pub fn now() -> Self {
        Mark(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Elapsed time since the mark, then move the mark to now.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.0);
        self.0 = now;
        elapsed
    }
}

impl Default for Mark {
    fn default() -> Self {
        Mark::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    #[test]
    fn test_zero_fps_is_ungoverned() {
        let mut gov = RateGovernor::new(0);
        assert!(!gov.is_governed());
        assert_eq!(gov.next_sleep(us(1)), Duration::ZERO);
        let start = Instant::now();
        gov.maintain_rate();
        gov.maintain_rate();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_steady_rate_needs_no_sleep() {
        let mut gov = RateGovernor::new(30);
        for _ in 0..100 {
            gov.next_sleep(us(33_333));
        }
        assert!(gov.sleep() <= us(1), "{:?}", gov.sleep());
    }

    #[test]
    fn test_fast_frames_converge_on_interval() {
        let mut gov = RateGovernor::new(30);
        // The loop itself takes 10ms; the elapsed time seen by the governor
        // includes the sleep it asked for.
        let mut sleep = Duration::ZERO;
        for _ in 0..200 {
            sleep = gov.next_sleep(us(10_000) + sleep);
        }
        let sleep = sleep.as_micros() as i64;
        assert!((sleep - 23_333).abs() < 500, "{sleep}");
    }

    #[test]
    fn test_bursty_intervals_are_damped() {
        let mut gov = RateGovernor::new(30);
        let mut prev = 0u64;
        for i in 0..40 {
            let elapsed = if i % 2 == 0 { 10_000 } else { 50_000 };
            let raw = (33_333i64 - elapsed + prev as i64).clamp(0, MAX_SLEEP_US as i64) as u64;
            let next = gov.next_sleep(us(elapsed as u64)).as_micros() as u64;
            if raw != prev {
                assert_ne!(next, raw, "step {i} jumped straight to the raw correction");
            }
            assert!(next.abs_diff(prev) <= raw.abs_diff(prev));
            prev = next;
        }
    }

    #[test]
    fn test_single_sleep_is_bounded() {
        let mut gov = RateGovernor::new(1);
        for _ in 0..100 {
            gov.next_sleep(Duration::ZERO);
        }
        assert!(gov.sleep() <= us(MAX_SLEEP_US));
        assert!(gov.sleep() > us(900_000));
    }

    #[test]
    fn test_mark_lap_resets() {
        let mut mark = Mark::now();
        thread::sleep(Duration::from_millis(2));
        assert!(mark.lap() >= Duration::from_millis(2));
        assert!(mark.elapsed() < Duration::from_millis(2));
    }
}
