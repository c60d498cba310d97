//! Data frame throughput ceiling.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

/// Sliding-window limiter for Data frames.
///
/// Keeps the send times of the last `max_eps` frames. A new frame may go out
/// once the oldest of them is a full window old, so no rolling one-second
/// window ever holds more than `max_eps` frames. A ceiling of 0 disables the
/// limiter.
#[derive(Debug)]
pub struct EpsLimiter {
    max_eps: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl EpsLimiter {
    /// Creates a limiter allowing `max_eps` frames per second.
    pub fn new(max_eps: usize) -> Self {
        Self::with_window(max_eps, Duration::from_secs(1))
    }

    /// Creates a limiter over a custom window.
    pub fn with_window(max_eps: usize, window: Duration) -> Self {
        Self {
            max_eps,
            window,
            sent: VecDeque::with_capacity(max_eps.min(4096)),
        }
    }

    /// Returns true if the limiter never waits.
    pub fn is_unlimited(&self) -> bool {
        self.max_eps == 0
    }

    /// How long a frame sent at `now` would have to wait.
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() < self.max_eps {
            return Duration::ZERO;
        }
        self.sent
            .front()
            .map_or(Duration::ZERO, |oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    /// Blocks until a frame may be sent, then records it.
    pub fn acquire(&mut self) {
        if self.is_unlimited() {
            return;
        }
        loop {
            let now = Instant::now();
            let delay = self.delay_at(now);
            if delay.is_zero() {
                self.sent.push_back(now);
                return;
            }
            thread::sleep(delay);
        }
    }
}
