//! Advisory per-stream pacing.
//!
//! A [`Pacer`] never sleeps. It tracks how many bytes a stream has sent
//! since its start instant and answers whether the stream is still within
//! its budget. The data-plane loop skips throttled senders and a periodic
//! pacing timer re-evaluates them, so one slow stream never blocks the loop.
//!
//! Budget arithmetic is integer-only: the allowance after `t` nanoseconds at
//! `rate` bits per second is `rate * t / 8e9` bytes.

use tokio::time::Instant;

const NANOS_PER_BYTE_SECOND: u128 = 8_000_000_000;

/// Sending budget of one stream.
///
/// # Examples
///
/// ```
/// use tperf::pacing::Pacer;
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let start = Instant::now();
/// let mut pacer = Pacer::new(8_000, start); // 1000 bytes per second
/// assert!(pacer.green_light(start));
///
/// pacer.record(1000);
/// assert!(!pacer.green_light(start + Duration::from_millis(500)));
/// assert!(pacer.green_light(start + Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Pacer {
    /// Target rate in bits per second
    rate: u64,
    started: Instant,
    bytes: u64,
}

impl Pacer {
    pub fn new(rate: u64, now: Instant) -> Self {
        Self {
            rate,
            started: now,
            bytes: 0,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Accounts bytes handed to the socket.
    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    /// Bytes the stream may have sent by `now`.
    pub fn allowance(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_nanos();
        let allowed = self.rate as u128 * elapsed / NANOS_PER_BYTE_SECOND;
        allowed.min(u64::MAX as u128) as u64
    }

    /// Whether the stream may attempt another send at `now`.
    pub fn green_light(&self, now: Instant) -> bool {
        self.rate == 0 || self.bytes <= self.allowance(now)
    }

    /// Starts a fresh budget, used when the warm-up period ends.
    pub fn restart(&mut self, now: Instant) {
        self.started = now;
        self.bytes = 0;
    }
}
