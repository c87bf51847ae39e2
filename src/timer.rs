//! Cooperative software timers.
//!
//! A [`TimerList`] never spawns anything. The data-plane loop asks it for
//! the nearest deadline, waits for readiness up to that point, and then
//! calls [`TimerList::run_due`] with the current instant. Every timer whose
//! deadline has passed fires exactly once per call: one-shot timers are
//! removed, periodic timers are re-armed one period after their previous
//! deadline. Because the clock is passed in, tests drive the list with
//! synthetic instants.

use crate::error::{ErrorCode, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Handle to a timer in a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer<E> {
    id: TimerId,
    deadline: Instant,
    delay: Duration,
    period: Duration,
    event: E,
}

/// Deadline-ordered list of timers, each carrying an event tag `E` that is
/// handed back when the timer fires.
#[derive(Debug)]
pub struct TimerList<E> {
    // Sorted by deadline; equal deadlines keep creation order.
    timers: Vec<Timer<E>>,
    next_id: u64,
}

impl<E: Copy> Default for TimerList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Copy> TimerList<E> {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 0,
        }
    }

    /// Arms a timer `delay` after `now`.
    ///
    /// A zero `period` makes a one-shot timer; otherwise the timer re-arms
    /// itself every `period` after its first expiry.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::NewTimer`] if the deadline is not representable.
    pub fn create(&mut self, now: Instant, delay: Duration, period: Duration, event: E) -> Result<TimerId> {
        let deadline = now.checked_add(delay).ok_or(ErrorCode::NewTimer)?;
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.insert(Timer {
            id,
            deadline,
            delay,
            period,
            event,
        });
        Ok(id)
    }

    /// Removes a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|t| t.id == id) {
            Some(index) => {
                self.timers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Re-arms a timer to fire one period (or its original delay, for a
    /// one-shot) after `now`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::UpdateTimer`] if the timer no longer exists.
    pub fn reset(&mut self, id: TimerId, now: Instant) -> Result<()> {
        let index = self
            .timers
            .iter()
            .position(|t| t.id == id)
            .ok_or(ErrorCode::UpdateTimer)?;
        let mut timer = self.timers.remove(index);
        let step = if timer.period.is_zero() {
            timer.delay
        } else {
            timer.period
        };
        timer.deadline = now.checked_add(step).ok_or(ErrorCode::UpdateTimer)?;
        self.insert(timer);
        Ok(())
    }

    /// Time left until the nearest deadline; `None` when no timer is armed.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.timers
            .first()
            .map(|t| t.deadline.saturating_duration_since(now))
    }

    /// The nearest deadline itself.
    pub fn next_instant(&self) -> Option<Instant> {
        self.timers.first().map(|t| t.deadline)
    }

    /// Fires every timer whose deadline is at or before `now`.
    ///
    /// Returns the events of the fired timers in deadline order.
    pub fn run_due(&mut self, now: Instant) -> Vec<E> {
        let due = self.timers.partition_point(|t| t.deadline <= now);
        let fired: Vec<Timer<E>> = self.timers.drain(..due).collect();

        let mut events = Vec::with_capacity(fired.len());
        for mut timer in fired {
            events.push(timer.event);
            if !timer.period.is_zero() {
                match timer.deadline.checked_add(timer.period) {
                    Some(deadline) => {
                        timer.deadline = deadline;
                        self.insert(timer);
                    }
                    None => log::warn!("dropping periodic timer whose next deadline overflows"),
                }
            }
        }
        events
    }

    /// Cancels every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn insert(&mut self, timer: Timer<E>) {
        let index = self.timers.partition_point(|t| t.deadline <= timer.deadline);
        self.timers.insert(index, timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ev {
        Duration,
        Stats,
        Omit,
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let start = Instant::now();
        let mut timers = TimerList::new();
        timers.create(start, ms(100), Duration::ZERO, Ev::Duration).unwrap();

        assert!(timers.run_due(start + ms(99)).is_empty());
        assert_eq!(timers.run_due(start + ms(100)), vec![Ev::Duration]);
        assert!(timers.run_due(start + ms(500)).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_periodic_rearms_from_previous_deadline() {
        let start = Instant::now();
        let mut timers = TimerList::new();
        timers.create(start, ms(100), ms(100), Ev::Stats).unwrap();

        assert_eq!(timers.run_due(start + ms(130)), vec![Ev::Stats]);
        assert_eq!(timers.next_deadline(start + ms(130)), Some(ms(70)));
        assert_eq!(timers.run_due(start + ms(200)), vec![Ev::Stats]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_fires_at_most_once_per_run() {
        let start = Instant::now();
        let mut timers = TimerList::new();
        timers.create(start, ms(10), ms(10), Ev::Stats).unwrap();

        // Far behind schedule: one fire now, the backlog drains on later runs.
        assert_eq!(timers.run_due(start + ms(45)).len(), 1);
        assert_eq!(timers.run_due(start + ms(45)).len(), 1);
        assert_eq!(timers.run_due(start + ms(45)).len(), 1);
        assert_eq!(timers.run_due(start + ms(45)).len(), 1);
        assert!(timers.run_due(start + ms(45)).is_empty());
    }

    #[test]
    fn test_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerList::new();
        timers.create(start, ms(300), Duration::ZERO, Ev::Duration).unwrap();
        timers.create(start, ms(100), Duration::ZERO, Ev::Omit).unwrap();
        timers.create(start, ms(200), Duration::ZERO, Ev::Stats).unwrap();

        assert_eq!(timers.next_deadline(start), Some(ms(100)));
        assert_eq!(
            timers.run_due(start + ms(300)),
            vec![Ev::Omit, Ev::Stats, Ev::Duration]
        );
    }

    #[test]
    fn test_cancel_and_reset() {
        let start = Instant::now();
        let mut timers = TimerList::new();
        let stats = timers.create(start, ms(100), ms(100), Ev::Stats).unwrap();
        let omit = timers.create(start, ms(50), Duration::ZERO, Ev::Omit).unwrap();

        assert!(timers.cancel(omit));
        assert!(!timers.cancel(omit));
        assert_eq!(timers.reset(omit, start).unwrap_err().code(), ErrorCode::UpdateTimer);

        timers.reset(stats, start + ms(80)).unwrap();
        assert!(timers.run_due(start + ms(100)).is_empty());
        assert_eq!(timers.run_due(start + ms(180)), vec![Ev::Stats]);
    }

    #[test]
    fn test_next_deadline_empty_and_overdue() {
        let start = Instant::now();
        let mut timers: TimerList<Ev> = TimerList::new();
        assert_eq!(timers.next_deadline(start), None);
        timers.create(start, ms(10), Duration::ZERO, Ev::Duration).unwrap();
        assert_eq!(timers.next_deadline(start + ms(50)), Some(Duration::ZERO));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: events come out in non-decreasing deadline order
            #[test]
            fn prop_fired_in_deadline_order(delays in proptest::collection::vec(0u64..1000, 1..32)) {
                let start = Instant::now();
                let mut timers = TimerList::new();
                for d in &delays {
                    timers.create(start, ms(*d), Duration::ZERO, *d).unwrap();
                }
                let fired = timers.run_due(start + ms(1000));
                prop_assert_eq!(fired.len(), delays.len());
                prop_assert!(fired.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
