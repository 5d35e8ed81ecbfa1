//! Monotonic deadline scheduling for periodic work
//!
//! Deadlines advance by exactly one period each tick so jitter does not
//! accumulate. If the worker falls more than one extra period behind, the
//! schedule resynchronises to `now + period` instead of firing a burst of
//! late ticks.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Drift-corrected periodic deadline.
#[derive(Debug, Clone)]
pub struct DeadlineScheduler {
    period: Duration,
    next: Instant,
}

impl DeadlineScheduler {
    /// First deadline is one period after `now`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next
    }

    /// Time left until the next deadline, zero when overdue.
    pub fn wait_time(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Move to the following deadline after a tick fired at `now`.
    ///
    /// Returns `true` when the schedule had to be resynchronised.
    pub fn advance(&mut self, now: Instant) -> bool {
        self.next += self.period;
        if now > self.next + self.period {
            self.next = now + self.period;
            return true;
        }
        false
    }
}

/// Run `tick` on a drift-corrected schedule until `shutdown` disconnects.
///
/// Any message on `shutdown` also stops the loop. The shutdown check wakes
/// immediately, it never waits for the current period to elapse.
pub fn run_periodic(period: Duration, shutdown: &Receiver<()>, mut tick: impl FnMut()) {
    let mut scheduler = DeadlineScheduler::new(period, Instant::now());
    loop {
        let wait = scheduler.wait_time(Instant::now());
        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                tick();
                if scheduler.advance(Instant::now()) {
                    log::debug!("[schedule] resynchronised {:?} schedule", period);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlines_do_not_drift() {
        let start = Instant::now();
        let period = Duration::from_millis(50);
        let mut scheduler = DeadlineScheduler::new(period, start);

        // Tick fires 10ms late, next deadline still lands on the grid.
        let resync = scheduler.advance(start + period + Duration::from_millis(10));
        assert!(!resync);
        assert_eq!(scheduler.next_deadline(), start + period * 2);
    }

    #[test]
    fn test_resync_when_far_behind() {
        let start = Instant::now();
        let period = Duration::from_millis(50);
        let mut scheduler = DeadlineScheduler::new(period, start);

        // Worker stalled for five periods.
        let late = start + period * 5;
        assert!(scheduler.advance(late));
        assert_eq!(scheduler.next_deadline(), late + period);
    }

    #[test]
    fn test_one_period_behind_is_tolerated() {
        let start = Instant::now();
        let period = Duration::from_millis(50);
        let mut scheduler = DeadlineScheduler::new(period, start);

        // Exactly at new deadline + one period: not strictly later, no resync.
        assert!(!scheduler.advance(start + period * 3));
        assert_eq!(scheduler.next_deadline(), start + period * 2);
    }

    #[test]
    fn test_wait_time_saturates() {
        let start = Instant::now();
        let scheduler = DeadlineScheduler::new(Duration::from_millis(20), start);
        assert_eq!(
            scheduler.wait_time(start + Duration::from_secs(1)),
            Duration::ZERO
        );
        assert_eq!(scheduler.wait_time(start), Duration::from_millis(20));
    }

    #[test]
    fn test_run_periodic_stops_on_disconnect() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            let mut ticks = 0u32;
            run_periodic(Duration::from_millis(5), &rx, || ticks += 1);
            ticks
        });
        std::thread::sleep(Duration::from_millis(60));
        drop(tx);
        let ticks = handle.join().unwrap();
        assert!(ticks >= 1);
    }
}
