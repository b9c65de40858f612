//! Heartbeat pacing: a drift-free [`Metronome`] for the outer loop's normal cadence, and a
//! [`HeartbeatDelay`] one-shot sleep that can be woken early without undercutting the configured
//! minimum interval (spec §4.4).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::Notify;

/// Paces the outer heartbeat loop. Each call to [`Metronome::next_tick_delay`] advances the
/// schedule by exactly one period, so a run of slow iterations doesn't push later ticks later
/// still — the schedule, not the last completion time, is authoritative.
pub(crate) struct Metronome {
    period: Duration,
    next_tick: Instant,
}

impl Metronome {
    /// The first tick is immediate (spec §4.1: monitoring begins with an immediate probe);
    /// subsequent ticks follow `period` from there.
    pub(crate) fn new(period: Duration) -> Self {
        Metronome {
            period,
            next_tick: Instant::now(),
        }
    }

    /// Returns how long to wait before the next tick and advances the schedule.
    pub(crate) fn next_tick_delay(&mut self) -> Duration {
        let delay = self.next_tick.saturating_duration_since(Instant::now());
        self.next_tick += self.period;
        delay
    }
}

/// A one-shot sleep that normally completes after `delay`, but can be told to complete sooner via
/// [`HeartbeatDelay::request_early_wake`] — though never sooner than `min_delay` after
/// construction — and can be cancelled outright via [`HeartbeatDelay::dispose`].
///
/// The outer loop owns exactly one of these at a time; replacing it is a matter of constructing a
/// new one and dropping the old (spec §4.4).
pub(crate) struct HeartbeatDelay {
    deadline: Instant,
    min_ready_at: Instant,
    woken: AtomicBool,
    disposed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl HeartbeatDelay {
    pub(crate) fn new(delay: Duration, min_delay: Duration) -> Self {
        let now = Instant::now();
        HeartbeatDelay {
            deadline: now + delay,
            min_ready_at: now + min_delay,
            woken: AtomicBool::new(false),
            disposed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wakes the delay early. Has no effect if already woken or disposed; the actual completion
    /// is still floored at `min_ready_at`.
    pub(crate) fn request_early_wake(&self) {
        self.woken.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Cancels the delay, causing any pending [`HeartbeatDelay::wait`] to return immediately.
    /// Idempotent.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits until the delay completes: at `deadline`, or — if woken early — at
    /// `max(now, min_ready_at)`, whichever is sooner; immediately if disposed.
    pub(crate) async fn wait(&self) {
        loop {
            // Registered before the flags are read: `Notified` records any `notify_waiters()` call
            // that happens between this line and the `.await` below, so a `request_early_wake`/
            // `dispose` landing in that window is never lost (tokio::sync::Notify's documented
            // "check condition, then await" pattern).
            let notified = self.notify.notified();

            if self.disposed.load(Ordering::SeqCst) {
                return;
            }

            let target = if self.woken.load(Ordering::SeqCst) {
                self.min_ready_at.min(self.deadline)
            } else {
                self.deadline
            };

            if Instant::now() >= target {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(target.into()) => return,
                _ = notified => continue,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn metronome_is_drift_free() {
        let mut metronome = Metronome::new(Duration::from_millis(100));
        let start = Instant::now();

        // The first tick is immediate; three more land at 100ms, 200ms, 300ms regardless of how
        // long each iteration's body took, since the schedule advances independently of `now`.
        for _ in 0..4 {
            tokio::time::sleep(metronome.next_tick_delay()).await;
        }

        assert!(Instant::now().saturating_duration_since(start) >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn early_wake_respects_min_delay() {
        let delay = HeartbeatDelay::new(Duration::from_secs(10), Duration::from_millis(50));
        let start = Instant::now();

        delay.request_early_wake();
        delay.wait().await;

        assert!(Instant::now().saturating_duration_since(start) >= Duration::from_millis(50));
        assert!(Instant::now().saturating_duration_since(start) < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn dispose_completes_immediately() {
        let delay = HeartbeatDelay::new(Duration::from_secs(10), Duration::from_secs(1));
        delay.dispose();
        delay.wait().await;
    }

    #[tokio::test]
    async fn early_wake_is_not_lost_to_a_concurrent_notify() {
        let delay = Arc::new(HeartbeatDelay::new(Duration::from_secs(5), Duration::from_millis(10)));
        let waker = delay.clone();
        let wait_task = tokio::spawn(async move { delay.wait().await });

        // Give `wait` a chance to reach its select before waking it, the window a lost
        // `notify_waiters()` would fall into if the waiter weren't registered until after the
        // flags were read.
        tokio::time::sleep(Duration::from_millis(5)).await;
        waker.request_early_wake();

        tokio::time::timeout(Duration::from_secs(1), wait_task)
            .await
            .expect("early wake must not be lost to the deadline's full 5s sleep")
            .unwrap();
    }
}
