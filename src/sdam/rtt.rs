//! The round-trip time monitor: a loop on its own dedicated connection, sampling a plain polling
//! probe's latency into an exponentially-weighted moving average (spec §4.2).

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bson::doc;

use crate::{
    cmap::{Connection, ConnectionFactory},
    error::Result,
    hello::LEGACY_HELLO_COMMAND_NAME,
    options::ServerAddress,
    runtime,
};

/// The smoothing factor for the EWMA (spec §4.2, §6 — not configurable).
const ALPHA: f64 = 0.2;

struct State {
    connection: Option<Box<dyn Connection>>,
    average: Option<Duration>,
}

/// Maintains `average_round_trip_time` on a connection separate from the heartbeat connection, so
/// a streaming heartbeat's server-side wait (`maxAwaitTimeMS`) never contaminates the RTT signal.
pub(crate) struct RoundTripTimeMonitor {
    address: ServerAddress,
    connection_factory: Arc<dyn ConnectionFactory>,
    connect_timeout: Duration,
    state: Mutex<State>,
    disposed: Arc<std::sync::atomic::AtomicBool>,
}

impl RoundTripTimeMonitor {
    pub(crate) fn new(
        address: ServerAddress,
        connection_factory: Arc<dyn ConnectionFactory>,
        connect_timeout: Duration,
    ) -> Self {
        RoundTripTimeMonitor {
            address,
            connection_factory,
            connect_timeout,
            state: Mutex::new(State {
                connection: None,
                average: None,
            }),
            disposed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// A thread-safe read of the current average; `None` until the first successful sample.
    pub(crate) fn average(&self) -> Option<Duration> {
        self.state.lock().unwrap().average
    }

    /// Folds a new sample into the EWMA: `avg <- alpha*d + (1-alpha)*avg`, or seeds `avg = d` on
    /// the first sample.
    pub(crate) fn add_sample(&self, sample: Duration) {
        let mut state = self.state.lock().unwrap();
        state.average = Some(match state.average {
            None => sample,
            Some(avg) => {
                let avg_secs = avg.as_secs_f64();
                let sample_secs = sample.as_secs_f64();
                Duration::from_secs_f64(ALPHA * sample_secs + (1.0 - ALPHA) * avg_secs)
            }
        });
    }

    /// Clears the running average; the next sample re-seeds it.
    pub(crate) fn reset(&self) {
        self.state.lock().unwrap().average = None;
    }

    /// Runs the sampling loop until disposed. Intended to be spawned as its own background task
    /// by [`super::monitor::ServerMonitor::initialize`].
    pub(crate) async fn run(self: Arc<Self>, heartbeat_interval: Duration) {
        loop {
            if self.disposed.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }

            if let Err(e) = self.sample_once().await {
                let _ = e;
                // Connection already cleared by `sample_once`; skip this sample and retry on
                // the next tick rather than tearing down the loop.
            }

            runtime::delay_for(heartbeat_interval).await;
        }
    }

    async fn sample_once(&self) -> Result<()> {
        let needs_open = self.state.lock().unwrap().connection.is_none();

        if needs_open {
            let start = Instant::now();
            let result = self
                .connection_factory
                .connect(&self.address, self.connect_timeout)
                .await;
            let mut state = self.state.lock().unwrap();
            match result {
                Ok(conn) => {
                    state.connection = Some(conn);
                    drop(state);
                    self.add_sample(start.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    state.connection = None;
                    return Err(e);
                }
            }
        }

        let mut conn = self.state.lock().unwrap().connection.take();
        let result = match conn.as_mut() {
            Some(conn) => {
                let start = Instant::now();
                let res = conn
                    .command(doc! { LEGACY_HELLO_COMMAND_NAME: 1 }, false)
                    .await;
                res.map(|_| start.elapsed())
            }
            None => return Ok(()),
        };

        let mut state = self.state.lock().unwrap();
        match result {
            Ok(elapsed) => {
                state.connection = conn;
                drop(state);
                self.add_sample(elapsed);
                Ok(())
            }
            Err(e) => {
                state.connection = None;
                Err(e)
            }
        }
    }

    /// Marks the loop for exit and closes the dedicated connection, ignoring close errors.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.state.lock().unwrap().connection = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmap::test::{MockConnectionFactory, MockReply};

    fn addr() -> ServerAddress {
        ServerAddress::parse("localhost:27017").unwrap()
    }

    #[test]
    fn first_sample_seeds_average() {
        let monitor = RoundTripTimeMonitor::new(addr(), Arc::new(MockConnectionFactory::new(vec![])), Duration::from_secs(1));
        assert_eq!(monitor.average(), None);
        monitor.add_sample(Duration::from_millis(100));
        assert_eq!(monitor.average(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn ewma_converges_toward_repeated_sample() {
        let monitor = RoundTripTimeMonitor::new(addr(), Arc::new(MockConnectionFactory::new(vec![])), Duration::from_secs(1));
        monitor.add_sample(Duration::from_millis(100));
        for _ in 0..50 {
            monitor.add_sample(Duration::from_millis(200));
        }
        let avg = monitor.average().unwrap();
        assert!((avg.as_millis() as i64 - 200).abs() < 2);
    }

    #[test]
    fn reset_clears_average() {
        let monitor = RoundTripTimeMonitor::new(addr(), Arc::new(MockConnectionFactory::new(vec![])), Duration::from_secs(1));
        monitor.add_sample(Duration::from_millis(100));
        monitor.reset();
        assert_eq!(monitor.average(), None);
    }

    #[tokio::test]
    async fn sample_once_opens_then_polls() {
        let factory = MockConnectionFactory::new(vec![vec![
            MockReply::Reply { body: doc! { "ok": 1.0 }, more_to_come: false },
            MockReply::Reply { body: doc! { "ok": 1.0 }, more_to_come: false },
        ]]);
        let monitor = RoundTripTimeMonitor::new(addr(), Arc::new(factory), Duration::from_secs(1));

        monitor.sample_once().await.unwrap();
        assert!(monitor.average().is_some());

        monitor.sample_once().await.unwrap();
        assert!(monitor.average().is_some());
    }
}
