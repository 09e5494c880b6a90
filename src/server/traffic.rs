use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct TrafficSample {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Byte counters for all connections of a server. Reads and writes are metered per chunk into
///  'current' counters, which a sampler moves into totals and 'last second' values at a fixed
///  interval.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    current_read: AtomicU64,
    current_written: AtomicU64,

    total_read: AtomicU64,
    total_written: AtomicU64,

    last_read: AtomicU64,
    last_written: AtomicU64,

    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> TrafficCounters {
        TrafficCounters::default()
    }

    pub fn add_read(&self, num_bytes: usize) {
        self.current_read.fetch_add(num_bytes as u64, Ordering::Relaxed);
        self.inbound.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn add_written(&self, num_bytes: usize) {
        self.current_written.fetch_add(num_bytes as u64, Ordering::Relaxed);
        self.outbound.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    /// Moves the current counters into the totals and publishes them as the most recent sample
    pub fn sample(&self) -> TrafficSample {
        let read_bytes = self.current_read.swap(0, Ordering::Relaxed);
        let written_bytes = self.current_written.swap(0, Ordering::Relaxed);

        self.total_read.fetch_add(read_bytes, Ordering::Relaxed);
        self.total_written.fetch_add(written_bytes, Ordering::Relaxed);
        self.last_read.store(read_bytes, Ordering::Relaxed);
        self.last_written.store(written_bytes, Ordering::Relaxed);

        TrafficSample { read_bytes, written_bytes }
    }

    /// bytes metered since the last sample
    pub fn current(&self) -> TrafficSample {
        TrafficSample {
            read_bytes: self.current_read.load(Ordering::Relaxed),
            written_bytes: self.current_written.load(Ordering::Relaxed),
        }
    }

    /// the values of the most recent sample
    pub fn last_sample(&self) -> TrafficSample {
        TrafficSample {
            read_bytes: self.last_read.load(Ordering::Relaxed),
            written_bytes: self.last_written.load(Ordering::Relaxed),
        }
    }

    /// sum of all samples taken so far
    pub fn totals(&self) -> TrafficSample {
        TrafficSample {
            read_bytes: self.total_read.load(Ordering::Relaxed),
            written_bytes: self.total_written.load(Ordering::Relaxed),
        }
    }

    /// inbound bytes since the previous call
    pub fn take_inbound(&self) -> u64 {
        self.inbound.swap(0, Ordering::Relaxed)
    }

    /// outbound bytes since the previous call
    pub fn take_outbound(&self) -> u64 {
        self.outbound.swap(0, Ordering::Relaxed)
    }

    pub(crate) async fn run_sampler(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    let sample = self.sample();
                    trace!("traffic: {:?}", sample);
                }
            }
        }
        debug!("traffic sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample() {
        let counters = TrafficCounters::new();
        counters.add_read(100);
        counters.add_read(20);
        counters.add_written(7);

        assert_eq!(counters.current(), TrafficSample { read_bytes: 120, written_bytes: 7 });
        assert_eq!(counters.totals(), TrafficSample::default());

        assert_eq!(counters.sample(), TrafficSample { read_bytes: 120, written_bytes: 7 });
        assert_eq!(counters.current(), TrafficSample::default());
        assert_eq!(counters.last_sample(), TrafficSample { read_bytes: 120, written_bytes: 7 });

        counters.add_read(1);
        counters.sample();
        assert_eq!(counters.last_sample(), TrafficSample { read_bytes: 1, written_bytes: 0 });
        assert_eq!(counters.totals(), TrafficSample { read_bytes: 121, written_bytes: 7 });

        assert_eq!(counters.take_inbound(), 121);
        assert_eq!(counters.take_inbound(), 0);
        assert_eq!(counters.take_outbound(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler() {
        let counters = Arc::new(TrafficCounters::new());
        let shutdown = CancellationToken::new();
        let sampler = tokio::spawn(counters.clone().run_sampler(Duration::from_secs(1), shutdown.clone()));

        counters.add_read(500);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counters.last_sample().read_bytes, 500);
        assert_eq!(counters.current().read_bytes, 0);

        counters.add_written(30);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counters.last_sample(), TrafficSample { read_bytes: 0, written_bytes: 30 });
        assert_eq!(counters.totals(), TrafficSample { read_bytes: 500, written_bytes: 30 });

        shutdown.cancel();
        sampler.await.unwrap();
    }
}
