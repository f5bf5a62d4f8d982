//! Periodic status reports.
//!
//! The monitor only reads shared state. Its one piece of state is the
//! previous sample, from which throughput is derived.
//!
//! ## Metrics
//!
//! `actual_throughput`: Messages published per second over the last period
//! `queue_size`: Messages waiting to be published

use std::{fmt, sync::Arc, time::Duration};

use metrics::gauge;
use surge_throttle::TokenBucket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use crate::{
    control::{Control, Snapshot},
    queue::Queue,
};

/// Efficiency, in percent, at or above which full load counts as healthy.
const HEALTHY_EFFICIENCY: f64 = 90.0;

/// Where the run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Both ramps are at target and throughput keeps up.
    FullLoad,
    /// Both ramps are at target but throughput falls short.
    LowEfficiency,
    /// At least one ramp is still moving.
    RampingUp,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::FullLoad => "FULL LOAD REACHED",
            Status::LowEfficiency => "FULL LOAD REACHED BUT LOW EFFICIENCY",
            Status::RampingUp => "RAMPING UP",
        };
        f.write_str(s)
    }
}

/// One status report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    /// Counters at sampling time
    pub snapshot: Snapshot,
    /// Messages waiting in the queue
    pub queue_len: usize,
    /// Most messages the queue holds
    pub queue_capacity: usize,
    /// Tokens in the bucket
    pub tokens: f64,
    /// Messages published per second since the previous sample
    pub throughput: f64,
    /// `throughput` as a percentage of the permitted rate
    pub efficiency: f64,
    /// Overall status
    pub status: Status,
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part / whole * 100.0 } else { 0.0 }
}

impl Report {
    /// Log the report as a status block.
    pub fn log(&self) {
        let s = &self.snapshot;
        info!("{}", "=".repeat(80));
        info!("LOAD TEST STATUS:");
        info!("  Messages Created: {}", s.created);
        info!("  Messages Published: {}", s.published);
        info!("  Publish Failures: {}", s.failed);
        info!("  Queue Size: {}/{}", self.queue_len, self.queue_capacity);
        info!(
            "  Current Rate: {}/{} ({:.1}%)",
            s.current_rate,
            s.target_rate,
            percent(f64::from(s.current_rate), f64::from(s.target_rate))
        );
        info!(
            "  Actual Throughput: {:.1} (Efficiency: {:.1}%)",
            self.throughput, self.efficiency
        );
        info!(
            "  Current Workers: {}/{} ({:.1}%)",
            s.current_workers,
            s.target_workers,
            percent(f64::from(s.current_workers), f64::from(s.target_workers))
        );
        info!("  Active Workers: {}", s.active_workers);
        info!("  Token Bucket Tokens: {:.2}", self.tokens);
        info!("  STATUS: {}", self.status);
        info!("{}", "=".repeat(80));
    }
}

#[derive(Debug)]
/// Samples run state on a fixed period and logs it.
pub struct Monitor {
    control: Arc<Control>,
    queue: Queue,
    bucket: Arc<TokenBucket>,
    period: Duration,
    previous_published: u64,
    previous_at: Instant,
    shutdown: surge_signal::Watcher,
}

impl Monitor {
    /// Create a new [`Monitor`]. The first report covers the time since
    /// creation.
    #[must_use]
    pub fn new(
        control: Arc<Control>,
        queue: Queue,
        bucket: Arc<TokenBucket>,
        period: Duration,
        shutdown: surge_signal::Watcher,
    ) -> Self {
        let previous_published = control.snapshot().published;
        Self {
            control,
            queue,
            bucket,
            period,
            previous_published,
            previous_at: Instant::now(),
            shutdown,
        }
    }

    /// Take a sample at `now`, relative to the previous one.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, now: Instant) -> Report {
        let snapshot = self.control.snapshot();
        let elapsed = now.saturating_duration_since(self.previous_at).as_secs_f64();
        let delta = snapshot.published.saturating_sub(self.previous_published);
        let throughput = if elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            0.0
        };
        let efficiency = percent(throughput, f64::from(snapshot.current_rate));

        let at_target = snapshot.current_rate >= snapshot.target_rate
            && snapshot.current_workers >= snapshot.target_workers;
        let status = match (at_target, efficiency >= HEALTHY_EFFICIENCY) {
            (true, true) => Status::FullLoad,
            (true, false) => Status::LowEfficiency,
            (false, _) => Status::RampingUp,
        };

        self.previous_published = snapshot.published;
        self.previous_at = now;

        let queue_len = self.queue.len();
        gauge!("actual_throughput").set(throughput);
        gauge!("queue_size").set(queue_len as f64);

        Report {
            snapshot,
            queue_len,
            queue_capacity: self.queue.capacity(),
            tokens: self.bucket.tokens(),
            throughput,
            efficiency,
            status,
        }
    }

    /// Report every period until the shutdown signal is received.
    pub async fn spin(mut self) {
        let shutdown = self.shutdown.clone();
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                now = interval.tick() => self.sample(now).log(),
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}
