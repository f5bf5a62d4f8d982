//! The throughput and worker-count ramp controllers.
//!
//! Both controllers step a [`Ramp`] on a fixed interval, measured from the
//! moment the controller starts, until the target is reached. After that they
//! hold and wait for shutdown. Neither ever moves its value down.

use std::{sync::Arc, time::Duration};

use surge_throttle::{Phase, Ramp, TokenBucket};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use crate::{broker::Connect, control::Control, worker::Pool};

fn step_interval(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[derive(Debug)]
/// Raises the token bucket's rate on a schedule.
pub struct Throughput {
    ramp: Ramp,
    period: Duration,
    bucket: Arc<TokenBucket>,
    control: Arc<Control>,
    shutdown: surge_signal::Watcher,
}

impl Throughput {
    /// Create a new [`Throughput`] controller. The bucket is set to the
    /// ramp's current value immediately.
    #[must_use]
    pub fn new(
        ramp: Ramp,
        period: Duration,
        bucket: Arc<TokenBucket>,
        control: Arc<Control>,
        shutdown: surge_signal::Watcher,
    ) -> Self {
        bucket.set_rate(ramp.current());
        control.rate_raised(ramp.current());
        Self {
            ramp,
            period,
            bucket,
            control,
            shutdown,
        }
    }

    /// Run the controller until the shutdown signal is received.
    pub async fn spin(mut self) {
        info!(
            "Throughput ramp: {initial} -> {target} msg/s, +{step} every {secs}s",
            initial = self.ramp.initial(),
            target = self.ramp.target(),
            step = self.ramp.step(),
            secs = self.period.as_secs(),
        );
        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        let mut interval = step_interval(self.period);

        while self.ramp.phase() != Phase::AtTarget {
            tokio::select! {
                _ = interval.tick() => {
                    let rate = self.ramp.advance();
                    self.bucket.set_rate(rate);
                    self.control.rate_raised(rate);
                    info!(
                        "Throughput increased to {rate} msg/s (target {target})",
                        target = self.ramp.target()
                    );
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }

        info!("Target throughput of {} msg/s reached", self.ramp.target());
        shutdown_wait.await;
        info!("shutdown signal received");
    }
}

#[derive(Debug)]
/// Grows the worker pool on a schedule.
pub struct Workers<C> {
    ramp: Ramp,
    period: Duration,
    stagger: Duration,
    pool: Pool<C>,
    shutdown: surge_signal::Watcher,
}

impl<C> Workers<C>
where
    C: Connect,
{
    /// Create a new [`Workers`] controller around an empty pool.
    #[must_use]
    pub fn new(
        ramp: Ramp,
        period: Duration,
        stagger: Duration,
        pool: Pool<C>,
        shutdown: surge_signal::Watcher,
    ) -> Self {
        Self {
            ramp,
            period,
            stagger,
            pool,
            shutdown,
        }
    }

    /// Spawn workers until the pool holds `count`, pausing `stagger` after
    /// each. Returns false if shutdown arrived meanwhile.
    async fn grow_to<F>(&mut self, count: u32, shutdown_wait: &mut F) -> bool
    where
        F: Future<Output = ()> + Unpin,
    {
        while self.pool.spawned() < count as usize {
            let id = self.pool.spawn();
            info!("Spawned worker {id} of {target}", target = self.ramp.target());
            if self.stagger.is_zero() {
                continue;
            }
            tokio::select! {
                () = time::sleep(self.stagger) => {}
                () = &mut *shutdown_wait => return false,
            }
        }
        true
    }

    /// Run the controller until the shutdown signal is received, then wait
    /// for every worker to stop.
    pub async fn spin(mut self) {
        info!(
            "Worker ramp: {initial} -> {target} workers, +{step} every {secs}s",
            initial = self.ramp.initial(),
            target = self.ramp.target(),
            step = self.ramp.step(),
            secs = self.period.as_secs(),
        );
        let shutdown = self.shutdown.clone();
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        let mut interval = step_interval(self.period);

        let mut running = self.grow_to(self.ramp.current(), &mut shutdown_wait).await;
        while running && self.ramp.phase() != Phase::AtTarget {
            tokio::select! {
                _ = interval.tick() => {
                    let count = self.ramp.advance();
                    info!(
                        "Scaling workers to {count} (target {target})",
                        target = self.ramp.target()
                    );
                    running = self.grow_to(count, &mut shutdown_wait).await;
                }
                () = &mut shutdown_wait => running = false,
            }
        }

        if running {
            info!("Target of {} workers reached", self.ramp.target());
            shutdown_wait.await;
        }
        info!("shutdown signal received, waiting for workers");
        self.pool.join().await;
    }
}

#[cfg(test)]
mod test {
    use std::{num::NonZeroU32, sync::Arc, time::Duration};

    use surge_throttle::{Ramp, TokenBucket};

    use crate::{
        broker::{Qos, memory::Memory},
        control::Control,
        queue::Queue,
        worker::{Pool, Shared},
    };

    use super::{Throughput, Workers};

    fn ramp(initial: u32, target: u32, step: u32) -> Ramp {
        Ramp::new(initial, target, NonZeroU32::new(step).expect("non-zero step"))
            .expect("valid ramp")
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_reaches_target_after_five_steps() {
        let bucket = Arc::new(TokenBucket::new(1));
        let control = Arc::new(Control::new(10, 500, 20));
        let (watcher, broadcaster) = surge_signal::signal();
        let controller = Throughput::new(
            ramp(10, 500, 100),
            Duration::from_secs(45),
            Arc::clone(&bucket),
            Arc::clone(&control),
            watcher,
        );
        assert_eq!(bucket.rate(), 10);
        let handle = tokio::spawn(controller.spin());

        let mut observed = Vec::new();
        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            observed.push(bucket.rate());
        }
        assert_eq!(observed, vec![110, 210, 310, 410, 500, 500, 500]);
        assert_eq!(control.snapshot().current_rate, 500);

        broadcaster.signal();
        handle.await.expect("controller panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn workers_reach_target_after_five_steps() {
        let broker = Memory::default();
        let control = Arc::new(Control::new(10, 10, 20));
        let shared = Shared {
            queue: Queue::new(10),
            bucket: Arc::new(TokenBucket::new(10)),
            control: Arc::clone(&control),
            qos: Qos::AtMostOnce,
            dequeue_timeout: Duration::from_millis(500),
        };
        let (watcher, broadcaster) = surge_signal::signal();
        let pool = Pool::new(Arc::new(broker.clone()), shared, watcher.clone());
        let controller = Workers::new(
            ramp(2, 20, 4),
            Duration::from_secs(30),
            Duration::from_millis(100),
            pool,
            watcher,
        );
        let handle = tokio::spawn(controller.spin());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(control.snapshot().current_workers, 2);

        let mut observed = Vec::new();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let snapshot = control.snapshot();
            assert!(snapshot.current_workers <= snapshot.target_workers);
            observed.push(snapshot.current_workers);
        }
        assert_eq!(observed, vec![6, 10, 14, 18, 20, 20]);
        assert_eq!(broker.connections(), 20);
        assert_eq!(control.snapshot().active_workers, 20);

        broadcaster.signal_and_wait().await;
        handle.await.expect("controller panicked");
        assert_eq!(control.snapshot().active_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_staggered_spawn() {
        let broker = Memory::default();
        let control = Arc::new(Control::new(10, 10, 10));
        let shared = Shared {
            queue: Queue::new(10),
            bucket: Arc::new(TokenBucket::new(10)),
            control: Arc::clone(&control),
            qos: Qos::AtMostOnce,
            dequeue_timeout: Duration::from_millis(500),
        };
        let (watcher, broadcaster) = surge_signal::signal();
        let pool = Pool::new(Arc::new(broker), shared, watcher.clone());
        let controller = Workers::new(
            ramp(10, 10, 1),
            Duration::from_secs(30),
            Duration::from_secs(2),
            pool,
            watcher,
        );
        let handle = tokio::spawn(controller.spin());

        tokio::time::sleep(Duration::from_secs(3)).await;
        broadcaster.signal();
        handle.await.expect("controller panicked");
        assert_eq!(control.snapshot().current_workers, 2);
    }
}
