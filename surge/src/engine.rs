//! The publishing engine.
//!
//! Wires a run together: one generator, one queue, one token bucket, the two
//! ramp controllers, the monitor and the worker pool. Every task stops on the
//! shutdown signal; messages still queued at that point are dropped.

use std::sync::Arc;

use surge_throttle::TokenBucket;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::{
    broker::Connect,
    config::{self, Config},
    control::{Control, Snapshot},
    generator::Generator,
    monitor::Monitor,
    queue::Queue,
    ramp,
    worker::{Pool, Shared},
};

/// Errors produced by [`Engine`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration does not describe a runnable load.
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
}

#[derive(Debug)]
/// A configured run against one broker.
pub struct Engine<C> {
    config: Config,
    connector: Arc<C>,
    shutdown: surge_signal::Watcher,
}

impl<C> Engine<C>
where
    C: Connect,
{
    /// Create a new [`Engine`].
    #[must_use]
    pub fn new(config: Config, connector: C, shutdown: surge_signal::Watcher) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            shutdown,
        }
    }

    /// Run until the shutdown signal is received, returning the final
    /// counters.
    ///
    /// # Errors
    ///
    /// Function will error if the ramp settings are invalid.
    pub async fn run(self) -> Result<Snapshot, Error> {
        let Self {
            config,
            connector,
            shutdown,
        } = self;

        let rate_ramp = config.rate_ramp()?;
        let worker_ramp = config.worker_ramp()?;
        info!(
            "Starting load: {initial} -> {target} msg/s (step {step} every {rate_secs}s), \
             {workers} -> {target_workers} workers (step {worker_step} every {worker_secs}s)",
            initial = rate_ramp.initial(),
            target = rate_ramp.target(),
            step = rate_ramp.step(),
            rate_secs = config.rate_interval_seconds,
            workers = worker_ramp.initial(),
            target_workers = worker_ramp.target(),
            worker_step = worker_ramp.step(),
            worker_secs = config.worker_interval_seconds,
        );

        let control = Arc::new(Control::new(
            rate_ramp.initial(),
            rate_ramp.target(),
            worker_ramp.target(),
        ));
        let queue = Queue::new(config.queue_capacity as usize);
        let bucket = Arc::new(TokenBucket::new(rate_ramp.initial()));

        let mut tasks = JoinSet::new();
        tasks.spawn(
            Generator::new(
                config.seed,
                &config.payload,
                queue.clone(),
                Arc::clone(&control),
                shutdown.clone(),
            )
            .spin(),
        );
        tasks.spawn(
            ramp::Throughput::new(
                rate_ramp,
                config.rate_interval(),
                Arc::clone(&bucket),
                Arc::clone(&control),
                shutdown.clone(),
            )
            .spin(),
        );
        let pool = Pool::new(
            connector,
            Shared {
                queue: queue.clone(),
                bucket: Arc::clone(&bucket),
                control: Arc::clone(&control),
                qos: config.qos,
                dequeue_timeout: config.dequeue_timeout(),
            },
            shutdown.clone(),
        );
        tasks.spawn(
            ramp::Workers::new(
                worker_ramp,
                config.worker_interval(),
                config.connect_stagger(),
                pool,
                shutdown.clone(),
            )
            .spin(),
        );
        tasks.spawn(
            Monitor::new(
                Arc::clone(&control),
                queue.clone(),
                bucket,
                config.monitor_interval(),
                shutdown,
            )
            .spin(),
        );

        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!("Could not join engine task: {err}");
            }
        }

        if !queue.is_empty() {
            info!("Dropping {} queued messages", queue.len());
        }
        let last = control.snapshot();
        info!(
            "Final status: workers {}/{}, rate {}/{} msg/s, created {}, published {}, failed {}",
            last.current_workers,
            last.target_workers,
            last.current_rate,
            last.target_rate,
            last.created,
            last.published,
            last.failed,
        );
        Ok(last)
    }
}
