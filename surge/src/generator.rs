//! The payload generator task.
//!
//! Builds telemetry messages as fast as the queue accepts them. A message is
//! only built once the queue has room for it, so a full queue suspends the
//! generator until a worker makes room and generation is paced entirely by
//! the publish side.

use std::{sync::Arc, time::Duration};

use rand::{SeedableRng, rngs::StdRng};
use surge_payload::Telemetry;
use tokio::time;
use tracing::{error, info};

use crate::{control::Control, queue::Queue};

/// Pause after a message could not be built.
const BUILD_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
/// Feeds the task queue.
pub struct Generator {
    telemetry: Telemetry,
    rng: StdRng,
    queue: Queue,
    control: Arc<Control>,
    shutdown: surge_signal::Watcher,
}

impl Generator {
    /// Create a new [`Generator`].
    #[must_use]
    pub fn new(
        seed: [u8; 32],
        payload: &surge_payload::Config,
        queue: Queue,
        control: Arc<Control>,
        shutdown: surge_signal::Watcher,
    ) -> Self {
        Self {
            telemetry: Telemetry::new(payload),
            rng: StdRng::from_seed(seed),
            queue,
            control,
            shutdown,
        }
    }

    /// Run the generator until the shutdown signal is received.
    pub async fn spin(mut self) {
        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);

        loop {
            let slot = tokio::select! {
                res = self.queue.reserve() => match res {
                    Ok(slot) => slot,
                    Err(err) => {
                        error!("Generator stopping: {err}");
                        return;
                    }
                },
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            };

            let message = match self.telemetry.next_message(&mut self.rng) {
                Ok(message) => message,
                Err(err) => {
                    error!("Skipping message that could not be built: {err}");
                    drop(slot);
                    tokio::select! {
                        () = time::sleep(BUILD_ERROR_BACKOFF) => {}
                        () = &mut shutdown_wait => {
                            info!("shutdown signal received");
                            return;
                        }
                    }
                    continue;
                }
            };

            // Counted before a worker can see it, the hand-over cannot wait.
            self.control.message_created();
            if let Err(err) = slot.put(message) {
                error!("Generator stopping: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use crate::{control::Control, queue::Queue};

    use super::Generator;

    #[tokio::test(start_paused = true)]
    async fn fills_queue_then_waits() {
        let queue = Queue::new(8);
        let control = Arc::new(Control::new(10, 10, 1));
        let (watcher, broadcaster) = surge_signal::signal();
        let generator = Generator::new(
            [3; 32],
            &surge_payload::Config::default(),
            queue.clone(),
            Arc::clone(&control),
            watcher,
        );
        let handle = tokio::spawn(generator.spin());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 8);
        // Nothing is built while the queue is full.
        assert_eq!(control.snapshot().created, 8);

        let message = queue.get(Duration::from_millis(10)).await;
        assert!(message.is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 8);
        assert_eq!(control.snapshot().created, 9);

        broadcaster.signal();
        handle.await.expect("generator panicked");
        // Shutdown while waiting for room counts nothing extra.
        assert_eq!(control.snapshot().created, 9);
        assert_eq!(queue.len(), 8);
    }
}
