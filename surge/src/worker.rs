//! Publishing workers.
//!
//! Each worker owns one broker connection. It pulls a message from the
//! shared queue, waits for a token from the shared bucket, then publishes. The
//! bucket is the only throttle: draining the queue is not rate limited.
//!
//! A failed publish loses that one message. A lost connection ends the
//! worker, and nothing replaces it.

use std::{sync::Arc, time::Duration};

use surge_throttle::TokenBucket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::{
    broker::{Connect, Publish, PublishError, Qos},
    control::Control,
    queue::Queue,
};

/// Everything a worker shares with its siblings.
#[derive(Debug, Clone)]
pub struct Shared {
    /// The task queue
    pub queue: Queue,
    /// The rate limit across all workers
    pub bucket: Arc<TokenBucket>,
    /// Run counters
    pub control: Arc<Control>,
    /// QoS of every publish
    pub qos: Qos,
    /// Bounded wait on an empty queue
    pub dequeue_timeout: Duration,
}

struct Worker<P> {
    id: u32,
    connection: P,
    shared: Shared,
    shutdown: surge_signal::Watcher,
}

impl<P> Worker<P>
where
    P: Publish,
{
    async fn spin(mut self) {
        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);

        loop {
            let message = tokio::select! {
                message = self.shared.queue.get(self.shared.dequeue_timeout) => message,
                () = &mut shutdown_wait => break,
            };
            let Some(message) = message else {
                continue;
            };

            tokio::select! {
                () = self.shared.bucket.wait_for_token() => {}
                () = &mut shutdown_wait => break,
            }

            trace!(worker = self.id, topic = %message.topic, "publishing");
            match self.connection.publish(message, self.shared.qos).await {
                Ok(()) => self.shared.control.message_published(),
                Err(err @ PublishError::Transient { .. }) => {
                    warn!(worker = self.id, "{err}");
                    self.shared.control.publish_failed();
                }
                Err(err @ PublishError::Connection(_)) => {
                    error!(worker = self.id, "Worker stopping: {err}");
                    self.shared.control.publish_failed();
                    self.shared.control.connection_failed();
                    return;
                }
            }
        }
        debug!(worker = self.id, "shutdown signal received");
    }
}

#[derive(Debug)]
struct Handle {
    id: u32,
    task: JoinHandle<()>,
}

#[derive(Debug)]
/// An append-only set of workers.
pub struct Pool<C> {
    connector: Arc<C>,
    shared: Shared,
    shutdown: surge_signal::Watcher,
    handles: Vec<Handle>,
}

impl<C> Pool<C>
where
    C: Connect,
{
    /// Create an empty [`Pool`].
    #[must_use]
    pub fn new(connector: Arc<C>, shared: Shared, shutdown: surge_signal::Watcher) -> Self {
        Self {
            connector,
            shared,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn one worker, returning its id. The worker connects first and
    /// only then starts consuming. A worker whose connection fails still
    /// counts as spawned.
    pub fn spawn(&mut self) -> u32 {
        let id = self.shared.control.worker_spawned();
        let connector = Arc::clone(&self.connector);
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let connect = connector.connect(id);
            let connection = tokio::select! {
                res = connect => res,
                () = shutdown.clone().recv() => return,
            };
            match connection {
                Ok(connection) => {
                    info!(worker = id, "Worker connected");
                    shared.control.worker_started();
                    let control = Arc::clone(&shared.control);
                    Worker {
                        id,
                        connection,
                        shared,
                        shutdown,
                    }
                    .spin()
                    .await;
                    control.worker_stopped();
                }
                Err(err) => {
                    error!(worker = id, "Worker failed to connect: {err}");
                    shared.control.connection_failed();
                }
            }
        });
        self.handles.push(Handle { id, task });
        id
    }

    /// The number of workers ever spawned.
    #[must_use]
    pub fn spawned(&self) -> usize {
        self.handles.len()
    }

    /// The number of worker tasks still running, connecting ones included.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.task.is_finished()).count()
    }

    /// Wait for every worker task to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.task.await {
                error!(worker = handle.id, "Could not join worker task: {err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use surge_payload::Message;
    use surge_throttle::TokenBucket;

    use crate::{
        broker::{Qos, memory::Memory},
        control::Control,
        queue::Queue,
    };

    use super::{Pool, Shared};

    fn shared(rate: u32, capacity: usize) -> Shared {
        Shared {
            queue: Queue::new(capacity),
            bucket: Arc::new(TokenBucket::new(rate)),
            control: Arc::new(Control::new(rate, rate, 4)),
            qos: Qos::AtMostOnce,
            dequeue_timeout: Duration::from_millis(100),
        }
    }

    async fn fill(queue: &Queue, control: &Control, count: usize) {
        for n in 0..count {
            let slot = queue.reserve().await.expect("connected");
            control.message_created();
            slot.put(Message {
                topic: format!("testmapper/{n}"),
                payload: Bytes::from_static(b"{}"),
            })
            .expect("connected");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_queue_at_bucket_rate() {
        let broker = Memory::default();
        let shared = shared(10, 100);
        fill(&shared.queue, &shared.control, 100).await;
        let (watcher, broadcaster) = surge_signal::signal();
        let mut pool = Pool::new(Arc::new(broker.clone()), shared.clone(), watcher);
        pool.spawn();
        pool.spawn();

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        let published = shared.control.snapshot().published;
        // Two seconds at ten per second, shared by both workers.
        assert!((19..=21).contains(&published), "published {published}");
        assert_eq!(broker.connections(), 2);
        assert_eq!(pool.active(), 2);

        broadcaster.signal();
        pool.join().await;
        assert_eq!(shared.control.snapshot().active_workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_worker_counts_as_spawned() {
        let broker = Memory::refusing(&[2]);
        let shared = shared(100, 10);
        let (watcher, broadcaster) = surge_signal::signal();
        let mut pool = Pool::new(Arc::new(broker.clone()), shared.clone(), watcher);
        assert_eq!(pool.spawn(), 1);
        assert_eq!(pool.spawn(), 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.spawned(), 2);
        assert_eq!(pool.active(), 1);
        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.current_workers, 2);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.connection_failures, 1);

        broadcaster.signal();
        pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_ends_worker_only() {
        let broker = Memory::failing_after(3);
        let shared = shared(1_000, 10);
        fill(&shared.queue, &shared.control, 10).await;
        let (watcher, broadcaster) = surge_signal::signal();
        let mut pool = Pool::new(Arc::new(broker.clone()), shared.clone(), watcher);
        pool.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.published, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.active_workers, 0);
        assert_eq!(pool.active(), 0);
        // The rest stay queued, nobody replaces the worker.
        assert_eq!(shared.queue.len(), 6);

        broadcaster.signal();
        pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_publish_keeps_worker_running() {
        let broker = Memory::rejecting_every(2);
        let shared = shared(1_000, 10);
        fill(&shared.queue, &shared.control, 10).await;
        let (watcher, broadcaster) = surge_signal::signal();
        let mut pool = Pool::new(Arc::new(broker.clone()), shared.clone(), watcher);
        pool.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = shared.control.snapshot();
        assert_eq!(snapshot.published, 5);
        assert_eq!(snapshot.failed, 5);
        assert_eq!(snapshot.connection_failures, 0);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(pool.active(), 1);
        assert!(shared.queue.is_empty());
        assert_eq!(broker.received().len(), 5);

        broadcaster.signal();
        pool.join().await;
        assert_eq!(shared.control.snapshot().active_workers, 0);
    }
}
