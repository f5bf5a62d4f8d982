//! The bounded task queue between the generator and the workers.
//!
//! This is the single point of backpressure in surge. A producer first
//! [`reserve`](Queue::reserve)s a slot, waiting while the queue is full, and
//! only then hands over its message. The hand-over never waits, so a message
//! is either in the queue or was never offered. `get` waits a bounded time for
//! a message.

use std::{sync::Arc, time::Duration};

use surge_payload::Message;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Errors produced by [`Queue`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// Every handle on the other side of the queue is gone.
    #[error("Queue disconnected")]
    Disconnected,
}

#[derive(Debug, Clone)]
/// A fixed-capacity, approximately FIFO message queue. Clones share the same
/// buffer.
pub struct Queue {
    sender: flume::Sender<Message>,
    receiver: flume::Receiver<Message>,
    /// One permit per free slot, reserved slots included as taken.
    slots: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug)]
/// Room for exactly one message. Dropping it unused frees the slot again.
pub struct Slot<'a> {
    sender: &'a flume::Sender<Message>,
    permit: SemaphorePermit<'a>,
}

impl Slot<'_> {
    /// Enqueue `message` into the reserved slot.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue is disconnected.
    pub fn put(self, message: Message) -> Result<(), Error> {
        // The slot is returned by whichever `get` takes the message out.
        self.permit.forget();
        self.sender.send(message).map_err(|_| Error::Disconnected)
    }
}

impl Queue {
    /// Create a queue holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Reserve room for one message, waiting while the queue is full.
    /// Cancelling the wait reserves nothing.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue is disconnected.
    pub async fn reserve(&self) -> Result<Slot<'_>, Error> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::Disconnected)?;
        Ok(Slot {
            sender: &self.sender,
            permit,
        })
    }

    /// Dequeue a message, waiting up to `timeout`. `None` when the wait ran
    /// out.
    pub async fn get(&self, timeout: Duration) -> Option<Message> {
        let message = tokio::time::timeout(timeout, self.receiver.recv_async())
            .await
            .ok()?
            .ok()?;
        self.slots.add_permits(1);
        Some(message)
    }

    /// The number of messages waiting. Racy, for reporting only.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no message is waiting. Racy, for reporting only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// The maximum number of messages the queue holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use surge_payload::Message;

    use super::Queue;

    fn message(n: usize) -> Message {
        Message {
            topic: format!("t/{n}"),
            payload: Bytes::new(),
        }
    }

    async fn put(queue: &Queue, n: usize) {
        queue
            .reserve()
            .await
            .expect("connected")
            .put(message(n))
            .expect("connected");
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let queue = Queue::new(3);
        for n in 0..3 {
            put(&queue, n).await;
        }
        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.reserve()).await;
        assert!(blocked.is_err());
        assert_eq!(queue.len(), queue.capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_slot_is_freed() {
        let queue = Queue::new(1);
        let slot = queue.reserve().await.expect("connected");
        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.reserve()).await;
        assert!(blocked.is_err());

        drop(slot);
        put(&queue, 0).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_times_out_on_empty_queue() {
        let queue = Queue::new(1);
        assert!(queue.get(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_waits_for_space() {
        let queue = Queue::new(1);
        put(&queue, 0).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { put(&queue, 1).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        let first = queue.get(Duration::from_secs(1)).await.expect("message");
        assert_eq!(first.topic, "t/0");
        producer.await.expect("producer panicked");
        let second = queue.get(Duration::from_secs(1)).await.expect("message");
        assert_eq!(second.topic, "t/1");
        assert!(queue.is_empty());
    }
}
