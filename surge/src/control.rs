//! Shared run state.
//!
//! One [`Control`] is shared by every task of a run. Counters only grow,
//! `current_rate` and `current_workers` never decrease. All fields are atomics,
//! readers take a lock-free [`Snapshot`].
//!
//! ## Metrics
//!
//! `messages_created`: Messages enqueued by the generator
//! `messages_published`: Messages accepted by the broker
//! `publish_failure`: Messages lost to a failed publish
//! `connection_failure`: Workers whose connection failed
//! `current_rate`: Current permitted publish rate
//! `workers`: Workers spawned so far
//! `active_workers`: Workers currently consuming

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use metrics::{counter, gauge};

#[derive(Debug)]
/// Counters and ramp progress for a single run.
pub struct Control {
    created: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    connection_failures: AtomicU64,
    current_rate: AtomicU32,
    target_rate: u32,
    current_workers: AtomicU32,
    target_workers: u32,
    active_workers: AtomicU32,
}

/// A point-in-time copy of [`Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Messages enqueued
    pub created: u64,
    /// Messages published
    pub published: u64,
    /// Messages lost to a failed publish
    pub failed: u64,
    /// Workers whose connection failed
    pub connection_failures: u64,
    /// Permitted publish rate, messages per second
    pub current_rate: u32,
    /// Rate the ramp ends at
    pub target_rate: u32,
    /// Workers spawned
    pub current_workers: u32,
    /// Worker count the ramp ends at
    pub target_workers: u32,
    /// Workers currently consuming
    pub active_workers: u32,
}

impl Control {
    /// Create a new `Control` at the start of both ramps.
    #[must_use]
    pub fn new(initial_rate: u32, target_rate: u32, target_workers: u32) -> Self {
        gauge!("current_rate").set(f64::from(initial_rate));
        Self {
            created: AtomicU64::new(0),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            current_rate: AtomicU32::new(initial_rate),
            target_rate,
            current_workers: AtomicU32::new(0),
            target_workers,
            active_workers: AtomicU32::new(0),
        }
    }

    pub(crate) fn message_created(&self) {
        self.created.fetch_add(1, Ordering::Release);
        counter!("messages_created").increment(1);
    }

    pub(crate) fn message_published(&self) {
        self.published.fetch_add(1, Ordering::Release);
        counter!("messages_published").increment(1);
    }

    pub(crate) fn publish_failed(&self) {
        self.failed.fetch_add(1, Ordering::Release);
        counter!("publish_failure").increment(1);
    }

    pub(crate) fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        counter!("connection_failure").increment(1);
    }

    /// Record a new permitted rate. Lower values are ignored.
    pub(crate) fn rate_raised(&self, rate: u32) {
        let previous = self.current_rate.fetch_max(rate, Ordering::AcqRel);
        gauge!("current_rate").set(f64::from(previous.max(rate)));
    }

    /// Record one more spawned worker, returning its id. Ids start at 1.
    pub(crate) fn worker_spawned(&self) -> u32 {
        let id = self.current_workers.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("workers").set(f64::from(id));
        id
    }

    pub(crate) fn worker_started(&self) {
        let active = self.active_workers.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("active_workers").set(f64::from(active));
    }

    pub(crate) fn worker_stopped(&self) {
        let active = self.active_workers.fetch_sub(1, Ordering::AcqRel) - 1;
        gauge!("active_workers").set(f64::from(active));
    }

    /// Take a snapshot of every counter.
    ///
    /// `published` is read before `created`, so `published <= created` holds
    /// in every snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let published = self.published.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        Snapshot {
            created,
            published,
            failed,
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            current_rate: self.current_rate.load(Ordering::Acquire),
            target_rate: self.target_rate,
            current_workers: self.current_workers.load(Ordering::Acquire),
            target_workers: self.target_workers,
            active_workers: self.active_workers.load(Ordering::Acquire),
        }
    }
}
