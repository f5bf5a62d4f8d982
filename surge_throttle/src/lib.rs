//! The surge throttle mechanism
//!
//! This library holds the rate limiting primitives for the rest of the surge
//! project: a shared [`TokenBucket`] every publisher draws from and the
//! fixed-step [`Ramp`] schedule that moves a control value from its initial
//! setting to its target.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use tokio::time::{self, Duration, Instant};

pub mod bucket;
pub mod ramp;

pub use bucket::TokenBucket;
pub use ramp::{Phase, Ramp};

/// The number of clock ticks in one second. A tick is one microsecond.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

#[async_trait]
/// The `Clock` used by every throttle primitive
pub trait Clock: Send + Sync {
    /// The number of ticks elapsed since the clock was created
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` amount of time
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
///
/// Time is read through tokio so that a paused runtime controls it.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of ticks since `Clock` was created.
    ///
    /// # Panics
    ///
    /// Function will panic if the number of ticks elapsed is greater than u64::MAX.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let now = Instant::now();
        let ticks_since: u128 = now.duration_since(self.start).as_micros();
        assert!(
            ticks_since <= u128::from(u64::MAX),
            "584,554 years elapsed since last call!"
        );
        ticks_since as u64
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}
