//! Token bucket
//!
//! Every publish, across every worker, draws one token from the same bucket.
//! The bucket refills continuously at `rate` tokens per second and never holds
//! more than one second's worth of tokens. The rate may be changed at any
//! time; the change is seen by the very next request.
//!
//! Waiters are served in arrival order. Only the waiter at the head of the
//! line sleeps on the bucket, everyone else queues behind it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::{Clock, RealClock, TICKS_PER_SECOND};

/// The longest a waiter sleeps between attempts, in ticks.
const MAXIMUM_POLL_TICKS: u64 = 10_000;

#[derive(Debug)]
/// A token bucket shared by all publishers.
///
/// The refill-then-consume sequence happens under a single lock so that no
/// two callers can spend the same token.
pub struct TokenBucket<C = RealClock> {
    valve: Mutex<Valve>,
    /// FIFO queue of `wait_for_token` callers.
    line: AsyncMutex<()>,
    /// The clock that `TokenBucket` will use.
    clock: C,
}

impl TokenBucket<RealClock> {
    /// Create a new `TokenBucket` refilling at `rate` tokens per second
    /// against real time.
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self::with_clock(rate, RealClock::default())
    }
}

impl<C> TokenBucket<C>
where
    C: Clock,
{
    /// Create a new `TokenBucket` with an explicit clock. The bucket starts
    /// empty.
    pub fn with_clock(rate: u32, clock: C) -> Self {
        let valve = Valve::new(rate, clock.ticks_elapsed());
        Self {
            valve: Mutex::new(valve),
            line: AsyncMutex::new(()),
            clock,
        }
    }

    fn valve(&self) -> MutexGuard<'_, Valve> {
        // The valve holds plain numbers, a panic mid-update cannot leave it
        // in a state worse than slightly stale.
        self.valve.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt to take a single token, returning whether one was taken.
    pub fn try_consume(&self) -> bool {
        let mut valve = self.valve();
        valve.request(self.clock.ticks_elapsed()) == 0
    }

    /// Wait until a single token has been taken.
    ///
    /// Callers are granted tokens in the order they arrive. Between attempts
    /// the caller at the head of the line sleeps for roughly the time needed
    /// to accumulate the missing token, never longer than 10ms.
    pub async fn wait_for_token(&self) {
        let _turn = self.line.lock().await;
        loop {
            let slop = {
                let mut valve = self.valve();
                valve.request(self.clock.ticks_elapsed())
            };
            if slop == 0 {
                break;
            }
            self.clock.wait(slop).await;
        }
    }

    /// Change the refill rate, in tokens per second.
    ///
    /// Tokens accrued so far are credited at the old rate before the switch.
    pub fn set_rate(&self, rate: u32) {
        let mut valve = self.valve();
        valve.set_rate(self.clock.ticks_elapsed(), rate);
    }

    /// The current refill rate, in tokens per second.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.valve().rate
    }

    /// The number of tokens held as of the last request. Intended for
    /// reporting only.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.valve().tokens
    }
}

/// The non-async interior to `TokenBucket`, about which we can make property
/// claims without a runtime.
#[derive(Debug)]
struct Valve {
    /// Tokens available, `0 <= tokens <= rate`.
    tokens: f64,
    /// Refill rate in tokens per second, also the burst capacity.
    rate: u32,
    /// The tick at which tokens were last credited.
    last_refill: u64,
}

impl Valve {
    fn new(rate: u32, ticks_elapsed: u64) -> Self {
        Self {
            tokens: 0.0,
            rate,
            last_refill: ticks_elapsed,
        }
    }

    /// Credit tokens for the time elapsed since the last refill, clamped to
    /// one second's worth.
    fn refill(&mut self, ticks_elapsed: u64) {
        let elapsed = ticks_elapsed.saturating_sub(self.last_refill);
        let rate = f64::from(self.rate);
        let accrued = (elapsed as f64 / TICKS_PER_SECOND as f64) * rate;
        self.tokens = (self.tokens + accrued).min(rate);
        self.last_refill = self.last_refill.max(ticks_elapsed);
    }

    /// For an absolute `ticks_elapsed` take one token if available and
    /// return zero, else return how long -- in ticks -- the caller should
    /// wait before asking again.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn request(&mut self, ticks_elapsed: u64) -> u64 {
        self.refill(ticks_elapsed);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return 0;
        }

        if self.rate == 0 {
            return MAXIMUM_POLL_TICKS;
        }
        let deficit = 1.0 - self.tokens;
        let ticks = (deficit / f64::from(self.rate) * TICKS_PER_SECOND as f64).ceil() as u64;
        ticks.clamp(1, MAXIMUM_POLL_TICKS)
    }

    fn set_rate(&mut self, ticks_elapsed: u64, rate: u32) {
        self.refill(ticks_elapsed);
        self.rate = rate;
        self.tokens = self.tokens.min(f64::from(rate));
    }
}
