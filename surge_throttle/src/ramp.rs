//! Fixed-step ramp
//!
//! A ramp moves a control value from an initial setting toward a target in
//! equal steps, one step per call to [`Ramp::advance`]. The value never
//! decreases and, once the target is reached, holds there forever. Callers
//! decide how often to step; the ramp itself knows nothing of time.

use std::num::NonZeroU32;

/// Errors produced by [`Ramp`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The initial value is above the target.
    #[error("initial value {initial} exceeds target {target}")]
    InitialExceedsTarget {
        /// The requested initial value
        initial: u32,
        /// The requested target value
        target: u32,
    },
}

/// The phase a [`Ramp`] is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No step has been taken and the target is not yet reached.
    Initial,
    /// At least one step has been taken, the target is not yet reached.
    Ramping,
    /// The target is reached. Terminal.
    AtTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A monotonic, fixed-step schedule from `initial` to `target`.
pub struct Ramp {
    initial: u32,
    current: u32,
    target: u32,
    step: NonZeroU32,
}

impl Ramp {
    /// Create a new `Ramp`.
    ///
    /// # Errors
    ///
    /// Returns an error if `initial` is greater than `target`.
    pub fn new(initial: u32, target: u32, step: NonZeroU32) -> Result<Self, Error> {
        if initial > target {
            return Err(Error::InitialExceedsTarget { initial, target });
        }
        Ok(Self {
            initial,
            current: initial,
            target,
            step,
        })
    }

    /// Take one step toward the target, returning the new current value.
    /// Has no effect once the target is reached.
    pub fn advance(&mut self) -> u32 {
        self.current = self
            .current
            .saturating_add(self.step.get())
            .min(self.target);
        self.current
    }

    /// The value after `steps` calls to `advance` on a fresh ramp:
    /// `min(initial + steps * step, target)`.
    #[must_use]
    pub fn value_after(&self, steps: u32) -> u32 {
        self.initial
            .saturating_add(steps.saturating_mul(self.step.get()))
            .min(self.target)
    }

    /// The number of steps needed to get from the initial value to the
    /// target.
    #[must_use]
    pub fn steps_to_target(&self) -> u32 {
        (self.target - self.initial).div_ceil(self.step.get())
    }

    /// The initial value.
    #[must_use]
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// The current value.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// The target value.
    #[must_use]
    pub fn target(&self) -> u32 {
        self.target
    }

    /// The size of a single step.
    #[must_use]
    pub fn step(&self) -> NonZeroU32 {
        self.step
    }

    /// The phase this ramp is in.
    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.current >= self.target {
            Phase::AtTarget
        } else if self.current == self.initial {
            Phase::Initial
        } else {
            Phase::Ramping
        }
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use proptest::prelude::*;

    use super::{Error, Phase, Ramp};

    fn step(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).expect("step must be non-zero")
    }

    #[test]
    fn throughput_schedule_reaches_target_in_five_steps() {
        let mut ramp = Ramp::new(10, 500, step(100)).expect("valid ramp");
        assert_eq!(ramp.phase(), Phase::Initial);
        let seen: Vec<u32> = (0..7).map(|_| ramp.advance()).collect();
        assert_eq!(seen, vec![110, 210, 310, 410, 500, 500, 500]);
        assert_eq!(ramp.steps_to_target(), 5);
        assert_eq!(ramp.phase(), Phase::AtTarget);
    }

    #[test]
    fn worker_schedule_reaches_target_in_five_steps() {
        let mut ramp = Ramp::new(2, 20, step(4)).expect("valid ramp");
        for _ in 0..4 {
            ramp.advance();
            assert_eq!(ramp.phase(), Phase::Ramping);
        }
        assert_eq!(ramp.advance(), 20);
        assert_eq!(ramp.steps_to_target(), 5);
    }

    #[test]
    fn initial_equal_to_target_is_at_target() {
        let ramp = Ramp::new(7, 7, step(3)).expect("valid ramp");
        assert_eq!(ramp.phase(), Phase::AtTarget);
        assert_eq!(ramp.steps_to_target(), 0);
    }

    #[test]
    fn initial_above_target_rejected() {
        assert_eq!(
            Ramp::new(8, 7, step(1)),
            Err(Error::InitialExceedsTarget {
                initial: 8,
                target: 7
            })
        );
    }

    // The value after any number of steps follows the closed form, never
    // decreases and never passes the target.
    proptest! {
        #[test]
        fn advance_matches_closed_form(
            initial in 0..10_000u32,
            extra in 0..100_000u32,
            step_size in 1..5_000u32,
            steps in 0..200u32,
        ) {
            let target = initial + extra;
            let mut ramp = Ramp::new(initial, target, step(step_size)).expect("valid ramp");
            let mut previous = ramp.current();
            for taken in 1..=steps {
                let value = ramp.advance();
                prop_assert!(value >= previous);
                prop_assert!(value <= target);
                prop_assert_eq!(value, ramp.value_after(taken));
                previous = value;
            }
        }
    }
}
