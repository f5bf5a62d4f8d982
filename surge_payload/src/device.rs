//! The pool of device identifiers messages are attributed to.

use std::num::NonZeroU32;

use rand::seq::IndexedRandom;
use serde::Deserialize;

const ID_PREFIX: &str = "TID-987654-";

/// How a device is picked from the pool for each message.
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Uniformly at random
    #[default]
    Random,
    /// Cycle through the pool in order
    RoundRobin,
}

#[derive(Debug, Clone)]
/// A fixed pool of device identifiers.
pub struct Pool {
    ids: Vec<String>,
    selection: Selection,
    cursor: usize,
}

impl Pool {
    /// Create a pool of `count` devices, `TID-987654-0000000001` onward.
    #[must_use]
    pub fn new(count: NonZeroU32, selection: Selection) -> Self {
        let ids = (1..=count.get())
            .map(|i| format!("{ID_PREFIX}{i:010}"))
            .collect();
        Self {
            ids,
            selection,
            cursor: 0,
        }
    }

    /// Pick the next device.
    pub fn next<R>(&mut self, rng: &mut R) -> &str
    where
        R: rand::Rng + ?Sized,
    {
        match self.selection {
            Selection::Random => self
                .ids
                .choose(rng)
                .map_or(ID_PREFIX, String::as_str),
            Selection::RoundRobin => {
                let idx = self.cursor;
                self.cursor = (self.cursor + 1) % self.ids.len();
                &self.ids[idx]
            }
        }
    }
}
