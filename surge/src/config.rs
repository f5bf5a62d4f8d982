//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.
//!
//! Configuration is layered: built-in defaults, then an optional YAML
//! document, then environment variables. A malformed YAML document is a hard
//! error. Environment values are lenient: one that does not parse is ignored
//! with a warning and the lower layer's value stays in force.

use std::{
    fs,
    net::SocketAddr,
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use surge_throttle::{Ramp, ramp};
use tracing::{debug, warn};

use crate::broker::{Qos, mqtt};

/// Environment variable holding a complete YAML configuration document.
pub const CONFIG_ENV: &str = "SURGE_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// A ramp could not be built from the configured values
    #[error("Invalid ramp: {0}")]
    Ramp(#[from] ramp::Error),
    /// A ramp step is zero
    #[error("{0} must not be zero")]
    ZeroStep(&'static str),
}

const DEFAULT_QUEUE_CAPACITY: u32 = 5_000;
const DEFAULT_INITIAL_RATE: u32 = 10;
const DEFAULT_TARGET_RATE: u32 = 500;
const DEFAULT_RATE_STEP: u32 = 100;
const DEFAULT_RATE_INTERVAL_SECONDS: u64 = 45;
const DEFAULT_INITIAL_WORKERS: u32 = 2;
const DEFAULT_TARGET_WORKERS: u32 = 20;
const DEFAULT_WORKER_STEP: u32 = 4;
const DEFAULT_WORKER_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_MONITOR_INTERVAL_SECONDS: u64 = 10;
const DEFAULT_CONNECT_STAGGER_MILLIS: u64 = 2_000;
const DEFAULT_DEQUEUE_TIMEOUT_MILLIS: u64 = 1_000;

fn default_seed() -> [u8; 32] {
    [
        115, 117, 114, 103, 101, 45, 108, 111, 97, 100, 45, 103, 101, 110, 101, 114, 97, 116, 111,
        114, 45, 115, 101, 101, 100, 45, 48, 48, 48, 48, 48, 49,
    ]
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The seed for random operations
    pub seed: [u8; 32],
    /// The payload variant
    #[serde(deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub payload: surge_payload::Config,
    /// Maximum number of messages waiting to be published
    pub queue_capacity: u32,
    /// Messages per second allowed when the run starts
    pub initial_rate: u32,
    /// Messages per second the rate ramps up to
    pub target_rate: u32,
    /// Messages per second added on every rate step
    pub rate_step: u32,
    /// Seconds between rate steps
    pub rate_interval_seconds: u64,
    /// Workers spawned when the run starts
    pub initial_workers: u32,
    /// Workers the pool grows to
    pub target_workers: u32,
    /// Workers added on every pool step
    pub worker_step: u32,
    /// Seconds between pool steps
    pub worker_interval_seconds: u64,
    /// Seconds between status reports
    pub monitor_interval_seconds: u64,
    /// Milliseconds between two worker spawns
    pub connect_stagger_millis: u64,
    /// Milliseconds a worker waits on an empty queue before looping
    pub dequeue_timeout_millis: u64,
    /// QoS of every publish
    pub qos: Qos,
    /// Address to serve Prometheus metrics on, if any
    pub prometheus_addr: Option<SocketAddr>,
    /// Broker connection parameters, environment only
    #[serde(skip)]
    pub broker: mqtt::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            payload: surge_payload::Config::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_rate: DEFAULT_INITIAL_RATE,
            target_rate: DEFAULT_TARGET_RATE,
            rate_step: DEFAULT_RATE_STEP,
            rate_interval_seconds: DEFAULT_RATE_INTERVAL_SECONDS,
            initial_workers: DEFAULT_INITIAL_WORKERS,
            target_workers: DEFAULT_TARGET_WORKERS,
            worker_step: DEFAULT_WORKER_STEP,
            worker_interval_seconds: DEFAULT_WORKER_INTERVAL_SECONDS,
            monitor_interval_seconds: DEFAULT_MONITOR_INTERVAL_SECONDS,
            connect_stagger_millis: DEFAULT_CONNECT_STAGGER_MILLIS,
            dequeue_timeout_millis: DEFAULT_DEQUEUE_TIMEOUT_MILLIS,
            qos: Qos::default(),
            prometheus_addr: None,
            broker: mqtt::Config::default(),
        }
    }
}

fn overlay<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!("{key} value {raw:?} does not parse, ignoring"),
    }
}

fn non_zero<T>(key: &str, slot: &mut T, default: T)
where
    T: PartialEq + Default + std::fmt::Display + Copy,
{
    if *slot == T::default() {
        warn!("{key} must not be zero, using {default}");
        *slot = default;
    }
}

fn at_most(initial_key: &str, initial: &mut u32, target: u32) {
    if *initial > target {
        warn!("{initial_key} {initial} exceeds its target {target}, clamping");
        *initial = target;
    }
}

impl Config {
    /// Parse a YAML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Function will error if the document is not valid YAML or names an
    /// unknown option.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load the full configuration: defaults, then YAML from the `SURGE_CONFIG`
    /// variable or `path`, then environment overrides. The result is
    /// validated.
    ///
    /// # Errors
    ///
    /// Function will error if the config file cannot be read or the YAML is
    /// malformed.
    pub fn load<F>(path: Option<&Path>, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if let Some(contents) = lookup(CONFIG_ENV) {
            debug!("Using config from env var '{CONFIG_ENV}'");
            Self::from_yaml(&contents)?
        } else if let Some(path) = path {
            debug!("Attempting to open configuration file at: {}", path.display());
            let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;
            Self::from_yaml(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(&lookup);
        config.validate();
        Ok(config)
    }

    /// Overlay the `SURGE_*` and broker environment variables.
    pub fn apply_env<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut device_count = self.payload.device_count.get();
        overlay(lookup, "SURGE_DEVICE_COUNT", &mut device_count);
        match NonZeroU32::new(device_count) {
            Some(count) => self.payload.device_count = count,
            None => warn!("SURGE_DEVICE_COUNT must not be zero, ignoring"),
        }
        let mut batch_size = self.payload.batch_size.get();
        overlay(lookup, "SURGE_BATCH_SIZE", &mut batch_size);
        match NonZeroU32::new(batch_size) {
            Some(size) => self.payload.batch_size = size,
            None => warn!("SURGE_BATCH_SIZE must not be zero, ignoring"),
        }
        overlay(lookup, "SURGE_ROOT_TOPIC", &mut self.payload.root_topic);

        overlay(lookup, "SURGE_QUEUE_CAPACITY", &mut self.queue_capacity);
        overlay(lookup, "SURGE_INITIAL_RATE", &mut self.initial_rate);
        overlay(lookup, "SURGE_TARGET_RATE", &mut self.target_rate);
        overlay(lookup, "SURGE_RATE_STEP", &mut self.rate_step);
        overlay(
            lookup,
            "SURGE_RATE_INTERVAL_SECONDS",
            &mut self.rate_interval_seconds,
        );
        overlay(lookup, "SURGE_INITIAL_WORKERS", &mut self.initial_workers);
        overlay(lookup, "SURGE_TARGET_WORKERS", &mut self.target_workers);
        overlay(lookup, "SURGE_WORKER_STEP", &mut self.worker_step);
        overlay(
            lookup,
            "SURGE_WORKER_INTERVAL_SECONDS",
            &mut self.worker_interval_seconds,
        );
        overlay(
            lookup,
            "SURGE_MONITOR_INTERVAL_SECONDS",
            &mut self.monitor_interval_seconds,
        );
        overlay(
            lookup,
            "SURGE_CONNECT_STAGGER_MILLIS",
            &mut self.connect_stagger_millis,
        );
        overlay(
            lookup,
            "SURGE_DEQUEUE_TIMEOUT_MILLIS",
            &mut self.dequeue_timeout_millis,
        );

        let mut qos = u8::from(self.qos);
        overlay(lookup, "SURGE_QOS", &mut qos);
        match Qos::try_from(qos) {
            Ok(q) => self.qos = q,
            Err(err) => warn!("SURGE_QOS ignored: {err}"),
        }

        if let Some(raw) = lookup("SURGE_PROMETHEUS_ADDR") {
            match raw.trim().parse() {
                Ok(addr) => self.prometheus_addr = Some(addr),
                Err(err) => warn!("SURGE_PROMETHEUS_ADDR {raw:?} ignored: {err}"),
            }
        }

        self.broker = mqtt::Config::from_env(lookup);
    }

    /// Replace zero values with their defaults and clamp initial values to
    /// their targets.
    pub fn validate(&mut self) {
        non_zero("queue_capacity", &mut self.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        non_zero("target_rate", &mut self.target_rate, DEFAULT_TARGET_RATE);
        non_zero("rate_step", &mut self.rate_step, DEFAULT_RATE_STEP);
        non_zero(
            "rate_interval_seconds",
            &mut self.rate_interval_seconds,
            DEFAULT_RATE_INTERVAL_SECONDS,
        );
        non_zero("target_workers", &mut self.target_workers, DEFAULT_TARGET_WORKERS);
        non_zero("worker_step", &mut self.worker_step, DEFAULT_WORKER_STEP);
        non_zero(
            "worker_interval_seconds",
            &mut self.worker_interval_seconds,
            DEFAULT_WORKER_INTERVAL_SECONDS,
        );
        non_zero(
            "monitor_interval_seconds",
            &mut self.monitor_interval_seconds,
            DEFAULT_MONITOR_INTERVAL_SECONDS,
        );
        non_zero(
            "dequeue_timeout_millis",
            &mut self.dequeue_timeout_millis,
            DEFAULT_DEQUEUE_TIMEOUT_MILLIS,
        );
        at_most("initial_rate", &mut self.initial_rate, self.target_rate);
        at_most("initial_workers", &mut self.initial_workers, self.target_workers);
    }

    /// The throughput ramp schedule.
    ///
    /// # Errors
    ///
    /// Function will error if the configuration has not been validated and
    /// the values do not form a ramp.
    pub fn rate_ramp(&self) -> Result<Ramp, Error> {
        let step = NonZeroU32::new(self.rate_step).ok_or(Error::ZeroStep("rate_step"))?;
        Ok(Ramp::new(self.initial_rate, self.target_rate, step)?)
    }

    /// The worker-count ramp schedule.
    ///
    /// # Errors
    ///
    /// Function will error if the configuration has not been validated and
    /// the values do not form a ramp.
    pub fn worker_ramp(&self) -> Result<Ramp, Error> {
        let step = NonZeroU32::new(self.worker_step).ok_or(Error::ZeroStep("worker_step"))?;
        Ok(Ramp::new(self.initial_workers, self.target_workers, step)?)
    }

    /// Time between rate steps.
    #[must_use]
    pub fn rate_interval(&self) -> Duration {
        Duration::from_secs(self.rate_interval_seconds)
    }

    /// Time between pool steps.
    #[must_use]
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_seconds)
    }

    /// Time between status reports.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    /// Time between two worker spawns.
    #[must_use]
    pub fn connect_stagger(&self) -> Duration {
        Duration::from_millis(self.connect_stagger_millis)
    }

    /// Bounded wait on an empty queue.
    #[must_use]
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_millis)
    }
}
