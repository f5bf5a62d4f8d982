//! The surge ramp-controlled MQTT load generator.
//!
//! This library supports the surge binary found elsewhere in this project.
//! Load is produced by a single generator into a bounded queue and published
//! by a growing pool of workers, each on its own broker connection, under one
//! shared token bucket. Two controllers ramp the bucket's rate and the pool's
//! size from their initial values to their targets, then hold.

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
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod broker;
pub mod config;
pub mod control;
pub mod engine;
pub mod generator;
pub mod monitor;
pub mod queue;
pub mod ramp;
pub mod worker;
