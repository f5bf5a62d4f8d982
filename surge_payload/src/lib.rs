//! The surge payloads
//!
//! This library supports payload generation for the surge project. Every
//! message is a small JSON document shaped like the telemetry an IoT gateway
//! forwards, paired with the topic it is published to. Payload content is not
//! interpreted by anything downstream in surge; only the topic matters for
//! routing.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use bytes::Bytes;

pub mod device;
pub mod telemetry;

pub use telemetry::{Category, Choice, Config, Shape, Telemetry};

/// Errors related to payload generation
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// The message timestamp could not be formatted
    #[error("Timestamp could not be formatted: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// A single message ready to publish.
///
/// Messages are immutable once built and are consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The topic this message is published to
    pub topic: String,
    /// The encoded payload, opaque to everything but the receiver
    pub payload: Bytes,
}
