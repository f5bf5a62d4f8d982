//! The broker transport.
//!
//! Workers see the broker only through [`Connect`] and [`Publish`]: open one
//! connection per worker, then publish messages on it one at a time. A failed
//! publish is either [`PublishError::Transient`], the message is lost and the
//! worker carries on, or [`PublishError::Connection`], the connection is gone
//! and the worker stops.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surge_payload::Message;

pub mod mqtt;
#[cfg(test)]
pub(crate) mod memory;

/// MQTT delivery guarantee requested for every publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// QoS 0, fire and forget
    #[default]
    AtMostOnce,
    /// QoS 1, acknowledged by the broker
    AtLeastOnce,
}

/// A QoS level outside of 0 and 1.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("QoS must be 0 or 1, got {0}")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for Qos {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            n => Err(InvalidQos(n)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Errors produced while opening a connection.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    /// The broker refused the connection.
    #[error("Broker refused connection: {0}")]
    Refused(String),
    /// The transport failed before the broker acknowledged the connection.
    #[error("Transport failed while connecting: {0}")]
    Transport(String),
    /// The broker did not acknowledge the connection in time.
    #[error("Timed out waiting for connection acknowledgement")]
    Timeout,
}

/// Errors produced by a single publish.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// The publish was rejected or timed out. The connection is still usable.
    #[error("Publish to {topic} failed: {reason}")]
    Transient {
        /// Topic of the lost message
        topic: String,
        /// What went wrong
        reason: String,
    },
    /// The connection is no longer usable.
    #[error("Connection lost: {0}")]
    Connection(String),
}

/// Opens broker connections, one per worker.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// The connection type handed to a worker.
    type Connection: Publish;

    /// Open a connection for worker `id`. Returns only once the broker has
    /// acknowledged the connection.
    ///
    /// # Errors
    ///
    /// Function will error if the broker refuses or cannot be reached.
    async fn connect(&self, id: u32) -> Result<Self::Connection, ConnectError>;
}

/// A live connection owned by exactly one worker.
#[async_trait]
pub trait Publish: Send + 'static {
    /// Publish `message` with the given QoS.
    ///
    /// # Errors
    ///
    /// Function will error if the message was not handed to the broker. See
    /// [`PublishError`] for which failures end the connection.
    async fn publish(&mut self, message: Message, qos: Qos) -> Result<(), PublishError>;
}

#[cfg(test)]
mod test {
    use super::Qos;

    #[test]
    fn qos_from_yaml_number() {
        let qos: Qos = serde_yaml::from_str("1").expect("valid qos");
        assert_eq!(qos, Qos::AtLeastOnce);
        assert!(serde_yaml::from_str::<Qos>("2").is_err());
    }
}
