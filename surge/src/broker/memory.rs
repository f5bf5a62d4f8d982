//! An in-process broker for tests.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use surge_payload::Message;

use super::{Connect, ConnectError, Publish, PublishError, Qos};

#[derive(Debug, Default)]
struct Shared {
    received: Mutex<Vec<(u32, Message)>>,
    connections: AtomicU32,
}

/// Records every published message. Connections for the worker ids in
/// `refuse` fail, a connection drops after `fail_after` publishes and every
/// `reject_every`th publish on a connection is rejected, each when set.
#[derive(Debug, Clone, Default)]
pub(crate) struct Memory {
    shared: Arc<Shared>,
    refuse: Vec<u32>,
    fail_after: Option<usize>,
    reject_every: Option<usize>,
}

impl Memory {
    pub(crate) fn refusing(ids: &[u32]) -> Self {
        Self {
            refuse: ids.to_vec(),
            ..Self::default()
        }
    }

    pub(crate) fn failing_after(publishes: usize) -> Self {
        Self {
            fail_after: Some(publishes),
            ..Self::default()
        }
    }

    pub(crate) fn rejecting_every(nth: usize) -> Self {
        Self {
            reject_every: Some(nth),
            ..Self::default()
        }
    }

    pub(crate) fn received(&self) -> Vec<(u32, Message)> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn connections(&self) -> u32 {
        self.shared.connections.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connect for Memory {
    type Connection = Session;

    async fn connect(&self, id: u32) -> Result<Session, ConnectError> {
        if self.refuse.contains(&id) {
            return Err(ConnectError::Refused("NotAuthorized".to_string()));
        }
        self.shared.connections.fetch_add(1, Ordering::Relaxed);
        Ok(Session {
            id,
            shared: Arc::clone(&self.shared),
            remaining: self.fail_after,
            reject_every: self.reject_every,
            attempts: 0,
        })
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    id: u32,
    shared: Arc<Shared>,
    remaining: Option<usize>,
    reject_every: Option<usize>,
    attempts: usize,
}

#[async_trait]
impl Publish for Session {
    async fn publish(&mut self, message: Message, _qos: Qos) -> Result<(), PublishError> {
        match self.remaining.as_mut() {
            Some(0) => return Err(PublishError::Connection("closed by peer".to_string())),
            Some(n) => *n -= 1,
            None => {}
        }
        self.attempts += 1;
        if self
            .reject_every
            .is_some_and(|nth| self.attempts % nth == 0)
        {
            return Err(PublishError::Transient {
                topic: message.topic,
                reason: "rejected by broker".to_string(),
            });
        }
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.id, message));
        Ok(())
    }
}
