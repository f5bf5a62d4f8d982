//! Module to signal phase changes in surge.
//!
//! Surge runs a handful of long-lived tasks -- the payload generator, two ramp
//! controllers, the monitor and every publishing worker -- none of which
//! stop on their own. This crate supplies the mechanism that tells them to.
//!
//! The mechanism has two components, a `Broadcaster` and a `Watcher`. The
//! `Broadcaster` signals every `Watcher` that a phase has been achieved. This
//! is a one-time event. There is only one `Broadcaster` and potentially many
//! `Watcher` instances; every live `Watcher` that has not yet seen the signal
//! is a peer the `Broadcaster` can wait on.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use tokio::sync::watch;
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (
        Watcher { receiver },
        Broadcaster { sender },
    )
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that a phase has been
/// achieved.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have ack'ed the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until every peer has either received the signal or
    /// been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for phase changes, typically used to control shutdown.
///
/// Every clone is an independent peer.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Receive the signal. This function will block if the signal has not
    /// already been sent. A dropped `Broadcaster` counts as a sent signal.
    /// The watcher stops being a peer of the `Broadcaster` once this returns.
    pub async fn recv(mut self) {
        // An error here means the `Broadcaster` is gone, same outcome.
        let _ = self.receiver.wait_for(|signaled| *signaled).await;
    }
}
