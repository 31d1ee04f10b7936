//! Shutdown signalling for strata.
//!
//! The rollup coordinator runs a driver loop and any number of in-flight
//! rollup passes. On shutdown the driver must stop scheduling new passes,
//! in-flight work must notice promptly and the process must wait a bounded
//! amount of time for that work to drain before forcing termination.
//!
//! The mechanism has two halves, a [`Broadcaster`] and a [`Watcher`]. There is
//! exactly one `Broadcaster`. A `Watcher` that was obtained through
//! [`signal`] or [`Watcher::register`] is a *peer*: the `Broadcaster` counts it
//! until it is dropped, which is how a task reports that it has drained. A
//! `Watcher` obtained through `Clone` observes the signal but is not counted.

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

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, watch};
use tracing::{info, warn};

/// Construct a registered `Watcher` and its `Broadcaster`.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let drained = Arc::new(Notify::new());

    let watcher = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        drained: Arc::clone(&drained),
        registered: true,
    };
    let broadcaster = Broadcaster {
        sender,
        peers,
        drained,
    };
    (watcher, broadcaster)
}

/// Result of [`Broadcaster::signal_and_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Every registered peer dropped within the grace period.
    Complete,
    /// The grace period elapsed with peers still alive.
    Abandoned {
        /// Registered peers still alive when the grace period ran out.
        peers: u32,
    },
}

/// Errors for [`Watcher::register`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// Shutdown is already in progress; no new work may register.
    #[error("shutdown already signaled")]
    Signaled,
}

/// Sends the shutdown signal to every [`Watcher`].
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<bool>,
    peers: Arc<AtomicU32>,
    drained: Arc<Notify>,
}

impl Broadcaster {
    /// Signal shutdown without waiting for peers.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Signal shutdown and wait up to `grace` for every registered peer to
    /// drop.
    pub async fn signal_and_wait(self, grace: Duration) -> Drain {
        self.sender.send_replace(true);

        let peers = Arc::clone(&self.peers);
        let drained = Arc::clone(&self.drained);
        let wait = async move {
            loop {
                // Register interest before reading the count, otherwise a
                // peer dropping between the load and the await is missed.
                let notified = drained.notified();
                let remaining = peers.load(Ordering::SeqCst);
                if remaining == 0 {
                    break;
                }
                info!("waiting for {remaining} peers to drain");
                notified.await;
            }
        };

        if tokio::time::timeout(grace, wait).await.is_ok() {
            Drain::Complete
        } else {
            let peers = self.peers.load(Ordering::SeqCst);
            warn!("{peers} peers still running after {grace:?}, abandoning drain");
            Drain::Abandoned { peers }
        }
    }
}

/// Observes the shutdown signal.
#[derive(Debug)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    drained: Arc<Notify>,
    registered: bool,
}

impl Watcher {
    /// Whether shutdown has been signaled. Never blocks.
    ///
    /// A dropped `Broadcaster` counts as a signal.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Wait for the shutdown signal.
    ///
    /// Cancel safe and callable repeatedly, so it may sit in a `select!` arm
    /// inside a loop. Returns immediately once the signal has been sent.
    pub async fn recv(&mut self) {
        // An error means the sender is gone, which is treated as the signal.
        let _ = self.receiver.wait_for(|signaled| *signaled).await;
    }

    /// Register a new peer that the `Broadcaster` will wait on.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Signaled`] once shutdown has begun.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.is_signaled() {
            return Err(RegisterError::Signaled);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            drained: Arc::clone(&self.drained),
            registered: true,
        })
    }

    fn depart(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;

        // Saturate at zero rather than wrap.
        let mut current = self.peers.load(Ordering::Relaxed);
        while current > 0 {
            match self.peers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.drained.notify_waiters();
                    break;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            drained: Arc::clone(&self.drained),
            registered: false,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.depart();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Drain, RegisterError, signal};

    #[tokio::test]
    async fn watcher_observes_signal() {
        let (mut watcher, broadcaster) = signal();
        assert!(!watcher.is_signaled());

        broadcaster.signal();
        watcher.recv().await;
        assert!(watcher.is_signaled());
        // Repeat receipt returns immediately.
        watcher.recv().await;
    }

    #[tokio::test]
    async fn dropped_broadcaster_counts_as_signal() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);
        watcher.recv().await;
        assert!(watcher.is_signaled());
    }

    #[tokio::test]
    async fn drain_completes_when_peers_drop() {
        let (watcher, broadcaster) = signal();
        let peer = watcher.register().expect("register before signal");

        let task = tokio::spawn(async move {
            let mut peer = peer;
            peer.recv().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        drop(watcher);

        let drain = broadcaster.signal_and_wait(Duration::from_secs(5)).await;
        assert_eq!(drain, Drain::Complete);
        task.await.expect("peer task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_abandons_stuck_peer() {
        let (watcher, broadcaster) = signal();
        let stuck = watcher.register().expect("register before signal");
        drop(watcher);

        let drain = broadcaster.signal_and_wait(Duration::from_millis(50)).await;
        assert_eq!(drain, Drain::Abandoned { peers: 1 });
        drop(stuck);
    }

    #[tokio::test]
    async fn clones_are_not_waited_on() {
        let (watcher, broadcaster) = signal();
        let observer = watcher.clone();
        drop(watcher);

        let drain = broadcaster.signal_and_wait(Duration::from_secs(1)).await;
        assert_eq!(drain, Drain::Complete);
        assert!(observer.is_signaled());
    }

    #[tokio::test]
    async fn register_after_signal_fails() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal();
        assert!(matches!(watcher.register(), Err(RegisterError::Signaled)));
    }
}
