//! Shutdown signal shared by every flowgre task.
//!
//! There is one `Broadcaster` and any number of `Watcher` instances. The
//! `Broadcaster` fires the signal once. Every loop that can block holds a
//! `Watcher` and selects on it next to its socket or channel, so a signal
//! is observed promptly even while the loop is idle.
//!
//! `Broadcaster::signal_and_wait` does not return until every registered
//! `Watcher` has seen the signal or been dropped. The process uses this to
//! drain its pipelines before exit.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        signal_received: false,
        notify: Arc::clone(&notify),
        peer_count_decreased: false,
        registered: true,
    };

    let b = Broadcaster {
        peers,
        sender,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Fires the shutdown signal at every `Watcher`.
pub struct Broadcaster {
    /// Registered watchers that have not yet observed the signal.
    peers: Arc<AtomicU32>,
    sender: watch::Sender<bool>,
    /// Woken each time a registered watcher logs off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Fire the signal. Does not wait for watchers.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Fire the signal and wait until every registered `Watcher` has seen it
    /// or been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        // Register for the wakeup before reading the count, a watcher that
        // logs off in between would otherwise be missed.
        loop {
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");
            notified.await;
        }
    }
}

/// Errors for `Watcher::try_recv`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal has been received and yet `try_recv` was called.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been received and yet `register` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Observes the shutdown signal.
///
/// A registered watcher holds up `Broadcaster::signal_and_wait` until it
/// sees the signal or is dropped. Clones are unregistered, use
/// `Watcher::register` to get one the broadcaster waits for.
pub struct Watcher {
    signal_received: bool,
    peer_count_decreased: bool,
    peers: Arc<AtomicU32>,
    receiver: watch::Receiver<bool>,
    notify: Arc<Notify>,
    registered: bool,
}

impl Watcher {
    fn decrease_peer_count(&mut self) {
        if !self.registered || self.peer_count_decreased {
            return;
        }
        // saturate at zero rather than wrap
        if self
            .peers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |peers| {
                peers.checked_sub(1)
            })
            .is_ok()
        {
            self.notify.notify_waiters();
        }
        self.peer_count_decreased = true;
    }

    fn fired(&self) -> bool {
        // a dropped broadcaster counts as the signal
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Wait for the signal. Returns immediately if it already fired.
    pub async fn recv(mut self) {
        if self.signal_received {
            // stops a completed recv from starving the other arms of a select!
            tokio::task::yield_now().await;
            return;
        }

        // Err means the broadcaster is gone, which is also a signal.
        let _ = self.receiver.wait_for(|fired| *fired).await;
        self.decrease_peer_count();
        self.signal_received = true;
    }

    /// Check for the signal without blocking.
    ///
    /// Returns `Ok(false)` until the signal fires, then `Ok(true)` once.
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::SignalReceived` on every call after the one
    /// that returned `Ok(true)`.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }

        if self.fired() {
            self.decrease_peer_count();
            self.signal_received = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Register a new `Watcher` the `Broadcaster` will wait for.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` once this watcher has seen
    /// the signal, no new peers join after shutdown.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }

        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.clone(),
            signal_received: false,
            notify: Arc::clone(&self.notify),
            peer_count_decreased: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.decrease_peer_count();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.clone(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            peer_count_decreased: false,
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::{RegisterError, TryRecvError, signal};

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn basic_signal() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());

        timeout(DEADLINE, broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn unregistered_clone_does_not_block() {
        let (watcher, broadcaster) = signal();
        let _unregistered = watcher.clone();
        let handle = tokio::spawn(watcher.recv());

        timeout(DEADLINE, broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn dropped_watcher_counts_as_done() {
        let (watcher, broadcaster) = signal();
        let registered = watcher.register().expect("not yet signaled");
        drop(watcher);
        drop(registered);

        timeout(DEADLINE, broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung");
    }

    #[tokio::test]
    async fn waits_for_every_registered_watcher() {
        let (watcher, broadcaster) = signal();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let peer = watcher.register().expect("not yet signaled");
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                peer.recv().await;
            }));
        }
        handles.push(tokio::spawn(watcher.recv()));

        timeout(DEADLINE, broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait hung");
        for handle in handles {
            handle.await.expect("watcher task panicked");
        }
    }

    #[tokio::test]
    async fn try_recv_reports_once() {
        let (mut watcher, broadcaster) = signal();
        assert!(!watcher.try_recv().expect("not yet signaled"));
        broadcaster.signal();
        assert!(watcher.try_recv().expect("first observation"));
        assert!(matches!(watcher.try_recv(), Err(TryRecvError::SignalReceived)));
        assert!(matches!(watcher.register(), Err(RegisterError::SignalReceived)));
    }

    #[tokio::test]
    async fn dropped_broadcaster_is_a_signal() {
        let (mut watcher, broadcaster) = signal();
        drop(broadcaster);
        assert!(watcher.try_recv().expect("first observation"));

        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        timeout(DEADLINE, watcher.recv())
            .await
            .expect("recv hung after broadcaster dropped");
    }
}
