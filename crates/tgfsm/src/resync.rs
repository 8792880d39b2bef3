//! Best-effort, coalescing notification for an external reconciliation loop.
//!
//! Handlers signal "new data exists" after a completed flow; the
//! reconciliation loop wakes up and pushes unsynced records on its own
//! schedule. The mailbox holds at most one pending notification: repeated
//! triggers while one is pending coalesce into a single resync. This is a
//! deliberate debounce, not a work queue.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Sending half of the resync mailbox. Cheap to clone into handlers.
#[derive(Clone)]
pub struct ResyncSignal {
    tx: mpsc::Sender<()>,
}

impl ResyncSignal {
    /// Requests a resync. Never blocks; if one is already pending the
    /// request is dropped.
    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                log::debug!("resync already pending, coalescing");
            }
            Err(TrySendError::Closed(())) => {
                log::warn!("resync receiver dropped, notification lost");
            }
        }
    }
}

/// Creates the resync mailbox: the signal for handlers and the receiver
/// for the reconciliation loop.
pub fn resync_channel() -> (ResyncSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ResyncSignal { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_notifies_coalesce_to_one_pending() {
        let (signal, mut rx) = resync_channel();
        signal.notify();
        signal.notify();
        signal.notify();

        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_after_receiver_dropped_does_not_panic() {
        let (signal, rx) = resync_channel();
        drop(rx);
        signal.notify();
    }
}
