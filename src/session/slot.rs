//! Pending response slots
//!
//! One slot per channel. A waiter registers with the slot before its
//! request goes out and is handed the first message or error published
//! after that. There are no request ids, so at most one waiter per channel
//! should be outstanding at a time.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::ble::BleError;

type Outcome<T> = Result<T, BleError>;

/// Single-outstanding-request slot for one channel.
pub struct ResponseSlot<T> {
    waiters: Mutex<Vec<oneshot::Sender<Outcome<T>>>>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> ResponseSlot<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        }
    }

    /// Start waiting for the next value. Anything already published counts
    /// as seen, so a stale reply from an earlier request is never returned.
    pub fn arm(&self) -> PendingResponse<T> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        // Waits that timed out or were dropped leave closed senders behind.
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        PendingResponse { rx }
    }

    /// Hand `outcome` to every armed waiter. Each waiter is served once, so
    /// later publications never overwrite what it was given.
    fn publish(&self, outcome: Outcome<T>) {
        let waiters =
            std::mem::take(&mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner));
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn set_last(&self, value: Option<T>) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn complete(&self, value: T) {
        self.set_last(Some(value.clone()));
        self.publish(Ok(value));
    }

    pub fn fail(&self, err: BleError) {
        self.set_last(None);
        self.publish(Err(err));
    }

    /// Wake every waiter with `BleError::Disconnected` and forget the last
    /// value.
    pub fn disconnect(&self) {
        self.set_last(None);
        self.publish(Err(BleError::Disconnected));
    }

    /// The last completed value, if the last thing published was a value.
    pub fn last(&self) -> Option<T> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone> Default for ResponseSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An armed wait on a [`ResponseSlot`].
pub struct PendingResponse<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T: Clone> PendingResponse<T> {
    /// Wait for the first value published after this wait was armed.
    ///
    /// Abandoning the wait (timeout or drop) leaves the slot untouched; a
    /// late reply is then picked up by whichever wait is armed next.
    pub async fn wait(self, timeout: Duration) -> Result<T, BleError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(BleError::NoResponse),
            // Slot gone: the session itself was dropped.
            Ok(Err(_)) => Err(BleError::Disconnected),
            Ok(Ok(outcome)) => outcome,
        }
    }
}
