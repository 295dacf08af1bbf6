//! Cancellable subscriptions.
//!
//! A [`Subscription`] is the consumer half of a channel plus a
//! [`CancellationToken`] shared with the producer's [`Publisher`]. Cancelling
//! (explicitly or by dropping the subscription) stops delivery immediately:
//! events still queued in the channel are discarded, and the producer sees
//! [`Publisher::is_closed`] and can stop its work.
//!
//! ```text
//!   Publisher ──send──▶ mpsc ──recv──▶ Subscription
//!       │                                   │
//!       └────────── CancellationToken ──────┘
//! ```

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer half.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: mpsc::UnboundedSender<T>,
    token: CancellationToken,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), token: self.token.clone() }
    }
}

impl<T> Publisher<T> {
    /// Deliver an event. Returns `false` once the subscriber has gone away.
    pub fn send(&self, event: T) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the subscriber cancels.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Consumer half. Cancels on drop.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    /// Create a connected publisher/subscription pair.
    pub fn pair() -> (Publisher<T>, Subscription<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        (Publisher { tx, token: token.clone() }, Subscription { rx, token })
    }

    /// Next event, or `None` once cancelled or the producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A handle that cancels this subscription from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
