//! Cancellation token for agent operations
//!
//! The engine hands every operation a token and triggers it when the step's
//! deadline expires (or the process receives an interrupt). Operations are
//! expected to observe it at their own suspension points.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel the token
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Check if cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until cancelled
    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();

        token.cancel();

        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let mut waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        token.cancel();
        assert!(handle.await.unwrap());
    }
}
