//! Session close detection
//!
//! russh drops the client handler when the transport ends. The handler owns
//! a [`CloseGuard`]; dropping it publishes how the session ended to every
//! [`CloseMonitor`] clone. Whether the end was requested is decided by the
//! flag set through [`CloseMonitor::request_end`] before the transport went
//! away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionClosed {
    /// Shutdown was requested before the transport closed
    Requested,
    /// The transport went away on its own
    Unexpected,
}

/// Observes the end of a session
#[derive(Debug, Clone)]
pub struct CloseMonitor {
    end_requested: Arc<AtomicBool>,
    rx: watch::Receiver<Option<SessionClosed>>,
}

/// Publishes the close when dropped
#[derive(Debug)]
pub struct CloseGuard {
    end_requested: Arc<AtomicBool>,
    tx: watch::Sender<Option<SessionClosed>>,
}

impl CloseMonitor {
    pub fn new() -> (Self, CloseGuard) {
        let end_requested = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(None);
        (
            Self {
                end_requested: Arc::clone(&end_requested),
                rx,
            },
            CloseGuard { end_requested, tx },
        )
    }

    /// Mark any following close as requested
    pub fn request_end(&self) {
        self.end_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_end_requested(&self) -> bool {
        self.end_requested.load(Ordering::SeqCst)
    }

    /// Close reason, if the session already ended
    pub fn state(&self) -> Option<SessionClosed> {
        *self.rx.borrow()
    }

    /// Wait for the session to end
    pub async fn closed(&self) -> SessionClosed {
        let mut rx = self.rx.clone();
        let closed = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.unwrap_or(SessionClosed::Unexpected),
            // Sender dropped without publishing cannot happen; treat as lost.
            Err(_) => SessionClosed::Unexpected,
        };
        closed
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let reason = if self.end_requested.load(Ordering::SeqCst) {
            SessionClosed::Requested
        } else {
            SessionClosed::Unexpected
        };
        self.tx.send_replace(Some(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unexpected_close() {
        let (monitor, guard) = CloseMonitor::new();
        assert_eq!(monitor.state(), None);

        drop(guard);
        assert_eq!(monitor.closed().await, SessionClosed::Unexpected);
    }

    #[tokio::test]
    async fn test_requested_close() {
        let (monitor, guard) = CloseMonitor::new();
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.closed().await })
        };

        monitor.request_end();
        drop(guard);

        assert_eq!(waiter.await.unwrap(), SessionClosed::Requested);
        assert!(monitor.is_end_requested());
    }
}
