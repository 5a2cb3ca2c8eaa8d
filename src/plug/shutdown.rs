use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    /// the connection a client depends on was closed (or could not be established)
    ConnectionClosed,
    /// a Blit `kill` command was received
    Killed,
    /// the operator interrupted the process
    Interrupted,
}
impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ConnectionClosed => write!(f, "connection closed"),
            StopReason::Killed => write!(f, "killed"),
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A one-shot stop signal that can be triggered from anywhere and awaited by any number of
///  tasks. The first reason wins, later triggers are ignored.
#[derive(Clone, Debug)]
pub struct Shutdown {
    sender: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (sender, _) = watch::channel(None);
        Shutdown { sender: Arc::new(sender) }
    }

    pub fn trigger(&self, reason: StopReason) {
        let changed = self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if changed {
            debug!("stop requested: {}", reason);
        }
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.sender.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the signal was triggered, immediately if that happened already
    pub async fn wait(&self) -> StopReason {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(reason) = *receiver.borrow_and_update() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                // unreachable as long as `self` holds the sender
                return StopReason::Interrupted;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.reason(), None);

        shutdown.trigger(StopReason::Killed);
        shutdown.trigger(StopReason::Interrupted);
        assert_eq!(shutdown.reason(), Some(StopReason::Killed));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger(StopReason::ConnectionClosed);
        assert_eq!(shutdown.wait().await, StopReason::ConnectionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_woken_by_clone() {
        let shutdown = Shutdown::new();
        let cloned = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cloned.trigger(StopReason::Interrupted);
        });

        assert_eq!(shutdown.wait().await, StopReason::Interrupted);
    }
}
