//! Node handle for type-safe message passing with backpressure support.
//!
//! The `NodeHandle` sends to a node's inbox with:
//! - a non-blocking fast path when the inbox has capacity
//! - a bounded wait when it is full
//! - a cancellation token to stop the node

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::NodeId;

/// Default inbox capacity for nodes.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Default timeout for send operations when the inbox is full.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The node has stopped and is no longer accepting messages.
    NodeStopped,
    /// The send operation timed out.
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NodeStopped => write!(f, "Node has stopped"),
            SendError::Timeout => write!(f, "Send operation timed out"),
        }
    }
}

impl std::error::Error for SendError {}

/// A handle to a node for sending messages.
pub struct NodeHandle<M> {
    pub id: NodeId,
    sender: mpsc::Sender<M>,
    cancellation_token: CancellationToken,
}

impl<M> Clone for NodeHandle<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

impl<M> NodeHandle<M> {
    pub fn new(id: NodeId, sender: mpsc::Sender<M>, cancellation_token: CancellationToken) -> Self {
        Self {
            id,
            sender,
            cancellation_token,
        }
    }

    /// Send a message with backpressure awareness.
    pub async fn send(&self, msg: M) -> Result<(), SendError> {
        self.send_with_timeout(msg, DEFAULT_SEND_TIMEOUT).await
    }

    /// Send a message with a custom timeout.
    pub async fn send_with_timeout(&self, msg: M, timeout: Duration) -> Result<(), SendError> {
        // Fast path: try non-blocking send first
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                // Slow path: wait for permit with timeout
                match tokio::time::timeout(timeout, self.sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::NodeStopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::NodeStopped),
        }
    }

    /// Token the node's run loop watches.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Cancel this node.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_fast_path() {
        let (tx, mut rx) = mpsc::channel(2);
        let handle = NodeHandle::new(NodeId::Output, tx, CancellationToken::new());

        handle.send(7u32).await.unwrap();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_send_times_out_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = NodeHandle::new(NodeId::Worker(0), tx, CancellationToken::new());

        handle.send(1u32).await.unwrap();
        assert_eq!(
            handle
                .send_with_timeout(3, Duration::from_millis(10))
                .await,
            Err(SendError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_send_to_stopped_node() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let handle = NodeHandle::new(NodeId::Station(1), tx, CancellationToken::new());
        assert_eq!(handle.send(1).await, Err(SendError::NodeStopped));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_cancel() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let handle = NodeHandle::new(NodeId::Output, tx, CancellationToken::new());
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
