//! Transport boundary
//!
//! The engine only needs a bidirectional connection: something it can hand
//! frames to, plus two callbacks into the node ([`NetworkingNode::on_frame`]
//! for received frames and [`NetworkingNode::on_closed`] when the peer goes
//! away). Transports provided here:
//! - `ChannelConnection`: in-memory, mpsc-backed (embedding, simulations, tests)
//! - `ws`: WebSocket client and listener

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::node::NetworkingNode;
use crate::routing::{ConnectionId, NodeId};

/// One unit handed to or received from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// How a connection accepted a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the peer
    Sent,
    /// Buffered, to be written once the peer catches up
    Queued,
}

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {0} is closed")]
    Closed(NodeId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A bidirectional connection to one peer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Node at the other end of the connection
    fn peer_id(&self) -> &str;

    /// Hand a frame to the transport
    async fn send(&self, frame: Frame) -> Result<Delivery, TransportError>;
}

/// In-memory connection backed by a bounded mpsc channel
pub struct ChannelConnection {
    peer_id: NodeId,
    tx: mpsc::Sender<Frame>,
}

impl ChannelConnection {
    /// Create a connection to `peer_id` and the receiver its frames arrive on
    pub fn new(peer_id: impl Into<NodeId>, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                peer_id: peer_id.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, frame: Frame) -> Result<Delivery, TransportError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(Delivery::Sent),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.tx
                    .send(frame)
                    .await
                    .map_err(|_| TransportError::Closed(self.peer_id.clone()))?;
                Ok(Delivery::Queued)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Closed(self.peer_id.clone()))
            }
        }
    }
}

/// Connect two nodes with a pair of in-memory connections.
///
/// Every frame is delivered on its own task, so a slow handler on one request
/// never holds up the next frame. Dropping either side's connection (see
/// [`NetworkingNode::disconnect`]) closes the link in both directions.
/// Linking the same pair again replaces the previous link.
pub fn link(a: &NetworkingNode, b: &NetworkingNode, capacity: usize) {
    let (a_to_b, from_a) = ChannelConnection::new(b.id(), capacity);
    let (b_to_a, from_b) = ChannelConnection::new(a.id(), capacity);
    let a_connection = a.attach(Arc::new(a_to_b));
    let b_connection = b.attach(Arc::new(b_to_a));

    pump(from_a, a.id().to_string(), b.clone(), b_connection);
    pump(from_b, b.id().to_string(), a.clone(), a_connection);
}

/// Deliver frames sent by `sender` to `receiver`. When the sender drops its
/// end, the receiver's own connection back to the sender is closed.
fn pump(
    mut rx: mpsc::Receiver<Frame>,
    sender: NodeId,
    receiver: NetworkingNode,
    receiver_connection: ConnectionId,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let node = receiver.clone();
            let peer = sender.clone();
            tokio::spawn(async move {
                node.on_frame(&peer, frame.as_bytes()).await;
            });
        }
        debug!("In-memory link {} -> {} closed", sender, receiver.id());
        receiver.on_closed(&sender, receiver_connection);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_connection_delivery() {
        let (connection, mut rx) = ChannelConnection::new("CSMS", 1);

        assert_eq!(connection.peer_id(), "CSMS");
        assert_eq!(
            connection.send(Frame::Text("[]".into())).await.unwrap(),
            Delivery::Sent
        );
        assert_eq!(rx.recv().await, Some(Frame::Text("[]".into())));
    }

    #[tokio::test]
    async fn test_channel_connection_closed() {
        let (connection, rx) = ChannelConnection::new("CSMS", 1);
        drop(rx);

        let err = connection.send(Frame::Binary(vec![1])).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(peer) if peer == "CSMS"));
    }

    #[tokio::test]
    async fn test_full_channel_queues() {
        let (connection, mut rx) = ChannelConnection::new("CSMS", 1);
        connection.send(Frame::Text("a".into())).await.unwrap();

        let pending = tokio::spawn(async move { connection.send(Frame::Text("b".into())).await });
        tokio::task::yield_now().await;
        assert_eq!(rx.recv().await, Some(Frame::Text("a".into())));
        assert_eq!(pending.await.unwrap().unwrap(), Delivery::Queued);
        assert_eq!(rx.recv().await, Some(Frame::Text("b".into())));
    }
}
