//! The transport boundary: one frame out, one frame in, plus an open check.
//!
//! The layer runs on top of *any* message-framed bidirectional stream. A
//! WebSocket is the canonical carrier, but the core only ever talks to the
//! [`Transport`] trait, so a unix socket, a channel pair, or a mock all work
//! the same way. [`memory_pair`] provides a connected in-process pair used
//! throughout the test-suite and the examples.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{WsrError, WsrResult};

const MEMORY_PAIR_CAPACITY: usize = 64;

/// A single transport frame, text or binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Create a text frame.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Create a binary frame.
    pub fn binary(content: impl Into<Vec<u8>>) -> Self {
        Self::Binary(content.into())
    }

    /// Get text content if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Get binary content regardless of frame type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// The narrow seam between the messaging layer and a concrete carrier.
///
/// Implementations are handed to [`Endpoint::attach`](crate::Endpoint::attach)
/// already connected; the endpoint actor takes ownership and drives both
/// directions until the transport closes or the endpoint is destroyed.
/// Dialing, TLS, and reconnection all live on the implementation's side of
/// this seam.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame. Fails when the carrier can no longer deliver.
    async fn send(&mut self, message: WireMessage) -> WsrResult<()>;

    /// Receive the next frame. `None` means the carrier closed.
    async fn recv(&mut self) -> Option<WireMessage>;

    /// Whether the carrier is currently able to deliver frames.
    fn is_open(&self) -> bool;
}

/// One end of an in-process transport pair.
///
/// Frames written on one end arrive on the other in order. Dropping an end
/// closes the pair: the peer's `recv` yields `None` and its `send` fails.
pub struct MemoryTransport {
    tx: mpsc::Sender<WireMessage>,
    rx: mpsc::Receiver<WireMessage>,
}

/// Create a connected pair of in-process transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (left_tx, left_rx) = mpsc::channel(MEMORY_PAIR_CAPACITY);
    let (right_tx, right_rx) = mpsc::channel(MEMORY_PAIR_CAPACITY);
    (
        MemoryTransport {
            tx: left_tx,
            rx: right_rx,
        },
        MemoryTransport {
            tx: right_tx,
            rx: left_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: WireMessage) -> WsrResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| WsrError::no_connection("peer transport dropped"))
    }

    async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_accessors() {
        let text = WireMessage::text("hello");
        assert_eq!(text.as_text(), Some("hello"));
        assert_eq!(text.as_bytes(), b"hello");

        let binary = WireMessage::binary(vec![1, 2, 3]);
        assert_eq!(binary.as_text(), None);
        assert_eq!(binary.as_bytes(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pair_delivers_both_directions() {
        let (mut left, mut right) = memory_pair();
        left.send(WireMessage::text("ping")).await.unwrap();
        right.send(WireMessage::text("pong")).await.unwrap();
        assert_eq!(right.recv().await, Some(WireMessage::text("ping")));
        assert_eq!(left.recv().await, Some(WireMessage::text("pong")));
    }

    #[tokio::test]
    async fn test_pair_preserves_order() {
        let (mut left, mut right) = memory_pair();
        for i in 0..5 {
            left.send(WireMessage::text(format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(right.recv().await, Some(WireMessage::text(format!("m{i}"))));
        }
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_the_pair() {
        let (mut left, right) = memory_pair();
        assert!(left.is_open());
        drop(right);
        assert!(!left.is_open());
        assert!(left.send(WireMessage::text("x")).await.is_err());
        assert_eq!(left.recv().await, None);
    }
}
