//! Transport abstraction traits for devlink.
//!
//! A [`Connection`] is the bidirectional message channel a session drives
//! once the transport handshake is done.

use async_trait::async_trait;
use bytes::Bytes;
use devlink_core::{CloseFrame, ConnectionId, Outbound};
use thiserror::Error;

/// A data frame read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame (UTF-8 payload).
    Text(Bytes),
    /// A binary frame.
    Binary(Bytes),
}

impl Inbound {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(b) | Self::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Inbound message exceeded the configured limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// An established connection to one device.
///
/// Ping/pong and other control traffic are handled inside the implementation;
/// callers only see data frames and the end of the stream.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next data frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection or the stream
    /// ended. Must be cancel-safe: sessions race it against their outbound
    /// queue and an idle deadline.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Send a text or close frame.
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError>;

    /// Send a text frame.
    async fn send_text(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.send(Outbound::Text(payload)).await
    }

    /// Send a close frame with a code and reason.
    async fn send_close(&mut self, frame: CloseFrame) -> Result<(), TransportError> {
        self.send(Outbound::Close(frame)).await
    }

    /// Release the connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_len() {
        assert_eq!(Inbound::Text(Bytes::from_static(b"abc")).len(), 3);
        assert!(Inbound::Binary(Bytes::new()).is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "Message too large: 10 bytes (max: 4)");
    }
}
