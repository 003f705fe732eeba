//! WebSocket transport implementation.
//!
//! Wraps a socket produced by axum's `WebSocketUpgrade`. The handshake itself
//! is axum's job; this adapter only maps frames.

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use bytes::Bytes;
use devlink_core::{ConnectionId, Outbound};
use futures_util::SinkExt;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, Inbound, TransportError};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            is_open: true,
            max_message_size,
        }
    }

    /// Record the peer address (from axum's `ConnectInfo`).
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(
                connection = %self.id,
                "Message too large: {} bytes (max: {})",
                size,
                self.max_message_size
            );
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

/// Map an outbound item onto a WebSocket message.
#[must_use]
pub fn to_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(payload) => {
            let text = match String::from_utf8(payload.to_vec()) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            };
            Message::Text(text)
        }
        Outbound::Close(frame) => Message::Close(Some(ws::CloseFrame {
            code: frame.code,
            reason: frame.reason.into(),
        })),
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Inbound::Text(Bytes::from(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(Inbound::Binary(Bytes::from(data))));
                }
                // The socket queues the pong itself and flushes it on the next read.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection = %self.id, ?frame, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!(connection = %self.id, error = %e, "WebSocket error");
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        if matches!(message, Outbound::Close(_)) {
            self.is_open = false;
        }

        self.socket
            .send(to_message(message))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        SinkExt::close(&mut self.socket)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_core::CloseFrame;

    #[test]
    fn test_text_to_message() {
        let message = to_message(Outbound::Text(Bytes::from_static(b"temp=21.5")));
        assert!(matches!(message, Message::Text(ref t) if t == "temp=21.5"));
    }

    #[test]
    fn test_close_to_message() {
        let message = to_message(Outbound::Close(CloseFrame::main_offline()));
        match message {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason, "main device offline");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }
}
