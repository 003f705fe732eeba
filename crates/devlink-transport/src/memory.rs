//! In-process connections.
//!
//! [`pair`] returns a [`MemoryConnection`] for the server side and a
//! [`MemoryClient`] that plays the device. Used to drive sessions in tests
//! without sockets.

use async_trait::async_trait;
use bytes::Bytes;
use devlink_core::{CloseFrame, ConnectionId, Outbound};
use tokio::sync::mpsc;

use crate::traits::{Connection, Inbound, TransportError};

/// A frame as seen by the client end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Text frame.
    Text(Bytes),
    /// Binary frame.
    Binary(Bytes),
    /// Close frame, with optional code and reason.
    Close(Option<CloseFrame>),
}

#[derive(Debug)]
enum ClientEvent {
    Frame(WireFrame),
    Fail(String),
}

/// Create a connected server/client pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryClient) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: from_client,
        outbound: Some(to_client),
        is_open: true,
    };
    let client = MemoryClient {
        outbound: to_server,
        inbound: from_server,
    };
    (conn, client)
}

/// Server end of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<ClientEvent>,
    outbound: Option<mpsc::UnboundedSender<WireFrame>>,
    is_open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inbound.recv().await {
            Some(ClientEvent::Frame(WireFrame::Text(data))) => Ok(Some(Inbound::Text(data))),
            Some(ClientEvent::Frame(WireFrame::Binary(data))) => Ok(Some(Inbound::Binary(data))),
            Some(ClientEvent::Frame(WireFrame::Close(_))) | None => {
                self.is_open = false;
                Ok(None)
            }
            Some(ClientEvent::Fail(reason)) => {
                self.is_open = false;
                Err(TransportError::ReceiveFailed(reason))
            }
        }
    }

    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;

        let frame = match message {
            Outbound::Text(payload) => WireFrame::Text(payload),
            Outbound::Close(frame) => {
                self.is_open = false;
                WireFrame::Close(Some(frame))
            }
        };
        outbound
            .send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.outbound = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Device end of an in-memory connection.
pub struct MemoryClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<WireFrame>,
}

impl MemoryClient {
    /// Send a text frame. Returns `false` if the server end is gone.
    pub fn send_text(&self, payload: impl Into<Bytes>) -> bool {
        self.push(ClientEvent::Frame(WireFrame::Text(payload.into())))
    }

    /// Send a binary frame.
    pub fn send_binary(&self, payload: impl Into<Bytes>) -> bool {
        self.push(ClientEvent::Frame(WireFrame::Binary(payload.into())))
    }

    /// Send a close frame.
    pub fn send_close(&self) -> bool {
        self.push(ClientEvent::Frame(WireFrame::Close(None)))
    }

    /// Make the server's next read fail.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.push(ClientEvent::Fail(reason.into()))
    }

    fn push(&self, event: ClientEvent) -> bool {
        self.outbound.send(event).is_ok()
    }

    /// Receive the next frame from the server.
    ///
    /// Returns `None` once the server released the connection.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.inbound.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.inbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_exchange() {
        let (mut conn, mut client) = pair();

        assert!(client.send_text("hello"));
        assert_eq!(
            conn.recv().await.unwrap(),
            Some(Inbound::Text(Bytes::from_static(b"hello")))
        );

        conn.send_text(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(
            client.recv().await,
            Some(WireFrame::Text(Bytes::from_static(b"world")))
        );
    }

    #[tokio::test]
    async fn test_memory_close_from_client() {
        let (mut conn, client) = pair();
        client.send_close();
        assert_eq!(conn.recv().await.unwrap(), None);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_memory_read_failure() {
        let (mut conn, client) = pair();
        client.fail("reset by peer");
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_close_frame_then_release() {
        let (mut conn, mut client) = pair();
        conn.send_close(CloseFrame::main_offline()).await.unwrap();
        assert!(conn.send_text(Bytes::from_static(b"late")).await.is_err());
        conn.close().await.unwrap();

        assert_eq!(
            client.recv().await,
            Some(WireFrame::Close(Some(CloseFrame::main_offline())))
        );
        assert_eq!(client.recv().await, None);
    }
}
