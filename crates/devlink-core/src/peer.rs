//! Peer handles: the connection side the registry holds on to.
//!
//! A session owns its transport connection. What it hands to the registry is
//! a [`PeerHandle`], the sending half of a bounded queue that the session
//! drains onto the wire. Every send through a handle is a `try_send`, so
//! nothing that holds a registry or room lock ever waits on the network.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure (RFC 6455).
pub const CLOSE_NORMAL: u16 = 1000;

/// Policy violation (RFC 6455).
pub const CLOSE_POLICY: u16 = 1008;

/// Default depth of a peer's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A close notification: code plus human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code.
    pub code: u16,
    /// Reason text shown to the client.
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure with the given reason.
    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_NORMAL, reason)
    }

    /// A second main device tried to open a room that is already live.
    #[must_use]
    pub fn collision() -> Self {
        Self::normal("This main device already has a websocket connection")
    }

    /// Sent to the main connection when its room is torn down.
    #[must_use]
    pub fn room_closed() -> Self {
        Self::normal("room closed by server")
    }

    /// Sent to every sub connection when the main device goes away.
    #[must_use]
    pub fn main_offline() -> Self {
        Self::normal("main device offline")
    }

    /// Main session went quiet for longer than the idle timeout.
    #[must_use]
    pub fn idle_timeout() -> Self {
        Self::normal("idle timeout")
    }

    /// A sub connection was dropped from its room after a failed send.
    #[must_use]
    pub fn evicted() -> Self {
        Self::new(CLOSE_POLICY, "sub device dropped: send failed")
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Something queued for delivery to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame, forwarded verbatim.
    Text(Bytes),
    /// A close frame; nothing is delivered after it.
    Close(CloseFrame),
}

/// Errors from enqueueing onto a peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    /// The peer's outbound queue is full.
    #[error("Outbound queue full")]
    Full,

    /// The owning session has gone away.
    #[error("Peer closed")]
    Closed,
}

impl<T> From<mpsc::error::TrySendError<T>> for PeerError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => PeerError::Full,
            mpsc::error::TrySendError::Closed(_) => PeerError::Closed,
        }
    }
}

/// The registry's handle on one connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl PeerHandle {
    /// Create a handle and the receiver its session drains.
    #[must_use]
    pub fn channel(id: ConnectionId, buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id, tx }, rx)
    }

    /// Connection this handle delivers to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Fails if the queue is full or the session is gone.
    pub fn send_text(&self, payload: Bytes) -> Result<(), PeerError> {
        self.tx.try_send(Outbound::Text(payload))?;
        Ok(())
    }

    /// Queue a close frame.
    ///
    /// # Errors
    ///
    /// Fails if the queue is full or the session is gone.
    pub fn send_close(&self, frame: CloseFrame) -> Result<(), PeerError> {
        self.tx.try_send(Outbound::Close(frame))?;
        Ok(())
    }

    /// Whether the owning session has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
