//! # devlink-transport
//!
//! Message connection abstraction for the devlink relay.
//!
//! Sessions are written against the [`Connection`] trait, so the same state
//! machines drive:
//!
//! - **WebSocket** - axum-upgraded connections from real devices
//! - **Memory** - in-process pairs for tests and embedding
//!
//! ```rust,ignore
//! use devlink_transport::{Connection, Inbound};
//!
//! async fn drain(mut conn: impl Connection) {
//!     while let Ok(Some(Inbound::Text(text))) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
