//! # devlink-core
//!
//! Room registry and relay primitives for the devlink device relay.
//!
//! A main device publishes to a room; sub devices bound to the same account
//! join that room and receive everything the main device sends. This crate
//! owns the shared state and knows nothing about the wire:
//!
//! - **ChannelKey** - `(account, main device)` pair identifying a room
//! - **PeerHandle** - non-blocking outbound queue of one connection
//! - **Room** - the main connection plus its bounded sub membership
//! - **RoomRegistry** - process-wide map of active rooms
//!
//! ## Locking
//!
//! ```text
//! ┌────────────────────┐  lookup / insert / pop  ┌─────────────┐
//! │    RoomRegistry    │────────────────────────▶│    Room     │
//! │ (sharded map lock) │                         │ (room lock) │
//! └────────────────────┘                         └─────────────┘
//! ```
//!
//! Locks are always taken registry first, room second. Neither is held
//! across an `.await`: sends only enqueue onto a peer's bounded queue.

pub mod key;
pub mod peer;
pub mod registry;
pub mod room;

pub use key::{AccountId, ChannelKey, MainDeviceId, SubDeviceId};
pub use peer::{CloseFrame, ConnectionId, Outbound, PeerError, PeerHandle};
pub use registry::{
    GetOrCreate, JoinOutcome, Membership, RegistryConfig, RegistryError, RegistryStats,
    RoomOwnership, RoomRegistry,
};
pub use room::{BroadcastReport, Room};
