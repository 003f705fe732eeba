//! Process-wide registry of active rooms.
//!
//! The registry maps a [`ChannelKey`] to its [`Room`]. The map's shard locks
//! are the registry-level lock; each room carries its own lock for membership.
//! Locks are only ever taken map first, room second, and only for in-memory
//! work: closing a room pops it from the map before anyone is notified.

use crate::key::{ChannelKey, SubDeviceId};
use crate::peer::{CloseFrame, ConnectionId, PeerHandle};
use crate::room::{Admission, Room};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Creating another room would exceed the global cap.
    #[error("Maximum number of rooms reached: {0}")]
    RoomLimitReached(usize),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent rooms.
    pub max_rooms: usize,
    /// Maximum sub devices per room.
    pub max_sub_devices: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100,
            max_sub_devices: 1,
        }
    }
}

/// Result of [`RoomRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub enum GetOrCreate {
    /// A new room was created with the caller as its main connection.
    Created(Arc<Room>),
    /// A room already existed; the caller must not displace it.
    Existing(Arc<Room>),
}

impl GetOrCreate {
    /// Whether the room was already live.
    #[must_use]
    pub fn already_existed(&self) -> bool {
        matches!(self, Self::Existing(_))
    }

    /// The room, whichever way it was obtained.
    #[must_use]
    pub fn room(&self) -> &Arc<Room> {
        match self {
            Self::Created(room) | Self::Existing(room) => room,
        }
    }
}

/// Result of [`RoomRegistry::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The sub device is now a member.
    Joined,
    /// No main device is connected for the key.
    RoomNotFound,
    /// The room already holds `limit` sub devices.
    RoomFull {
        /// Per-room sub device limit.
        limit: usize,
    },
    /// The sub device ID is already present.
    AlreadyJoined,
}

impl JoinOutcome {
    /// Close frame explaining a rejected join, `None` for [`JoinOutcome::Joined`].
    #[must_use]
    pub fn close_frame(&self) -> Option<CloseFrame> {
        match self {
            Self::Joined => None,
            Self::RoomNotFound => Some(CloseFrame::normal("room not exist")),
            Self::RoomFull { limit } => Some(CloseFrame::normal(format!(
                "number of sub_device should <= {}",
                limit
            ))),
            Self::AlreadyJoined => Some(CloseFrame::normal("this subdevice has already joined")),
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::RoomNotFound => "room_not_found",
            Self::RoomFull { .. } => "room_full",
            Self::AlreadyJoined => "already_joined",
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of joined sub devices across all rooms.
    pub sub_count: usize,
}

/// The registry of active rooms.
pub struct RoomRegistry {
    rooms: DashMap<ChannelKey, Arc<Room>>,
    /// Rooms reserved or live; checked against `max_rooms` before insert.
    room_count: AtomicUsize,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a registry with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom limits.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            room_count: AtomicUsize::new(0),
            config,
        }
    }

    /// Registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Look up the room for `key`, creating it with `main` as its main
    /// connection if none exists.
    ///
    /// An existing room is returned untouched; `main` is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RoomLimitReached`] if a new room is needed but
    /// the registry is at its cap.
    pub fn get_or_create(
        &self,
        key: ChannelKey,
        main: PeerHandle,
    ) -> Result<GetOrCreate, RegistryError> {
        match self.rooms.entry(key) {
            Entry::Occupied(entry) => {
                debug!(room = %key, "Room already live");
                Ok(GetOrCreate::Existing(Arc::clone(entry.get())))
            }
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                let room = Arc::new(Room::new(key, main, self.config.max_sub_devices));
                entry.insert(Arc::clone(&room));
                debug!(room = %key, connection = %room.main_connection_id(), "Created room");
                Ok(GetOrCreate::Created(room))
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), RegistryError> {
        let max = self.config.max_rooms;
        self.room_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RegistryError::RoomLimitReached(max))
    }

    /// Add a sub device to the room for `key`.
    ///
    /// The map entry stays locked while the room decides, so a concurrent
    /// [`RoomRegistry::remove`] either sees the new member or the join sees
    /// no room.
    pub fn join(&self, key: ChannelKey, sub: SubDeviceId, peer: PeerHandle) -> JoinOutcome {
        let Some(room) = self.rooms.get(&key) else {
            return JoinOutcome::RoomNotFound;
        };

        match room.admit(sub, peer) {
            Admission::Admitted => JoinOutcome::Joined,
            Admission::Full => JoinOutcome::RoomFull {
                limit: room.capacity(),
            },
            Admission::Duplicate => JoinOutcome::AlreadyJoined,
        }
    }

    /// Remove a sub device from its room. No-op if either is already gone.
    pub fn leave(&self, key: ChannelKey, sub: SubDeviceId) {
        if let Some(room) = self.rooms.get(&key) {
            room.release(sub, None);
        }
    }

    /// Remove a sub device only if its slot still belongs to `conn`.
    ///
    /// Returns `true` if this call removed the membership.
    pub fn leave_connection(&self, key: ChannelKey, sub: SubDeviceId, conn: &ConnectionId) -> bool {
        self.rooms
            .get(&key)
            .map(|room| room.release(sub, Some(conn)))
            .unwrap_or(false)
    }

    /// Tear down the room for `key`.
    ///
    /// The room leaves the map first; its connections are notified afterwards
    /// under the room lock only. Returns the removed room, or `None` if it was
    /// already gone.
    pub fn remove(&self, key: ChannelKey) -> Option<Arc<Room>> {
        let (_, room) = self.rooms.remove(&key)?;
        Some(self.finish_removal(room))
    }

    /// Tear down the room for `key` only if `owner` is its main connection.
    pub fn remove_owned(&self, key: ChannelKey, owner: &ConnectionId) -> Option<Arc<Room>> {
        let (_, room) = self
            .rooms
            .remove_if(&key, |_, room| room.main_connection_id() == owner)?;
        Some(self.finish_removal(room))
    }

    fn finish_removal(&self, room: Arc<Room>) -> Arc<Room> {
        self.room_count.fetch_sub(1, Ordering::AcqRel);
        room.close_all();
        debug!(room = %room.key(), "Removed room");
        room
    }

    /// Get the room for `key`.
    #[must_use]
    pub fn get(&self, key: ChannelKey) -> Option<Arc<Room>> {
        self.rooms.get(&key).map(|room| Arc::clone(room.value()))
    }

    /// Check if a room is live for `key`.
    #[must_use]
    pub fn contains(&self, key: ChannelKey) -> bool {
        self.rooms.contains_key(&key)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            sub_count: self.rooms.iter().map(|room| room.sub_count()).sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns a room on behalf of its main session.
///
/// Releasing (explicitly or on drop) tears the room down exactly once, and
/// only if it is still the room this main connection created.
pub struct RoomOwnership {
    registry: Option<Arc<RoomRegistry>>,
    key: ChannelKey,
    owner: ConnectionId,
}

impl RoomOwnership {
    /// Take ownership of the room `room` inside `registry`.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, room: &Room) -> Self {
        Self {
            registry: Some(registry),
            key: room.key(),
            owner: room.main_connection_id().clone(),
        }
    }

    /// Tear the room down. Later calls do nothing.
    pub fn release(&mut self) -> Option<Arc<Room>> {
        self.registry
            .take()
            .and_then(|registry| registry.remove_owned(self.key, &self.owner))
    }
}

impl Drop for RoomOwnership {
    fn drop(&mut self) {
        self.release();
    }
}

/// A sub device's seat in a room, vacated exactly once.
pub struct Membership {
    registry: Option<Arc<RoomRegistry>>,
    key: ChannelKey,
    sub: SubDeviceId,
    conn: ConnectionId,
}

impl Membership {
    /// Record a successful join.
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        key: ChannelKey,
        sub: SubDeviceId,
        conn: ConnectionId,
    ) -> Self {
        Self {
            registry: Some(registry),
            key,
            sub,
            conn,
        }
    }

    /// Leave the room. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.leave_connection(self.key, self.sub, &self.conn);
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Outbound;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn peer(id: &str) -> (PeerHandle, mpsc::Receiver<Outbound>) {
        PeerHandle::channel(id.into(), 16)
    }

    fn key() -> ChannelKey {
        ChannelKey::new(7, 100)
    }

    #[test]
    fn test_get_or_create_first_wins() {
        let registry = RoomRegistry::new();
        let (first, _rx1) = peer("first");
        let (second, _rx2) = peer("second");

        let created = registry.get_or_create(key(), first).unwrap();
        assert!(!created.already_existed());

        let existing = registry.get_or_create(key(), second).unwrap();
        assert!(existing.already_existed());
        assert_eq!(existing.room().main_connection_id().as_str(), "first");
        assert_eq!(registry.stats().room_count, 1);
    }

    #[test]
    fn test_join_outcomes() {
        let registry = RoomRegistry::with_config(RegistryConfig {
            max_rooms: 10,
            max_sub_devices: 2,
        });
        let (sub1, _r1) = peer("s1");
        assert_eq!(
            registry.join(key(), SubDeviceId(1), sub1.clone()),
            JoinOutcome::RoomNotFound
        );

        let (main, _rm) = peer("main");
        registry.get_or_create(key(), main).unwrap();

        assert_eq!(registry.join(key(), SubDeviceId(1), sub1), JoinOutcome::Joined);
        let (dup, _rd) = peer("dup");
        assert_eq!(
            registry.join(key(), SubDeviceId(1), dup),
            JoinOutcome::AlreadyJoined
        );
        let (sub2, _r2) = peer("s2");
        assert_eq!(registry.join(key(), SubDeviceId(2), sub2), JoinOutcome::Joined);
        let (sub3, _r3) = peer("s3");
        assert_eq!(
            registry.join(key(), SubDeviceId(3), sub3),
            JoinOutcome::RoomFull { limit: 2 }
        );
        assert_eq!(registry.stats().sub_count, 2);
    }

    #[test]
    fn test_join_close_reasons() {
        assert_eq!(
            JoinOutcome::RoomNotFound.close_frame().unwrap().reason,
            "room not exist"
        );
        assert_eq!(
            JoinOutcome::RoomFull { limit: 1 }.close_frame().unwrap().reason,
            "number of sub_device should <= 1"
        );
        assert_eq!(
            JoinOutcome::AlreadyJoined.close_frame().unwrap().reason,
            "this subdevice has already joined"
        );
        assert!(JoinOutcome::Joined.close_frame().is_none());
    }

    #[test]
    fn test_remove_cascades_and_blocks_joins() {
        let registry = RoomRegistry::new();
        let (main, mut main_rx) = peer("main");
        let (sub, mut sub_rx) = peer("sub");
        registry.get_or_create(key(), main).unwrap();
        assert_eq!(registry.join(key(), SubDeviceId(1), sub), JoinOutcome::Joined);

        assert!(registry.remove(key()).is_some());

        assert!(!registry.contains(key()));
        assert_eq!(
            main_rx.try_recv().unwrap(),
            Outbound::Close(CloseFrame::room_closed())
        );
        assert_eq!(
            sub_rx.try_recv().unwrap(),
            Outbound::Close(CloseFrame::main_offline())
        );

        let (late, _rl) = peer("late");
        assert_eq!(
            registry.join(key(), SubDeviceId(2), late),
            JoinOutcome::RoomNotFound
        );
    }

    #[test]
    fn test_leave_and_remove_are_idempotent() {
        let registry = RoomRegistry::new();
        let (main, _rm) = peer("main");
        let (sub, _rs) = peer("sub");
        registry.get_or_create(key(), main).unwrap();
        registry.join(key(), SubDeviceId(1), sub);

        registry.leave(key(), SubDeviceId(1));
        registry.leave(key(), SubDeviceId(1));
        assert_eq!(registry.stats().sub_count, 0);

        assert!(registry.remove(key()).is_some());
        assert!(registry.remove(key()).is_none());
        registry.leave(key(), SubDeviceId(1));
        assert_eq!(registry.stats().room_count, 0);
    }

    #[test]
    fn test_room_limit_enforced() {
        let registry = RoomRegistry::with_config(RegistryConfig {
            max_rooms: 1,
            max_sub_devices: 1,
        });
        let (a, _ra) = peer("a");
        let (b, _rb) = peer("b");
        let (c, _rc) = peer("c");

        registry.get_or_create(ChannelKey::new(1, 1), a).unwrap();
        assert_eq!(
            registry.get_or_create(ChannelKey::new(1, 2), b).unwrap_err(),
            RegistryError::RoomLimitReached(1)
        );

        // An existing room is still reachable at the cap.
        let (again, _r) = peer("again");
        assert!(registry
            .get_or_create(ChannelKey::new(1, 1), again)
            .unwrap()
            .already_existed());

        registry.remove(ChannelKey::new(1, 1));
        assert!(registry.get_or_create(ChannelKey::new(1, 2), c).is_ok());
    }

    #[test]
    fn test_ownership_guard_only_removes_own_room() {
        let registry = Arc::new(RoomRegistry::new());
        let (first, _r1) = peer("first");
        let created = registry.get_or_create(key(), first).unwrap();
        let mut ownership = RoomOwnership::new(Arc::clone(&registry), created.room());

        assert!(ownership.release().is_some());
        assert!(ownership.release().is_none());

        let (second, _r2) = peer("second");
        registry.get_or_create(key(), second).unwrap();
        drop(ownership);
        assert!(registry.contains(key()));
    }

    #[test]
    fn test_membership_guard_releases_on_drop() {
        let registry = Arc::new(RoomRegistry::new());
        let (main, _rm) = peer("main");
        let (sub, _rs) = peer("sub");
        registry.get_or_create(key(), main).unwrap();
        registry.join(key(), SubDeviceId(1), sub);

        {
            let _membership = Membership::new(
                Arc::clone(&registry),
                key(),
                SubDeviceId(1),
                "sub".into(),
            );
        }
        assert_eq!(registry.stats().sub_count, 0);
    }

    #[test]
    fn test_stale_membership_keeps_successor() {
        let registry = Arc::new(RoomRegistry::new());
        let (main, _rm) = peer("main");
        let (successor, _rs) = peer("successor");
        registry.get_or_create(key(), main).unwrap();
        registry.join(key(), SubDeviceId(1), successor);

        let mut stale = Membership::new(Arc::clone(&registry), key(), SubDeviceId(1), "old".into());
        stale.release();
        assert!(registry.get(key()).unwrap().contains(SubDeviceId(1)));
    }

    #[test]
    fn test_concurrent_main_race_single_winner() {
        let registry = Arc::new(RoomRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let (main, rx) = PeerHandle::channel(ConnectionId::new(format!("m{i}")), 4);
                    let created = !registry.get_or_create(key(), main).unwrap().already_existed();
                    (created, rx)
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(created, _)| *created)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.stats().room_count, 1);
    }

    #[test]
    fn test_concurrent_joins_respect_capacity() {
        let registry = Arc::new(RoomRegistry::with_config(RegistryConfig {
            max_rooms: 10,
            max_sub_devices: 3,
        }));
        let (main, _rm) = peer("main");
        registry.get_or_create(key(), main).unwrap();

        let handles: Vec<_> = (0..32u64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let (sub, rx) = PeerHandle::channel(ConnectionId::new(format!("s{i}")), 4);
                    (registry.join(key(), SubDeviceId(i), sub), rx)
                })
            })
            .collect();

        let joined = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(outcome, _)| *outcome == JoinOutcome::Joined)
            .count();
        assert_eq!(joined, 3);
        assert_eq!(registry.get(key()).unwrap().sub_count(), 3);
    }

    #[test]
    fn test_broadcast_through_registry_room() {
        let registry = RoomRegistry::new();
        let (main, _rm) = peer("main");
        let (sub, mut sub_rx) = peer("sub");
        let room = registry.get_or_create(key(), main).unwrap().room().clone();
        registry.join(key(), SubDeviceId(1), sub);

        let report = room.broadcast(Bytes::from_static(b"temp=21.5"));
        assert_eq!(report.delivered, 1);
        assert_eq!(
            sub_rx.try_recv().unwrap(),
            Outbound::Text(Bytes::from_static(b"temp=21.5"))
        );
    }
}
