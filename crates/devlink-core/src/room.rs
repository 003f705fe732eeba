//! Room: one main connection and its sub device membership.

use crate::key::{ChannelKey, SubDeviceId};
use crate::peer::{CloseFrame, ConnectionId, PeerHandle};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Result of a membership insert, decided under the room lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    Full,
    Duplicate,
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subs that accepted the frame.
    pub delivered: usize,
    /// Subs whose send failed and were removed from the room.
    pub dropped: Vec<SubDeviceId>,
}

/// An active channel.
///
/// The main connection is fixed for the room's whole lifetime. Sub membership
/// is guarded by the room lock and only changed through the registry, except
/// for the self-healing removal done by [`Room::broadcast`].
#[derive(Debug)]
pub struct Room {
    key: ChannelKey,
    main: PeerHandle,
    subs: Mutex<HashMap<SubDeviceId, PeerHandle>>,
    capacity: usize,
}

impl Room {
    pub(crate) fn new(key: ChannelKey, main: PeerHandle, capacity: usize) -> Self {
        Self {
            key,
            main,
            subs: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    // A panic while holding the lock leaves the map itself consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<SubDeviceId, PeerHandle>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel this room serves.
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Connection ID of the main device.
    #[must_use]
    pub fn main_connection_id(&self) -> &ConnectionId {
        self.main.id()
    }

    /// Maximum number of concurrent sub devices.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of joined sub devices.
    #[must_use]
    pub fn sub_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether a sub device is currently joined.
    #[must_use]
    pub fn contains(&self, sub: SubDeviceId) -> bool {
        self.lock().contains_key(&sub)
    }

    /// Forward a text frame to every joined sub device.
    ///
    /// Subs whose queue rejects the frame are removed after the pass; dropping
    /// their handle ends the owning session once it drains what it already has.
    pub fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let mut subs = self.lock();
        let mut report = BroadcastReport::default();

        for (sub, peer) in subs.iter() {
            match peer.send_text(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(room = %self.key, sub_device = %sub, error = %e, "Dropping sub device");
                    report.dropped.push(*sub);
                }
            }
        }

        for sub in &report.dropped {
            subs.remove(sub);
        }

        trace!(
            room = %self.key,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Broadcast"
        );
        report
    }

    pub(crate) fn admit(&self, sub: SubDeviceId, peer: PeerHandle) -> Admission {
        let mut subs = self.lock();
        if subs.len() >= self.capacity {
            return Admission::Full;
        }
        if subs.contains_key(&sub) {
            return Admission::Duplicate;
        }
        subs.insert(sub, peer);
        debug!(room = %self.key, sub_device = %sub, subs = subs.len(), "Sub device joined");
        Admission::Admitted
    }

    /// Remove a sub; with `conn`, only if the stored handle belongs to it.
    pub(crate) fn release(&self, sub: SubDeviceId, conn: Option<&ConnectionId>) -> bool {
        let mut subs = self.lock();
        let owned = match (subs.get(&sub), conn) {
            (Some(peer), Some(conn)) => peer.id() == conn,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            subs.remove(&sub);
            debug!(room = %self.key, sub_device = %sub, "Sub device left");
        }
        owned
    }

    /// Notify every connection that the room is gone and empty the membership.
    pub(crate) fn close_all(&self) {
        let mut subs = self.lock();

        if let Err(e) = self.main.send_close(CloseFrame::room_closed()) {
            trace!(room = %self.key, error = %e, "Main connection already gone");
        }
        for (sub, peer) in subs.drain() {
            if let Err(e) = peer.send_close(CloseFrame::main_offline()) {
                trace!(room = %self.key, sub_device = %sub, error = %e, "Sub connection already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Outbound;

    fn room(capacity: usize) -> (Room, tokio::sync::mpsc::Receiver<Outbound>) {
        let (main, rx) = PeerHandle::channel("main".into(), 8);
        (Room::new(ChannelKey::new(7, 100), main, capacity), rx)
    }

    #[test]
    fn test_admit_until_full() {
        let (room, _main_rx) = room(2);
        let (a, _rx_a) = PeerHandle::channel("a".into(), 8);
        let (b, _rx_b) = PeerHandle::channel("b".into(), 8);
        let (c, _rx_c) = PeerHandle::channel("c".into(), 8);

        assert_eq!(room.admit(SubDeviceId(1), a), Admission::Admitted);
        assert_eq!(room.admit(SubDeviceId(2), b), Admission::Admitted);
        assert_eq!(room.admit(SubDeviceId(3), c), Admission::Full);
        assert_eq!(room.sub_count(), 2);
    }

    #[test]
    fn test_admit_duplicate() {
        let (room, _main_rx) = room(2);
        let (a, _rx_a) = PeerHandle::channel("a".into(), 8);
        let (a2, _rx_a2) = PeerHandle::channel("a2".into(), 8);

        assert_eq!(room.admit(SubDeviceId(1), a), Admission::Admitted);
        assert_eq!(room.admit(SubDeviceId(1), a2), Admission::Duplicate);
        assert_eq!(room.sub_count(), 1);
    }

    #[test]
    fn test_broadcast_drops_failed_sub() {
        let (room, _main_rx) = room(3);
        let (a, mut rx_a) = PeerHandle::channel("a".into(), 8);
        let (b, rx_b) = PeerHandle::channel("b".into(), 8);
        let (c, mut rx_c) = PeerHandle::channel("c".into(), 8);
        room.admit(SubDeviceId(1), a);
        room.admit(SubDeviceId(2), b);
        room.admit(SubDeviceId(3), c);
        drop(rx_b);

        let report = room.broadcast(Bytes::from_static(b"temp=21.5"));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec![SubDeviceId(2)]);
        assert!(!room.contains(SubDeviceId(2)));
        assert_eq!(
            rx_a.try_recv().unwrap(),
            Outbound::Text(Bytes::from_static(b"temp=21.5"))
        );
        assert_eq!(
            rx_c.try_recv().unwrap(),
            Outbound::Text(Bytes::from_static(b"temp=21.5"))
        );
    }

    #[test]
    fn test_release_checks_owner() {
        let (room, _main_rx) = room(1);
        let (a, _rx_a) = PeerHandle::channel("a".into(), 8);
        room.admit(SubDeviceId(1), a);

        assert!(!room.release(SubDeviceId(1), Some(&"other".into())));
        assert!(room.contains(SubDeviceId(1)));
        assert!(room.release(SubDeviceId(1), Some(&"a".into())));
        assert!(!room.release(SubDeviceId(1), None));
    }

    #[test]
    fn test_close_all_notifies_everyone() {
        let (room, mut main_rx) = room(1);
        let (a, mut rx_a) = PeerHandle::channel("a".into(), 8);
        room.admit(SubDeviceId(1), a);

        room.close_all();

        assert_eq!(room.sub_count(), 0);
        assert_eq!(
            main_rx.try_recv().unwrap(),
            Outbound::Close(CloseFrame::room_closed())
        );
        assert_eq!(
            rx_a.try_recv().unwrap(),
            Outbound::Close(CloseFrame::main_offline())
        );
    }
}
