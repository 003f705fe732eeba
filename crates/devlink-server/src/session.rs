//! Main and sub device sessions.
//!
//! One session runs per upgraded connection. Authorization and the upgrade
//! itself happen in the HTTP handler; a session starts with a live
//! [`Connection`] and drives it until it is closed:
//!
//! ```text
//! main:  Registering ──▶ Relaying  ──▶ Closed   (room torn down)
//! sub:   Joining     ──▶ Listening ──▶ Closed   (membership vacated)
//! ```
//!
//! Sessions never talk to each other directly. A main session forwards into
//! its room; sub sessions drain the queue the room feeds.

use crate::metrics;
use devlink_core::{
    ChannelKey, CloseFrame, GetOrCreate, JoinOutcome, Membership, Outbound, PeerHandle,
    RegistryError, RoomOwnership, RoomRegistry, SubDeviceId,
};
use devlink_transport::{Connection, Inbound};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Try again later (RFC 6455).
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// What a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Shared room registry.
    pub registry: Arc<RoomRegistry>,
    /// Depth of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Sliding idle timeout for main devices.
    pub main_idle_timeout: Duration,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Another main device already owns the room.
    Collision,
    /// The registry is at its room cap.
    RoomLimit,
    /// The sub device's join was refused.
    Rejected(JoinOutcome),
    /// The device sent a close frame or the stream ended.
    PeerClosed,
    /// Reading from or writing to the device failed.
    PeerError,
    /// The main device was silent past its idle timeout.
    IdleTimeout,
    /// The server closed the room.
    ClosedByServer,
    /// The sub device was dropped from its room after a failed send.
    Evicted,
}

impl SessionEnd {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collision => "collision",
            Self::RoomLimit => "room_limit",
            Self::Rejected(outcome) => outcome.as_str(),
            Self::PeerClosed => "peer_closed",
            Self::PeerError => "peer_error",
            Self::IdleTimeout => "idle_timeout",
            Self::ClosedByServer => "closed_by_server",
            Self::Evicted => "evicted",
        }
    }
}

/// Refuse an upgraded connection with a close reason and release it.
async fn refuse<C: Connection>(conn: &mut C, frame: CloseFrame) {
    if let Err(e) = conn.send_close(frame).await {
        trace!(connection = %conn.id(), error = %e, "Could not send close frame");
    }
    let _ = conn.close().await;
}

/// Drive a main device connection for `key`.
///
/// The first main device for a key owns the room until it disconnects; any
/// later attempt is refused and the incumbent is left alone. When the session
/// ends for any reason the room is torn down, which closes every sub device
/// with "main device offline".
pub async fn run_main_session<C: Connection>(
    mut conn: C,
    key: ChannelKey,
    ctx: &SessionContext,
) -> SessionEnd {
    let _metrics_guard = metrics::ConnectionMetricsGuard::new("main");
    let (peer, mut outbound) = PeerHandle::channel(conn.id().clone(), ctx.outbound_buffer);

    // Registering
    let room = match ctx.registry.get_or_create(key, peer) {
        Ok(GetOrCreate::Created(room)) => room,
        Ok(GetOrCreate::Existing(existing)) => {
            info!(
                room = %key,
                connection = %conn.id(),
                incumbent = %existing.main_connection_id(),
                "Main device already connected, refusing"
            );
            refuse(&mut conn, CloseFrame::collision()).await;
            return finish("main", SessionEnd::Collision);
        }
        Err(e @ RegistryError::RoomLimitReached(_)) => {
            warn!(room = %key, connection = %conn.id(), error = %e, "Refusing main device");
            refuse(&mut conn, CloseFrame::new(CLOSE_TRY_AGAIN_LATER, e.to_string())).await;
            return finish("main", SessionEnd::RoomLimit);
        }
    };
    let mut ownership = RoomOwnership::new(Arc::clone(&ctx.registry), &room);
    metrics::set_active_rooms(ctx.registry.stats().room_count);
    info!(room = %key, connection = %conn.id(), "Main device connected");

    // Relaying
    let mut deadline = Instant::now() + ctx.main_idle_timeout;
    let end = loop {
        tokio::select! {
            biased;

            out = outbound.recv() => match out {
                Some(Outbound::Close(frame)) => {
                    debug!(room = %key, reason = %frame, "Room closed by server");
                    let _ = conn.send_close(frame).await;
                    break SessionEnd::ClosedByServer;
                }
                // Nothing relays into a main device.
                Some(Outbound::Text(_)) => {}
                None => break SessionEnd::ClosedByServer,
            },

            read = tokio::time::timeout_at(deadline, conn.recv()) => match read {
                Ok(Ok(Some(Inbound::Text(payload)))) => {
                    deadline = Instant::now() + ctx.main_idle_timeout;
                    let size = payload.len();
                    let report = room.broadcast(payload);
                    metrics::record_relay(size, report.delivered);
                    metrics::record_evictions(report.dropped.len());
                }
                Ok(Ok(Some(Inbound::Binary(_)))) => {
                    deadline = Instant::now() + ctx.main_idle_timeout;
                    trace!(room = %key, "Ignoring binary frame from main device");
                }
                Ok(Ok(None)) => break SessionEnd::PeerClosed,
                Ok(Err(e)) => {
                    debug!(room = %key, error = %e, "Main device read failed");
                    break SessionEnd::PeerError;
                }
                Err(_) => {
                    info!(room = %key, timeout = ?ctx.main_idle_timeout, "Main device idle");
                    let _ = conn.send_close(CloseFrame::idle_timeout()).await;
                    break SessionEnd::IdleTimeout;
                }
            },
        }
    };

    // Closed
    drop(room);
    ownership.release();
    metrics::set_active_rooms(ctx.registry.stats().room_count);
    if conn.is_open() {
        if let Ok(Outbound::Close(frame)) = outbound.try_recv() {
            let _ = conn.send_close(frame).await;
        }
    }
    let _ = conn.close().await;

    info!(room = %key, connection = %conn.id(), cause = end.as_str(), "Main device disconnected");
    finish("main", end)
}

/// Drive a sub device connection joining the room for `key`.
///
/// Frames the sub device sends are read and discarded; the read loop only
/// exists to notice the device going away.
pub async fn run_sub_session<C: Connection>(
    mut conn: C,
    key: ChannelKey,
    sub: SubDeviceId,
    ctx: &SessionContext,
) -> SessionEnd {
    let _metrics_guard = metrics::ConnectionMetricsGuard::new("sub");
    let (peer, mut outbound) = PeerHandle::channel(conn.id().clone(), ctx.outbound_buffer);

    // Joining
    let outcome = ctx.registry.join(key, sub, peer);
    if let Some(frame) = outcome.close_frame() {
        info!(room = %key, sub_device = %sub, reason = %frame, "Sub device refused");
        metrics::record_rejection(outcome.as_str());
        refuse(&mut conn, frame).await;
        return finish("sub", SessionEnd::Rejected(outcome));
    }
    let mut membership = Membership::new(Arc::clone(&ctx.registry), key, sub, conn.id().clone());
    info!(room = %key, sub_device = %sub, connection = %conn.id(), "Sub device joined");

    // Listening
    let end = loop {
        tokio::select! {
            biased;

            out = outbound.recv() => match out {
                Some(Outbound::Text(payload)) => {
                    if let Err(e) = conn.send_text(payload).await {
                        debug!(room = %key, sub_device = %sub, error = %e, "Sub device write failed");
                        break SessionEnd::PeerError;
                    }
                }
                Some(Outbound::Close(frame)) => {
                    let _ = conn.send_close(frame).await;
                    break SessionEnd::ClosedByServer;
                }
                None => {
                    let _ = conn.send_close(CloseFrame::evicted()).await;
                    break SessionEnd::Evicted;
                }
            },

            read = conn.recv() => match read {
                Ok(Some(frame)) => {
                    trace!(room = %key, sub_device = %sub, len = frame.len(), "Discarding sub device frame");
                }
                Ok(None) => break SessionEnd::PeerClosed,
                Err(e) => {
                    debug!(room = %key, sub_device = %sub, error = %e, "Sub device read failed");
                    break SessionEnd::PeerError;
                }
            },
        }
    };

    // Closed
    membership.release();
    let _ = conn.close().await;

    info!(room = %key, sub_device = %sub, cause = end.as_str(), "Sub device disconnected");
    finish("sub", end)
}

fn finish(role: &'static str, end: SessionEnd) -> SessionEnd {
    metrics::record_session_end(role, end.as_str());
    end
}
