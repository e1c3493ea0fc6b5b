//! # Session Store Contract
//!
//! The persistence boundary of the engine. Implementations own per-room
//! exclusivity: every transition is a read-modify-write of the room's open
//! session that no other transition on the same room can interleave with.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RoomResult;
use crate::sessions::lifecycle::SessionOp;
use crate::sessions::model::{DeviceId, OccupancySession, RoomId, RoomView};

/// The committed result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The session row as written.
    pub session: OccupancySession,
    /// Device linked to the room at commit time.
    pub device_id: Option<DeviceId>,
}

/// # Session Store
///
/// Durable record of each room's current and past occupancy sessions.
///
/// ## Contract:
/// - At most one session per room is `InUse` or `Paused`; `assign` on an
///   occupied room fails with `Conflict`.
/// - `assign` on an unknown or deleted room fails with `NotFound`.
/// - A transition that is not legal from the stored state fails with
///   `InvalidState` and writes nothing.
/// - Terminal rows are never rewritten.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Opens a new `InUse` session on `room_id`.
    async fn assign(
        &self,
        room_id: RoomId,
        customer_id: Option<i64>,
        duration_seconds: i64,
        now: DateTime<Utc>,
    ) -> RoomResult<Transition>;

    /// Applies `op` to the room's open session.
    async fn apply(&self, room_id: RoomId, op: SessionOp, now: DateTime<Utc>) -> RoomResult<Transition>;

    /// Atomically finalizes every running session whose scheduled end is at or
    /// before `now`.
    async fn finalize_expired(&self, now: DateTime<Utc>) -> RoomResult<Vec<Transition>>;

    /// Projects one room at `now`.
    async fn room_view(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<RoomView>;

    /// Projects several rooms at `now`. Unknown ids are skipped.
    async fn room_views(&self, room_ids: &[RoomId], now: DateTime<Utc>) -> RoomResult<Vec<RoomView>>;

    async fn pause(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<Transition> {
        self.apply(room_id, SessionOp::Pause, now).await
    }

    async fn resume(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<Transition> {
        self.apply(room_id, SessionOp::Resume, now).await
    }

    async fn cancel(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<Transition> {
        self.apply(room_id, SessionOp::Cancel, now).await
    }

    async fn finalize(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<Transition> {
        self.apply(room_id, SessionOp::Finalize, now).await
    }

    async fn extend_or_reduce(
        &self,
        room_id: RoomId,
        delta_seconds: i64,
        now: DateTime<Utc>,
    ) -> RoomResult<Transition> {
        self.apply(room_id, SessionOp::ExtendOrReduce { delta_seconds }, now)
            .await
    }
}

/// Flips a device's `active` flag.
#[async_trait]
pub trait DeviceActivity: Send + Sync {
    async fn set_active(&self, device_id: DeviceId, active: bool) -> RoomResult<()>;
}
