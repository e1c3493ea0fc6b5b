//! # In-Memory Session Store
//!
//! A process-local `SessionStore` and `DeviceActivity` backed by `DashMap`.
//! Per-room exclusivity comes from the map's entry lock: a transition holds
//! the room's write guard for the whole read-modify-write and never awaits
//! while holding it.
//!
//! Used by the test suites and by `server_rooms` when `storeBackend = memory`.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{RoomError, RoomResult};
use crate::sessions::lifecycle::{self, SessionOp};
use crate::sessions::model::{
    Device, DeviceId, OccupancySession, Room, RoomId, RoomState, RoomView,
};
use crate::sessions::store::{DeviceActivity, SessionStore, Transition};

/// Initial rooms and devices, as loaded from a JSON seed file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySeed {
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

struct RoomRecord {
    room: Room,
    /// Append-only; the last entry is the current or most recent session.
    history: Vec<OccupancySession>,
}

impl RoomRecord {
    fn open_session(&self) -> Option<&OccupancySession> {
        self.history.last().filter(|s| s.status.is_open())
    }
}

/// In-process store of rooms, devices and session history.
#[derive(Default)]
pub struct MemorySessionStore {
    rooms: DashMap<RoomId, RoomRecord>,
    devices: DashMap<DeviceId, Device>,
    toggles: Mutex<Vec<(DeviceId, bool)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated from `seed`.
    pub fn from_seed(seed: MemorySeed) -> Self {
        let store = Self::new();
        for device in seed.devices {
            store.insert_device(device);
        }
        for room in seed.rooms {
            store.insert_room(room);
        }
        store
    }

    /// Adds or replaces a room. Its session history is kept if it exists.
    pub fn insert_room(&self, room: Room) {
        self.rooms
            .entry(room.id)
            .and_modify(|record| record.room = room.clone())
            .or_insert_with(|| RoomRecord {
                room,
                history: Vec::new(),
            });
    }

    pub fn insert_device(&self, device: Device) {
        self.devices.insert(device.id, device);
    }

    pub fn device(&self, device_id: DeviceId) -> Option<Device> {
        self.devices.get(&device_id).map(|d| d.value().clone())
    }

    /// Every `set_active` call that reached a known device, in order.
    pub fn device_toggles(&self) -> Vec<(DeviceId, bool)> {
        self.toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All sessions ever opened on `room_id`, oldest first.
    pub fn history(&self, room_id: RoomId) -> Vec<OccupancySession> {
        self.rooms
            .get(&room_id)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Stands in for the billing collaborator writing the running cost.
    pub fn set_billed_time_cost(&self, room_id: RoomId, cost: i64) -> RoomResult<()> {
        let mut record = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))?;
        match record.history.last_mut() {
            Some(session) if session.status.is_open() => {
                session.billed_time_cost = cost;
                Ok(())
            }
            _ => Err(RoomError::invalid_state(room_id, "bill", "no open session")),
        }
    }

    fn project(&self, room_id: RoomId, now: DateTime<Utc>) -> Option<RoomView> {
        // The room guard is released before the device map is read.
        let (room, session) = {
            let record = self.rooms.get(&room_id)?;
            (record.room.clone(), record.history.last().cloned())
        };
        let device = room.device_id.and_then(|id| self.device(id));
        Some(RoomView::project(&room, device, session.as_ref(), now))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn assign(
        &self,
        room_id: RoomId,
        customer_id: Option<i64>,
        duration_seconds: i64,
        now: DateTime<Utc>,
    ) -> RoomResult<Transition> {
        let mut record = self
            .rooms
            .get_mut(&room_id)
            .filter(|r| r.room.state != RoomState::Deleted)
            .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))?;

        if record.open_session().is_some() {
            return Err(RoomError::Conflict(room_id));
        }

        let session = lifecycle::open_session(room_id, customer_id, duration_seconds, now)?;
        record.history.push(session.clone());
        Ok(Transition {
            session,
            device_id: record.room.device_id,
        })
    }

    async fn apply(&self, room_id: RoomId, op: SessionOp, now: DateTime<Utc>) -> RoomResult<Transition> {
        let mut record = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))?;
        let device_id = record.room.device_id;

        let current = record
            .history
            .last_mut()
            .ok_or_else(|| RoomError::invalid_state(room_id, op.name(), "room has no session"))?;

        let next = lifecycle::apply(op, current, now)?;
        *current = next.clone();
        Ok(Transition {
            session: next,
            device_id,
        })
    }

    async fn finalize_expired(&self, now: DateTime<Utc>) -> RoomResult<Vec<Transition>> {
        let mut finalized = Vec::new();
        for mut record in self.rooms.iter_mut() {
            let device_id = record.room.device_id;
            if let Some(current) = record.history.last_mut() {
                if let Some(next) = lifecycle::finalize_expired(current, now) {
                    *current = next.clone();
                    finalized.push(Transition {
                        session: next,
                        device_id,
                    });
                }
            }
        }
        finalized.sort_by_key(|t| t.session.room_id);
        Ok(finalized)
    }

    async fn room_view(&self, room_id: RoomId, now: DateTime<Utc>) -> RoomResult<RoomView> {
        self.project(room_id, now)
            .ok_or_else(|| RoomError::NotFound(format!("room {room_id}")))
    }

    async fn room_views(&self, room_ids: &[RoomId], now: DateTime<Utc>) -> RoomResult<Vec<RoomView>> {
        Ok(room_ids
            .iter()
            .filter_map(|id| self.project(*id, now))
            .collect())
    }
}

#[async_trait]
impl DeviceActivity for MemorySessionStore {
    async fn set_active(&self, device_id: DeviceId, active: bool) -> RoomResult<()> {
        let mut device = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| RoomError::NotFound(format!("device {device_id}")))?;
        device.active = active;
        drop(device);

        self.toggles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device_id, active));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::model::SessionStatus;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn store() -> MemorySessionStore {
        let seed: MemorySeed = serde_json::from_value(serde_json::json!({
            "rooms": [
                { "id": 5, "branchId": 2, "name": "Sala 5", "state": "active", "deviceId": 9 },
                { "id": 6, "branchId": 2, "name": "Sala 6", "state": "deleted" }
            ],
            "devices": [
                { "id": 9, "name": "PS5 #9", "ownerUserId": 3 }
            ]
        }))
        .unwrap();
        MemorySessionStore::from_seed(seed)
    }

    #[tokio::test]
    async fn test_assign_twice_conflicts() {
        let store = store();
        let first = store.assign(5, Some(1), 3600, t0()).await.unwrap();
        assert_eq!(first.device_id, Some(9));

        let err = store.assign(5, Some(2), 3600, t0()).await.unwrap_err();
        assert_eq!(err, RoomError::Conflict(5));
        assert_eq!(store.history(5).len(), 1);
    }

    #[tokio::test]
    async fn test_assign_on_deleted_or_unknown_room_is_not_found() {
        let store = store();
        assert!(matches!(
            store.assign(6, None, 60, t0()).await,
            Err(RoomError::NotFound(_))
        ));
        assert!(matches!(
            store.assign(404, None, 60, t0()).await,
            Err(RoomError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reassign_after_cancel_appends_history() {
        let store = store();
        store.assign(5, None, 600, t0()).await.unwrap();
        store.cancel(5, t0() + Duration::seconds(10)).await.unwrap();
        store.assign(5, None, 600, t0() + Duration::seconds(20)).await.unwrap();

        let history = store.history(5);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, SessionStatus::Cancelled);
        assert_eq!(history[1].status, SessionStatus::InUse);
    }

    #[tokio::test]
    async fn test_view_carries_device_and_billing() {
        let store = store();
        store.assign(5, None, 600, t0()).await.unwrap();
        store.set_billed_time_cost(5, 1250).unwrap();

        let view = store.room_view(5, t0() + Duration::seconds(60)).await.unwrap();
        assert_eq!(view.device.as_ref().and_then(|d| d.owner_user_id), Some(3));
        assert_eq!(view.session.as_ref().map(|s| s.billed_time_cost), Some(1250));
        assert_eq!(view.remaining_seconds, Some(540));
    }

    #[tokio::test]
    async fn test_room_views_skips_unknown_ids() {
        let store = store();
        let views = store.room_views(&[5, 404, 6], t0()).await.unwrap();
        let ids: Vec<_> = views.iter().map(|v| v.room_id).collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_set_active_records_toggles() {
        let store = store();
        store.set_active(9, true).await.unwrap();
        assert!(store.device(9).unwrap().active);
        assert!(store.set_active(77, true).await.is_err());
        assert_eq!(store.device_toggles(), vec![(9, true)]);
    }
}
