//! # Session Lifecycle Engine
//!
//! The single entry point for operator actions on rooms. The engine reads the
//! clock, asks the store to commit the transition, then brings the linked
//! device in line with the new state.
//!
//! ## Workflow (every mutating call):
//! 1. `now` is taken from the engine's `Clock`.
//! 2. The store commits the transition under its per-room lock, or rejects it.
//! 3. On commit, the device collaborator is told the new `active` flag.
//!    A device failure is logged and swallowed: the session change is already
//!    durable and must not be reported as failed.
//!
//! Re-reading the `RoomView` and broadcasting it is left to the caller.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RoomResult;
use crate::sessions::clock::{Clock, SystemClock};
use crate::sessions::lifecycle::SessionOp;
use crate::sessions::model::{DeviceId, RoomId, RoomView};
use crate::sessions::store::{DeviceActivity, SessionStore, Transition};

/// Drives a `SessionStore` and a `DeviceActivity` collaborator.
#[derive(Clone)]
pub struct SessionEngine {
    store: Arc<dyn SessionStore>,
    devices: Arc<dyn DeviceActivity>,
    clock: Arc<dyn Clock>,
}

impl SessionEngine {
    /// Creates an engine on the wall clock.
    pub fn new(store: Arc<dyn SessionStore>, devices: Arc<dyn DeviceActivity>) -> Self {
        Self::with_clock(store, devices, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        devices: Arc<dyn DeviceActivity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            devices,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// # Assign
    ///
    /// Opens a new session on `room_id` for `duration_seconds` and activates the
    /// room's device.
    ///
    /// # Errors
    /// `Conflict` if the room is occupied, `NotFound` if it does not exist or is
    /// deleted, `InvalidInput` for a non-positive duration.
    pub async fn assign(
        &self,
        room_id: RoomId,
        customer_id: Option<i64>,
        duration_seconds: i64,
    ) -> RoomResult<Uuid> {
        let now = self.clock.now();
        let transition = self
            .store
            .assign(room_id, customer_id, duration_seconds, now)
            .await?;
        info!(
            room_id,
            session_id = %transition.session.id,
            duration_seconds,
            "Session assigned"
        );
        self.sync_device(room_id, transition.device_id, true).await;
        Ok(transition.session.id)
    }

    pub async fn pause(&self, room_id: RoomId) -> RoomResult<Transition> {
        self.transition(room_id, SessionOp::Pause).await
    }

    pub async fn resume(&self, room_id: RoomId) -> RoomResult<Transition> {
        self.transition(room_id, SessionOp::Resume).await
    }

    pub async fn cancel(&self, room_id: RoomId) -> RoomResult<Transition> {
        self.transition(room_id, SessionOp::Cancel).await
    }

    pub async fn finalize(&self, room_id: RoomId) -> RoomResult<Transition> {
        self.transition(room_id, SessionOp::Finalize).await
    }

    /// Moves the scheduled end by `delta_seconds`, never before the start.
    pub async fn extend_or_reduce(&self, room_id: RoomId, delta_seconds: i64) -> RoomResult<Transition> {
        self.transition(room_id, SessionOp::ExtendOrReduce { delta_seconds })
            .await
    }

    /// # Finalize Expired
    ///
    /// Finalizes every running session past its scheduled end in one atomic
    /// store call, then deactivates the affected devices in a single follow-up
    /// pass. Returns the affected room ids.
    pub async fn finalize_expired(&self) -> RoomResult<Vec<RoomId>> {
        // --- Phase 1: Batch finalize ---
        let now = self.clock.now();
        let transitions = self.store.finalize_expired(now).await?;

        // --- Phase 2: Device deactivation ---
        for t in &transitions {
            info!(room_id = t.session.room_id, session_id = %t.session.id, "Session expired");
            self.sync_device(t.session.room_id, t.device_id, false).await;
        }

        Ok(transitions.iter().map(|t| t.session.room_id).collect())
    }

    pub async fn room_view(&self, room_id: RoomId) -> RoomResult<RoomView> {
        self.store.room_view(room_id, self.clock.now()).await
    }

    pub async fn room_views(&self, room_ids: &[RoomId]) -> RoomResult<Vec<RoomView>> {
        self.store.room_views(room_ids, self.clock.now()).await
    }

    async fn transition(&self, room_id: RoomId, op: SessionOp) -> RoomResult<Transition> {
        let now = self.clock.now();
        let transition = match self.store.apply(room_id, op, now).await {
            Ok(t) => t,
            Err(e) => {
                debug!(room_id, op = op.name(), error = %e, "Transition rejected");
                return Err(e);
            }
        };
        info!(
            room_id,
            op = op.name(),
            status = transition.session.status.as_str(),
            "Session transition committed"
        );
        if let Some(active) = op.device_effect() {
            self.sync_device(room_id, transition.device_id, active).await;
        }
        Ok(transition)
    }

    async fn sync_device(&self, room_id: RoomId, device_id: Option<DeviceId>, active: bool) {
        let Some(device_id) = device_id else {
            return;
        };
        if let Err(e) = self.devices.set_active(device_id, active).await {
            warn!(room_id, device_id, active, error = %e, "Device toggle failed after commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoomError;
    use crate::sessions::clock::ManualClock;
    use crate::sessions::memory_store::MemorySessionStore;
    use crate::sessions::model::{Device, Room, RoomState, SessionStatus};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn setup() -> (SessionEngine, Arc<MemorySessionStore>, Arc<ManualClock>) {
        let store = Arc::new(MemorySessionStore::new());
        for id in [5, 7] {
            store.insert_room(Room {
                id,
                branch_id: 1,
                name: format!("Room {id}"),
                state: RoomState::Active,
                device_id: Some(id * 10),
            });
            store.insert_device(Device {
                id: id * 10,
                name: format!("Console {id}"),
                owner_user_id: None,
                active: false,
            });
        }
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = SessionEngine::with_clock(store.clone(), store.clone(), clock.clone());
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_pause_resume_scenario() {
        let (engine, store, clock) = setup();
        engine.assign(5, None, 3600).await.unwrap();

        clock.set(t0() + Duration::seconds(600));
        engine.pause(5).await.unwrap();
        clock.set(t0() + Duration::seconds(900));
        let t = engine.resume(5).await.unwrap();

        assert_eq!(t.session.status, SessionStatus::InUse);
        assert_eq!(t.session.scheduled_end_at, t0() + Duration::seconds(3900));
        assert_eq!(t.session.accumulated_pause, Duration::seconds(300));
        assert_eq!(
            store.device_toggles(),
            vec![(50, true), (50, false), (50, true)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_pause_only_one_wins() {
        let (engine, _store, _clock) = setup();
        engine.assign(7, None, 3600).await.unwrap();

        let (a, b) = tokio::join!(
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.pause(7).await }
            }),
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.pause(7).await }
            })
        );
        let results = [a.unwrap(), b.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let invalid = results
            .iter()
            .filter(|r| matches!(r, Err(RoomError::InvalidState { .. })))
            .count();
        assert_eq!((ok, invalid), (1, 1));
    }

    #[tokio::test]
    async fn test_cancel_twice_toggles_device_once() {
        let (engine, store, _clock) = setup();
        engine.assign(5, None, 600).await.unwrap();
        engine.cancel(5).await.unwrap();

        let err = engine.cancel(5).await.unwrap_err();
        assert!(matches!(err, RoomError::InvalidState { op: "cancel", .. }));
        assert_eq!(store.device_toggles(), vec![(50, true), (50, false)]);
    }

    #[tokio::test]
    async fn test_finalize_twice_is_invalid_state() {
        let (engine, _store, _clock) = setup();
        engine.assign(5, None, 600).await.unwrap();
        engine.finalize(5).await.unwrap();
        assert!(matches!(
            engine.finalize(5).await,
            Err(RoomError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_device_failure_does_not_fail_transition() {
        let store = Arc::new(MemorySessionStore::new());
        store.insert_room(Room {
            id: 1,
            branch_id: 1,
            name: "Orphan".into(),
            state: RoomState::Active,
            device_id: Some(999),
        });
        let engine = SessionEngine::new(store.clone(), store.clone());
        assert!(engine.assign(1, None, 60).await.is_ok());
        assert!(store.device_toggles().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_expired_deactivates_devices() {
        let (engine, store, clock) = setup();
        engine.assign(5, None, 60).await.unwrap();
        engine.assign(7, None, 600).await.unwrap();

        clock.set(t0() + Duration::seconds(61));
        let rooms = engine.finalize_expired().await.unwrap();
        assert_eq!(rooms, vec![5]);
        assert!(!store.device(50).unwrap().active);
        assert!(store.device(70).unwrap().active);

        assert!(engine.finalize_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let (engine, _store, _clock) = setup();
        assert!(matches!(engine.pause(404).await, Err(RoomError::NotFound(_))));
        assert!(matches!(engine.room_view(404).await, Err(RoomError::NotFound(_))));
    }
}
