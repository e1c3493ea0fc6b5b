//! End-to-end session scenarios against the in-memory store, with the
//! publisher wired to an in-memory broker.

use chrono::{DateTime, Duration, TimeZone, Utc};
use lib_common::core::{BroadcastPublisher, BrokerLink, MemoryBroker, RetryPolicy, TopicKey};
use lib_common::sessions::{ManualClock, MemorySessionStore, Sweeper};
use lib_common::{Device, Room, RoomError, RoomState, SessionEngine, SessionStatus};
use std::sync::Arc;
use tokio::sync::broadcast;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

fn venue() -> (Arc<MemorySessionStore>, Arc<ManualClock>, SessionEngine) {
    let store = Arc::new(MemorySessionStore::new());
    for (id, device_id) in [(5, Some(50)), (7, Some(70)), (8, None)] {
        store.insert_room(Room {
            id,
            branch_id: 1,
            name: format!("Room {id}"),
            state: RoomState::Active,
            device_id,
        });
    }
    for id in [50, 70] {
        store.insert_device(Device {
            id,
            name: format!("Console {id}"),
            owner_user_id: Some(3),
            active: false,
        });
    }
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = SessionEngine::with_clock(store.clone(), store.clone(), clock.clone());
    (store, clock, engine)
}

#[tokio::test]
async fn pause_and_resume_push_the_end_back() {
    let (store, clock, engine) = venue();

    engine.assign(5, Some(11), 3600).await.unwrap();
    assert_eq!(store.device(50).map(|d| d.active), Some(true));

    clock.advance(Duration::seconds(600));
    engine.pause(5).await.unwrap();
    assert_eq!(store.device(50).map(|d| d.active), Some(false));

    clock.advance(Duration::seconds(300));
    let resumed = engine.resume(5).await.unwrap().session;
    assert_eq!(resumed.status, SessionStatus::InUse);
    assert_eq!(resumed.scheduled_end_at, t0() + Duration::seconds(3900));
    assert_eq!(resumed.accumulated_pause, Duration::seconds(300));
    assert_eq!(store.device(50).map(|d| d.active), Some(true));

    clock.advance(Duration::seconds(100));
    let view = engine.room_view(5).await.unwrap();
    assert_eq!(view.elapsed_billable_seconds, Some(700));
    assert_eq!(view.remaining_seconds, Some(2900));
}

#[tokio::test]
async fn second_assign_conflicts_until_the_session_closes() {
    let (_store, _clock, engine) = venue();

    engine.assign(8, None, 600).await.unwrap();
    assert_eq!(engine.assign(8, None, 600).await, Err(RoomError::Conflict(8)));

    engine.cancel(8).await.unwrap();
    assert!(engine.assign(8, None, 600).await.is_ok());
}

#[tokio::test]
async fn reduce_never_ends_before_start() {
    let (_store, clock, engine) = venue();
    engine.assign(8, None, 600).await.unwrap();
    clock.advance(Duration::seconds(60));

    let session = engine.extend_or_reduce(8, -10_000).await.unwrap().session;
    assert_eq!(session.scheduled_end_at, session.started_at);

    let session = engine.extend_or_reduce(8, 900).await.unwrap().session;
    assert_eq!(session.scheduled_end_at, t0() + Duration::seconds(900));
}

#[tokio::test]
async fn concurrent_pauses_admit_exactly_one() {
    let (store, _clock, engine) = venue();
    engine.assign(7, None, 3600).await.unwrap();

    let a = tokio::spawn({
        let engine = engine.clone();
        async move { engine.pause(7).await }
    });
    let b = tokio::spawn({
        let engine = engine.clone();
        async move { engine.pause(7).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(RoomError::InvalidState { .. }))));
    let pauses = store
        .device_toggles()
        .into_iter()
        .filter(|&(id, on)| id == 70 && !on)
        .count();
    assert_eq!(pauses, 1);
}

#[tokio::test]
async fn finalize_twice_toggles_device_once() {
    let (store, _clock, engine) = venue();
    engine.assign(5, None, 3600).await.unwrap();

    engine.finalize(5).await.unwrap();
    assert!(matches!(
        engine.finalize(5).await,
        Err(RoomError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.cancel(5).await,
        Err(RoomError::InvalidState { .. })
    ));
    assert_eq!(store.device_toggles(), vec![(50, true), (50, false)]);
    assert_eq!(store.history(5)[0].status, SessionStatus::Finalized);
}

#[tokio::test]
async fn sweeper_finalizes_and_publishes_expired_rooms() {
    let (store, clock, engine) = venue();
    engine.assign(5, None, 3600).await.unwrap();
    engine.assign(7, None, 7200).await.unwrap();

    let broker = Arc::new(MemoryBroker::new());
    let link = Arc::new(BrokerLink::new(broker.clone(), RetryPolicy::default()));
    let (_tx, mut rx) = broadcast::channel(1);
    assert!(link.establish(&mut rx).await);
    let publisher = Arc::new(BroadcastPublisher::new(link, std::time::Duration::from_secs(1)));
    let sweeper = Sweeper::new(engine.clone(), publisher, std::time::Duration::from_secs(10));

    clock.set(t0() + Duration::seconds(3601));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.finalized, vec![5]);
    assert_eq!(report.published, vec![5]);
    assert_eq!(broker.depth(&TopicKey::Room(5)), 1);
    assert_eq!(broker.depth(&TopicKey::DeviceOwner { device_id: 50, user_id: 3 }), 1);

    let again = sweeper.sweep_once().await;
    assert!(again.finalized.is_empty());

    let off = store
        .device_toggles()
        .into_iter()
        .filter(|&(id, on)| id == 50 && !on)
        .count();
    assert_eq!(off, 1);
    assert!(engine.room_view(5).await.unwrap().session.is_none());
    assert!(engine.room_view(7).await.unwrap().session.is_some());
}
