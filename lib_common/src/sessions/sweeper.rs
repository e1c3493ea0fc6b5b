//! # Reconciliation Sweeper
//!
//! Fixed-interval job that finalizes sessions whose scheduled end has passed
//! and broadcasts the rooms it touched. Running it twice in a row is harmless:
//! the second pass finds nothing to finalize.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::publisher::BroadcastPublisher;
use crate::sessions::engine::SessionEngine;
use crate::sessions::model::RoomId;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rooms whose session was finalized.
    pub finalized: Vec<RoomId>,
    /// Rooms whose view reached every topic key.
    pub published: Vec<RoomId>,
}

pub struct Sweeper {
    engine: SessionEngine,
    publisher: Arc<BroadcastPublisher>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(engine: SessionEngine, publisher: Arc<BroadcastPublisher>, interval: Duration) -> Self {
        Self {
            engine,
            publisher,
            interval,
        }
    }

    /// Sweeps every `interval` until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sweeper received shutdown signal.");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if !report.finalized.is_empty() {
                        info!(
                            finalized = report.finalized.len(),
                            published = report.published.len(),
                            "Sweep finalized expired sessions"
                        );
                    }
                }
            }
        }
    }

    /// One pass: batch finalize, then re-read and publish each affected room.
    /// A room that fails to load or publish is logged and skipped.
    pub async fn sweep_once(&self) -> SweepReport {
        let finalized = match self.engine.finalize_expired().await {
            Ok(rooms) => rooms,
            Err(e) => {
                error!(error = %e, "Finalize-if-expired failed");
                return SweepReport::default();
            }
        };
        if finalized.is_empty() {
            debug!("Sweep found nothing to finalize");
            return SweepReport::default();
        }

        let views = match self.engine.room_views(&finalized).await {
            Ok(views) => views,
            Err(e) => {
                warn!(error = %e, "Batch room view failed, reading rooms one by one");
                let mut views = Vec::with_capacity(finalized.len());
                for room_id in &finalized {
                    match self.engine.room_view(*room_id).await {
                        Ok(view) => views.push(view),
                        Err(e) => warn!(room_id, error = %e, "Room view failed after finalize"),
                    }
                }
                views
            }
        };

        let mut published = Vec::with_capacity(views.len());
        for view in &views {
            let report = self.publisher.publish_now(view).await;
            if report.failed.is_empty() {
                published.push(view.room_id);
            }
        }

        SweepReport {
            finalized,
            published,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broker::TopicKey;
    use crate::core::broker_link::{BrokerLink, RetryPolicy};
    use crate::core::memory_broker::MemoryBroker;
    use crate::core::Broker;
    use crate::sessions::clock::ManualClock;
    use crate::sessions::memory_store::MemorySessionStore;
    use crate::sessions::model::{Device, Room, RoomState};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    #[tokio::test]
    async fn test_sweep_finalizes_once_and_publishes() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();
        let store = Arc::new(MemorySessionStore::new());
        store.insert_room(Room {
            id: 5,
            branch_id: 2,
            name: "Sala 5".into(),
            state: RoomState::Active,
            device_id: Some(9),
        });
        store.insert_device(Device {
            id: 9,
            name: "PS5".into(),
            owner_user_id: None,
            active: false,
        });
        let clock = Arc::new(ManualClock::new(start));
        let engine = SessionEngine::with_clock(store.clone(), store.clone(), clock.clone());

        let broker = Arc::new(MemoryBroker::new());
        let link = Arc::new(BrokerLink::new(broker.clone(), RetryPolicy::default()));
        let (_tx, mut rx) = broadcast::channel(1);
        link.establish(&mut rx).await;
        let publisher = Arc::new(BroadcastPublisher::new(link, Duration::from_millis(200)));
        let sweeper = Sweeper::new(engine.clone(), publisher, Duration::from_secs(10));

        engine.assign(5, None, 3600).await.unwrap();
        clock.set(start + ChronoDuration::seconds(3601));

        let report = sweeper.sweep_once().await;
        assert_eq!(report.finalized, vec![5]);
        assert_eq!(report.published, vec![5]);
        assert_eq!(store.device_toggles(), vec![(9, true), (9, false)]);

        let again = sweeper.sweep_once().await;
        assert!(again.finalized.is_empty());
        assert_eq!(store.device_toggles().len(), 2);

        let msg = broker
            .receive(&TopicKey::Room(5), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert!(json["session"].is_null());
    }
}
