//! # Broadcast Publisher
//!
//! Pushes a freshly projected `RoomView` onto every topic queue that cares
//! about the room. Publishing is fire-and-forget from the operator's point of
//! view: failures end up in logs and, for connection loss, in the broker link.
//!
//! A key whose publish failed keeps its latest payload in a pending slot. The
//! broker link drains those slots once it is back up, so every key eventually
//! carries the most recent view published for it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::broker::{Broker, BrokerError, QueueOptions, TopicKey};
use crate::core::broker_link::BrokerLink;
use crate::sessions::model::RoomView;

/// The queues a view is published to: room, branch, global, and the device
/// owner's queue when the room's device has an owner.
pub fn topic_keys(view: &RoomView) -> Vec<TopicKey> {
    let mut keys = vec![
        TopicKey::Room(view.room_id),
        TopicKey::Branch(view.branch_id),
        TopicKey::AllRooms,
    ];
    if let Some(device) = &view.device {
        if let Some(user_id) = device.owner_user_id {
            keys.push(TopicKey::DeviceOwner {
                device_id: device.id,
                user_id,
            });
        }
    }
    keys
}

/// Per-key outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: Vec<TopicKey>,
    pub failed: Vec<TopicKey>,
}

/// Publishes room views through the shared broker.
pub struct BroadcastPublisher {
    broker: Arc<dyn Broker>,
    link: Arc<BrokerLink>,
    timeout: Duration,
    /// Latest undelivered payload per key.
    pending: DashMap<TopicKey, Arc<str>>,
}

impl BroadcastPublisher {
    /// `publish_timeout` bounds declare + publish on each key.
    pub fn new(link: Arc<BrokerLink>, publish_timeout: Duration) -> Self {
        Self {
            broker: Arc::clone(link.broker()),
            link,
            timeout: publish_timeout,
            pending: DashMap::new(),
        }
    }

    /// Keys waiting for a retry, sorted.
    pub fn pending_keys(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self.pending.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    /// Publishes on a background task and returns immediately.
    pub fn publish(self: &Arc<Self>, view: RoomView) -> JoinHandle<PublishReport> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move { publisher.publish_now(&view).await })
    }

    /// Publishes on every key of `view`, one key's failure never stopping the
    /// others.
    pub async fn publish_now(&self, view: &RoomView) -> PublishReport {
        let keys = topic_keys(view);
        let mut report = PublishReport::default();

        let payload: Arc<str> = match serde_json::to_string(view) {
            Ok(p) => Arc::from(p),
            Err(e) => {
                error!(room_id = view.room_id, error = %e, "RoomView serialization failed");
                report.failed = keys;
                return report;
            }
        };

        if !self.link.is_up() {
            debug!(room_id = view.room_id, "Broker link down, view held for retry");
            for key in &keys {
                self.pending.insert(*key, Arc::clone(&payload));
            }
            report.failed = keys;
            return report;
        }

        for key in keys {
            match self.publish_key(&key, &payload).await {
                Ok(()) => {
                    self.pending.remove(&key);
                    report.delivered.push(key);
                }
                Err(e) => {
                    warn!(%key, room_id = view.room_id, error = %e, "Publish failed");
                    self.link.report_failure(&e);
                    self.pending.insert(key, Arc::clone(&payload));
                    report.failed.push(key);
                }
            }
        }
        report
    }

    /// Republishes every pending payload. A key stays pending when it fails
    /// again or when a newer payload replaced it while in flight.
    pub async fn flush_pending(&self) -> PublishReport {
        let mut report = PublishReport::default();
        for key in self.pending_keys() {
            let Some(payload) = self.pending.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            match self.publish_key(&key, &payload).await {
                Ok(()) => {
                    self.pending.remove_if(&key, |_, held| Arc::ptr_eq(held, &payload));
                    report.delivered.push(key);
                }
                Err(e) => {
                    warn!(%key, error = %e, "Pending publish failed");
                    self.link.report_failure(&e);
                    report.failed.push(key);
                }
            }
        }
        if !report.delivered.is_empty() || !report.failed.is_empty() {
            info!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Pending views republished"
            );
        }
        report
    }

    async fn publish_key(&self, key: &TopicKey, payload: &str) -> Result<(), BrokerError> {
        let attempt = async {
            self.broker.declare(key, QueueOptions::LATEST_VALUE).await?;
            self.broker.publish(key, payload).await
        };
        timeout(self.timeout, attempt)
            .await
            .map_err(|_| BrokerError::Timeout(self.timeout))?
    }
}
