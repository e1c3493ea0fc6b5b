//! # Broker Contract
//!
//! Topic keys and the transport contract the fanout layer runs on. A topic
//! queue is a single-slot, latest-value channel: publishing onto a full queue
//! discards the unread message. Viewers therefore see the newest `RoomView`
//! rather than a backlog of intermediate ones.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::sessions::model::{BranchId, DeviceId, RoomId, UserId};

/// Address of a topic queue and of a connection-registry bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKey {
    /// `room:<id>`
    Room(RoomId),
    /// `branch:<id>`
    Branch(BranchId),
    /// `rooms`
    AllRooms,
    /// `device-owner:<deviceId>:<userId>`
    DeviceOwner { device_id: DeviceId, user_id: UserId },
}

impl TopicKey {
    /// Parses the wire form produced by `Display`.
    pub fn parse(value: &str) -> Option<Self> {
        if value == "rooms" {
            return Some(TopicKey::AllRooms);
        }
        let (kind, rest) = value.split_once(':')?;
        match kind {
            "room" => rest.parse().ok().map(TopicKey::Room),
            "branch" => rest.parse().ok().map(TopicKey::Branch),
            "device-owner" => {
                let (device, user) = rest.split_once(':')?;
                Some(TopicKey::DeviceOwner {
                    device_id: device.parse().ok()?,
                    user_id: user.parse().ok()?,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKey::Room(id) => write!(f, "room:{id}"),
            TopicKey::Branch(id) => write!(f, "branch:{id}"),
            TopicKey::AllRooms => f.write_str("rooms"),
            TopicKey::DeviceOwner { device_id, user_id } => {
                write!(f, "device-owner:{device_id}:{user_id}")
            }
        }
    }
}

/// What happens when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    DropOldest,
}

/// Declaration options for a topic queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_length: usize,
    pub overflow: Overflow,
}

impl QueueOptions {
    /// Single slot, newest wins.
    pub const LATEST_VALUE: QueueOptions = QueueOptions {
        max_length: 1,
        overflow: Overflow::DropOldest,
    };
}

/// A message handed to a consumer, to be acked after fanout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: String,
    pub payload: String,
}

/// Failures of the broadcast transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// No live connection; `connect` has not run or the link dropped.
    #[error("broker is disconnected")]
    Disconnected,

    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// The broker answered with something unusable.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// `true` when the link itself is gone and the reconnect loop must run.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::Disconnected | BrokerError::Connect(_) | BrokerError::Timeout(_)
        )
    }
}

/// # Broker
///
/// The shared message broker behind the fanout. One instance per process,
/// owning its live connection and its declared-queue bookkeeping.
///
/// ## Contract:
/// - `connect` is idempotent while connected; `teardown` drops the connection
///   and forgets every declared queue.
/// - `publish` on a full queue drops the oldest unread message.
/// - `receive` waits at most `wait` and returns `None` on an empty queue.
/// - A received message is acked once it has been fanned out.
/// - `release` frees whatever a retired consumer held for its key.
/// - `close` is the final teardown at process exit.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn teardown(&self);

    /// Drops per-key receive resources once no consumer reads `key`.
    async fn release(&self, key: &TopicKey);

    async fn close(&self) {
        self.teardown().await;
    }

    async fn declare(&self, key: &TopicKey, options: QueueOptions) -> Result<(), BrokerError>;

    async fn publish(&self, key: &TopicKey, payload: &str) -> Result<(), BrokerError>;

    async fn receive(&self, key: &TopicKey, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, key: &TopicKey, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_key_wire_forms() {
        assert_eq!(TopicKey::Room(5).to_string(), "room:5");
        assert_eq!(TopicKey::Branch(2).to_string(), "branch:2");
        assert_eq!(TopicKey::AllRooms.to_string(), "rooms");
        assert_eq!(
            TopicKey::DeviceOwner { device_id: 9, user_id: 3 }.to_string(),
            "device-owner:9:3"
        );
    }

    #[test]
    fn test_topic_key_parse() {
        assert_eq!(
            TopicKey::parse("device-owner:9:3"),
            Some(TopicKey::DeviceOwner { device_id: 9, user_id: 3 })
        );
        assert_eq!(TopicKey::parse("rooms"), Some(TopicKey::AllRooms));
        assert_eq!(TopicKey::parse("room:x"), None);
        assert_eq!(TopicKey::parse("device-owner:9"), None);
        assert_eq!(TopicKey::parse("hall:1"), None);
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(BrokerError::Disconnected.is_connection_loss());
        assert!(BrokerError::Timeout(Duration::from_millis(5)).is_connection_loss());
        assert!(!BrokerError::Protocol("bad reply".into()).is_connection_loss());
    }
}
