//! # Core Fanout Module
//!
//! The broadcast side of the rooms service: everything between "a room
//! changed" and "every viewer of that room sees the change".
//!
//! ## Core Components:
//!
//! - **`broker`**: topic keys and the `Broker` contract. Topic queues hold a
//!   single latest value.
//!
//! - **`memory_broker`**: an in-process `Broker`, used by tests and by the
//!   `memory` broker backend.
//!
//! - **`registry`**: the concurrent keyed set of live viewer connections.
//!
//! - **`supervisor`**: one consumer task per key with local viewers, fanning
//!   each message out to the key's bucket.
//!
//! - **`broker_link`**: the owned connection manager. It detects broker loss,
//!   reconnects with backoff and restarts consumers.
//!
//! - **`publisher`**: serializes a `RoomView` and pushes it to its topic keys.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Topic keys and the broker contract.
pub mod broker;
/// In-process broker.
pub mod memory_broker;
/// Keyed set of viewer connections.
pub mod registry;
/// Per-key consumer tasks.
pub mod supervisor;
/// Broker connection lifecycle and reconnect loop.
pub mod broker_link;
/// Room view publisher.
pub mod publisher;

// --- Public API Re-exports ---
pub use broker::{Broker, BrokerError, Delivery, Overflow, QueueOptions, TopicKey};
pub use broker_link::{BrokerLink, LinkState, RetryPolicy};
pub use memory_broker::MemoryBroker;
pub use publisher::{topic_keys, BroadcastPublisher, PublishReport};
pub use registry::{ConnectionId, ConnectionRegistry, DeliveryError, ViewerHandle, ViewerInbox};
pub use supervisor::{fan_out, ConsumerSupervisor, FanOutReport};
