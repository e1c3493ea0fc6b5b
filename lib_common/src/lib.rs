//! # lib_common
//!
//! Shared library behind the rooms servers. It carries the occupancy-session
//! engine for billable room rentals and the fanout layer that keeps every
//! connected viewer looking at the latest state of each room.
//!
//! ## Layout
//! - **`sessions`**: the session model, the transition rules, the store and
//!   device collaborators, the engine that drives them and the sweeper that
//!   finalizes expired sessions.
//! - **`core`**: the broadcast side. Topic keys and the broker contract, the
//!   connection registry, the per-key consumer supervisor, the broker link that
//!   reconnects, and the publisher.
//! - **`connections`** (feature `connections`): Postgres and Redis backed
//!   implementations of the store and broker contracts.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod error;
pub mod sessions;
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

// Re-export the types most callers need.
pub use error::{RoomError, RoomResult};
pub use sessions::model::{Device, OccupancySession, Room, RoomState, RoomView, SessionStatus};
pub use sessions::engine::SessionEngine;
pub use crate::core::broker::{Broker, BrokerError, TopicKey};
