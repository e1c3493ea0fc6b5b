//! # Sessions Module
//!
//! Everything that decides *what* a room's occupancy session looks like.
//!
//! ## Components:
//!
//! - **`model`**: rooms, devices, sessions and the `RoomView` read model.
//! - **`lifecycle`**: pure transition rules and elapsed-time arithmetic.
//! - **`clock`**: the time source, swappable in tests.
//! - **`store`**: the persistence and device-activity contracts.
//! - **`memory_store`**: the in-process implementation of both contracts.
//! - **`engine`**: drives a store and a device collaborator through the rules.
//! - **`sweeper`**: the periodic job that finalizes expired sessions.

/// Data types and the `RoomView` projection.
pub mod model;
/// The session state machine.
pub mod lifecycle;
/// Wall clock abstraction.
pub mod clock;
/// Store and device-activity traits.
pub mod store;
/// In-memory store and device collaborator.
pub mod memory_store;
/// The session lifecycle engine.
pub mod engine;
/// Reconciliation sweeper.
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::SessionEngine;
pub use lifecycle::SessionOp;
pub use memory_store::{MemorySeed, MemorySessionStore};
pub use store::{DeviceActivity, SessionStore, Transition};
pub use sweeper::{SweepReport, Sweeper};
