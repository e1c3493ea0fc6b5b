//! # Room Error Taxonomy
//!
//! Every fallible operation on sessions and room views returns a `RoomError`.
//! State-machine violations are reported synchronously to the operator that
//! triggered them; transport failures only ever reach logs.

use thiserror::Error;

use crate::core::broker::BrokerError;

/// Errors raised by the session engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// No room, device or session matches the request.
    #[error("{0} not found")]
    NotFound(String),

    /// The transition is not legal from the current session state.
    #[error("cannot {op} room {room_id}: {reason}")]
    InvalidState {
        room_id: i64,
        op: &'static str,
        reason: String,
    },

    /// The room already has an open (in use or paused) session.
    #[error("room {0} already has an open session")]
    Conflict(i64),

    /// The request carried an unusable value (e.g. a non-positive duration).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Broker or socket I/O failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected persistence failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type RoomResult<T> = Result<T, RoomError>;

impl RoomError {
    /// Builds an `InvalidState` error for `op` on `room_id`.
    pub fn invalid_state(room_id: i64, op: &'static str, reason: impl Into<String>) -> Self {
        RoomError::InvalidState {
            room_id,
            op,
            reason: reason.into(),
        }
    }

    /// Short machine-readable label, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::NotFound(_) => "NotFound",
            RoomError::InvalidState { .. } => "InvalidState",
            RoomError::Conflict(_) => "Conflict",
            RoomError::InvalidInput(_) => "InvalidInput",
            RoomError::Transport(_) => "TransportError",
            RoomError::Internal(_) => "Internal",
        }
    }
}

impl From<BrokerError> for RoomError {
    fn from(err: BrokerError) -> Self {
        RoomError::Transport(err.to_string())
    }
}

#[cfg(feature = "connections")]
impl From<sqlx::Error> for RoomError {
    fn from(err: sqlx::Error) -> Self {
        RoomError::Internal(err.to_string())
    }
}
