//! # Session and Room Model
//!
//! Plain data types for rooms, their linked devices and occupancy sessions,
//! plus the `RoomView` read model that is broadcast to viewers.
//!
//! `RoomView` is always rebuilt from typed fields at publish time. It is never
//! stored, so its derived timings are exactly as fresh as the `now` it was
//! projected at.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a room.
pub type RoomId = i64;
/// Identifier of the branch owning a room.
pub type BranchId = i64;
/// Identifier of a physical device linked to a room.
pub type DeviceId = i64;
/// Identifier of a user owning a device.
pub type UserId = i64;
/// Identifier of an occupancy session.
pub type SessionId = Uuid;

/// Operational state of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Active,
    Inactive,
    Deleted,
}

impl RoomState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomState::Active => "active",
            RoomState::Inactive => "inactive",
            RoomState::Deleted => "deleted",
        }
    }

    /// Parses the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RoomState::Active),
            "inactive" => Some(RoomState::Inactive),
            "deleted" => Some(RoomState::Deleted),
            _ => None,
        }
    }
}

/// Lifecycle status of an occupancy session.
///
/// `Idle` is not a status: a room without an open session simply has no
/// `InUse`/`Paused` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InUse,
    Paused,
    Finalized,
    Cancelled,
}

impl SessionStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InUse => "in_use",
            SessionStatus::Paused => "paused",
            SessionStatus::Finalized => "finalized",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_use" => Some(SessionStatus::InUse),
            "paused" => Some(SessionStatus::Paused),
            "finalized" => Some(SessionStatus::Finalized),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    /// `true` for `InUse` and `Paused`.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::InUse | SessionStatus::Paused)
    }

    /// `true` once the row is frozen.
    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

/// A rentable room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub branch_id: BranchId,
    pub name: String,
    pub state: RoomState,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

/// A physical device whose activity follows the room's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub owner_user_id: Option<UserId>,
    #[serde(default)]
    pub active: bool,
}

/// One billable reservation interval for a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancySession {
    pub id: SessionId,
    pub room_id: RoomId,
    pub customer_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    /// Set iff `status == Paused`.
    pub paused_at: Option<DateTime<Utc>>,
    pub accumulated_pause: Duration,
    pub status: SessionStatus,
    /// Written by the billing collaborator, carried as minor currency units.
    pub billed_time_cost: i64,
    /// Time of the terminal transition.
    pub ended_at: Option<DateTime<Utc>>,
}

impl OccupancySession {
    /// The instant billing time is measured against. Frozen at `paused_at`
    /// while the session is paused.
    fn billing_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.status, self.paused_at) {
            (SessionStatus::Paused, Some(paused_at)) => paused_at.min(now),
            _ => now,
        }
    }

    /// `now - startedAt - accumulatedPauseDuration`, never negative.
    pub fn elapsed_billable(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = self.billing_instant(now) - self.started_at - self.accumulated_pause;
        elapsed.max(Duration::zero())
    }

    /// `scheduledEndAt - now`, never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.scheduled_end_at - self.billing_instant(now);
        remaining.max(Duration::zero())
    }
}

/// Serialized form of an open session inside a `RoomView`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: SessionId,
    pub customer_id: Option<i64>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub accumulated_pause_seconds: i64,
    pub billed_time_cost: i64,
}

impl From<&OccupancySession> for SessionView {
    fn from(session: &OccupancySession) -> Self {
        SessionView {
            id: session.id,
            customer_id: session.customer_id,
            status: session.status,
            started_at: session.started_at,
            scheduled_end_at: session.scheduled_end_at,
            paused_at: session.paused_at,
            accumulated_pause_seconds: session.accumulated_pause.num_seconds(),
            billed_time_cost: session.billed_time_cost,
        }
    }
}

/// Point-in-time projection of a room, its device and its open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub room_id: RoomId,
    pub branch_id: BranchId,
    pub name: String,
    pub state: RoomState,
    pub device: Option<Device>,
    pub session: Option<SessionView>,
    pub elapsed_billable_seconds: Option<i64>,
    pub remaining_seconds: Option<i64>,
    pub generated_at: DateTime<Utc>,
}

impl RoomView {
    /// Projects a room at `now`. Terminal sessions are dropped: a room whose
    /// latest session is finalized or cancelled is shown as idle.
    pub fn project(
        room: &Room,
        device: Option<Device>,
        session: Option<&OccupancySession>,
        now: DateTime<Utc>,
    ) -> Self {
        let open = session.filter(|s| s.status.is_open());
        RoomView {
            room_id: room.id,
            branch_id: room.branch_id,
            name: room.name.clone(),
            state: room.state,
            device,
            session: open.map(SessionView::from),
            elapsed_billable_seconds: open.map(|s| s.elapsed_billable(now).num_seconds()),
            remaining_seconds: open.map(|s| s.remaining(now).num_seconds()),
            generated_at: now,
        }
    }

    /// `true` when the room has an open session.
    pub fn is_occupied(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn session(status: SessionStatus) -> OccupancySession {
        OccupancySession {
            id: Uuid::new_v4(),
            room_id: 5,
            customer_id: Some(11),
            started_at: t0(),
            scheduled_end_at: t0() + Duration::seconds(3600),
            paused_at: None,
            accumulated_pause: Duration::seconds(120),
            status,
            billed_time_cost: 0,
            ended_at: None,
        }
    }

    fn room() -> Room {
        Room {
            id: 5,
            branch_id: 2,
            name: "Sala 5".to_string(),
            state: RoomState::Active,
            device_id: Some(9),
        }
    }

    #[test]
    fn test_elapsed_and_remaining_for_running_session() {
        let s = session(SessionStatus::InUse);
        let now = t0() + Duration::seconds(1000);
        assert_eq!(s.elapsed_billable(now), Duration::seconds(880));
        assert_eq!(s.remaining(now), Duration::seconds(2600));
    }

    #[test]
    fn test_paused_session_freezes_timings() {
        let mut s = session(SessionStatus::Paused);
        s.paused_at = Some(t0() + Duration::seconds(600));
        let later = t0() + Duration::seconds(5000);
        assert_eq!(s.elapsed_billable(later), Duration::seconds(480));
        assert_eq!(s.remaining(later), Duration::seconds(3000));
    }

    #[test]
    fn test_remaining_is_clamped_after_scheduled_end() {
        let s = session(SessionStatus::InUse);
        let now = t0() + Duration::seconds(4000);
        assert_eq!(s.remaining(now), Duration::zero());
    }

    #[test]
    fn test_projection_hides_terminal_sessions() {
        let s = session(SessionStatus::Finalized);
        let view = RoomView::project(&room(), None, Some(&s), t0());
        assert!(!view.is_occupied());
        assert_eq!(view.remaining_seconds, None);
    }

    #[test]
    fn test_view_serializes_camel_case() {
        let s = session(SessionStatus::InUse);
        let view = RoomView::project(&room(), None, Some(&s), t0() + Duration::seconds(60));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["roomId"], 5);
        assert_eq!(json["branchId"], 2);
        assert_eq!(json["session"]["status"], "in_use");
        assert_eq!(json["session"]["accumulatedPauseSeconds"], 120);
        assert_eq!(json["remainingSeconds"], 3540);
    }

    #[test]
    fn test_status_round_trips_database_strings() {
        for status in [
            SessionStatus::InUse,
            SessionStatus::Paused,
            SessionStatus::Finalized,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("open"), None);
    }
}
