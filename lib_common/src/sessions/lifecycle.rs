//! # Session Lifecycle Rules
//!
//! The state machine for a single occupancy session, kept free of I/O so both
//! stores apply exactly the same rules under their own per-room lock.
//!
//! ```text
//! Idle --assign--> InUse <--pause/resume--> Paused
//!                    |                        |
//!                    +--cancel/finalize-------+--> Cancelled | Finalized
//! ```
//!
//! Terminal rows are never touched again; a new assignment opens a new row.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{RoomError, RoomResult};
use crate::sessions::model::{OccupancySession, RoomId, SessionStatus};

/// Upper bound on the booked time of one session (duration plus extensions,
/// pauses excluded).
pub const MAX_BOOKED_SECONDS: i64 = 366 * 24 * 60 * 60;

/// A transition on a room's open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    Pause,
    Resume,
    ExtendOrReduce { delta_seconds: i64 },
    Cancel,
    Finalize,
}

impl SessionOp {
    /// Verb used in logs and `InvalidState` messages.
    pub fn name(&self) -> &'static str {
        match self {
            SessionOp::Pause => "pause",
            SessionOp::Resume => "resume",
            SessionOp::ExtendOrReduce { .. } => "extend",
            SessionOp::Cancel => "cancel",
            SessionOp::Finalize => "finalize",
        }
    }

    /// The `active` flag the linked device must take after this transition,
    /// or `None` when the device is left alone.
    pub fn device_effect(&self) -> Option<bool> {
        match self {
            SessionOp::Pause => Some(false),
            SessionOp::Resume => Some(true),
            SessionOp::ExtendOrReduce { .. } => None,
            SessionOp::Cancel | SessionOp::Finalize => Some(false),
        }
    }
}

/// Builds a fresh `InUse` session starting at `now`.
pub fn open_session(
    room_id: RoomId,
    customer_id: Option<i64>,
    duration_seconds: i64,
    now: DateTime<Utc>,
) -> RoomResult<OccupancySession> {
    if duration_seconds <= 0 {
        return Err(RoomError::InvalidInput(format!(
            "duration must be positive, got {duration_seconds}s"
        )));
    }
    if duration_seconds > MAX_BOOKED_SECONDS {
        return Err(RoomError::InvalidInput(format!(
            "duration {duration_seconds}s exceeds the {MAX_BOOKED_SECONDS}s limit"
        )));
    }
    let scheduled_end_at = Duration::try_seconds(duration_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            RoomError::InvalidInput(format!("duration {duration_seconds}s is out of range"))
        })?;

    Ok(OccupancySession {
        id: Uuid::new_v4(),
        room_id,
        customer_id,
        started_at: now,
        scheduled_end_at,
        paused_at: None,
        accumulated_pause: Duration::zero(),
        status: SessionStatus::InUse,
        billed_time_cost: 0,
        ended_at: None,
    })
}

/// Applies `op` to `session` at `now` and returns the updated row.
///
/// The input is left untouched; callers persist the result only on `Ok`.
pub fn apply(
    op: SessionOp,
    session: &OccupancySession,
    now: DateTime<Utc>,
) -> RoomResult<OccupancySession> {
    let room_id = session.room_id;
    let mut next = session.clone();

    match (op, session.status) {
        (SessionOp::Pause, SessionStatus::InUse) if session.paused_at.is_none() => {
            next.paused_at = Some(now);
            next.status = SessionStatus::Paused;
        }
        (SessionOp::Resume, SessionStatus::Paused) => {
            let delta = pause_delta(session, now);
            next.accumulated_pause = saturating_add(session.accumulated_pause, delta);
            next.scheduled_end_at = session
                .scheduled_end_at
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            next.paused_at = None;
            next.status = SessionStatus::InUse;
        }
        (SessionOp::ExtendOrReduce { delta_seconds }, SessionStatus::InUse) => {
            next.scheduled_end_at = shifted_end(session, delta_seconds)?;
        }
        (SessionOp::Cancel, status) | (SessionOp::Finalize, status) if status.is_open() => {
            close(&mut next, now);
            next.status = if op == SessionOp::Cancel {
                SessionStatus::Cancelled
            } else {
                SessionStatus::Finalized
            };
        }
        (_, status) => {
            return Err(RoomError::invalid_state(
                room_id,
                op.name(),
                format!("session is {}", status.as_str()),
            ));
        }
    }

    Ok(next)
}

/// Finalizes `session` if it is running and its scheduled end is at or before
/// `now`. Paused sessions never expire.
pub fn finalize_expired(session: &OccupancySession, now: DateTime<Utc>) -> Option<OccupancySession> {
    if session.status != SessionStatus::InUse || session.scheduled_end_at > now {
        return None;
    }
    let mut next = session.clone();
    close(&mut next, now);
    next.status = SessionStatus::Finalized;
    Some(next)
}

/// Time spent in the current pause, never negative.
fn pause_delta(session: &OccupancySession, now: DateTime<Utc>) -> Duration {
    session
        .paused_at
        .map(|paused_at| (now - paused_at).max(Duration::zero()))
        .unwrap_or_else(Duration::zero)
}

/// Folds an in-progress pause into the accumulated total and stamps the end.
fn close(session: &mut OccupancySession, now: DateTime<Utc>) {
    let delta = pause_delta(session, now);
    session.accumulated_pause = saturating_add(session.accumulated_pause, delta);
    session.paused_at = None;
    session.ended_at = Some(now);
}

fn saturating_add(a: Duration, b: Duration) -> Duration {
    a.checked_add(&b).unwrap_or(Duration::MAX)
}

/// `max(startedAt, scheduledEndAt + delta)`, saturating toward `startedAt` for
/// out-of-range reductions. Extensions past `MAX_BOOKED_SECONDS` of booked
/// time are rejected.
fn shifted_end(session: &OccupancySession, delta_seconds: i64) -> RoomResult<DateTime<Utc>> {
    let out_of_range = || {
        RoomError::InvalidInput(format!(
            "extension of {delta_seconds}s exceeds the {MAX_BOOKED_SECONDS}s booking limit"
        ))
    };
    let shifted = Duration::try_seconds(delta_seconds)
        .and_then(|d| session.scheduled_end_at.checked_add_signed(d));

    let end = match shifted {
        Some(end) => end.max(session.started_at),
        None if delta_seconds < 0 => return Ok(session.started_at),
        None => return Err(out_of_range()),
    };
    let booked = (end - session.started_at)
        .checked_sub(&session.accumulated_pause)
        .unwrap_or_else(Duration::zero);
    if delta_seconds > 0 && booked.num_seconds() > MAX_BOOKED_SECONDS {
        return Err(out_of_range());
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn test_pause_resume_shifts_end_by_pause_length() {
        let s = open_session(5, None, 3600, t0()).unwrap();
        let paused = apply(SessionOp::Pause, &s, t0() + secs(600)).unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.paused_at, Some(t0() + secs(600)));

        let resumed = apply(SessionOp::Resume, &paused, t0() + secs(900)).unwrap();
        assert_eq!(resumed.status, SessionStatus::InUse);
        assert_eq!(resumed.paused_at, None);
        assert_eq!(resumed.scheduled_end_at, t0() + secs(3900));
        assert_eq!(resumed.accumulated_pause, secs(300));
    }

    #[test]
    fn test_resume_preserves_remaining_time() {
        let s = open_session(1, None, 1800, t0()).unwrap();
        let before = s.remaining(t0() + secs(100));
        let paused = apply(SessionOp::Pause, &s, t0() + secs(100)).unwrap();
        let resumed = apply(SessionOp::Resume, &paused, t0() + secs(700)).unwrap();
        assert_eq!(resumed.remaining(t0() + secs(700)), before);
    }

    #[test]
    fn test_non_positive_duration_is_rejected() {
        assert!(matches!(
            open_session(1, None, 0, t0()),
            Err(RoomError::InvalidInput(_))
        ));
        assert!(matches!(
            open_session(1, None, -30, t0()),
            Err(RoomError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reduce_never_moves_end_before_start() {
        let s = open_session(1, None, 600, t0()).unwrap();
        let reduced = apply(SessionOp::ExtendOrReduce { delta_seconds: -3600 }, &s, t0()).unwrap();
        assert_eq!(reduced.scheduled_end_at, t0());

        let extreme = apply(SessionOp::ExtendOrReduce { delta_seconds: i64::MIN }, &s, t0()).unwrap();
        assert_eq!(extreme.scheduled_end_at, t0());
    }

    #[test]
    fn test_extend_only_from_in_use() {
        let s = open_session(3, None, 600, t0()).unwrap();
        let extended = apply(SessionOp::ExtendOrReduce { delta_seconds: 300 }, &s, t0()).unwrap();
        assert_eq!(extended.scheduled_end_at, t0() + secs(900));

        let paused = apply(SessionOp::Pause, &s, t0()).unwrap();
        let err = apply(SessionOp::ExtendOrReduce { delta_seconds: 300 }, &paused, t0()).unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
    }

    #[test]
    fn test_invalid_transitions_report_invalid_state() {
        let s = open_session(4, None, 600, t0()).unwrap();
        assert!(apply(SessionOp::Resume, &s, t0()).is_err());

        let paused = apply(SessionOp::Pause, &s, t0()).unwrap();
        assert!(apply(SessionOp::Pause, &paused, t0()).is_err());

        let cancelled = apply(SessionOp::Cancel, &paused, t0() + secs(60)).unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(cancelled.paused_at, None);
        assert_eq!(cancelled.accumulated_pause, secs(60));
        assert_eq!(cancelled.ended_at, Some(t0() + secs(60)));

        for op in [SessionOp::Cancel, SessionOp::Finalize, SessionOp::Pause, SessionOp::Resume] {
            let err = apply(op, &cancelled, t0() + secs(61)).unwrap_err();
            assert!(matches!(err, RoomError::InvalidState { room_id: 4, .. }));
        }
    }

    #[test]
    fn test_finalize_expired_skips_running_and_paused_sessions() {
        let s = open_session(6, None, 60, t0()).unwrap();
        assert!(finalize_expired(&s, t0() + secs(59)).is_none());

        let done = finalize_expired(&s, t0() + secs(60)).unwrap();
        assert_eq!(done.status, SessionStatus::Finalized);

        let paused = apply(SessionOp::Pause, &s, t0() + secs(10)).unwrap();
        assert!(finalize_expired(&paused, t0() + secs(600)).is_none());
    }

    #[test]
    fn test_extend_stops_at_booking_limit_and_resume_still_works() {
        let s = open_session(2, None, 60, t0()).unwrap();
        let mut current = s.clone();
        let mut rejected = None;
        for _ in 0..64 {
            match apply(SessionOp::ExtendOrReduce { delta_seconds: i64::MAX / 2 }, &current, t0()) {
                Ok(next) => current = next,
                Err(err) => {
                    rejected = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(rejected, Some(RoomError::InvalidInput(_))));
        assert_eq!(current.scheduled_end_at, s.scheduled_end_at);

        let near_limit = apply(
            SessionOp::ExtendOrReduce { delta_seconds: MAX_BOOKED_SECONDS - 60 },
            &current,
            t0(),
        )
        .unwrap();
        assert_eq!(near_limit.scheduled_end_at, t0() + secs(MAX_BOOKED_SECONDS));
        assert!(apply(SessionOp::ExtendOrReduce { delta_seconds: 1 }, &near_limit, t0()).is_err());

        let paused = apply(SessionOp::Pause, &near_limit, t0() + secs(10)).unwrap();
        let resumed = apply(SessionOp::Resume, &paused, t0() + secs(3610)).unwrap();
        assert_eq!(resumed.status, SessionStatus::InUse);
        assert_eq!(resumed.scheduled_end_at, t0() + secs(MAX_BOOKED_SECONDS + 3600));
        assert_eq!(resumed.accumulated_pause, secs(3600));
    }

    #[test]
    fn test_resume_saturates_instead_of_overflowing() {
        let mut s = open_session(2, None, 60, t0()).unwrap();
        s.scheduled_end_at = DateTime::<Utc>::MAX_UTC - secs(5);
        let paused = apply(SessionOp::Pause, &s, t0()).unwrap();
        let resumed = apply(SessionOp::Resume, &paused, t0() + secs(60)).unwrap();
        assert_eq!(resumed.scheduled_end_at, DateTime::<Utc>::MAX_UTC);

        let cancelled = apply(SessionOp::Cancel, &paused, t0() + secs(60)).unwrap();
        assert_eq!(cancelled.accumulated_pause, secs(60));
    }

    #[test]
    fn test_oversized_duration_is_rejected() {
        assert!(matches!(
            open_session(1, None, MAX_BOOKED_SECONDS + 1, t0()),
            Err(RoomError::InvalidInput(_))
        ));
        assert!(open_session(1, None, MAX_BOOKED_SECONDS, t0()).is_ok());
    }

    #[test]
    fn test_device_effects() {
        assert_eq!(SessionOp::Pause.device_effect(), Some(false));
        assert_eq!(SessionOp::Resume.device_effect(), Some(true));
        assert_eq!(SessionOp::ExtendOrReduce { delta_seconds: 1 }.device_effect(), None);
        assert_eq!(SessionOp::Finalize.device_effect(), Some(false));
    }
}
