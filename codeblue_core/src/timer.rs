//! Timer engine.
//!
//! Countdowns are derived from the absolute anchors stored in the session on
//! every tick, so a missed or late tick never drifts. The one accumulated
//! quantity is `total_active_ms`, which only grows while compressions are
//! genuinely ongoing.

use crate::config::ProtocolConfig;
use crate::types::{ArrestPhase, Session};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Derived countdowns; never the source of truth
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TimerState {
    pub cycle_remaining_ms: i64,
    pub medication_interval_remaining_ms: i64,
    pub total_elapsed_ms: i64,
    pub total_active_ms: i64,
    pub pre_alert_due: bool,
    pub check_due: bool,
    /// Instant this state was computed for
    pub computed_at: Option<DateTime<Utc>>,
}

impl TimerState {
    /// State before any tick: both countdowns at their configured length
    pub fn initial(config: &ProtocolConfig) -> Self {
        Self {
            cycle_remaining_ms: config.rhythm_check_interval_ms as i64,
            medication_interval_remaining_ms: config.medication_interval_ms as i64,
            ..Self::default()
        }
    }
}

fn remaining(interval: Duration, anchor: Option<DateTime<Utc>>, reference: DateTime<Utc>) -> i64 {
    match anchor {
        Some(anchor) => (interval - (reference - anchor)).num_milliseconds().max(0),
        None => 0,
    }
}

/// Recompute every timer field for `now`
///
/// During a rhythm check the countdowns are evaluated at the instant the
/// check started, which freezes them without resetting. While the rhythm is
/// still pending both countdowns sit at their full length.
pub fn compute(
    session: &Session,
    previous: &TimerState,
    now: DateTime<Utc>,
    config: &ProtocolConfig,
) -> TimerState {
    let phase = session.phase;
    let end = session.end_time.unwrap_or(now);

    let (cycle_remaining_ms, medication_interval_remaining_ms) = match phase {
        ArrestPhase::PathwaySelection | ArrestPhase::CprPendingRhythm => (
            config.rhythm_check_interval_ms as i64,
            config.medication_interval_ms as i64,
        ),
        _ => {
            let reference = match phase {
                ArrestPhase::RhythmCheck => session.rhythm_check_started_at.unwrap_or(now),
                _ => end,
            };
            (
                remaining(config.rhythm_check_interval(), session.cpr_cycle_start_time, reference),
                remaining(config.medication_interval(), session.last_epinephrine_time, reference),
            )
        }
    };

    let total_elapsed_ms = match phase {
        ArrestPhase::PathwaySelection => 0,
        _ => (end - session.start_time).num_milliseconds().max(0),
    };

    let total_active_ms = previous.total_active_ms + active_delta(session, previous, now);

    let active = phase.is_active_cpr();
    TimerState {
        cycle_remaining_ms,
        medication_interval_remaining_ms,
        total_elapsed_ms,
        total_active_ms,
        pre_alert_due: active
            && cycle_remaining_ms > 0
            && cycle_remaining_ms <= config.pre_alert_ms as i64,
        check_due: active && cycle_remaining_ms == 0,
        computed_at: Some(now),
    }
}

/// Compression time between the previous tick and `now`
///
/// The current cycle began at `cpr_cycle_start_time`; it ends at `now` while
/// compressions continue, or at the start of the rhythm check that paused it.
fn active_delta(session: &Session, previous: &TimerState, now: DateTime<Utc>) -> i64 {
    let until = match session.phase {
        phase if phase.is_active_cpr() => now,
        ArrestPhase::RhythmCheck => match session.rhythm_check_started_at {
            Some(started) => started,
            None => return 0,
        },
        _ => return 0,
    };
    let since = match (previous.computed_at, session.cpr_cycle_start_time) {
        (Some(last), Some(cycle)) => last.max(cycle),
        (None, Some(cycle)) => cycle,
        (Some(last), None) => last,
        (None, None) => return 0,
    };
    (until - since).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rhythm;

    fn active_session(t0: DateTime<Utc>) -> Session {
        let mut session = Session::new(t0);
        session.phase = ArrestPhase::NonShockable;
        session.current_rhythm = Rhythm::Asystole;
        session.initial_rhythm = Some(Rhythm::Asystole);
        session.cpr_cycle_start_time = Some(t0);
        session
    }

    #[test]
    fn test_pending_rhythm_holds_full_intervals() {
        let config = ProtocolConfig::default();
        let t0 = Utc::now();
        let mut session = Session::new(t0);
        session.phase = ArrestPhase::CprPendingRhythm;
        session.cpr_cycle_start_time = Some(t0);

        let state = compute(&session, &TimerState::initial(&config), t0 + Duration::seconds(50), &config);
        assert_eq!(state.cycle_remaining_ms, 120_000);
        assert_eq!(state.medication_interval_remaining_ms, 240_000);
        assert_eq!(state.total_active_ms, 0);
        assert_eq!(state.total_elapsed_ms, 50_000);
    }

    #[test]
    fn test_cycle_countdown_and_alerts() {
        let config = ProtocolConfig::default();
        let t0 = Utc::now();
        let session = active_session(t0);

        let early = compute(&session, &TimerState::default(), t0 + Duration::seconds(30), &config);
        assert_eq!(early.cycle_remaining_ms, 90_000);
        assert!(!early.pre_alert_due);
        assert!(!early.check_due);

        let pre = compute(&session, &early, t0 + Duration::seconds(110), &config);
        assert_eq!(pre.cycle_remaining_ms, 10_000);
        assert!(pre.pre_alert_due);

        let due = compute(&session, &pre, t0 + Duration::seconds(125), &config);
        assert_eq!(due.cycle_remaining_ms, 0);
        assert!(due.check_due);
        assert!(!due.pre_alert_due);
    }

    #[test]
    fn test_rhythm_check_freezes_countdowns() {
        let config = ProtocolConfig::default();
        let t0 = Utc::now();
        let mut session = active_session(t0);
        session.last_epinephrine_time = Some(t0);

        let before = compute(&session, &TimerState::default(), t0 + Duration::seconds(60), &config);
        session.phase = ArrestPhase::RhythmCheck;
        session.rhythm_check_started_at = Some(t0 + Duration::seconds(60));

        let during = compute(&session, &before, t0 + Duration::seconds(75), &config);
        assert_eq!(during.cycle_remaining_ms, 60_000);
        assert_eq!(during.medication_interval_remaining_ms, 180_000);
        assert!(!during.check_due);
        assert_eq!(during.total_active_ms, 60_000);
    }

    #[test]
    fn test_active_time_excludes_check_pause() {
        let config = ProtocolConfig::default();
        let t0 = Utc::now();
        let mut session = active_session(t0);

        let mut state = TimerState::default();
        state = compute(&session, &state, t0 + Duration::seconds(100), &config);

        // Check starts at 110 s and lasts 20 s, no tick in between
        session.phase = ArrestPhase::RhythmCheck;
        session.rhythm_check_started_at = Some(t0 + Duration::seconds(110));
        state = compute(&session, &state, t0 + Duration::seconds(125), &config);
        assert_eq!(state.total_active_ms, 110_000);

        session.phase = ArrestPhase::NonShockable;
        session.rhythm_check_started_at = None;
        session.cpr_cycle_start_time = Some(t0 + Duration::seconds(130));
        state = compute(&session, &state, t0 + Duration::seconds(140), &config);
        assert_eq!(state.total_active_ms, 120_000);
        assert_eq!(state.cycle_remaining_ms, 110_000);
    }

    #[test]
    fn test_medication_remaining_without_dose_is_zero() {
        let config = ProtocolConfig::default();
        let t0 = Utc::now();
        let session = active_session(t0);
        let state = compute(&session, &TimerState::default(), t0 + Duration::seconds(5), &config);
        assert_eq!(state.medication_interval_remaining_ms, 0);
    }
}
