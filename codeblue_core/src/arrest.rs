//! Cardiac-arrest protocol state machine.
//!
//! `ArrestMachine` owns the single [`Session`] for an episode and is the only
//! thing that mutates it. Every action takes the wall-clock instant it
//! happened at, checks the phase graph, mutates the session and appends to the
//! intervention log. Derived view state (timers, eligibility, banner) comes
//! from pure functions over the committed session, so the UI and the action
//! guard read the same rules.

use crate::bradytachy::Handoff;
use crate::config::{GuardMode, ProtocolConfig};
use crate::dosing::{self, DoseResult};
use crate::log::{BradyTachyAction, Entry, Intervention, InterventionKind};
use crate::timer::{self, TimerState};
use crate::types::{
    AirwayStatus, ArrestPhase, CircumstanceChecklist, CprRatio, ObstetricCause,
    ObstetricIntervention, Outcome, PathwayMode, PostRoscTask, PostRoscVitals, ReversibleCausesUpdate,
    Rhythm, Session, SessionOrigin, SpecialCircumstance, VitalMetric, VitalReading,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shocks after which the first antiarrhythmic dose slot opens
const FIRST_ANTIARRHYTHMIC_SHOCK: u32 = 3;
/// Shocks after which the second antiarrhythmic dose slot opens
const SECOND_ANTIARRHYTHMIC_SHOCK: u32 = 5;
const MAX_AMIODARONE_DOSES: u32 = 2;

// ============================================================================
// Derived view state
// ============================================================================

/// Which interventions the caller may offer right now
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Eligibility {
    pub can_give_epinephrine: bool,
    pub can_give_amiodarone: bool,
    pub can_give_lidocaine: bool,
    pub epinephrine_due: bool,
    pub antiarrhythmic_due: bool,
    pub rhythm_check_due: bool,
}

fn antiarrhythmic_slots_open(shock_count: u32) -> u32 {
    match shock_count {
        n if n >= SECOND_ANTIARRHYTHMIC_SHOCK => 2,
        n if n >= FIRST_ANTIARRHYTHMIC_SHOCK => 1,
        _ => 0,
    }
}

fn interval_elapsed(last: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    last.map_or(true, |last| now - last >= interval)
}

/// Eligibility rules shared by the view state and the action guard
///
/// Epinephrine: immediately on the non-shockable path, after the second shock
/// on the shockable path, then once per medication interval. Antiarrhythmics:
/// from the third shock. The two antiarrhythmics share dose slots (one after
/// shock three, one after shock five); `antiarrhythmic_due` is true while a
/// slot is open and unused.
pub fn eligibility(session: &Session, now: DateTime<Utc>, config: &ProtocolConfig) -> Eligibility {
    let active = session.phase.is_active_cpr();

    let first_dose_ready = !session.current_rhythm.is_shockable() || session.shock_count >= 2;
    let can_give_epinephrine = active
        && first_dose_ready
        && interval_elapsed(session.last_epinephrine_time, config.medication_interval(), now);

    let antiarrhythmics_given = session.amiodarone_count + session.lidocaine_count;
    let slot_open = antiarrhythmics_given < antiarrhythmic_slots_open(session.shock_count);
    let unlocked = active && session.shock_count >= FIRST_ANTIARRHYTHMIC_SHOCK;
    let exclusive = config.guard == GuardMode::Enforce;

    let can_give_amiodarone =
        unlocked && session.amiodarone_count < MAX_AMIODARONE_DOSES && (!exclusive || slot_open);
    let can_give_lidocaine = unlocked && (!exclusive || slot_open);

    let rhythm_check_due = active
        && session
            .cpr_cycle_start_time
            .map_or(false, |start| now - start >= config.rhythm_check_interval());

    Eligibility {
        can_give_epinephrine,
        can_give_amiodarone,
        can_give_lidocaine,
        epinephrine_due: can_give_epinephrine,
        antiarrhythmic_due: unlocked && slot_open,
        rhythm_check_due,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BannerPriority {
    Critical,
    High,
    Normal,
    Info,
}

/// Guidance line shown above the controls
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Banner {
    pub message_key: &'static str,
    pub priority: BannerPriority,
    pub submessage_key: Option<&'static str>,
}

impl Banner {
    fn new(message_key: &'static str, priority: BannerPriority) -> Self {
        Self {
            message_key,
            priority,
            submessage_key: None,
        }
    }

    fn sub(mut self, key: &'static str) -> Self {
        self.submessage_key = Some(key);
        self
    }
}

/// The obstetric delivery prompt is due
pub fn delivery_prompt_due(session: &Session, now: DateTime<Utc>, config: &ProtocolConfig) -> bool {
    let pregnancy = &session.pregnancy;
    pregnancy.active
        && !pregnancy.delivery_prompt_dismissed
        && !session.phase.is_terminal()
        && pregnancy
            .activated_at
            .map_or(false, |at| now - at >= config.delivery_prompt())
}

/// Map the committed state to one banner
///
/// Emergency delivery outranks everything; within a phase a due rhythm check
/// outranks the pre-alert, which outranks routine guidance.
pub fn banner(
    session: &Session,
    timer: &TimerState,
    now: DateTime<Utc>,
    config: &ProtocolConfig,
) -> Banner {
    if delivery_prompt_due(session, now, config) {
        return Banner::new("banner.emergency_delivery", BannerPriority::Critical)
            .sub("banner.emergency_delivery.detail");
    }

    let flags = eligibility(session, now, config);
    match session.phase {
        ArrestPhase::PathwaySelection => Banner::new("banner.select_pathway", BannerPriority::Info),
        ArrestPhase::CprPendingRhythm => Banner::new("banner.start_cpr", BannerPriority::High)
            .sub("banner.attach_monitor"),
        ArrestPhase::Shockable | ArrestPhase::NonShockable => {
            if timer.check_due || flags.rhythm_check_due {
                Banner::new("banner.rhythm_check_due", BannerPriority::High)
                    .sub("banner.minimize_pause")
            } else if timer.pre_alert_due {
                let banner = Banner::new("banner.prepare_rhythm_check", BannerPriority::Normal);
                if session.phase == ArrestPhase::Shockable {
                    banner.sub("banner.charge_defibrillator")
                } else {
                    banner
                }
            } else if flags.epinephrine_due {
                Banner::new("banner.give_epinephrine", BannerPriority::Normal)
            } else if flags.antiarrhythmic_due {
                Banner::new("banner.give_antiarrhythmic", BannerPriority::Normal)
            } else if session.phase == ArrestPhase::Shockable {
                Banner::new("banner.continue_cpr", BannerPriority::Info)
                    .sub("banner.shockable_path")
            } else {
                Banner::new("banner.continue_cpr", BannerPriority::Info)
                    .sub("banner.consider_reversible_causes")
            }
        }
        ArrestPhase::RhythmCheck => Banner::new("banner.analyze_rhythm", BannerPriority::High)
            .sub("banner.check_pulse"),
        ArrestPhase::Rosc => Banner::new("banner.post_rosc_care", BannerPriority::Normal),
        ArrestPhase::Deceased => Banner::new("banner.session_ended", BannerPriority::Info),
    }
}

/// Everything the presentation layer reads after an action or tick
#[derive(Clone, Debug)]
pub struct ArrestView<'a> {
    pub session: &'a Session,
    pub timer: &'a TimerState,
    pub banner: Banner,
    pub eligibility: Eligibility,
}

/// Ticket for one tick schedule; stale once the phase changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickToken {
    session_id: Uuid,
    epoch: u64,
}

// ============================================================================
// Machine
// ============================================================================

pub struct ArrestMachine {
    session: Session,
    timer: TimerState,
    config: ProtocolConfig,
    epoch: u64,
}

impl ArrestMachine {
    pub fn new(config: ProtocolConfig, now: DateTime<Utc>) -> Self {
        let timer = TimerState::initial(&config);
        Self {
            session: Session::new(now),
            timer,
            config,
            epoch: 0,
        }
    }

    /// Start an arrest session that continues a with-pulse episode
    pub fn from_handoff(handoff: Handoff, config: ProtocolConfig, now: DateTime<Utc>) -> Self {
        let mut machine = Self::new(config, now);
        machine.session.pathway_mode = handoff.patient_group;
        if handoff.patient_group == PathwayMode::Pediatric {
            machine.session.cpr_ratio = CprRatio::FifteenToTwo;
        }
        machine.set_patient_weight(handoff.weight);
        machine.import_interventions(handoff.interventions, handoff.anchor_time, handoff.source_session_id);
        machine
    }

    /// Continue a saved session, shifting countdown anchors past the gap
    ///
    /// The gap between `saved_at` and `now` is treated as paused time, so a
    /// countdown shows what it showed when the snapshot was written.
    pub fn resume(
        mut session: Session,
        mut timer: TimerState,
        saved_at: DateTime<Utc>,
        config: ProtocolConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let gap = (now - saved_at).max(Duration::zero());
        if !session.phase.is_terminal() {
            let shift = |t: &mut Option<DateTime<Utc>>| {
                if let Some(value) = t.as_mut() {
                    *value += gap;
                }
            };
            shift(&mut session.cpr_cycle_start_time);
            shift(&mut session.last_epinephrine_time);
            shift(&mut session.last_amiodarone_time);
            shift(&mut session.rhythm_check_started_at);
        }
        tracing::info!(
            "Resumed session {} in {:?} after {} s away",
            session.id,
            session.phase,
            gap.num_seconds()
        );

        timer.computed_at = Some(now);
        let mut machine = Self {
            session,
            timer,
            config,
            epoch: 0,
        };
        machine.tick(now);
        machine
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn timer(&self) -> &TimerState {
        &self.timer
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn phase(&self) -> ArrestPhase {
        self.session.phase
    }

    pub fn eligibility(&self, now: DateTime<Utc>) -> Eligibility {
        eligibility(&self.session, now, &self.config)
    }

    pub fn banner(&self, now: DateTime<Utc>) -> Banner {
        banner(&self.session, &self.timer, now, &self.config)
    }

    pub fn view(&self, now: DateTime<Utc>) -> ArrestView<'_> {
        ArrestView {
            session: &self.session,
            timer: &self.timer,
            banner: self.banner(now),
            eligibility: self.eligibility(now),
        }
    }

    /// Energy the next shock should use for the current pathway
    pub fn next_shock_energy(&self) -> DoseResult {
        dosing::shock_energy_for(
            self.session.pathway_mode,
            self.session.dosing_weight(),
            self.session.shock_count,
            self.config.adult_energy_joules,
            self.config.max_energy_joules,
        )
    }

    // ------------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------------

    /// Recompute the timer for `now` from the committed session
    pub fn tick(&mut self, now: DateTime<Utc>) -> &TimerState {
        self.timer = timer::compute(&self.session, &self.timer, now, &self.config);
        &self.timer
    }

    /// Token for a periodic tick schedule, or `None` when no phase needs one
    pub fn tick_token(&self) -> Option<TickToken> {
        match self.session.phase {
            ArrestPhase::CprPendingRhythm
            | ArrestPhase::Shockable
            | ArrestPhase::NonShockable
            | ArrestPhase::RhythmCheck => Some(TickToken {
                session_id: self.session.id,
                epoch: self.epoch,
            }),
            _ => None,
        }
    }

    /// Tick on behalf of a schedule; ignored once its phase has ended
    pub fn scheduled_tick(&mut self, token: TickToken, now: DateTime<Utc>) -> Option<&TimerState> {
        if token.session_id != self.session.id || token.epoch != self.epoch {
            tracing::debug!("Dropping stale tick for epoch {}", token.epoch);
            return None;
        }
        Some(self.tick(now))
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: ArrestPhase, action: &'static str) -> Result<()> {
        if !self.session.phase.can_transition_to(next) {
            tracing::warn!("Rejected {} in {:?}", action, self.session.phase);
            return Err(Error::illegal(self.session.phase, action));
        }
        tracing::info!("{:?} -> {:?} ({})", self.session.phase, next, action);
        self.session.phase = next;
        self.epoch += 1;
        Ok(())
    }

    fn require_phase(&self, allowed: &[ArrestPhase], action: &'static str) -> Result<()> {
        if allowed.contains(&self.session.phase) {
            Ok(())
        } else {
            Err(Error::illegal(self.session.phase, action))
        }
    }

    fn require_not_terminal(&self, action: &'static str) -> Result<()> {
        if self.session.phase.is_terminal() {
            Err(Error::illegal(self.session.phase, action))
        } else {
            Ok(())
        }
    }

    fn guard(&self, eligible: bool, what: &str) -> Result<()> {
        if eligible {
            return Ok(());
        }
        match self.config.guard {
            GuardMode::Enforce => {
                tracing::warn!("Refused {}: not eligible", what);
                Err(Error::Ineligible(what.to_string()))
            }
            GuardMode::Trust => {
                tracing::debug!("Applying {} outside eligibility window", what);
                Ok(())
            }
        }
    }

    fn log(&mut self, now: DateTime<Utc>, entry: Entry<InterventionKind>) {
        self.session.interventions.append(now, entry);
    }

    fn change_rhythm(&mut self, rhythm: Rhythm, now: DateTime<Utc>) {
        if self.session.initial_rhythm.is_none() {
            self.session.initial_rhythm = Some(rhythm);
        }
        if self.session.current_rhythm != rhythm {
            self.session.current_rhythm = rhythm;
            self.log(
                now,
                Entry::new(InterventionKind::RhythmChange, "log.rhythm_change")
                    .text(rhythm_name(rhythm))
                    .param("rhythm", rhythm_name(rhythm)),
            );
        }
    }

    fn record_shock(&mut self, energy: Option<f64>, display: &str, now: DateTime<Utc>) {
        self.session.shock_count += 1;
        let mut entry = Entry::new(InterventionKind::Shock, "log.shock")
            .param("number", self.session.shock_count)
            .param("energy", display);
        if let Some(joules) = energy {
            entry = entry.number(joules);
        }
        self.log(now, entry);
    }

    /// Leave a rhythm check: medication clocks resume where they froze and a
    /// fresh compression cycle begins
    fn resume_compressions(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.session.rhythm_check_started_at.take() {
            let paused = (now - started).max(Duration::zero());
            if let Some(t) = self.session.last_epinephrine_time.as_mut() {
                *t += paused;
            }
            if let Some(t) = self.session.last_amiodarone_time.as_mut() {
                *t += paused;
            }
        }
        self.session.cpr_cycle_start_time = Some(now);
    }

    fn end(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        self.session.outcome = outcome;
        if self.session.end_time.is_none() {
            self.session.end_time = Some(now);
        }
        self.session.rhythm_check_started_at = None;
        self.tick(now);
    }

    // ------------------------------------------------------------------------
    // Protocol actions
    // ------------------------------------------------------------------------

    pub fn start_cpr(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ArrestPhase::CprPendingRhythm, "start_cpr")?;
        self.session.start_time = now;
        self.session.cpr_cycle_start_time = Some(now);
        let ratio = self.session.cpr_ratio;
        self.log(
            now,
            Entry::new(InterventionKind::CprStart, "log.cpr_start").param("ratio", ratio_name(ratio)),
        );
        self.tick(now);
        Ok(())
    }

    /// Identify the first rhythm; a shockable rhythm is shocked immediately
    pub fn select_rhythm(&mut self, rhythm: Rhythm, now: DateTime<Utc>) -> Result<()> {
        let next = match rhythm {
            Rhythm::Shockable => ArrestPhase::Shockable,
            Rhythm::Asystole | Rhythm::Pea => ArrestPhase::NonShockable,
            Rhythm::None => return Err(Error::Other("a rhythm must be selected".into())),
        };
        self.transition(next, "select_rhythm")?;
        self.change_rhythm(rhythm, now);

        if rhythm.is_shockable() {
            let dose = self.next_shock_energy();
            self.record_shock(dose.value, &dose.display_text, now);
        }
        self.session.cpr_cycle_start_time = Some(now);
        self.tick(now);
        Ok(())
    }

    pub fn start_rhythm_check(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.tick(now);
        self.transition(ArrestPhase::RhythmCheck, "start_rhythm_check")?;
        self.session.rhythm_check_started_at = Some(now);
        self.tick(now);
        Ok(())
    }

    pub fn complete_check_with_shock(&mut self, energy_joules: f64, now: DateTime<Utc>) -> Result<()> {
        self.transition(ArrestPhase::Shockable, "complete_check_with_shock")?;
        self.change_rhythm(Rhythm::Shockable, now);
        self.record_shock(Some(energy_joules), &format!("{} J", energy_joules), now);
        self.resume_compressions(now);
        self.tick(now);
        Ok(())
    }

    pub fn complete_check_no_shock(&mut self, rhythm: Rhythm, now: DateTime<Utc>) -> Result<()> {
        if !matches!(rhythm, Rhythm::Asystole | Rhythm::Pea) {
            return Err(Error::Other(format!(
                "no-shock resolution needs a non-shockable rhythm, got {:?}",
                rhythm
            )));
        }
        self.transition(ArrestPhase::NonShockable, "complete_check_no_shock")?;
        self.change_rhythm(rhythm, now);
        self.resume_compressions(now);
        self.tick(now);
        Ok(())
    }

    /// Rhythm unchanged; continue compressions on the same path
    pub fn complete_check_resume_cpr(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = if self.session.current_rhythm.is_shockable() {
            ArrestPhase::Shockable
        } else {
            ArrestPhase::NonShockable
        };
        self.transition(next, "complete_check_resume_cpr")?;
        self.resume_compressions(now);
        self.tick(now);
        Ok(())
    }

    pub fn give_epinephrine(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&ACTIVE_OR_CHECK, "give_epinephrine")?;
        self.guard(self.eligibility(now).can_give_epinephrine, "epinephrine")?;
        let dose = dosing::epinephrine_for(self.session.pathway_mode, self.session.dosing_weight());
        self.session.epinephrine_count += 1;
        self.session.last_epinephrine_time = Some(now);
        let entry = dose_entry(InterventionKind::Epinephrine, "log.epinephrine", &dose)
            .param("number", self.session.epinephrine_count);
        self.log(now, entry);
        self.tick(now);
        Ok(dose)
    }

    pub fn give_amiodarone(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&ACTIVE_OR_CHECK, "give_amiodarone")?;
        self.guard(self.eligibility(now).can_give_amiodarone, "amiodarone")?;
        let dose = dosing::amiodarone_for(
            self.session.pathway_mode,
            self.session.dosing_weight(),
            self.session.amiodarone_count,
        );
        self.session.amiodarone_count += 1;
        self.session.last_amiodarone_time = Some(now);
        let entry = dose_entry(InterventionKind::Amiodarone, "log.amiodarone", &dose)
            .param("number", self.session.amiodarone_count);
        self.log(now, entry);
        Ok(dose)
    }

    pub fn give_lidocaine(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&ACTIVE_OR_CHECK, "give_lidocaine")?;
        self.guard(self.eligibility(now).can_give_lidocaine, "lidocaine")?;
        let dose = dosing::lidocaine_for(
            self.session.pathway_mode,
            self.session.dosing_weight(),
            self.session.lidocaine_count,
        );
        self.session.lidocaine_count += 1;
        let entry = dose_entry(InterventionKind::Lidocaine, "log.lidocaine", &dose)
            .param("number", self.session.lidocaine_count);
        self.log(now, entry);
        Ok(dose)
    }

    /// Return of spontaneous circulation; repeated calls are no-ops
    pub fn achieve_rosc(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.session.phase == ArrestPhase::Rosc {
            return Ok(());
        }
        self.transition(ArrestPhase::Rosc, "achieve_rosc")?;
        self.session.rosc_time = Some(now);
        self.log(now, Entry::new(InterventionKind::Rosc, "log.rosc"));
        self.end(Outcome::Rosc, now);
        Ok(())
    }

    /// Stop resuscitation; repeated calls are no-ops
    pub fn terminate(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.session.phase == ArrestPhase::Deceased {
            return Ok(());
        }
        self.transition(ArrestPhase::Deceased, "terminate")?;
        self.log(now, Entry::new(InterventionKind::Termination, "log.termination"));
        self.end(Outcome::Deceased, now);
        Ok(())
    }

    /// Discard the episode and start over at pathway selection
    pub fn reset(&mut self, now: DateTime<Utc>) {
        tracing::info!("Resetting session {}", self.session.id);
        self.session = Session::new(now);
        self.timer = TimerState::initial(&self.config);
        self.epoch += 1;
    }

    /// Merge a finalized with-pulse timeline into this session
    ///
    /// `anchor_time` is stored verbatim as the start of deterioration.
    pub fn import_interventions(
        &mut self,
        interventions: Vec<Intervention<BradyTachyAction>>,
        anchor_time: DateTime<Utc>,
        source_session_id: Uuid,
    ) -> usize {
        self.session.brady_tachy_start_time = Some(anchor_time);
        self.session.origin = SessionOrigin::BradyTachyHandoff { source_session_id };
        let imported = self
            .session
            .interventions
            .import(interventions.into_iter().map(|e| e.map_kind(InterventionKind::BradyTachy)));
        tracing::info!(
            "Imported {} interventions from session {}",
            imported,
            source_session_id
        );
        imported
    }

    // ------------------------------------------------------------------------
    // Patient context
    // ------------------------------------------------------------------------

    pub fn set_patient_weight(&mut self, weight: Option<f64>) {
        self.session.patient_weight = weight.filter(|w| w.is_finite() && *w > 0.0);
    }

    pub fn set_cpr_ratio(&mut self, ratio: CprRatio) {
        self.session.cpr_ratio = ratio;
    }

    pub fn set_pathway_mode(&mut self, mode: PathwayMode) -> Result<()> {
        self.require_not_terminal("set_pathway_mode")?;
        self.session.pathway_mode = mode;
        if mode == PathwayMode::Pediatric && self.session.interventions.is_empty() {
            self.session.cpr_ratio = CprRatio::FifteenToTwo;
        }
        Ok(())
    }

    pub fn set_airway(&mut self, status: AirwayStatus, now: DateTime<Utc>) -> Result<()> {
        self.require_not_terminal("set_airway")?;
        if self.session.airway_status != status {
            self.session.airway_status = status;
            self.log(
                now,
                Entry::new(InterventionKind::AirwayChange, "log.airway")
                    .text(airway_name(status))
                    .param("airway", airway_name(status)),
            );
        }
        Ok(())
    }

    pub fn record_etco2(&mut self, value: f64, now: DateTime<Utc>) -> Result<()> {
        self.require_not_terminal("record_etco2")?;
        self.session.vital_readings.push(VitalReading {
            timestamp: now,
            metric: VitalMetric::Etco2,
            value,
        });
        self.log(
            now,
            Entry::new(InterventionKind::Etco2, "log.etco2").number(value).param("value", value),
        );
        Ok(())
    }

    pub fn update_reversible_causes(&mut self, update: &ReversibleCausesUpdate, now: DateTime<Utc>) {
        for cause in self.session.reversible_causes.apply(update) {
            self.log(
                now,
                Entry::new(InterventionKind::ReversibleCauseCheck, "log.reversible_cause")
                    .text(cause)
                    .param("cause", cause),
            );
        }
    }

    pub fn add_note(&mut self, text: &str, now: DateTime<Utc>) {
        self.log(now, Entry::new(InterventionKind::Note, "log.note").text(text));
    }

    // ------------------------------------------------------------------------
    // Checklists
    // ------------------------------------------------------------------------

    pub fn toggle_pregnancy(&mut self, now: DateTime<Utc>) {
        let pregnancy = &mut self.session.pregnancy;
        pregnancy.active = !pregnancy.active;
        if pregnancy.active && pregnancy.activated_at.is_none() {
            pregnancy.activated_at = Some(now);
        }
    }

    pub fn dismiss_delivery_prompt(&mut self) {
        self.session.pregnancy.delivery_prompt_dismissed = true;
    }

    pub fn update_pregnancy_causes(&mut self, changes: &[(ObstetricCause, bool)]) {
        for (cause, checked) in changes {
            if *checked {
                self.session.pregnancy.causes.insert(*cause);
            } else {
                self.session.pregnancy.causes.remove(cause);
            }
        }
    }

    pub fn update_pregnancy_interventions(&mut self, changes: &[(ObstetricIntervention, bool)]) {
        for (intervention, done) in changes {
            if *done {
                self.session.pregnancy.interventions.insert(*intervention);
            } else {
                self.session.pregnancy.interventions.remove(intervention);
            }
        }
    }

    pub fn toggle_special_circumstance(&mut self, key: SpecialCircumstance) {
        let checklist = self
            .session
            .special_circumstances
            .entry(key)
            .or_insert_with(|| CircumstanceChecklist {
                active: false,
                items: key
                    .checklist_items()
                    .iter()
                    .map(|item| (item.to_string(), false))
                    .collect(),
            });
        checklist.active = !checklist.active;
    }

    pub fn update_special_circumstance_checklist(
        &mut self,
        key: SpecialCircumstance,
        item: &str,
        checked: bool,
    ) -> Result<()> {
        if !key.checklist_items().contains(&item) {
            return Err(Error::Other(format!("{:?} has no checklist item '{}'", key, item)));
        }
        let checklist = self.session.special_circumstances.entry(key).or_default();
        checklist.items.insert(item.to_string(), checked);
        Ok(())
    }

    pub fn update_post_rosc_checklist(&mut self, task: PostRoscTask, done: bool) -> Result<()> {
        self.require_phase(&[ArrestPhase::Rosc], "update_post_rosc_checklist")?;
        if done {
            self.session.post_rosc.completed.insert(task);
        } else {
            self.session.post_rosc.completed.remove(&task);
        }
        Ok(())
    }

    pub fn update_post_rosc_vitals(&mut self, vitals: &PostRoscVitals) -> Result<()> {
        self.require_phase(&[ArrestPhase::Rosc], "update_post_rosc_vitals")?;
        self.session.post_rosc.vitals.merge(vitals);
        Ok(())
    }
}

const ACTIVE_OR_CHECK: [ArrestPhase; 3] = [
    ArrestPhase::Shockable,
    ArrestPhase::NonShockable,
    ArrestPhase::RhythmCheck,
];

fn dose_entry(kind: InterventionKind, key: &str, dose: &DoseResult) -> Entry<InterventionKind> {
    let entry = Entry::new(kind, key).param("dose", &dose.display_text);
    match dose.value {
        Some(value) => entry.number(value),
        None => entry,
    }
}

fn rhythm_name(rhythm: Rhythm) -> &'static str {
    match rhythm {
        Rhythm::None => "none",
        Rhythm::Shockable => "vf_pvt",
        Rhythm::Asystole => "asystole",
        Rhythm::Pea => "pea",
    }
}

fn airway_name(status: AirwayStatus) -> &'static str {
    match status {
        AirwayStatus::BagMask => "bag_mask",
        AirwayStatus::Supraglottic => "supraglottic",
        AirwayStatus::Tube => "tube",
    }
}

fn ratio_name(ratio: CprRatio) -> &'static str {
    match ratio {
        CprRatio::FifteenToTwo => "15:2",
        CprRatio::ThirtyToTwo => "30:2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InterventionKind;

    fn secs(t0: DateTime<Utc>, s: i64) -> DateTime<Utc> {
        t0 + Duration::seconds(s)
    }

    fn started(mode: PathwayMode, weight: Option<f64>) -> (ArrestMachine, DateTime<Utc>) {
        let t0 = Utc::now();
        let mut machine = ArrestMachine::new(ProtocolConfig::default(), t0);
        machine.set_pathway_mode(mode).unwrap();
        machine.set_patient_weight(weight);
        machine.start_cpr(t0).unwrap();
        (machine, t0)
    }

    fn check_and_shock(machine: &mut ArrestMachine, at: DateTime<Utc>) {
        machine.start_rhythm_check(at).unwrap();
        machine
            .complete_check_with_shock(200.0, at + Duration::seconds(5))
            .unwrap();
    }

    #[test]
    fn test_shockable_selection_delivers_first_shock() {
        crate::logging::init_test();
        let (mut machine, t0) = started(PathwayMode::Pediatric, Some(20.0));
        machine.select_rhythm(Rhythm::Shockable, secs(t0, 10)).unwrap();

        let session = machine.session();
        assert_eq!(session.phase, ArrestPhase::Shockable);
        assert_eq!(session.shock_count, 1);
        assert_eq!(session.initial_rhythm, Some(Rhythm::Shockable));
        let shocks: Vec<_> = session
            .interventions
            .iter()
            .filter(|e| e.kind == InterventionKind::Shock)
            .collect();
        assert_eq!(shocks.len(), 1);
        assert_eq!(shocks[0].number(), Some(40.0));
    }

    #[test]
    fn test_pediatric_shock_respects_configured_ceiling() {
        let t0 = Utc::now();
        let config = ProtocolConfig {
            max_energy_joules: 200,
            ..ProtocolConfig::default()
        };
        config.validate().unwrap();
        let mut machine = ArrestMachine::new(config, t0);
        machine.set_pathway_mode(PathwayMode::Pediatric).unwrap();
        machine.set_patient_weight(Some(150.0));
        machine.start_cpr(t0).unwrap();
        machine.select_rhythm(Rhythm::Shockable, secs(t0, 10)).unwrap();

        let shock = machine.session().interventions.last().unwrap();
        assert_eq!(shock.kind, InterventionKind::Shock);
        assert_eq!(shock.number(), Some(200.0));
        assert_eq!(machine.next_shock_energy().value, Some(200.0));
    }

    #[test]
    fn test_adult_first_shock_uses_configured_energy() {
        let (mut machine, t0) = started(PathwayMode::Adult, Some(20.0));
        machine.select_rhythm(Rhythm::Shockable, secs(t0, 10)).unwrap();
        let shock = machine.session().interventions.last().unwrap();
        assert_eq!(shock.kind, InterventionKind::Shock);
        assert_eq!(shock.number(), Some(200.0));
    }

    #[test]
    fn test_full_shockable_sequence_unlocks_antiarrhythmics() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();
        assert!(!machine.eligibility(t0).can_give_amiodarone);

        check_and_shock(&mut machine, secs(t0, 120));
        check_and_shock(&mut machine, secs(t0, 245));
        check_and_shock(&mut machine, secs(t0, 370));

        let now = secs(t0, 380);
        assert_eq!(machine.session().shock_count, 4);
        let flags = machine.eligibility(now);
        assert!(flags.can_give_amiodarone);
        assert!(flags.can_give_lidocaine);
        assert!(flags.antiarrhythmic_due);
    }

    #[test]
    fn test_epinephrine_waits_for_second_shock_on_shockable_path() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();
        assert!(!machine.eligibility(secs(t0, 30)).can_give_epinephrine);

        check_and_shock(&mut machine, secs(t0, 120));
        assert!(machine.eligibility(secs(t0, 130)).can_give_epinephrine);
    }

    #[test]
    fn test_epinephrine_immediate_on_non_shockable_then_interval() {
        let (mut machine, t0) = started(PathwayMode::Pediatric, Some(10.0));
        machine.select_rhythm(Rhythm::Asystole, t0).unwrap();
        assert!(machine.eligibility(t0).can_give_epinephrine);

        let dose = machine.give_epinephrine(secs(t0, 5)).unwrap();
        assert_eq!(dose.value, Some(0.1));
        assert!(!machine.eligibility(secs(t0, 60)).can_give_epinephrine);
        assert!(machine.eligibility(secs(t0, 245)).can_give_epinephrine);
    }

    #[test]
    fn test_rhythm_check_freezes_medication_clock() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Pea, t0).unwrap();
        machine.give_epinephrine(t0).unwrap();

        machine.start_rhythm_check(secs(t0, 120)).unwrap();
        machine.complete_check_resume_cpr(secs(t0, 150)).unwrap();

        // 30 s of check time do not count toward the 240 s interval
        assert!(!machine.eligibility(secs(t0, 250)).can_give_epinephrine);
        assert!(machine.eligibility(secs(t0, 270)).can_give_epinephrine);
        let timer = machine.tick(secs(t0, 150));
        assert_eq!(timer.cycle_remaining_ms, 120_000);
        assert_eq!(timer.medication_interval_remaining_ms, 120_000);
    }

    #[test]
    fn test_check_resolutions_move_along_graph() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();

        machine.start_rhythm_check(secs(t0, 120)).unwrap();
        machine.complete_check_no_shock(Rhythm::Pea, secs(t0, 125)).unwrap();
        assert_eq!(machine.phase(), ArrestPhase::NonShockable);
        assert_eq!(machine.session().current_rhythm, Rhythm::Pea);
        assert_eq!(machine.session().initial_rhythm, Some(Rhythm::Shockable));

        machine.start_rhythm_check(secs(t0, 250)).unwrap();
        machine.complete_check_resume_cpr(secs(t0, 255)).unwrap();
        assert_eq!(machine.phase(), ArrestPhase::NonShockable);
        assert_eq!(machine.session().cpr_cycle_start_time, Some(secs(t0, 255)));
    }

    #[test]
    fn test_illegal_actions_are_rejected() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        assert!(matches!(
            machine.complete_check_with_shock(200.0, t0),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(machine.achieve_rosc(t0).is_err());
        assert!(machine.select_rhythm(Rhythm::None, t0).is_err());

        machine.select_rhythm(Rhythm::Asystole, t0).unwrap();
        machine.start_rhythm_check(secs(t0, 120)).unwrap();
        assert!(machine
            .complete_check_no_shock(Rhythm::Shockable, secs(t0, 121))
            .is_err());
        assert_eq!(machine.phase(), ArrestPhase::RhythmCheck);
    }

    #[test]
    fn test_terminal_transitions_are_idempotent() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Asystole, t0).unwrap();
        machine.start_rhythm_check(secs(t0, 120)).unwrap();
        machine.achieve_rosc(secs(t0, 125)).unwrap();
        machine.achieve_rosc(secs(t0, 200)).unwrap();

        let session = machine.session();
        assert_eq!(session.outcome, Outcome::Rosc);
        assert_eq!(session.end_time, Some(secs(t0, 125)));
        assert_eq!(
            session.interventions.count_where(|k| *k == InterventionKind::Rosc),
            1
        );
        assert!(machine.terminate(secs(t0, 300)).is_err());
    }

    #[test]
    fn test_counters_never_decrease() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();
        let mut last = (0, 0);
        for cycle in 1..=6 {
            check_and_shock(&mut machine, secs(t0, cycle * 125));
            let _ = machine.give_epinephrine(secs(t0, cycle * 125 + 10));
            let s = machine.session();
            assert!(s.shock_count >= last.0);
            assert!(s.epinephrine_count >= last.1);
            last = (s.shock_count, s.epinephrine_count);
        }
        assert_eq!(last.0, 7);
    }

    #[test]
    fn test_enforce_guard_refuses_ineligible_drugs() {
        let t0 = Utc::now();
        let config = ProtocolConfig {
            guard: GuardMode::Enforce,
            ..ProtocolConfig::default()
        };
        let mut machine = ArrestMachine::new(config, t0);
        machine.start_cpr(t0).unwrap();
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();
        assert!(matches!(machine.give_epinephrine(t0), Err(Error::Ineligible(_))));
        assert_eq!(machine.session().epinephrine_count, 0);

        for n in 1..=3 {
            check_and_shock(&mut machine, secs(t0, n * 125));
        }
        let now = secs(t0, 400);
        machine.give_amiodarone(now).unwrap();
        // The only open slot is used; lidocaine now has to wait for shock five
        assert!(!machine.eligibility(now).antiarrhythmic_due);
        assert!(matches!(machine.give_lidocaine(now), Err(Error::Ineligible(_))));
    }

    #[test]
    fn test_trust_guard_applies_ineligible_drug() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Shockable, t0).unwrap();
        machine.give_epinephrine(t0).unwrap();
        assert_eq!(machine.session().epinephrine_count, 1);
    }

    #[test]
    fn test_banner_priorities() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Pea, t0).unwrap();
        machine.give_epinephrine(t0).unwrap();

        machine.tick(secs(t0, 30));
        assert_eq!(machine.banner(secs(t0, 30)).message_key, "banner.continue_cpr");

        machine.tick(secs(t0, 110));
        assert_eq!(machine.banner(secs(t0, 110)).message_key, "banner.prepare_rhythm_check");

        machine.tick(secs(t0, 121));
        let due = machine.banner(secs(t0, 121));
        assert_eq!(due.message_key, "banner.rhythm_check_due");
        assert_eq!(due.priority, BannerPriority::High);

        machine.toggle_pregnancy(t0);
        let now = secs(t0, 301);
        machine.tick(now);
        let delivery = machine.banner(now);
        assert_eq!(delivery.message_key, "banner.emergency_delivery");
        assert_eq!(delivery.priority, BannerPriority::Critical);

        machine.dismiss_delivery_prompt();
        assert_eq!(machine.banner(now).message_key, "banner.rhythm_check_due");
    }

    #[test]
    fn test_stale_tick_token_is_dropped() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        let token = machine.tick_token().unwrap();
        assert!(machine.scheduled_tick(token, secs(t0, 1)).is_some());

        machine.select_rhythm(Rhythm::Asystole, secs(t0, 2)).unwrap();
        assert!(machine.scheduled_tick(token, secs(t0, 3)).is_none());

        machine.start_rhythm_check(secs(t0, 120)).unwrap();
        machine.achieve_rosc(secs(t0, 125)).unwrap();
        assert!(machine.tick_token().is_none());
    }

    #[test]
    fn test_resume_pauses_countdown_across_gap() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.select_rhythm(Rhythm::Asystole, t0).unwrap();
        let saved_at = secs(t0, 40);
        let original = machine.tick(saved_at).cycle_remaining_ms;

        let session = machine.session().clone();
        let timer = machine.timer().clone();
        let now = saved_at + Duration::seconds(90);
        let mut resumed = ArrestMachine::resume(session, timer, saved_at, ProtocolConfig::default(), now);

        let live = resumed.tick(now).cycle_remaining_ms;
        let tick = ProtocolConfig::default().tick_interval_ms as i64;
        assert!((original - live).abs() <= tick);
        assert_eq!(resumed.timer().total_active_ms, 40_000);
    }

    #[test]
    fn test_import_stores_anchor_unmodified() {
        let t0 = Utc::now();
        let anchor = t0 - Duration::minutes(7);
        let mut machine = ArrestMachine::new(ProtocolConfig::default(), t0);
        let mut source = crate::log::InterventionLog::default();
        source.append(anchor, Entry::new(BradyTachyAction::Atropine, "bt.atropine").number(1.0));

        let source_id = Uuid::new_v4();
        machine.import_interventions(source.into_entries(), anchor, source_id);
        machine.start_cpr(t0).unwrap();

        let session = machine.session();
        assert_eq!(session.brady_tachy_start_time, Some(anchor));
        assert_eq!(session.timeline_origin(), anchor);
        assert_eq!(session.session_type(), crate::types::SessionType::BradytachyArrest);
        assert_eq!(
            session.interventions.entries()[0].kind,
            InterventionKind::BradyTachy(BradyTachyAction::Atropine)
        );
    }

    #[test]
    fn test_handoff_starts_merged_session() {
        let t0 = Utc::now();
        let mut brady = crate::bradytachy::BradyTachyMachine::new(ProtocolConfig::default(), t0);
        brady.set_patient_group(PathwayMode::Pediatric).unwrap();
        brady.set_patient_weight(Some(12.0));
        brady.set_branch(crate::types::Branch::Bradycardia).unwrap();
        brady.give_atropine(secs(t0, 60)).unwrap();
        let handoff = brady.switch_to_arrest(secs(t0, 300)).unwrap();

        let mut machine = ArrestMachine::from_handoff(handoff, ProtocolConfig::default(), secs(t0, 301));
        machine.start_cpr(secs(t0, 301)).unwrap();

        let session = machine.session();
        assert_eq!(session.pathway_mode, PathwayMode::Pediatric);
        assert_eq!(session.patient_weight, Some(12.0));
        assert_eq!(session.cpr_ratio, CprRatio::FifteenToTwo);
        assert_eq!(session.brady_tachy_start_time, Some(t0));
        assert_eq!(session.interventions.len(), 3);
        assert_eq!(session.interventions.last().unwrap().kind, InterventionKind::CprStart);
    }

    #[test]
    fn test_checklists() {
        let (mut machine, t0) = started(PathwayMode::Adult, None);
        machine.update_reversible_causes(
            &ReversibleCausesUpdate {
                hypoxia: Some(true),
                ..Default::default()
            },
            t0,
        );
        machine.toggle_special_circumstance(SpecialCircumstance::OpioidOverdose);
        machine
            .update_special_circumstance_checklist(SpecialCircumstance::OpioidOverdose, "naloxone", true)
            .unwrap();
        assert!(machine
            .update_special_circumstance_checklist(SpecialCircumstance::OpioidOverdose, "calcium", true)
            .is_err());
        assert!(machine
            .update_post_rosc_checklist(PostRoscTask::TwelveLeadEcg, true)
            .is_err());

        let session = machine.session();
        let opioid = &session.special_circumstances[&SpecialCircumstance::OpioidOverdose];
        assert!(opioid.active);
        assert_eq!(opioid.items.get("naloxone"), Some(&true));
        assert_eq!(
            session
                .interventions
                .count_where(|k| *k == InterventionKind::ReversibleCauseCheck),
            1
        );
    }
}
