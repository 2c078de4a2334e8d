//! Bradycardia / tachycardia with pulse.
//!
//! A decision tree rather than a timed loop: each answer is recorded in the
//! [`DecisionContext`] and some answers move the phase forward. Every logged
//! action carries a copy of the context at that moment. When the patient
//! loses their pulse the episode is frozen and its timeline is handed to the
//! arrest machine as a [`Handoff`].

use crate::config::ProtocolConfig;
use crate::dosing::{self, DoseResult};
use crate::log::{BradyTachyAction, Entry, Intervention};
use crate::types::{
    BradyTachyOutcome, BradyTachyPhase, BradyTachySession, Branch, CardioversionRhythm, PathwayMode,
    QrsWidth, Regularity, SinusVsSvt, Stability,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Finalized with-pulse timeline passed to the arrest machine
#[derive(Clone, Debug)]
pub struct Handoff {
    pub source_session_id: Uuid,
    /// When deterioration began; becomes the arrest timeline origin
    pub anchor_time: DateTime<Utc>,
    pub patient_group: PathwayMode,
    pub weight: Option<f64>,
    pub interventions: Vec<Intervention<BradyTachyAction>>,
}

const BRADY_PHASES: [BradyTachyPhase; 2] = [
    BradyTachyPhase::BradycardiaAssessment,
    BradyTachyPhase::BradycardiaTreatment,
];

const TACHY_PHASES: [BradyTachyPhase; 4] = [
    BradyTachyPhase::TachycardiaAssessment,
    BradyTachyPhase::TachycardiaSinusEvaluation,
    BradyTachyPhase::TachycardiaCompromiseAssessment,
    BradyTachyPhase::TachycardiaTreatment,
];

pub struct BradyTachyMachine {
    session: BradyTachySession,
    config: ProtocolConfig,
}

impl BradyTachyMachine {
    pub fn new(config: ProtocolConfig, now: DateTime<Utc>) -> Self {
        Self {
            session: BradyTachySession::new(now),
            config,
        }
    }

    /// Continue a saved episode; nothing here is time-driven
    pub fn resume(session: BradyTachySession, config: ProtocolConfig) -> Self {
        tracing::info!("Resumed brady/tachy session {} in {:?}", session.id, session.phase);
        Self { session, config }
    }

    pub fn session(&self) -> &BradyTachySession {
        &self.session
    }

    pub fn phase(&self) -> BradyTachyPhase {
        self.session.phase
    }

    fn group(&self) -> PathwayMode {
        self.session.context.patient_group.unwrap_or_default()
    }

    fn transition(&mut self, next: BradyTachyPhase, action: &'static str) -> Result<()> {
        if !self.session.phase.can_transition_to(next) {
            tracing::warn!("Rejected {} in {:?}", action, self.session.phase);
            return Err(Error::illegal(self.session.phase, action));
        }
        tracing::info!("{:?} -> {:?} ({})", self.session.phase, next, action);
        self.session.phase = next;
        Ok(())
    }

    fn require_open(&self, action: &'static str) -> Result<()> {
        if self.session.phase == BradyTachyPhase::SessionEnded {
            Err(Error::illegal(self.session.phase, action))
        } else {
            Ok(())
        }
    }

    fn require_phase(&self, allowed: &[BradyTachyPhase], action: &'static str) -> Result<()> {
        if allowed.contains(&self.session.phase) {
            Ok(())
        } else {
            Err(Error::illegal(self.session.phase, action))
        }
    }

    fn log(&mut self, now: DateTime<Utc>, entry: Entry<BradyTachyAction>) {
        let entry = entry.context(self.session.context.clone());
        self.session.interventions.append(now, entry);
    }

    fn log_dose(&mut self, action: BradyTachyAction, key: &str, dose: &DoseResult, now: DateTime<Utc>) {
        let mut entry = Entry::new(action, key).param("dose", &dose.display_text);
        if let Some(value) = dose.value {
            entry = entry.number(value);
        }
        self.log(now, entry);
    }

    // ------------------------------------------------------------------------
    // Decision answers
    // ------------------------------------------------------------------------

    /// Adult or pediatric; the first answer opens branch selection
    pub fn set_patient_group(&mut self, group: PathwayMode) -> Result<()> {
        self.require_open("set_patient_group")?;
        self.session.context.patient_group = Some(group);
        if self.session.phase == BradyTachyPhase::PatientSelection {
            self.transition(BradyTachyPhase::BranchSelection, "set_patient_group")?;
        }
        Ok(())
    }

    pub fn set_patient_weight(&mut self, weight: Option<f64>) {
        self.session.context.weight = weight.filter(|w| w.is_finite() && *w > 0.0);
    }

    pub fn set_branch(&mut self, branch: Branch) -> Result<()> {
        let next = match branch {
            Branch::Bradycardia => BradyTachyPhase::BradycardiaAssessment,
            Branch::Tachycardia => BradyTachyPhase::TachycardiaAssessment,
        };
        self.transition(next, "set_branch")?;
        self.session.context.branch = Some(branch);
        Ok(())
    }

    /// Stability verdict; moves either branch into treatment
    pub fn set_stability(&mut self, stability: Stability) -> Result<()> {
        let next = match self.session.phase {
            BradyTachyPhase::BradycardiaAssessment | BradyTachyPhase::BradycardiaTreatment => {
                BradyTachyPhase::BradycardiaTreatment
            }
            _ => BradyTachyPhase::TachycardiaTreatment,
        };
        if self.session.phase != next {
            self.transition(next, "set_stability")?;
        }
        self.session.context.stability = Some(stability);
        Ok(())
    }

    /// QRS width; a narrow complex in a child opens sinus-vs-SVT evaluation
    pub fn set_qrs_width(&mut self, width: QrsWidth) -> Result<()> {
        self.require_phase(&TACHY_PHASES, "set_qrs_width")?;
        self.session.context.qrs_width = Some(width);
        if width == QrsWidth::Narrow
            && self.session.context.is_pediatric()
            && self.session.phase == BradyTachyPhase::TachycardiaAssessment
        {
            self.transition(BradyTachyPhase::TachycardiaSinusEvaluation, "set_qrs_width")?;
        }
        Ok(())
    }

    pub fn set_rhythm_regularity(&mut self, regularity: Regularity) -> Result<()> {
        self.require_phase(&TACHY_PHASES, "set_rhythm_regularity")?;
        self.session.context.regularity = Some(regularity);
        Ok(())
    }

    pub fn set_monomorphic(&mut self, monomorphic: bool) -> Result<()> {
        self.require_phase(&TACHY_PHASES, "set_monomorphic")?;
        self.session.context.monomorphic = Some(monomorphic);
        Ok(())
    }

    /// Record the sinus-vs-SVT verdict
    ///
    /// Probable sinus keeps the phase and switches guidance to treating the
    /// cause. Probable SVT moves on to the compromise assessment.
    pub fn set_sinus_vs_svt(&mut self, choice: SinusVsSvt, criteria: Vec<String>) -> Result<()> {
        self.require_phase(
            &[
                BradyTachyPhase::TachycardiaSinusEvaluation,
                BradyTachyPhase::TachycardiaCompromiseAssessment,
            ],
            "set_sinus_vs_svt",
        )?;
        self.session.context.sinus_vs_svt = Some(choice);
        self.session.context.sinus_criteria = criteria;
        match choice {
            SinusVsSvt::ProbableSinus => self.session.context.cause_directed_therapy = true,
            SinusVsSvt::ProbableSvt => {
                self.session.context.cause_directed_therapy = false;
                if self.session.phase == BradyTachyPhase::TachycardiaSinusEvaluation {
                    self.transition(
                        BradyTachyPhase::TachycardiaCompromiseAssessment,
                        "set_sinus_vs_svt",
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Confirm probable sinus tachycardia and log it
    pub fn select_pediatric_sinus_tachycardia(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_phase(
            &[BradyTachyPhase::TachycardiaSinusEvaluation],
            "select_pediatric_sinus_tachycardia",
        )?;
        self.session.context.sinus_vs_svt = Some(SinusVsSvt::ProbableSinus);
        self.session.context.cause_directed_therapy = true;
        self.log(
            now,
            Entry::new(BradyTachyAction::SinusTachycardiaIdentified, "bt.sinus_tachycardia"),
        );
        Ok(())
    }

    pub fn advance_to_compromise_assessment(&mut self) -> Result<()> {
        self.transition(
            BradyTachyPhase::TachycardiaCompromiseAssessment,
            "advance_to_compromise_assessment",
        )
    }

    pub fn set_cardioversion_rhythm_type(&mut self, rhythm: CardioversionRhythm) -> Result<()> {
        self.require_phase(&TACHY_PHASES, "set_cardioversion_rhythm_type")?;
        self.session.context.cardioversion_rhythm = Some(rhythm);
        Ok(())
    }

    /// Navigation escape hatch; ending still goes through the ending actions
    pub fn set_phase(&mut self, phase: BradyTachyPhase) -> Result<()> {
        if phase == BradyTachyPhase::SessionEnded || self.session.phase == BradyTachyPhase::SessionEnded {
            return Err(Error::illegal(self.session.phase, "set_phase"));
        }
        tracing::info!("{:?} -> {:?} (set_phase)", self.session.phase, phase);
        self.session.phase = phase;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Bradycardia treatment
    // ------------------------------------------------------------------------

    pub fn give_atropine(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&BRADY_PHASES, "give_atropine")?;
        let dose = dosing::atropine_for(self.group(), self.session.context.dosing_weight());
        self.session.atropine_count += 1;
        self.log_dose(BradyTachyAction::Atropine, "bt.atropine", &dose, now);
        Ok(dose)
    }

    pub fn start_dopamine(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&BRADY_PHASES, "start_dopamine")?;
        let dose = dosing::dopamine_rate();
        self.log_dose(BradyTachyAction::Dopamine, "bt.dopamine", &dose, now);
        Ok(dose)
    }

    pub fn start_epinephrine_infusion(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&BRADY_PHASES, "start_epinephrine_infusion")?;
        let dose = dosing::epinephrine_infusion_for(self.group());
        self.log_dose(BradyTachyAction::EpinephrineInfusion, "bt.epinephrine_infusion", &dose, now);
        Ok(dose)
    }

    pub fn start_pacing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_phase(&BRADY_PHASES, "start_pacing")?;
        self.log(now, Entry::new(BradyTachyAction::TranscutaneousPacing, "bt.pacing"));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tachycardia treatment
    // ------------------------------------------------------------------------

    pub fn perform_vagal_maneuver(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require_phase(&TACHY_PHASES, "perform_vagal_maneuver")?;
        self.log(now, Entry::new(BradyTachyAction::VagalManeuver, "bt.vagal_maneuver"));
        Ok(())
    }

    pub fn give_adenosine(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&TACHY_PHASES, "give_adenosine")?;
        let dose = dosing::adenosine_for(
            self.group(),
            self.session.context.dosing_weight(),
            self.session.adenosine_count,
        );
        self.session.adenosine_count += 1;
        self.log_dose(BradyTachyAction::Adenosine, "bt.adenosine", &dose, now);
        Ok(dose)
    }

    pub fn perform_cardioversion(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&TACHY_PHASES, "perform_cardioversion")?;
        let energy = dosing::cardioversion_energy_for(
            self.group(),
            self.session.context.dosing_weight(),
            self.session.context.cardioversion_rhythm,
            self.session.cardioversion_count,
            self.config.max_energy_joules,
        );
        self.session.cardioversion_count += 1;
        self.log_dose(
            BradyTachyAction::SynchronizedCardioversion,
            "bt.cardioversion",
            &energy,
            now,
        );
        Ok(energy)
    }

    pub fn give_amiodarone(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&TACHY_PHASES, "give_amiodarone")?;
        let dose = dosing::stable_amiodarone_for(self.group(), self.session.context.dosing_weight());
        self.log_dose(BradyTachyAction::Amiodarone, "bt.amiodarone", &dose, now);
        Ok(dose)
    }

    pub fn give_procainamide(&mut self, now: DateTime<Utc>) -> Result<DoseResult> {
        self.require_phase(&TACHY_PHASES, "give_procainamide")?;
        let dose = dosing::procainamide_for(self.group(), self.session.context.dosing_weight());
        self.log_dose(BradyTachyAction::Procainamide, "bt.procainamide", &dose, now);
        Ok(dose)
    }

    pub fn add_note(&mut self, text: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_open("add_note")?;
        self.log(now, Entry::new(BradyTachyAction::Note, "bt.note").text(text));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Ending
    // ------------------------------------------------------------------------

    fn finish(&mut self, outcome: BradyTachyOutcome, now: DateTime<Utc>, action: &'static str) -> Result<()> {
        self.transition(BradyTachyPhase::SessionEnded, action)?;
        self.session.outcome = Some(outcome);
        self.session.end_time = Some(now);
        Ok(())
    }

    /// The patient lost their pulse: freeze this episode and hand it over
    ///
    /// Nothing is written to history here; the arrest session that receives
    /// the handoff carries this timeline into its own record.
    pub fn switch_to_arrest(&mut self, now: DateTime<Utc>) -> Result<Handoff> {
        self.require_open("switch_to_arrest")?;
        self.log(now, Entry::new(BradyTachyAction::SwitchToArrest, "bt.switch_to_arrest"));
        self.finish(BradyTachyOutcome::SwitchedToArrest, now, "switch_to_arrest")?;
        self.session.switched_to_arrest_time = Some(now);

        Ok(Handoff {
            source_session_id: self.session.id,
            anchor_time: self.session.start_time,
            patient_group: self.group(),
            weight: self.session.context.weight,
            interventions: self.session.interventions.entries().to_vec(),
        })
    }

    /// Close the episode as resolved or transferred
    pub fn end_session(&mut self, outcome: BradyTachyOutcome, now: DateTime<Utc>) -> Result<()> {
        if outcome == BradyTachyOutcome::SwitchedToArrest {
            return Err(Error::Other("use switch_to_arrest to hand off to the arrest protocol".into()));
        }
        self.finish(outcome, now, "end_session")
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        tracing::info!("Resetting brady/tachy session {}", self.session.id);
        self.session = BradyTachySession::new(now);
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn machine(group: PathwayMode, branch: Branch) -> (BradyTachyMachine, DateTime<Utc>) {
        let t0 = Utc::now();
        let mut machine = BradyTachyMachine::new(ProtocolConfig::default(), t0);
        machine.set_patient_group(group).unwrap();
        machine.set_branch(branch).unwrap();
        (machine, t0)
    }

    #[test]
    fn test_adult_tachycardia_goes_straight_to_treatment() {
        let (mut machine, _) = machine(PathwayMode::Adult, Branch::Tachycardia);
        machine.set_qrs_width(QrsWidth::Narrow).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaAssessment);

        machine.set_stability(Stability::Unstable).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaTreatment);
    }

    #[test]
    fn test_pediatric_narrow_complex_sinus_evaluation() {
        let (mut machine, t0) = machine(PathwayMode::Pediatric, Branch::Tachycardia);
        machine.set_patient_weight(Some(15.0));
        machine.set_qrs_width(QrsWidth::Narrow).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaSinusEvaluation);

        machine
            .set_sinus_vs_svt(SinusVsSvt::ProbableSinus, vec!["p_waves_present".into()])
            .unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaSinusEvaluation);
        assert!(machine.session().context.cause_directed_therapy);

        machine.select_pediatric_sinus_tachycardia(t0).unwrap();
        assert_eq!(machine.session().interventions.len(), 1);

        machine.set_sinus_vs_svt(SinusVsSvt::ProbableSvt, vec![]).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaCompromiseAssessment);
        assert!(!machine.session().context.cause_directed_therapy);

        machine.set_stability(Stability::Stable).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::TachycardiaTreatment);

        let dose = machine.give_adenosine(t0).unwrap();
        assert_eq!(dose.value, Some(1.5));
        let second = machine.give_adenosine(t0).unwrap();
        assert_eq!(second.value, Some(3.0));
    }

    #[test]
    fn test_bradycardia_treatment_logs_context() {
        let (mut machine, t0) = machine(PathwayMode::Pediatric, Branch::Bradycardia);
        machine.set_patient_weight(Some(3.0));
        machine.set_stability(Stability::Unstable).unwrap();
        assert_eq!(machine.phase(), BradyTachyPhase::BradycardiaTreatment);

        let dose = machine.give_atropine(t0).unwrap();
        // 0.06 mg clamps up to the 0.1 mg floor
        assert_eq!(dose.value, Some(0.1));
        let entry = machine.session().interventions.last().unwrap();
        let context = entry.context.as_ref().unwrap();
        assert_eq!(context.stability, Some(Stability::Unstable));
        assert_eq!(machine.session().atropine_count, 1);

        assert!(machine.give_adenosine(t0).is_err());
    }

    #[test]
    fn test_switch_to_arrest_freezes_and_hands_off() {
        let (mut machine, t0) = machine(PathwayMode::Adult, Branch::Bradycardia);
        machine.give_atropine(t0 + Duration::minutes(1)).unwrap();

        let at = t0 + Duration::minutes(4);
        let handoff = machine.switch_to_arrest(at).unwrap();

        let session = machine.session();
        assert_eq!(session.outcome, Some(BradyTachyOutcome::SwitchedToArrest));
        assert_eq!(session.phase, BradyTachyPhase::SessionEnded);
        assert_eq!(session.switched_to_arrest_time, Some(at));
        assert_eq!(session.end_time, Some(at));

        assert_eq!(handoff.anchor_time, t0);
        assert_eq!(handoff.source_session_id, session.id);
        assert_eq!(handoff.interventions.len(), 2);
        assert_eq!(
            handoff.interventions.last().map(|e| e.kind),
            Some(BradyTachyAction::SwitchToArrest)
        );

        assert!(machine.switch_to_arrest(at).is_err());
        assert!(machine.give_atropine(at).is_err());
    }

    #[test]
    fn test_end_session_outcomes() {
        let (mut machine, t0) = machine(PathwayMode::Adult, Branch::Tachycardia);
        assert!(machine
            .end_session(BradyTachyOutcome::SwitchedToArrest, t0)
            .is_err());
        machine.end_session(BradyTachyOutcome::Transferred, t0).unwrap();
        assert_eq!(machine.session().outcome, Some(BradyTachyOutcome::Transferred));
        assert!(machine.session().validate().is_ok());
        assert!(machine.end_session(BradyTachyOutcome::Resolved, t0).is_err());
    }

    #[test]
    fn test_set_phase_navigation() {
        let (mut machine, t0) = machine(PathwayMode::Adult, Branch::Tachycardia);
        machine.set_phase(BradyTachyPhase::BranchSelection).unwrap();
        machine.set_branch(Branch::Bradycardia).unwrap();
        assert!(machine.set_phase(BradyTachyPhase::SessionEnded).is_err());

        machine.end_session(BradyTachyOutcome::Resolved, t0).unwrap();
        assert!(machine.set_phase(BradyTachyPhase::BranchSelection).is_err());
    }

    #[test]
    fn test_illegal_branch_order() {
        let t0 = Utc::now();
        let mut machine = BradyTachyMachine::new(ProtocolConfig::default(), t0);
        assert!(matches!(
            machine.set_branch(Branch::Bradycardia),
            Err(Error::IllegalTransition { .. })
        ));
    }
}
