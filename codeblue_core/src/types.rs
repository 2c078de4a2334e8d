//! Core domain types for the CodeBlue protocol engine.
//!
//! This module defines the aggregates mutated by the two protocol machines:
//! - Patient context (pathway mode, CPR ratio, airway)
//! - The cardiac-arrest `Session` with its phases and checklists
//! - The bradycardia/tachycardia `BradyTachySession` and its decision context
//!
//! All timestamps are UTC wall-clock instants. Durations are derived, never
//! stored, except the accumulated active time carried by the timer snapshot.

use crate::log::{InterventionKind, InterventionLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ============================================================================
// Patient Context
// ============================================================================

/// Which algorithm variant (and dosing table) applies
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathwayMode {
    #[default]
    Adult,
    Pediatric,
}

/// Compression-to-ventilation ratio
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CprRatio {
    #[serde(rename = "15:2")]
    FifteenToTwo,
    #[default]
    #[serde(rename = "30:2")]
    ThirtyToTwo,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AirwayStatus {
    #[default]
    BagMask,
    Supraglottic,
    Tube,
}

// ============================================================================
// Cardiac Arrest: rhythm, phase, outcome
// ============================================================================

/// Rhythm class identified on the monitor
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Rhythm {
    #[default]
    None,
    /// VF / pulseless VT
    Shockable,
    Asystole,
    Pea,
}

impl Rhythm {
    pub fn is_shockable(self) -> bool {
        self == Rhythm::Shockable
    }
}

/// Phase of the cardiac-arrest algorithm
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArrestPhase {
    #[default]
    PathwaySelection,
    CprPendingRhythm,
    Shockable,
    NonShockable,
    RhythmCheck,
    /// Return of spontaneous circulation; hosts the post-care checklist
    Rosc,
    Deceased,
}

impl ArrestPhase {
    /// Edges of the legal transition graph
    pub fn can_transition_to(self, next: ArrestPhase) -> bool {
        use ArrestPhase::*;
        matches!(
            (self, next),
            (PathwaySelection, CprPendingRhythm)
                | (CprPendingRhythm, Shockable)
                | (CprPendingRhythm, NonShockable)
                | (Shockable, RhythmCheck)
                | (NonShockable, RhythmCheck)
                | (RhythmCheck, Shockable)
                | (RhythmCheck, NonShockable)
                | (RhythmCheck, Rosc)
                | (RhythmCheck, Deceased)
        )
    }

    /// Chest compressions are ongoing
    pub fn is_active_cpr(self) -> bool {
        matches!(self, ArrestPhase::Shockable | ArrestPhase::NonShockable)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArrestPhase::Rosc | ArrestPhase::Deceased)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    None,
    Rosc,
    Deceased,
}

/// How the arrest session came to exist; drives the history tag
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOrigin {
    #[default]
    Direct,
    /// The patient deteriorated during a bradycardia/tachycardia episode
    BradyTachyHandoff { source_session_id: Uuid },
}

/// Reporting tag carried into every history record
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    CardiacArrest,
    Bradytachy,
    BradytachyArrest,
}

impl From<&SessionOrigin> for SessionType {
    fn from(origin: &SessionOrigin) -> Self {
        match origin {
            SessionOrigin::Direct => SessionType::CardiacArrest,
            SessionOrigin::BradyTachyHandoff { .. } => SessionType::BradytachyArrest,
        }
    }
}

// ============================================================================
// Checklists
// ============================================================================

/// The "H's and T's"
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ReversibleCauses {
    pub hypovolemia: bool,
    pub hypoxia: bool,
    pub hydrogen_ion: bool,
    pub hypo_hyperkalemia: bool,
    pub hypothermia: bool,
    pub tension_pneumothorax: bool,
    pub tamponade: bool,
    pub toxins: bool,
    pub thrombosis_pulmonary: bool,
    pub thrombosis_coronary: bool,
}

/// Partial update; `None` leaves a cause untouched
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ReversibleCausesUpdate {
    pub hypovolemia: Option<bool>,
    pub hypoxia: Option<bool>,
    pub hydrogen_ion: Option<bool>,
    pub hypo_hyperkalemia: Option<bool>,
    pub hypothermia: Option<bool>,
    pub tension_pneumothorax: Option<bool>,
    pub tamponade: Option<bool>,
    pub toxins: Option<bool>,
    pub thrombosis_pulmonary: Option<bool>,
    pub thrombosis_coronary: Option<bool>,
}

impl ReversibleCauses {
    /// Apply a partial update, returning the names of causes newly checked
    pub fn apply(&mut self, update: &ReversibleCausesUpdate) -> Vec<&'static str> {
        let mut checked = Vec::new();
        let mut set = |field: &mut bool, value: Option<bool>, name: &'static str| {
            if let Some(value) = value {
                if value && !*field {
                    checked.push(name);
                }
                *field = value;
            }
        };
        set(&mut self.hypovolemia, update.hypovolemia, "hypovolemia");
        set(&mut self.hypoxia, update.hypoxia, "hypoxia");
        set(&mut self.hydrogen_ion, update.hydrogen_ion, "hydrogen_ion");
        set(&mut self.hypo_hyperkalemia, update.hypo_hyperkalemia, "hypo_hyperkalemia");
        set(&mut self.hypothermia, update.hypothermia, "hypothermia");
        set(&mut self.tension_pneumothorax, update.tension_pneumothorax, "tension_pneumothorax");
        set(&mut self.tamponade, update.tamponade, "tamponade");
        set(&mut self.toxins, update.toxins, "toxins");
        set(&mut self.thrombosis_pulmonary, update.thrombosis_pulmonary, "thrombosis_pulmonary");
        set(&mut self.thrombosis_coronary, update.thrombosis_coronary, "thrombosis_coronary");
        checked
    }

    pub fn checked_count(&self) -> usize {
        [
            self.hypovolemia,
            self.hypoxia,
            self.hydrogen_ion,
            self.hypo_hyperkalemia,
            self.hypothermia,
            self.tension_pneumothorax,
            self.tamponade,
            self.toxins,
            self.thrombosis_pulmonary,
            self.thrombosis_coronary,
        ]
        .iter()
        .filter(|c| **c)
        .count()
    }
}

/// Obstetric arrest causes (BEAU-CHOPS)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ObstetricCause {
    Bleeding,
    Embolism,
    AnestheticComplication,
    UterineAtony,
    Cardiac,
    Hypertension,
    Other,
    Placenta,
    Sepsis,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ObstetricIntervention {
    LeftUterineDisplacement,
    IvAboveDiaphragm,
    RemoveFetalMonitors,
    StopMagnesium,
    ExpertAirway,
    PrepareDelivery,
}

/// Maternal cardiac arrest tracking
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct PregnancyState {
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub delivery_prompt_dismissed: bool,
    pub causes: BTreeSet<ObstetricCause>,
    pub interventions: BTreeSet<ObstetricIntervention>,
}

/// Special circumstances with their own sub-checklists
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SpecialCircumstance {
    Hypothermia,
    Drowning,
    Anaphylaxis,
    OpioidOverdose,
    Hyperkalemia,
    Trauma,
    PulmonaryEmbolism,
}

impl SpecialCircumstance {
    pub const ALL: [SpecialCircumstance; 7] = [
        SpecialCircumstance::Hypothermia,
        SpecialCircumstance::Drowning,
        SpecialCircumstance::Anaphylaxis,
        SpecialCircumstance::OpioidOverdose,
        SpecialCircumstance::Hyperkalemia,
        SpecialCircumstance::Trauma,
        SpecialCircumstance::PulmonaryEmbolism,
    ];

    /// Item keys of this circumstance's sub-checklist
    pub fn checklist_items(self) -> &'static [&'static str] {
        match self {
            SpecialCircumstance::Hypothermia => &[
                "measure_core_temperature",
                "active_rewarming",
                "withhold_drugs_below_30c",
                "limit_shocks_below_30c",
            ],
            SpecialCircumstance::Drowning => &[
                "early_ventilation",
                "high_flow_oxygen",
                "consider_hypothermia",
            ],
            SpecialCircumstance::Anaphylaxis => &[
                "im_epinephrine",
                "aggressive_fluids",
                "early_advanced_airway",
                "remove_trigger",
            ],
            SpecialCircumstance::OpioidOverdose => &[
                "naloxone",
                "ventilation_priority",
            ],
            SpecialCircumstance::Hyperkalemia => &[
                "calcium",
                "sodium_bicarbonate",
                "insulin_glucose",
                "consider_dialysis",
            ],
            SpecialCircumstance::Trauma => &[
                "control_hemorrhage",
                "volume_replacement",
                "decompress_chest",
                "consider_thoracotomy",
            ],
            SpecialCircumstance::PulmonaryEmbolism => &[
                "consider_thrombolysis",
                "prolonged_cpr_after_lysis",
                "ecpr_referral",
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CircumstanceChecklist {
    pub active: bool,
    pub items: BTreeMap<String, bool>,
}

/// Post-ROSC bundle tasks
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PostRoscTask {
    OptimizeOxygenation,
    AvoidHyperventilation,
    TreatHypotension,
    TwelveLeadEcg,
    TemperatureControl,
    CheckGlucose,
    ConsiderCoronaryAngiography,
}

/// Post-ROSC targets; each reading is absent until entered
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct PostRoscVitals {
    pub spo2: Option<f64>,
    pub etco2: Option<f64>,
    pub mean_arterial_pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub glucose: Option<f64>,
}

impl PostRoscVitals {
    /// Overwrite only the readings present in `update`
    pub fn merge(&mut self, update: &PostRoscVitals) {
        if update.spo2.is_some() {
            self.spo2 = update.spo2;
        }
        if update.etco2.is_some() {
            self.etco2 = update.etco2;
        }
        if update.mean_arterial_pressure.is_some() {
            self.mean_arterial_pressure = update.mean_arterial_pressure;
        }
        if update.temperature.is_some() {
            self.temperature = update.temperature;
        }
        if update.glucose.is_some() {
            self.glucose = update.glucose;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct PostRoscCare {
    pub completed: BTreeSet<PostRoscTask>,
    pub vitals: PostRoscVitals,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VitalMetric {
    Etco2,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VitalReading {
    pub timestamp: DateTime<Utc>,
    pub metric: VitalMetric,
    pub value: f64,
}

// ============================================================================
// Cardiac Arrest Session
// ============================================================================

/// Aggregate root of one resuscitation episode
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    pub current_rhythm: Rhythm,
    pub initial_rhythm: Option<Rhythm>,
    pub phase: ArrestPhase,
    pub outcome: Outcome,

    pub shock_count: u32,
    pub epinephrine_count: u32,
    pub amiodarone_count: u32,
    pub lidocaine_count: u32,

    pub cpr_cycle_start_time: Option<DateTime<Utc>>,
    pub rhythm_check_started_at: Option<DateTime<Utc>>,
    pub last_epinephrine_time: Option<DateTime<Utc>>,
    pub last_amiodarone_time: Option<DateTime<Utc>>,
    pub rosc_time: Option<DateTime<Utc>>,
    /// Set only by a handoff; the true start of deterioration
    pub brady_tachy_start_time: Option<DateTime<Utc>>,

    pub pathway_mode: PathwayMode,
    pub patient_weight: Option<f64>,
    pub cpr_ratio: CprRatio,
    pub airway_status: AirwayStatus,

    pub reversible_causes: ReversibleCauses,
    pub pregnancy: PregnancyState,
    pub special_circumstances: BTreeMap<SpecialCircumstance, CircumstanceChecklist>,
    pub post_rosc: PostRoscCare,

    pub interventions: InterventionLog<InterventionKind>,
    pub vital_readings: Vec<VitalReading>,

    #[serde(default)]
    pub origin: SessionOrigin,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            current_rhythm: Rhythm::None,
            initial_rhythm: None,
            phase: ArrestPhase::PathwaySelection,
            outcome: Outcome::None,
            shock_count: 0,
            epinephrine_count: 0,
            amiodarone_count: 0,
            lidocaine_count: 0,
            cpr_cycle_start_time: None,
            rhythm_check_started_at: None,
            last_epinephrine_time: None,
            last_amiodarone_time: None,
            rosc_time: None,
            brady_tachy_start_time: None,
            pathway_mode: PathwayMode::Adult,
            patient_weight: None,
            cpr_ratio: CprRatio::ThirtyToTwo,
            airway_status: AirwayStatus::BagMask,
            reversible_causes: ReversibleCauses::default(),
            pregnancy: PregnancyState::default(),
            special_circumstances: BTreeMap::new(),
            post_rosc: PostRoscCare::default(),
            interventions: InterventionLog::default(),
            vital_readings: Vec::new(),
            origin: SessionOrigin::Direct,
        }
    }

    /// Zero reference for timeline displays
    pub fn timeline_origin(&self) -> DateTime<Utc> {
        self.brady_tachy_start_time.unwrap_or(self.start_time)
    }

    pub fn session_type(&self) -> SessionType {
        SessionType::from(&self.origin)
    }

    /// Weight used for dosing; only meaningful on the pediatric pathway
    pub fn dosing_weight(&self) -> Option<f64> {
        match self.pathway_mode {
            PathwayMode::Pediatric => self.patient_weight,
            PathwayMode::Adult => None,
        }
    }

    /// Structural checks applied to sessions read back from storage
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.phase == ArrestPhase::PathwaySelection {
            return Err("session never started".into());
        }
        if self.phase.is_terminal() != self.end_time.is_some() {
            return Err(format!(
                "end_time {:?} inconsistent with phase {:?}",
                self.end_time, self.phase
            ));
        }
        if self.phase != ArrestPhase::CprPendingRhythm && self.initial_rhythm.is_none() {
            return Err("rhythm-dependent phase without an identified rhythm".into());
        }
        if self.phase == ArrestPhase::RhythmCheck && self.rhythm_check_started_at.is_none() {
            return Err("rhythm check without an anchor".into());
        }
        if self.cpr_cycle_start_time.is_none() {
            return Err("missing CPR cycle anchor".into());
        }
        let shocks = self.interventions.count_where(|k| *k == InterventionKind::Shock);
        if shocks != self.shock_count as usize {
            return Err(format!(
                "shock_count {} disagrees with {} logged shocks",
                self.shock_count, shocks
            ));
        }
        if let Some(weight) = self.patient_weight {
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("invalid patient weight {}", weight));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Bradycardia / Tachycardia With Pulse
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BradyTachyPhase {
    #[default]
    PatientSelection,
    BranchSelection,
    BradycardiaAssessment,
    BradycardiaTreatment,
    TachycardiaAssessment,
    TachycardiaSinusEvaluation,
    TachycardiaCompromiseAssessment,
    TachycardiaTreatment,
    SessionEnded,
}

impl BradyTachyPhase {
    pub fn can_transition_to(self, next: BradyTachyPhase) -> bool {
        use BradyTachyPhase::*;
        if next == SessionEnded {
            return self != SessionEnded;
        }
        matches!(
            (self, next),
            (PatientSelection, BranchSelection)
                | (BranchSelection, BradycardiaAssessment)
                | (BranchSelection, TachycardiaAssessment)
                | (BradycardiaAssessment, BradycardiaTreatment)
                | (TachycardiaAssessment, TachycardiaTreatment)
                | (TachycardiaAssessment, TachycardiaSinusEvaluation)
                | (TachycardiaAssessment, TachycardiaCompromiseAssessment)
                | (TachycardiaSinusEvaluation, TachycardiaCompromiseAssessment)
                | (TachycardiaCompromiseAssessment, TachycardiaTreatment)
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Bradycardia,
    Tachycardia,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Unstable,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QrsWidth {
    Narrow,
    Wide,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Regularity {
    Regular,
    Irregular,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinusVsSvt {
    ProbableSinus,
    ProbableSvt,
}

/// Rhythm subtype selecting the synchronized cardioversion energy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardioversionRhythm {
    NarrowRegular,
    NarrowIrregular,
    WideRegular,
    WideIrregular,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BradyTachyOutcome {
    Resolved,
    SwitchedToArrest,
    Transferred,
}

/// Answers collected while walking the decision tree
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct DecisionContext {
    pub patient_group: Option<PathwayMode>,
    pub weight: Option<f64>,
    pub branch: Option<Branch>,
    pub stability: Option<Stability>,
    pub qrs_width: Option<QrsWidth>,
    pub regularity: Option<Regularity>,
    pub monomorphic: Option<bool>,
    pub sinus_vs_svt: Option<SinusVsSvt>,
    pub sinus_criteria: Vec<String>,
    pub cardioversion_rhythm: Option<CardioversionRhythm>,
    /// Probable sinus tachycardia: treat the cause, not the rhythm
    pub cause_directed_therapy: bool,
}

impl DecisionContext {
    pub fn is_pediatric(&self) -> bool {
        self.patient_group == Some(PathwayMode::Pediatric)
    }

    pub fn dosing_weight(&self) -> Option<f64> {
        if self.is_pediatric() {
            self.weight
        } else {
            None
        }
    }
}

/// Parallel aggregate for the with-pulse algorithm
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BradyTachySession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub phase: BradyTachyPhase,
    pub context: DecisionContext,
    pub interventions: InterventionLog<crate::log::BradyTachyAction>,
    pub outcome: Option<BradyTachyOutcome>,
    pub switched_to_arrest_time: Option<DateTime<Utc>>,

    pub atropine_count: u32,
    pub adenosine_count: u32,
    pub cardioversion_count: u32,
}

impl BradyTachySession {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: now,
            end_time: None,
            phase: BradyTachyPhase::PatientSelection,
            context: DecisionContext::default(),
            interventions: InterventionLog::default(),
            outcome: None,
            switched_to_arrest_time: None,
            atropine_count: 0,
            adenosine_count: 0,
            cardioversion_count: 0,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.phase == BradyTachyPhase::PatientSelection && self.interventions.is_empty() {
            return Err("session never started".into());
        }
        if (self.phase == BradyTachyPhase::SessionEnded) != self.end_time.is_some() {
            return Err(format!(
                "end_time {:?} inconsistent with phase {:?}",
                self.end_time, self.phase
            ));
        }
        Ok(())
    }
}
