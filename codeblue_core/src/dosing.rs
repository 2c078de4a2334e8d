//! Medication and energy dose calculations.
//!
//! Pure functions only. Pediatric doses scale with weight and are clamped to
//! the adult maximum; adult doses are literature-fixed. A missing or invalid
//! weight never fails: the value is `None` and the display text falls back to
//! the per-kilogram formula so the rescuer can still compute it by hand.

use crate::types::{CardioversionRhythm, PathwayMode};
use serde::{Deserialize, Serialize};

/// Highest energy any defibrillator setting may be configured to
pub const MAX_ENERGY_JOULES: u32 = 360;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseUnit {
    Mg,
    Joules,
    MgPerMin,
    McgPerMin,
    McgPerKgPerMin,
}

impl DoseUnit {
    pub fn symbol(self) -> &'static str {
        match self {
            DoseUnit::Mg => "mg",
            DoseUnit::Joules => "J",
            DoseUnit::MgPerMin => "mg/min",
            DoseUnit::McgPerMin => "mcg/min",
            DoseUnit::McgPerKgPerMin => "mcg/kg/min",
        }
    }
}

/// A computed dose; `upper` is set when the dose is a range
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseResult {
    pub value: Option<f64>,
    pub upper: Option<f64>,
    pub display_text: String,
    pub unit: DoseUnit,
}

impl DoseResult {
    fn fixed(value: f64, unit: DoseUnit) -> Self {
        Self {
            value: Some(value),
            upper: None,
            display_text: format_amount(value, unit),
            unit,
        }
    }

    fn range(low: f64, high: f64, unit: DoseUnit) -> Self {
        Self {
            value: Some(low),
            upper: Some(high),
            display_text: format!(
                "{}-{}",
                format_number(low, unit),
                format_amount(high, unit)
            ),
            unit,
        }
    }

    fn formula(text: impl Into<String>, unit: DoseUnit) -> Self {
        Self {
            value: None,
            upper: None,
            display_text: text.into(),
            unit,
        }
    }

    /// True when the dose could not be computed and only the formula is shown
    pub fn is_formula_only(&self) -> bool {
        self.value.is_none()
    }
}

fn valid_weight(weight: Option<f64>) -> Option<f64> {
    weight.filter(|w| w.is_finite() && *w > 0.0)
}

/// Display rounding only; computed values are never rounded
fn format_number(value: f64, unit: DoseUnit) -> String {
    if unit == DoseUnit::Joules || value >= 10.0 || (value.fract() == 0.0 && value >= 1.0) {
        format!("{:.0}", value)
    } else if value < 0.1 {
        format!("{:.3}", value)
    } else {
        format!("{:.2}", value)
    }
}

fn format_amount(value: f64, unit: DoseUnit) -> String {
    format!("{} {}", format_number(value, unit), unit.symbol())
}

/// `min(weight × per_kg, cap)` or the formula text when weight is unusable
fn weight_based(
    weight: Option<f64>,
    per_kg: f64,
    cap: Option<f64>,
    unit: DoseUnit,
) -> DoseResult {
    let cap_text = cap
        .map(|c| format!(" (max {})", format_amount(c, unit)))
        .unwrap_or_default();
    match valid_weight(weight) {
        Some(w) => {
            let raw = w * per_kg;
            let clamped = cap.map_or(raw, |c| raw.min(c));
            DoseResult::fixed(clamped, unit)
        }
        None => DoseResult::formula(
            format!("{} {}/kg{}", per_kg, unit.symbol(), cap_text),
            unit,
        ),
    }
}

fn weight_based_range(
    weight: Option<f64>,
    low_per_kg: f64,
    high_per_kg: f64,
    cap: Option<f64>,
    unit: DoseUnit,
) -> DoseResult {
    match valid_weight(weight) {
        Some(w) => {
            let clamp = |v: f64| cap.map_or(v, |c| v.min(c));
            DoseResult::range(clamp(w * low_per_kg), clamp(w * high_per_kg), unit)
        }
        None => DoseResult::formula(
            format!("{}-{} {}/kg", low_per_kg, high_per_kg, unit.symbol()),
            unit,
        ),
    }
}

// ============================================================================
// Cardiac arrest, pediatric
// ============================================================================

/// Epinephrine 0.01 mg/kg, max 1 mg
pub fn epinephrine_dose(weight: Option<f64>) -> DoseResult {
    weight_based(weight, 0.01, Some(1.0), DoseUnit::Mg)
}

/// Amiodarone 5 mg/kg; first dose max 300 mg, later doses max 150 mg
pub fn amiodarone_dose(weight: Option<f64>, ordinal: u32) -> DoseResult {
    let cap = if ordinal == 0 { 300.0 } else { 150.0 };
    weight_based(weight, 5.0, Some(cap), DoseUnit::Mg)
}

/// Lidocaine 1 mg/kg, uncapped
pub fn lidocaine_dose(weight: Option<f64>) -> DoseResult {
    weight_based(weight, 1.0, None, DoseUnit::Mg)
}

/// Defibrillation energy by shock ordinal (0 = first shock)
///
/// First shock 2 J/kg, second 4 J/kg, third onward the 4–10 J/kg range.
/// Every bound is capped at `max_joules`.
pub fn shock_energy(weight: Option<f64>, ordinal: u32, max_joules: u32) -> DoseResult {
    let cap = Some(f64::from(max_joules));
    match ordinal {
        0 => weight_based(weight, 2.0, cap, DoseUnit::Joules),
        1 => weight_based(weight, 4.0, cap, DoseUnit::Joules),
        _ => weight_based_range(weight, 4.0, 10.0, cap, DoseUnit::Joules),
    }
}

// ============================================================================
// Cardiac arrest, adult (fixed)
// ============================================================================

pub fn adult_epinephrine_dose() -> DoseResult {
    DoseResult::fixed(1.0, DoseUnit::Mg)
}

pub fn adult_amiodarone_dose(ordinal: u32) -> DoseResult {
    DoseResult::fixed(if ordinal == 0 { 300.0 } else { 150.0 }, DoseUnit::Mg)
}

pub fn adult_lidocaine_dose(ordinal: u32) -> DoseResult {
    DoseResult::fixed(if ordinal == 0 { 100.0 } else { 50.0 }, DoseUnit::Mg)
}

/// Adult energy is the configured device setting, never computed
pub fn adult_shock_energy(configured_joules: u32, max_joules: u32) -> DoseResult {
    DoseResult::fixed(f64::from(configured_joules.min(max_joules)), DoseUnit::Joules)
}

// ============================================================================
// Pathway dispatch
// ============================================================================

pub fn epinephrine_for(mode: PathwayMode, weight: Option<f64>) -> DoseResult {
    match mode {
        PathwayMode::Adult => adult_epinephrine_dose(),
        PathwayMode::Pediatric => epinephrine_dose(weight),
    }
}

pub fn amiodarone_for(mode: PathwayMode, weight: Option<f64>, ordinal: u32) -> DoseResult {
    match mode {
        PathwayMode::Adult => adult_amiodarone_dose(ordinal),
        PathwayMode::Pediatric => amiodarone_dose(weight, ordinal),
    }
}

pub fn lidocaine_for(mode: PathwayMode, weight: Option<f64>, ordinal: u32) -> DoseResult {
    match mode {
        PathwayMode::Adult => adult_lidocaine_dose(ordinal),
        PathwayMode::Pediatric => lidocaine_dose(weight),
    }
}

pub fn shock_energy_for(
    mode: PathwayMode,
    weight: Option<f64>,
    ordinal: u32,
    adult_joules: u32,
    max_joules: u32,
) -> DoseResult {
    match mode {
        PathwayMode::Adult => adult_shock_energy(adult_joules, max_joules),
        PathwayMode::Pediatric => shock_energy(weight, ordinal, max_joules),
    }
}

// ============================================================================
// Bradycardia / tachycardia with pulse
// ============================================================================

/// Atropine: adult 1 mg; pediatric 0.02 mg/kg clamped to 0.1–0.5 mg
pub fn atropine_for(mode: PathwayMode, weight: Option<f64>) -> DoseResult {
    match mode {
        PathwayMode::Adult => DoseResult::fixed(1.0, DoseUnit::Mg),
        PathwayMode::Pediatric => match valid_weight(weight) {
            Some(w) => DoseResult::fixed((w * 0.02).clamp(0.1, 0.5), DoseUnit::Mg),
            None => DoseResult::formula("0.02 mg/kg (min 0.10 mg, max 0.50 mg)", DoseUnit::Mg),
        },
    }
}

/// Adenosine: adult 6 mg then 12 mg; pediatric 0.1 mg/kg (max 6) then 0.2 mg/kg (max 12)
pub fn adenosine_for(mode: PathwayMode, weight: Option<f64>, ordinal: u32) -> DoseResult {
    let first = ordinal == 0;
    match mode {
        PathwayMode::Adult => DoseResult::fixed(if first { 6.0 } else { 12.0 }, DoseUnit::Mg),
        PathwayMode::Pediatric if first => weight_based(weight, 0.1, Some(6.0), DoseUnit::Mg),
        PathwayMode::Pediatric => weight_based(weight, 0.2, Some(12.0), DoseUnit::Mg),
    }
}

/// Synchronized cardioversion energy
///
/// Adults use fixed energies by rhythm subtype. Children get 0.5–1 J/kg for
/// the first attempt and 2 J/kg afterwards. Every bound is capped at
/// `max_joules`.
pub fn cardioversion_energy_for(
    mode: PathwayMode,
    weight: Option<f64>,
    rhythm: Option<CardioversionRhythm>,
    ordinal: u32,
    max_joules: u32,
) -> DoseResult {
    let max = f64::from(max_joules);
    let cap = Some(max);
    match mode {
        PathwayMode::Adult => match rhythm {
            Some(CardioversionRhythm::NarrowRegular) => {
                DoseResult::range(50.0_f64.min(max), 100.0_f64.min(max), DoseUnit::Joules)
            }
            Some(CardioversionRhythm::NarrowIrregular) => {
                DoseResult::range(120.0_f64.min(max), 200.0_f64.min(max), DoseUnit::Joules)
            }
            Some(CardioversionRhythm::WideRegular) => DoseResult::fixed(100.0_f64.min(max), DoseUnit::Joules),
            Some(CardioversionRhythm::WideIrregular) => DoseResult::fixed(200.0_f64.min(max), DoseUnit::Joules),
            None => DoseResult::formula("select rhythm type", DoseUnit::Joules),
        },
        PathwayMode::Pediatric if ordinal == 0 => weight_based_range(weight, 0.5, 1.0, cap, DoseUnit::Joules),
        PathwayMode::Pediatric => weight_based(weight, 2.0, cap, DoseUnit::Joules),
    }
}

/// Amiodarone for stable wide-complex tachycardia (given over 10–60 min)
pub fn stable_amiodarone_for(mode: PathwayMode, weight: Option<f64>) -> DoseResult {
    match mode {
        PathwayMode::Adult => DoseResult::fixed(150.0, DoseUnit::Mg),
        PathwayMode::Pediatric => weight_based(weight, 5.0, Some(300.0), DoseUnit::Mg),
    }
}

/// Procainamide: adult infusion rate; pediatric 15 mg/kg loading dose
pub fn procainamide_for(mode: PathwayMode, weight: Option<f64>) -> DoseResult {
    match mode {
        PathwayMode::Adult => DoseResult::range(20.0, 50.0, DoseUnit::MgPerMin),
        PathwayMode::Pediatric => weight_based(weight, 15.0, Some(1000.0), DoseUnit::Mg),
    }
}

/// Dopamine infusion, same weight-normalized rate for all ages
pub fn dopamine_rate() -> DoseResult {
    DoseResult::range(5.0, 20.0, DoseUnit::McgPerKgPerMin)
}

/// Epinephrine infusion: adult 2–10 mcg/min; pediatric 0.1–1 mcg/kg/min
pub fn epinephrine_infusion_for(mode: PathwayMode) -> DoseResult {
    match mode {
        PathwayMode::Adult => DoseResult::range(2.0, 10.0, DoseUnit::McgPerMin),
        PathwayMode::Pediatric => DoseResult::range(0.1, 1.0, DoseUnit::McgPerKgPerMin),
    }
}
