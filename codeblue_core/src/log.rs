//! Append-only intervention log.
//!
//! Every clinical action becomes an immutable [`Intervention`] carrying its
//! timestamp, a closed kind, an optional value and a display-text key with
//! interpolation parameters for the presentation layer. Entries are only ever
//! created by [`InterventionLog::append`] (or merged in by
//! [`InterventionLog::import`] during a handoff) and never edited.

use crate::types::DecisionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kinds of entries in the cardiac-arrest timeline
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    CprStart,
    Shock,
    Epinephrine,
    Amiodarone,
    Lidocaine,
    RhythmChange,
    AirwayChange,
    Etco2,
    Rosc,
    ReversibleCauseCheck,
    Note,
    /// Resuscitation terminated, patient deceased
    Termination,
    /// Carried over from a bradycardia/tachycardia episode
    BradyTachy(BradyTachyAction),
}

/// Kinds of entries in the with-pulse timeline
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BradyTachyAction {
    Atropine,
    Dopamine,
    EpinephrineInfusion,
    TranscutaneousPacing,
    VagalManeuver,
    Adenosine,
    SynchronizedCardioversion,
    Amiodarone,
    Procainamide,
    SinusTachycardiaIdentified,
    Note,
    /// Terminal marker: the patient lost their pulse
    SwitchToArrest,
}

/// Scalar payload of an entry (energy, dose, reading or free text)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InterventionValue {
    Number(f64),
    Text(String),
}

/// An immutable timestamped audit record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Intervention<K> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: K,
    pub value: Option<InterventionValue>,
    pub text_key: String,
    #[serde(default)]
    pub text_params: BTreeMap<String, String>,
    /// Decision answers at the moment of the action (with-pulse entries only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DecisionContext>,
}

impl<K> Intervention<K> {
    /// Re-home an entry into another timeline, keeping id and timestamp
    pub fn map_kind<T>(self, f: impl FnOnce(K) -> T) -> Intervention<T> {
        Intervention {
            id: self.id,
            timestamp: self.timestamp,
            kind: f(self.kind),
            value: self.value,
            text_key: self.text_key,
            text_params: self.text_params,
            context: self.context,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self.value {
            Some(InterventionValue::Number(n)) => Some(n),
            _ => None,
        }
    }
}

/// Draft of an entry; becomes an [`Intervention`] when appended
#[derive(Clone, Debug)]
pub struct Entry<K> {
    kind: K,
    text_key: String,
    value: Option<InterventionValue>,
    text_params: BTreeMap<String, String>,
    context: Option<DecisionContext>,
}

impl<K> Entry<K> {
    pub fn new(kind: K, text_key: impl Into<String>) -> Self {
        Self {
            kind,
            text_key: text_key.into(),
            value: None,
            text_params: BTreeMap::new(),
            context: None,
        }
    }

    pub fn number(mut self, value: f64) -> Self {
        self.value = Some(InterventionValue::Number(value));
        self
    }

    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.value = Some(InterventionValue::Text(value.into()));
        self
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.text_params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn context(mut self, context: DecisionContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Ordered, append-only list of interventions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct InterventionLog<K> {
    entries: Vec<Intervention<K>>,
}

impl<K> Default for InterventionLog<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K> InterventionLog<K> {
    /// Record an action at `timestamp`
    pub fn append(&mut self, timestamp: DateTime<Utc>, entry: Entry<K>) -> &Intervention<K> {
        self.entries.push(Intervention {
            id: Uuid::new_v4(),
            timestamp,
            kind: entry.kind,
            value: entry.value,
            text_key: entry.text_key,
            text_params: entry.text_params,
            context: entry.context,
        });
        let index = self.entries.len() - 1;
        &self.entries[index]
    }

    /// Merge finalized entries from another timeline, keeping chronological order
    pub fn import(&mut self, entries: impl IntoIterator<Item = Intervention<K>>) -> usize {
        let before = self.entries.len();
        self.entries.extend(entries);
        // Stable: equal timestamps keep their relative order
        self.entries.sort_by_key(|e| e.timestamp);
        self.entries.len() - before
    }

    pub fn entries(&self) -> &[Intervention<K>] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Intervention<K>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Intervention<K>> {
        self.entries.last()
    }

    pub fn count_where(&self, pred: impl Fn(&K) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.kind)).count()
    }

    /// Consume the log, yielding its entries
    pub fn into_entries(self) -> Vec<Intervention<K>> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_append_preserves_order_and_payload() {
        let t0 = Utc::now();
        let mut log = InterventionLog::default();
        log.append(t0, Entry::new(InterventionKind::CprStart, "log.cpr_start"));
        let shock = log
            .append(
                t0 + Duration::seconds(5),
                Entry::new(InterventionKind::Shock, "log.shock").number(200.0).param("energy", 200),
            )
            .clone();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].kind, InterventionKind::CprStart);
        assert_eq!(shock.number(), Some(200.0));
        assert_eq!(shock.text_params.get("energy").map(String::as_str), Some("200"));
        assert_eq!(log.count_where(|k| *k == InterventionKind::Shock), 1);
    }

    #[test]
    fn test_import_merges_chronologically() {
        let t0 = Utc::now();
        let mut source: InterventionLog<BradyTachyAction> = InterventionLog::default();
        source.append(t0, Entry::new(BradyTachyAction::Atropine, "bt.atropine").number(1.0));

        let mut target = InterventionLog::default();
        target.append(
            t0 + Duration::minutes(3),
            Entry::new(InterventionKind::CprStart, "log.cpr_start"),
        );

        let imported = target.import(
            source
                .into_entries()
                .into_iter()
                .map(|e| e.map_kind(InterventionKind::BradyTachy)),
        );

        assert_eq!(imported, 1);
        assert_eq!(
            target.entries()[0].kind,
            InterventionKind::BradyTachy(BradyTachyAction::Atropine)
        );
        assert_eq!(target.entries()[1].kind, InterventionKind::CprStart);
    }

    #[test]
    fn test_kind_wire_format() {
        let kind = InterventionKind::BradyTachy(BradyTachyAction::Adenosine);
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"brady_tachy":"adenosine"}"#);
        let parsed: InterventionKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, kind);
    }
}
