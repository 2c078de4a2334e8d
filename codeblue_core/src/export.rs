//! CSV export of session history.
//!
//! One row per completed episode, for reporting outside the app.

use crate::log::{BradyTachyAction, InterventionKind};
use crate::persistence::{HistoryEntry, HistoryRecord};
use crate::types::Session;
use crate::{Error, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    session_type: String,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: Option<i64>,
    outcome: String,
    pathway: Option<String>,
    weight_kg: Option<f64>,
    shocks: u32,
    epinephrine: u32,
    amiodarone: u32,
    lidocaine: u32,
    atropine: u32,
    adenosine: u32,
    cardioversions: u32,
    interventions: usize,
}

fn label<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// With-pulse treatments carried into an arrest log by a handoff
fn carried(session: &Session, action: BradyTachyAction) -> u32 {
    let count = session
        .interventions
        .count_where(|k| *k == InterventionKind::BradyTachy(action));
    u32::try_from(count).unwrap_or(u32::MAX)
}

impl From<&HistoryRecord> for CsvRow {
    fn from(record: &HistoryRecord) -> Self {
        let start = record.start_time();
        match &record.entry {
            HistoryEntry::Arrest(s) => CsvRow {
                id: s.id.to_string(),
                session_type: label(&record.session_type),
                start_time: start.to_rfc3339(),
                end_time: s.end_time.map(|t| t.to_rfc3339()),
                duration_seconds: s.end_time.map(|t| (t - start).num_seconds()),
                outcome: label(&s.outcome),
                pathway: Some(label(&s.pathway_mode)),
                weight_kg: s.patient_weight,
                shocks: s.shock_count,
                epinephrine: s.epinephrine_count,
                amiodarone: s.amiodarone_count,
                lidocaine: s.lidocaine_count,
                atropine: carried(s, BradyTachyAction::Atropine),
                adenosine: carried(s, BradyTachyAction::Adenosine),
                cardioversions: carried(s, BradyTachyAction::SynchronizedCardioversion),
                interventions: s.interventions.len(),
            },
            HistoryEntry::Bradytachy(s) => CsvRow {
                id: s.id.to_string(),
                session_type: label(&record.session_type),
                start_time: start.to_rfc3339(),
                end_time: s.end_time.map(|t| t.to_rfc3339()),
                duration_seconds: s.end_time.map(|t| (t - start).num_seconds()),
                outcome: s.outcome.as_ref().map(label).unwrap_or_default(),
                pathway: s.context.patient_group.as_ref().map(label),
                weight_kg: s.context.weight,
                shocks: 0,
                epinephrine: 0,
                amiodarone: 0,
                lidocaine: 0,
                atropine: s.atropine_count,
                adenosine: s.adenosine_count,
                cardioversions: s.cardioversion_count,
                interventions: s.interventions.len(),
            },
        }
    }
}

/// Write `records` as CSV with a header row
pub fn write_csv<W: Write>(records: &[HistoryRecord], writer: W) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Export to `path`, replacing any previous export atomically
pub fn export_history_csv(records: &[HistoryRecord], path: &Path) -> Result<usize> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    let count = write_csv(records, temp.as_file())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::info!("Exported {} sessions to {:?}", count, path);
    Ok(count)
}
