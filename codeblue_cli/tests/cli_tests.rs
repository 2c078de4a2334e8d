//! End-to-end tests for the codeblue binary.
//!
//! Each test points the binary at its own temp data directory and config home.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn cli(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("codeblue"));
    cmd.env("XDG_CONFIG_HOME", temp_dir.path().join("config"))
        .arg("--data-dir")
        .arg(data_dir(temp_dir));
    cmd
}

fn data_dir(temp_dir: &TempDir) -> std::path::PathBuf {
    temp_dir.path().join("data")
}

fn read_history(dir: &Path) -> Vec<serde_json::Value> {
    let text = fs::read_to_string(dir.join("session_history.json")).expect("history file");
    serde_json::from_str(&text).expect("history json")
}

#[test]
fn test_cli_help() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resuscitation protocol assistant"));
}

#[test]
fn test_dose_adult() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["dose", "--pathway", "adult"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Adult dosing"))
        .stdout(predicate::str::contains("Epinephrine:      1 mg"))
        .stdout(predicate::str::contains("Amiodarone #1:    300 mg"))
        .stdout(predicate::str::contains("Atropine:         1 mg"));
}

#[test]
fn test_dose_pediatric_weight_based() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["dose", "--pathway", "pediatric", "--weight", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pediatric dosing for 20 kg"))
        .stdout(predicate::str::contains("Epinephrine:      0.20 mg"));
}

#[test]
fn test_dose_pediatric_without_weight_shows_formula() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["dose", "--pathway", "pediatric"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0.01 mg/kg"));
}

#[test]
fn test_shockable_demo_writes_history() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["--plaintext", "demo", "--scenario", "shockable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Shock #1"))
        .stdout(predicate::str::contains("Shock #4"))
        .stdout(predicate::str::contains("Amiodarone #1"))
        .stdout(predicate::str::contains("Outcome: Rosc"))
        .stdout(predicate::str::contains("History record written."));

    let dir = data_dir(&temp_dir);
    assert!(!dir.join("resumable_session.json").exists());

    let history = read_history(&dir);
    assert_eq!(history.len(), 1);
    let session = &history[0]["entry"]["session"];
    assert_eq!(session["shock_count"], 4);
    assert_eq!(session["epinephrine_count"], 2);
    assert_eq!(session["outcome"], "rosc");
}

#[test]
fn test_non_shockable_demo_deceased() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["--plaintext", "demo", "--scenario", "non-shockable", "--outcome", "deceased"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rhythm Asystole"))
        .stdout(predicate::str::contains("No shock, rhythm Pea"))
        .stdout(predicate::str::contains("Outcome: Deceased"));

    let history = read_history(&data_dir(&temp_dir));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["entry"]["session"]["shock_count"], 0);
}

#[test]
fn test_interrupted_demo_resumes_with_countdown_preserved() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["demo", "--scenario", "shockable", "--interrupt-at", "220"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session interrupted at 03:40"));

    // Shock #2 at 135 s restarted the cycle; 85 s had passed at the interrupt
    cli(&temp_dir)
        .args(["resume", "--after", "90"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Phase: Shockable"))
        .stdout(predicate::str::contains("Cycle remaining: 00:35"));

    cli(&temp_dir)
        .args(["resume", "--after", "5", "--finish", "deceased"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Outcome: Deceased"));

    cli(&temp_dir)
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to resume."));

    cli(&temp_dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deceased, 2 shocks, 1 epinephrine"));
}

#[test]
fn test_encrypted_storage_hides_session_contents() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["demo", "--scenario", "shockable", "--interrupt-at", "100"])
        .assert()
        .success();

    let dir = data_dir(&temp_dir);
    assert!(dir.join("storage.key").exists());
    let raw = fs::read_to_string(dir.join("resumable_session.json")).unwrap();
    assert!(!raw.contains("shock_count"));

    cli(&temp_dir)
        .args(["resume", "--after", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Resumed cardiac arrest session"));
}

#[test]
fn test_discard() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("discard")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to discard."));

    cli(&temp_dir)
        .args(["demo", "--scenario", "non-shockable", "--interrupt-at", "60"])
        .assert()
        .success();

    cli(&temp_dir)
        .arg("discard")
        .assert()
        .success()
        .stdout(predicate::str::contains("Discarded interrupted session."));

    cli(&temp_dir)
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to resume."));
}

#[test]
fn test_bradytachy_demo_resolves() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["--plaintext", "demo", "--scenario", "bradytachy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Adenosine #2 (12 mg)"))
        .stdout(predicate::str::contains("Episode resolved"));

    let history = read_history(&data_dir(&temp_dir));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["session_type"], "bradytachy");
    assert_eq!(history[0]["entry"]["session"]["outcome"], "resolved");
}

#[test]
fn test_bradytachy_handoff_into_arrest() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["--plaintext", "demo", "--scenario", "bradytachy-arrest", "--outcome", "deceased"])
        .assert()
        .success()
        .stdout(predicate::str::contains("switching to cardiac arrest"))
        .stdout(predicate::str::contains("Outcome: Deceased"));

    // The with-pulse episode is carried inside the arrest record
    let history = read_history(&data_dir(&temp_dir));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["session_type"], "bradytachy_arrest");
    let session = &history[0]["entry"]["session"];
    assert_eq!(session["origin"]["kind"], "brady_tachy_handoff");
    let interventions = session["interventions"].as_array().expect("interventions");
    assert!(interventions
        .iter()
        .any(|i| i["kind"]["brady_tachy"] == "atropine"));
}

#[test]
fn test_history_empty_and_export() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions recorded."));

    cli(&temp_dir)
        .args(["demo", "--scenario", "shockable"])
        .assert()
        .success();
    cli(&temp_dir)
        .args(["demo", "--scenario", "bradytachy"])
        .assert()
        .success();

    let output = temp_dir.path().join("export.csv");
    cli(&temp_dir)
        .arg("export")
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 2 sessions"));

    let csv = fs::read_to_string(&output).unwrap();
    assert!(csv.starts_with("id,session_type,start_time"));
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn test_history_json() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["demo", "--scenario", "non-shockable"])
        .assert()
        .success();

    let output = cli(&temp_dir)
        .args(["history", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(records.as_array().map(Vec::len), Some(1));
    assert_eq!(records[0]["session_type"], "cardiac_arrest");
}

#[test]
fn test_rejects_mismatched_finish() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["demo", "--scenario", "shockable", "--interrupt-at", "60"])
        .assert()
        .success();

    cli(&temp_dir)
        .args(["resume", "--finish", "resolved"])
        .assert()
        .failure();
}

#[test]
fn test_resume_rejects_out_of_range_gap() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["demo", "--scenario", "shockable", "--interrupt-at", "60"])
        .assert()
        .success();

    cli(&temp_dir)
        .args(["resume", "--after", "9223372036854775807"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"))
        .stderr(predicate::str::contains("panicked").not());

    cli(&temp_dir)
        .args(["resume", "--after", "-5"])
        .assert()
        .failure();

    // The snapshot is untouched by the rejected attempts
    cli(&temp_dir)
        .args(["resume", "--after", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Resumed cardiac arrest session"));
}

#[test]
fn test_resume_finish_reports_failed_history_write() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["--plaintext", "demo", "--scenario", "shockable", "--interrupt-at", "60"])
        .assert()
        .success();

    // History that cannot be read is never overwritten
    let history_path = data_dir(&temp_dir).join("session_history.json");
    fs::create_dir(&history_path).unwrap();

    cli(&temp_dir)
        .args(["--plaintext", "resume", "--after", "5", "--finish", "deceased"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("History record written.").not())
        .stderr(predicate::str::contains("history record was not written"));

    fs::remove_dir(&history_path).unwrap();
    cli(&temp_dir)
        .args(["--plaintext", "resume", "--after", "5", "--finish", "deceased"])
        .assert()
        .success()
        .stdout(predicate::str::contains("History record written."));
    assert_eq!(read_history(&data_dir(&temp_dir)).len(), 1);
}

#[test]
fn test_config_write_and_energy_ceiling() {
    let temp_dir = setup_test_dir();
    cli(&temp_dir)
        .args(["dose", "--pathway", "pediatric", "--weight", "120"])
        .assert()
        .success()
        .stdout(predicate::str::contains("240 J"));

    cli(&temp_dir)
        .args(["config", "--write"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote config to"));

    let config_path = temp_dir.path().join("config").join("codeblue").join("config.toml");
    let written = fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("max_energy_joules = 360"));
    fs::write(
        &config_path,
        written.replace("max_energy_joules = 360", "max_energy_joules = 200"),
    )
    .unwrap();

    cli(&temp_dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Energy ceiling:   200 J"));

    cli(&temp_dir)
        .args(["dose", "--pathway", "pediatric", "--weight", "120"])
        .assert()
        .success()
        .stdout(predicate::str::contains("200 J"))
        .stdout(predicate::str::contains("240 J").not());
}
