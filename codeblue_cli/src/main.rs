use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use codeblue_core::persistence::{self, HistoryEntry};
use codeblue_core::*;
use std::path::{Path, PathBuf};

type Store = Persistence<Box<dyn KeyValueStore>>;

#[derive(Parser)]
#[command(name = "codeblue")]
#[command(about = "Resuscitation protocol assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Store session data unencrypted
    #[arg(long, global = true)]
    plaintext: bool,

    /// Log engine decisions to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the dosing table for a patient
    Dose {
        #[arg(long, value_enum, default_value = "adult")]
        pathway: Pathway,

        /// Patient weight in kilograms (pediatric dosing)
        #[arg(long)]
        weight: Option<f64>,
    },

    /// Run a scripted scenario on a simulated clock
    Demo {
        #[arg(long, value_enum, default_value = "shockable")]
        scenario: Scenario,

        /// How the arrest ends
        #[arg(long, value_enum, default_value = "rosc")]
        outcome: ArrestEnd,

        /// Stop the scenario at this many seconds, leaving it resumable
        #[arg(long)]
        interrupt_at: Option<i64>,
    },

    /// Resume the interrupted session
    Resume {
        /// Seconds since the snapshot was saved (defaults to the real gap)
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        after: Option<i64>,

        /// Bring the resumed session to an end
        #[arg(long, value_enum)]
        finish: Option<Finish>,
    },

    /// Discard the interrupted session
    Discard,

    /// List completed sessions
    History {
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export completed sessions to CSV
    Export {
        #[arg(long)]
        output: PathBuf,
    },

    /// Show the active configuration
    Config {
        /// Write the active configuration to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Pathway {
    Adult,
    Pediatric,
}

impl From<Pathway> for PathwayMode {
    fn from(p: Pathway) -> Self {
        match p {
            Pathway::Adult => PathwayMode::Adult,
            Pathway::Pediatric => PathwayMode::Pediatric,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    Shockable,
    NonShockable,
    Bradytachy,
    BradytachyArrest,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArrestEnd {
    Rosc,
    Deceased,
}

#[derive(Clone, Copy, ValueEnum)]
enum Finish {
    Rosc,
    Deceased,
    Resolved,
    Transferred,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    codeblue_core::logging::init(cli.verbose);

    let mut config = Config::load()?;
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    if cli.plaintext {
        config.storage.encrypt = false;
    }
    tracing::debug!("Using data dir {:?}", config.data.data_dir);

    match cli.command {
        Commands::Dose { pathway, weight } => cmd_dose(pathway.into(), weight, &config),
        Commands::Demo {
            scenario,
            outcome,
            interrupt_at,
        } => cmd_demo(scenario, outcome, interrupt_at, &config),
        Commands::Resume { after, finish } => cmd_resume(after, finish, &config),
        Commands::Discard => cmd_discard(&config),
        Commands::History { json } => cmd_history(json, &config),
        Commands::Config { write } => cmd_config(write, &config),
        Commands::Export { output } => cmd_export(&output, &config),
    }
}

// ============================================================================
// dose
// ============================================================================

fn cmd_dose(mode: PathwayMode, weight: Option<f64>, config: &Config) -> Result<()> {
    let weight = match mode {
        PathwayMode::Pediatric => weight,
        PathwayMode::Adult => None,
    };
    let adult_joules = config.protocol.adult_energy_joules;
    let max_joules = config.protocol.max_energy_joules;

    match (mode, weight) {
        (PathwayMode::Pediatric, Some(w)) => println!("Pediatric dosing for {} kg", w),
        (PathwayMode::Pediatric, None) => println!("Pediatric dosing (no weight: formulas shown)"),
        (PathwayMode::Adult, _) => println!("Adult dosing"),
    }

    println!();
    println!("Cardiac arrest");
    println!("  Epinephrine:      {}", dosing::epinephrine_for(mode, weight).display_text);
    println!("  Amiodarone #1:    {}", dosing::amiodarone_for(mode, weight, 0).display_text);
    println!("  Amiodarone #2:    {}", dosing::amiodarone_for(mode, weight, 1).display_text);
    println!("  Lidocaine #1:     {}", dosing::lidocaine_for(mode, weight, 0).display_text);
    println!("  Lidocaine #2:     {}", dosing::lidocaine_for(mode, weight, 1).display_text);
    for ordinal in 0..3 {
        println!(
            "  Shock #{}:         {}",
            ordinal + 1,
            dosing::shock_energy_for(mode, weight, ordinal, adult_joules, max_joules).display_text
        );
    }

    println!();
    println!("Bradycardia / tachycardia with pulse");
    println!("  Atropine:         {}", dosing::atropine_for(mode, weight).display_text);
    println!("  Dopamine:         {}", dosing::dopamine_rate().display_text);
    println!("  Epinephrine drip: {}", dosing::epinephrine_infusion_for(mode).display_text);
    println!("  Adenosine #1:     {}", dosing::adenosine_for(mode, weight, 0).display_text);
    println!("  Adenosine #2:     {}", dosing::adenosine_for(mode, weight, 1).display_text);
    println!("  Amiodarone:       {}", dosing::stable_amiodarone_for(mode, weight).display_text);
    println!("  Procainamide:     {}", dosing::procainamide_for(mode, weight).display_text);
    for rhythm in [
        CardioversionRhythm::NarrowRegular,
        CardioversionRhythm::NarrowIrregular,
        CardioversionRhythm::WideRegular,
        CardioversionRhythm::WideIrregular,
    ] {
        println!(
            "  Cardioversion {:<16} {}",
            format!("{:?}:", rhythm),
            dosing::cardioversion_energy_for(mode, weight, Some(rhythm), 0, max_joules).display_text
        );
    }
    Ok(())
}

// ============================================================================
// demo
// ============================================================================

#[derive(Clone, Copy)]
enum ArrestStep {
    StartCpr,
    Rhythm(Rhythm),
    Check,
    Shock,
    NoShock(Rhythm),
    ResumeCpr,
    Epinephrine,
    Amiodarone,
    Etco2(f64),
    End(ArrestEnd),
    PostRosc(PostRoscTask),
}

#[derive(Clone, Copy)]
enum BradyStep {
    Group(PathwayMode),
    Branch(Branch),
    QrsWidth(QrsWidth),
    Regularity(Regularity),
    CardioversionRhythm(CardioversionRhythm),
    Stability(Stability),
    Atropine,
    Pacing,
    Vagal,
    Adenosine,
    Resolve,
    SwitchToArrest,
}

/// Simulated episode: fixed start instant plus second offsets
struct Demo {
    persistence: Store,
    saver: AutoSaver,
    t0: DateTime<Utc>,
    interrupt_at: Option<i64>,
}

impl Demo {
    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + Duration::seconds(secs)
    }

    fn interrupted(&self, secs: i64) -> bool {
        self.interrupt_at.map_or(false, |stop| secs > stop)
    }

    fn stamp(&self, origin: DateTime<Utc>, secs: i64) -> String {
        format_clock((self.at(secs) - origin).num_milliseconds())
    }
}

fn format_clock(ms: i64) -> String {
    let total = ms.max(0) / 1000;
    format!("{:02}:{:02}", total / 60, total % 60)
}

fn arrest_script(scenario: Scenario, end: ArrestEnd, offset: i64) -> Vec<(i64, ArrestStep)> {
    use ArrestStep::*;
    let mut steps = match scenario {
        Scenario::Shockable => vec![
            (0, StartCpr),
            (10, Rhythm(codeblue_core::Rhythm::Shockable)),
            (130, Check),
            (135, Shock),
            (140, Epinephrine),
            (255, Check),
            (260, Shock),
            (265, Amiodarone),
            (300, Etco2(18.0)),
            (380, Check),
            (385, Shock),
            (395, Epinephrine),
            (505, Check),
            (510, End(end)),
        ],
        _ => vec![
            (0, StartCpr),
            (10, Rhythm(codeblue_core::Rhythm::Asystole)),
            (15, Epinephrine),
            (130, Check),
            (135, ResumeCpr),
            (255, Check),
            (260, NoShock(codeblue_core::Rhythm::Pea)),
            (265, Epinephrine),
            (380, Check),
            (385, End(end)),
        ],
    };
    if matches!(end, ArrestEnd::Rosc) {
        let last = steps.last().map_or(0, |(t, _)| *t);
        steps.push((last + 60, PostRosc(PostRoscTask::TwelveLeadEcg)));
        steps.push((last + 90, PostRosc(PostRoscTask::CheckGlucose)));
    }
    steps.into_iter().map(|(t, s)| (t + offset, s)).collect()
}

fn brady_script(scenario: Scenario) -> Vec<(i64, BradyStep)> {
    use BradyStep::*;
    match scenario {
        Scenario::Bradytachy => vec![
            (0, Group(PathwayMode::Adult)),
            (5, Branch(codeblue_core::Branch::Tachycardia)),
            (20, QrsWidth(codeblue_core::QrsWidth::Narrow)),
            (25, Regularity(codeblue_core::Regularity::Regular)),
            (30, CardioversionRhythm(codeblue_core::CardioversionRhythm::NarrowRegular)),
            (40, Stability(codeblue_core::Stability::Stable)),
            (60, Vagal),
            (120, Adenosine),
            (240, Adenosine),
            (360, Resolve),
        ],
        _ => vec![
            (0, Group(PathwayMode::Adult)),
            (5, Branch(codeblue_core::Branch::Bradycardia)),
            (20, Stability(codeblue_core::Stability::Unstable)),
            (60, Atropine),
            (180, Pacing),
            (300, SwitchToArrest),
        ],
    }
}

fn cmd_demo(scenario: Scenario, end: ArrestEnd, interrupt_at: Option<i64>, config: &Config) -> Result<()> {
    let mut demo = Demo {
        persistence: persistence::open(config)?,
        saver: AutoSaver::new(&config.storage),
        t0: Utc::now(),
        interrupt_at,
    };

    match scenario {
        Scenario::Shockable | Scenario::NonShockable => {
            let machine = ArrestMachine::new(config.protocol.clone(), demo.t0);
            run_arrest(&mut demo, machine, arrest_script(scenario, end, 0))
        }
        Scenario::Bradytachy | Scenario::BradytachyArrest => {
            let machine = BradyTachyMachine::new(config.protocol.clone(), demo.t0);
            let Some((handoff, at)) = run_brady(&mut demo, machine, brady_script(scenario))? else {
                return Ok(());
            };
            let machine = ArrestMachine::from_handoff(handoff, config.protocol.clone(), demo.at(at));
            run_arrest(
                &mut demo,
                machine,
                arrest_script(Scenario::NonShockable, end, at + 1),
            )
        }
    }
}

fn report_interrupt(secs: i64) {
    println!();
    println!("Session interrupted at {}.", format_clock(secs * 1000));
    println!("Run `codeblue resume` to continue it.");
}

fn run_arrest(demo: &mut Demo, mut machine: ArrestMachine, steps: Vec<(i64, ArrestStep)>) -> Result<()> {
    for (secs, step) in steps {
        if let Some(stop) = demo.interrupt_at.filter(|_| demo.interrupted(secs)) {
            let now = demo.at(stop);
            machine.tick(now);
            demo.saver.observe_arrest(&mut demo.persistence, &machine, now);
            tracing::info!("Demo interrupted at {} s in {:?}", stop, machine.phase());
            report_interrupt(stop);
            return Ok(());
        }

        let now = demo.at(secs);
        machine.tick(now);
        let line = apply_arrest_step(&mut machine, step, now)?;
        let origin = machine.session().timeline_origin();
        println!("[{}] {}", demo.stamp(origin, secs), line);
        demo.saver.observe_arrest(&mut demo.persistence, &machine, now);
    }

    if let Some(last) = machine.session().end_time {
        demo.saver.flush(&mut demo.persistence);
        print_arrest_summary(&machine, last);
        if demo.saver.has_saved(machine.session().id) {
            println!("History record written.");
        }
    }
    Ok(())
}

fn apply_arrest_step(machine: &mut ArrestMachine, step: ArrestStep, now: DateTime<Utc>) -> Result<String> {
    let line = match step {
        ArrestStep::StartCpr => {
            machine.start_cpr(now)?;
            "CPR started".to_string()
        }
        ArrestStep::Rhythm(rhythm) => {
            machine.select_rhythm(rhythm, now)?;
            match machine.session().interventions.last() {
                Some(shock) if shock.kind == InterventionKind::Shock => {
                    format!("Rhythm {:?}: Shock #1 ({})", rhythm, energy_text(shock))
                }
                _ => format!("Rhythm {:?}", rhythm),
            }
        }
        ArrestStep::Check => {
            machine.start_rhythm_check(now)?;
            "Rhythm check".to_string()
        }
        ArrestStep::Shock => {
            let energy = machine.next_shock_energy();
            let joules = energy.value.unwrap_or(f64::from(machine.config().adult_energy_joules));
            machine.complete_check_with_shock(joules, now)?;
            format!("Shock #{} ({} J)", machine.session().shock_count, joules)
        }
        ArrestStep::NoShock(rhythm) => {
            machine.complete_check_no_shock(rhythm, now)?;
            format!("No shock, rhythm {:?}", rhythm)
        }
        ArrestStep::ResumeCpr => {
            machine.complete_check_resume_cpr(now)?;
            "Rhythm unchanged, CPR resumed".to_string()
        }
        ArrestStep::Epinephrine => {
            let dose = machine.give_epinephrine(now)?;
            format!("Epinephrine #{} ({})", machine.session().epinephrine_count, dose.display_text)
        }
        ArrestStep::Amiodarone => {
            let dose = machine.give_amiodarone(now)?;
            format!("Amiodarone #{} ({})", machine.session().amiodarone_count, dose.display_text)
        }
        ArrestStep::Etco2(value) => {
            machine.record_etco2(value, now)?;
            format!("ETCO2 {} mmHg", value)
        }
        ArrestStep::End(ArrestEnd::Rosc) => {
            machine.achieve_rosc(now)?;
            "ROSC".to_string()
        }
        ArrestStep::End(ArrestEnd::Deceased) => {
            machine.terminate(now)?;
            "Resuscitation terminated".to_string()
        }
        ArrestStep::PostRosc(task) => {
            machine.update_post_rosc_checklist(task, true)?;
            format!("Post-ROSC: {:?} done", task)
        }
    };
    Ok(line)
}

fn energy_text(entry: &Intervention<InterventionKind>) -> String {
    entry
        .text_params
        .get("energy")
        .cloned()
        .unwrap_or_else(|| "energy unknown".to_string())
}

fn run_brady(
    demo: &mut Demo,
    mut machine: BradyTachyMachine,
    steps: Vec<(i64, BradyStep)>,
) -> Result<Option<(Handoff, i64)>> {
    for (secs, step) in steps {
        if let Some(stop) = demo.interrupt_at.filter(|_| demo.interrupted(secs)) {
            let stop_at = demo.at(stop);
            demo.saver
                .observe_bradytachy(&mut demo.persistence, &machine, stop_at);
            report_interrupt(stop);
            return Ok(None);
        }

        let now = demo.at(secs);
        let start = machine.session().start_time;
        let line = match step {
            BradyStep::Group(group) => {
                machine.set_patient_group(group)?;
                format!("Patient group {:?}", group)
            }
            BradyStep::Branch(branch) => {
                machine.set_branch(branch)?;
                format!("{:?} branch", branch)
            }
            BradyStep::QrsWidth(width) => {
                machine.set_qrs_width(width)?;
                format!("QRS {:?}", width)
            }
            BradyStep::Regularity(regularity) => {
                machine.set_rhythm_regularity(regularity)?;
                format!("Rhythm {:?}", regularity)
            }
            BradyStep::CardioversionRhythm(rhythm) => {
                machine.set_cardioversion_rhythm_type(rhythm)?;
                format!("Cardioversion rhythm {:?}", rhythm)
            }
            BradyStep::Stability(stability) => {
                machine.set_stability(stability)?;
                format!("Patient {:?}", stability)
            }
            BradyStep::Atropine => {
                let dose = machine.give_atropine(now)?;
                format!("Atropine ({})", dose.display_text)
            }
            BradyStep::Pacing => {
                machine.start_pacing(now)?;
                "Transcutaneous pacing".to_string()
            }
            BradyStep::Vagal => {
                machine.perform_vagal_maneuver(now)?;
                "Vagal maneuver".to_string()
            }
            BradyStep::Adenosine => {
                let dose = machine.give_adenosine(now)?;
                format!("Adenosine #{} ({})", machine.session().adenosine_count, dose.display_text)
            }
            BradyStep::Resolve => {
                machine.end_session(BradyTachyOutcome::Resolved, now)?;
                "Episode resolved".to_string()
            }
            BradyStep::SwitchToArrest => {
                let handoff = machine.switch_to_arrest(now)?;
                println!("[{}] Pulse lost: switching to cardiac arrest", demo.stamp(start, secs));
                demo.saver.observe_bradytachy(&mut demo.persistence, &machine, now);
                return Ok(Some((handoff, secs)));
            }
        };
        println!("[{}] {}", demo.stamp(start, secs), line);
        demo.saver.observe_bradytachy(&mut demo.persistence, &machine, now);
    }

    if machine.phase() == BradyTachyPhase::SessionEnded
        && demo.saver.has_saved(machine.session().id)
    {
        println!();
        println!("History record written.");
    }
    Ok(None)
}

fn print_arrest_summary(machine: &ArrestMachine, now: DateTime<Utc>) {
    let session = machine.session();
    println!();
    println!("Outcome: {:?}", session.outcome);
    println!(
        "Shocks: {}  Epinephrine: {}  Amiodarone: {}  Lidocaine: {}",
        session.shock_count, session.epinephrine_count, session.amiodarone_count, session.lidocaine_count
    );
    println!(
        "Elapsed: {}  Compressions: {}",
        format_clock((now - session.timeline_origin()).num_milliseconds()),
        format_clock(machine.timer().total_active_ms)
    );
    println!("Interventions logged: {}", session.interventions.len());
}

// ============================================================================
// resume / discard
// ============================================================================

fn cmd_resume(after: Option<i64>, finish: Option<Finish>, config: &Config) -> Result<()> {
    let mut persistence = persistence::open(config)?;
    let Some(snapshot) = persistence.load_snapshot() else {
        println!("Nothing to resume.");
        return Ok(());
    };

    let now = match after {
        Some(secs) => Duration::try_seconds(secs)
            .and_then(|gap| snapshot.saved_at.checked_add_signed(gap))
            .ok_or_else(|| Error::Other(format!("--after {} is out of range", secs)))?,
        None => Utc::now(),
    };
    let mut saver = AutoSaver::new(&config.storage);

    match snapshot.body {
        SnapshotBody::Arrest { session, timer } => {
            let mut machine = ArrestMachine::resume(session, timer, snapshot.saved_at, config.protocol.clone(), now);
            let view = machine.view(now);
            println!("Resumed cardiac arrest session {}", view.session.id);
            println!("Phase: {:?}", view.session.phase);
            println!("Cycle remaining: {}", format_clock(view.timer.cycle_remaining_ms));
            println!("Banner: {}", view.banner.message_key);

            match finish {
                Some(Finish::Rosc) | Some(Finish::Deceased) => {
                    if machine.phase().is_active_cpr() {
                        machine.start_rhythm_check(now)?;
                    }
                    if matches!(finish, Some(Finish::Rosc)) {
                        machine.achieve_rosc(now)?;
                    } else {
                        machine.terminate(now)?;
                    }
                    saver.observe_arrest(&mut persistence, &machine, now);
                    print_arrest_summary(&machine, now);
                    confirm_history_written(saver.has_saved(machine.session().id))?;
                }
                Some(_) => {
                    return Err(Error::Other(
                        "resolved/transferred only apply to brady/tachy sessions".into(),
                    ))
                }
                None => saver.observe_arrest(&mut persistence, &machine, now),
            }
        }
        SnapshotBody::Bradytachy { session } => {
            let mut machine = BradyTachyMachine::resume(session, config.protocol.clone());
            println!("Resumed brady/tachy session {}", machine.session().id);
            println!("Phase: {:?}", machine.phase());

            let outcome = match finish {
                Some(Finish::Resolved) => Some(BradyTachyOutcome::Resolved),
                Some(Finish::Transferred) => Some(BradyTachyOutcome::Transferred),
                Some(_) => {
                    return Err(Error::Other(
                        "rosc/deceased only apply to cardiac arrest sessions".into(),
                    ))
                }
                None => None,
            };
            if let Some(outcome) = outcome {
                machine.end_session(outcome, now)?;
                saver.observe_bradytachy(&mut persistence, &machine, now);
                println!("Outcome: {:?}", outcome);
                confirm_history_written(saver.has_saved(machine.session().id))?;
            }
        }
    }
    Ok(())
}

/// A finished session whose record failed to write keeps its snapshot
fn confirm_history_written(saved: bool) -> Result<()> {
    if !saved {
        return Err(Error::Storage(
            "history record was not written; the session is still resumable".into(),
        ));
    }
    println!("History record written.");
    Ok(())
}

fn cmd_discard(config: &Config) -> Result<()> {
    let mut persistence = persistence::open(config)?;
    if persistence.load_snapshot().is_some() {
        persistence.clear_snapshot();
        println!("Discarded interrupted session.");
    } else {
        println!("Nothing to discard.");
    }
    Ok(())
}

// ============================================================================
// history / export
// ============================================================================

fn cmd_history(json: bool, config: &Config) -> Result<()> {
    let persistence = persistence::open(config)?;
    let mut records = persistence.load_history();
    records.sort_by_key(HistoryRecord::start_time);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    for record in &records {
        let summary = match &record.entry {
            HistoryEntry::Arrest(s) => format!(
                "{:?}, {} shocks, {} epinephrine",
                s.outcome, s.shock_count, s.epinephrine_count
            ),
            HistoryEntry::Bradytachy(s) => format!("{:?}", s.outcome),
        };
        println!(
            "{}  {:<18} {}",
            record.start_time().format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", record.session_type),
            summary
        );
    }
    Ok(())
}

fn cmd_export(output: &Path, config: &Config) -> Result<()> {
    let persistence = persistence::open(config)?;
    let records = persistence.load_history();
    let count = export::export_history_csv(&records, output)?;
    println!("Exported {} sessions to {}", count, output.display());
    Ok(())
}

// ============================================================================
// config
// ============================================================================

fn cmd_config(write: bool, config: &Config) -> Result<()> {
    let path = Config::default_config_path();
    if write {
        config.save_to(&path)?;
        println!("Wrote config to {}", path.display());
        return Ok(());
    }

    let protocol = &config.protocol;
    println!("Config file:      {}", path.display());
    println!("Data directory:   {}", config.data.data_dir.display());
    println!("Encrypted:        {}", config.storage.encrypt);
    println!("Adult shock:      {} J", protocol.adult_energy_joules);
    println!("Energy ceiling:   {} J", protocol.max_energy_joules);
    Ok(())
}
