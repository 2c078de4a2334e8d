#![forbid(unsafe_code)]

//! Core protocol engine for the CodeBlue resuscitation assistant.
//!
//! This crate provides:
//! - Domain types (sessions, phases, checklists, decision context)
//! - The cardiac-arrest and bradycardia/tachycardia state machines
//! - Timer engine and dosing calculator
//! - Persistence (resumable snapshot, history, encrypted storage, CSV export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod log;
pub mod dosing;
pub mod timer;
pub mod arrest;
pub mod bradytachy;
pub mod store;
pub mod crypto;
pub mod persistence;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::{Config, GuardMode, ProtocolConfig};
pub use log::{BradyTachyAction, Intervention, InterventionKind, InterventionLog};
pub use dosing::DoseResult;
pub use timer::TimerState;
pub use arrest::{ArrestMachine, Banner, BannerPriority, Eligibility};
pub use bradytachy::{BradyTachyMachine, Handoff};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use persistence::{AutoSaver, HistoryRecord, Persistence, Snapshot, SnapshotBody};
