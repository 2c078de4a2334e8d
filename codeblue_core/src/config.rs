//! Configuration file support for CodeBlue.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/codeblue/config.toml`.
//! Protocol constants are immutable for the lifetime of a session: a machine
//! copies its `ProtocolConfig` at creation.

use crate::dosing::MAX_ENERGY_JOULES;
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Discrete biphasic energies an adult defibrillator is configured with
pub const ADULT_ENERGY_CHOICES: [u32; 4] = [120, 150, 200, 360];

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Whether action handlers re-check eligibility before mutating
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    /// Apply every drug/shock action; the caller gates on eligibility flags
    #[default]
    Trust,
    /// Refuse drug actions whose eligibility flag is false
    Enforce,
}

/// Timing and energy constants for the resuscitation algorithms
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtocolConfig {
    #[serde(default = "default_rhythm_check_interval_ms")]
    pub rhythm_check_interval_ms: u64,

    #[serde(default = "default_medication_interval_ms")]
    pub medication_interval_ms: u64,

    #[serde(default = "default_pre_alert_ms")]
    pub pre_alert_ms: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Energy for every adult shock, one of [`ADULT_ENERGY_CHOICES`]
    #[serde(default = "default_adult_energy_joules")]
    pub adult_energy_joules: u32,

    /// Ceiling applied to every computed shock and cardioversion energy
    #[serde(default = "default_max_energy_joules")]
    pub max_energy_joules: u32,

    /// How long a pregnant patient may be in arrest before delivery is prompted
    #[serde(default = "default_delivery_prompt_ms")]
    pub delivery_prompt_ms: u64,

    #[serde(default)]
    pub guard: GuardMode,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            rhythm_check_interval_ms: default_rhythm_check_interval_ms(),
            medication_interval_ms: default_medication_interval_ms(),
            pre_alert_ms: default_pre_alert_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            adult_energy_joules: default_adult_energy_joules(),
            max_energy_joules: default_max_energy_joules(),
            delivery_prompt_ms: default_delivery_prompt_ms(),
            guard: GuardMode::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn rhythm_check_interval(&self) -> Duration {
        Duration::milliseconds(self.rhythm_check_interval_ms as i64)
    }

    pub fn medication_interval(&self) -> Duration {
        Duration::milliseconds(self.medication_interval_ms as i64)
    }

    pub fn pre_alert(&self) -> Duration {
        Duration::milliseconds(self.pre_alert_ms as i64)
    }

    pub fn delivery_prompt(&self) -> Duration {
        Duration::milliseconds(self.delivery_prompt_ms as i64)
    }

    /// Reject constants that would make the timers meaningless
    pub fn validate(&self) -> Result<()> {
        if self.rhythm_check_interval_ms == 0 || self.medication_interval_ms == 0 {
            return Err(Error::Config("intervals must be non-zero".into()));
        }
        if self.pre_alert_ms >= self.rhythm_check_interval_ms {
            return Err(Error::Config(format!(
                "pre-alert lead ({} ms) must be shorter than the rhythm check interval ({} ms)",
                self.pre_alert_ms, self.rhythm_check_interval_ms
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick interval must be non-zero".into()));
        }
        if !ADULT_ENERGY_CHOICES.contains(&self.adult_energy_joules) {
            return Err(Error::Config(format!(
                "adult energy {} J is not one of {:?}",
                self.adult_energy_joules, ADULT_ENERGY_CHOICES
            )));
        }
        if self.max_energy_joules == 0 || self.max_energy_joules > MAX_ENERGY_JOULES {
            return Err(Error::Config(format!(
                "energy ceiling {} J must be between 1 and {} J",
                self.max_energy_joules, MAX_ENERGY_JOULES
            )));
        }
        if self.adult_energy_joules > self.max_energy_joules {
            return Err(Error::Config(format!(
                "adult energy {} J exceeds the {} J ceiling",
                self.adult_energy_joules, self.max_energy_joules
            )));
        }
        Ok(())
    }
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Quiet period before post-ROSC checklist edits are written to history
    #[serde(default = "default_history_debounce_ms")]
    pub history_debounce_ms: u64,

    #[serde(default = "default_encrypt")]
    pub encrypt: bool,

    #[serde(default = "default_key_file")]
    pub key_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_debounce_ms: default_history_debounce_ms(),
            encrypt: default_encrypt(),
            key_file: default_key_file(),
        }
    }
}

impl StorageConfig {
    pub fn history_debounce(&self) -> Duration {
        Duration::milliseconds(self.history_debounce_ms as i64)
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("codeblue")
}

fn default_rhythm_check_interval_ms() -> u64 {
    120_000
}

fn default_medication_interval_ms() -> u64 {
    240_000
}

fn default_pre_alert_ms() -> u64 {
    15_000
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_adult_energy_joules() -> u32 {
    200
}

fn default_max_energy_joules() -> u32 {
    MAX_ENERGY_JOULES
}

fn default_delivery_prompt_ms() -> u64 {
    300_000
}

fn default_history_debounce_ms() -> u64 {
    2_000
}

fn default_encrypt() -> bool {
    true
}

fn default_key_file() -> String {
    "storage.key".into()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.protocol.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("codeblue").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
