//! Configuration resolution for Cipherchat.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cipherchat/settings.json)
//! 3. Project config (.cipherchat/settings.json)
//! 4. Environment variables
//!
//! Files may be partial: only the keys they contain override lower layers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default rotation interval: 24 hours.
const DEFAULT_ROTATION_SECS: u64 = 24 * 60 * 60;

/// Default maximum age of an unused stored key: 30 days.
const DEFAULT_KEY_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// How the local identity key pair lives across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
    /// A fresh identity per process; nothing is written to disk.
    #[default]
    Ephemeral,
    /// The identity secret is stored in the key database and reused.
    Persistent,
}

impl FromStr for IdentityPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ephemeral" => Ok(Self::Ephemeral),
            "persistent" => Ok(Self::Persistent),
            other => Err(Error::Config(format!("Unknown identity policy: {other}"))),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Rotate a conversation's ratchet when this many seconds have passed.
    pub key_rotation_interval_secs: u64,
    /// Highest outgoing sequence number before numbering wraps.
    pub max_sequence_number: u32,
    /// Largest gap of skipped messages a single receive may bridge.
    pub max_skip: u32,
    /// Entries kept in each conversation's replay window.
    pub replay_window: usize,
    /// Stored keys unused for longer than this are pruned.
    pub key_max_age_secs: u64,
    /// Cached skipped keys further than this behind the receiving counter are pruned.
    pub skipped_key_window: u32,
    pub identity: IdentityPolicy,
    /// Key database location; `None` keeps keys in memory.
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_rotation_interval_secs: DEFAULT_ROTATION_SECS,
            max_sequence_number: 2_147_483_647, // 2^31 - 1
            max_skip: 1000,
            replay_window: 1000,
            key_max_age_secs: DEFAULT_KEY_MAX_AGE_SECS,
            skipped_key_window: 100,
            identity: IdentityPolicy::Ephemeral,
            database_path: None,
            log_level: "info".to_string(),
            event_capacity: 256,
        }
    }
}

impl CryptoConfig {
    pub const fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.key_rotation_interval_secs)
    }

    pub const fn key_max_age(&self) -> Duration {
        Duration::from_secs(self.key_max_age_secs)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_sequence_number == 0 {
            return Err(Error::Config("max_sequence_number must be positive".into()));
        }
        if self.replay_window == 0 {
            return Err(Error::Config("replay_window must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<CryptoConfig> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            layers.push(global_path);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".cipherchat").join("settings.json");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cipherchat").join("settings.json"))
}

/// Default on-disk location of the key database.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("cipherchat").join("keys.db"))
}

/// Merge the given JSON files over the defaults, later files winning.
fn load_layers(paths: &[PathBuf]) -> Result<CryptoConfig> {
    let mut merged = serde_json::to_value(CryptoConfig::default())?;
    for path in paths {
        let overlay = load_config_file(path)?;
        merge_json(&mut merged, overlay);
    }
    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid config: {e}")))
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut CryptoConfig) -> Result<()> {
    if let Ok(val) = std::env::var("CIPHERCHAT_KEY_ROTATION_SECS") {
        if let Ok(n) = val.parse() {
            config.key_rotation_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("CIPHERCHAT_MAX_SEQUENCE") {
        if let Ok(n) = val.parse() {
            config.max_sequence_number = n;
        }
    }
    if let Ok(val) = std::env::var("CIPHERCHAT_IDENTITY") {
        config.identity = val.parse()?;
    }
    if let Ok(val) = std::env::var("CIPHERCHAT_DATABASE") {
        config.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("CIPHERCHAT_LOG_LEVEL") {
        config.log_level = val;
    }
    Ok(())
}
