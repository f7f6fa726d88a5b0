//! # Sync Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_ROUTING_MODE=offline_first                                   │
//! │     TALLY_TERMINAL_ID=till-1                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     RoutingMode::Direct, generated terminal id                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [terminal]
//! id = "till-1"
//! name = "Front Counter"
//!
//! [sync]
//! routing_mode = "direct"   # direct | offline_first
//! call_timeout_ms = 10000
//! command_timeout_ms = 5000
//! retry_ceiling = 10
//! initial_backoff_ms = 500
//! max_backoff_secs = 60
//! backoff_multiplier = 2.0
//! check_interval_secs = 15
//!
//! [storage]
//! database_path = "/var/lib/tally/tally.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Routing Mode
// =============================================================================

/// How the command router treats remote-backed commands while online.
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  DIRECT (Default)                                                      │
/// │  • Online with an empty queue: call the backend, apply the result      │
/// │  • Timeout or transient failure: enqueue and apply locally             │
/// │                                                                         │
/// │  OFFLINE_FIRST                                                         │
/// │  • Always apply locally and enqueue                                    │
/// │  • The sync engine delivers in the background                          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    Direct,
    OfflineFirst,
}

impl RoutingMode {
    pub fn always_enqueues(&self) -> bool {
        matches!(self, RoutingMode::OfflineFirst)
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMode::Direct => write!(f, "direct"),
            RoutingMode::OfflineFirst => write!(f, "offline_first"),
        }
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "online" => Ok(RoutingMode::Direct),
            "offline_first" | "offline-first" | "queued" => Ok(RoutingMode::OfflineFirst),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown routing mode: '{}'. Valid options: direct, offline_first",
                other
            ))),
        }
    }
}

// =============================================================================
// Terminal Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Sent with every `StartSession`.
    pub id: String,

    #[serde(default = "default_terminal_name")]
    pub name: String,
}

fn default_terminal_name() -> String {
    "POS Terminal".to_string()
}

impl Default for TerminalConfig {
    fn default() -> Self {
        TerminalConfig {
            id: Uuid::new_v4().to_string(),
            name: default_terminal_name(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub routing_mode: RoutingMode,

    /// Bound on each remote call made while draining (milliseconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Bound on a direct online command before it degrades to the queue
    /// (milliseconds).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Operations that failed more often than this are reported as
    /// needing attention.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Reachability check period; 0 disables the check.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

fn default_call_timeout() -> u64 {
    10_000
}
fn default_command_timeout() -> u64 {
    5_000
}
fn default_retry_ceiling() -> u32 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_check_interval() -> u64 {
    15
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            routing_mode: RoutingMode::default(),
            call_timeout_ms: default_call_timeout(),
            command_timeout_ms: default_command_timeout(),
            retry_ceiling: default_retry_ceiling(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            check_interval_secs: default_check_interval(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to `tally.db` in the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub terminal: TerminalConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.terminal.id.trim().is_empty() {
            return Err(SyncError::MissingTerminalId);
        }

        if self.sync.call_timeout_ms == 0 || self.sync.command_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "timeouts must be greater than 0".into(),
            ));
        }

        if self.sync.retry_ceiling == 0 {
            return Err(SyncError::InvalidConfig(
                "retry_ceiling must be greater than 0".into(),
            ));
        }

        if self.max_backoff() < self.initial_backoff() {
            return Err(SyncError::InvalidConfig(format!(
                "max_backoff_secs ({}) is below initial_backoff_ms ({})",
                self.sync.max_backoff_secs, self.sync.initial_backoff_ms
            )));
        }

        let multiplier = self.sync.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TALLY_TERMINAL_ID") {
            debug!(terminal_id = %id, "Overriding terminal ID from environment");
            self.terminal.id = id;
        }

        if let Ok(name) = std::env::var("TALLY_TERMINAL_NAME") {
            self.terminal.name = name;
        }

        if let Ok(mode) = std::env::var("TALLY_ROUTING_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding routing mode from environment");
                    self.sync.routing_mode = parsed;
                }
                Err(e) => warn!(mode = %mode, error = %e, "Ignoring routing mode from environment"),
            }
        }

        if let Ok(timeout) = std::env::var("TALLY_CALL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.sync.call_timeout_ms = ms;
            }
        }

        if let Ok(ceiling) = std::env::var("TALLY_RETRY_CEILING") {
            if let Ok(c) = ceiling.parse::<u32>() {
                self.sync.retry_ceiling = c;
            }
        }

        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn terminal_id(&self) -> &str {
        &self.terminal.id
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.sync.routing_mode
    }

    /// Configured database file, else `tally.db` in the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "tally", "pos")
                .map(|dirs| dirs.data_dir().join("tally.db"))
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.call_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.command_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.sync.max_backoff_secs)
    }

    /// `None` when probing is disabled.
    pub fn check_interval(&self) -> Option<Duration> {
        (self.sync.check_interval_secs > 0)
            .then(|| Duration::from_secs(self.sync.check_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_mode_parsing() {
        assert_eq!("direct".parse::<RoutingMode>().unwrap(), RoutingMode::Direct);
        assert_eq!(
            "offline_first".parse::<RoutingMode>().unwrap(),
            RoutingMode::OfflineFirst
        );
        assert_eq!(
            "Offline-First".parse::<RoutingMode>().unwrap(),
            RoutingMode::OfflineFirst
        );
        assert!("sometimes".parse::<RoutingMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.terminal.id.is_empty());
        assert_eq!(config.routing_mode(), RoutingMode::Direct);
        assert_eq!(config.sync.retry_ceiling, 10);
        assert_eq!(config.initial_backoff(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.terminal.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingTerminalId)));

        config.terminal.id = "till-1".to_string();
        config.sync.call_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.sync.call_timeout_ms = 1_000;
        config.sync.retry_ceiling = 0;
        assert!(config.validate().is_err());

        config.sync.retry_ceiling = 3;
        config.sync.initial_backoff_ms = 5_000;
        config.sync.max_backoff_secs = 1;
        assert!(config.validate().is_err());

        config.sync.max_backoff_secs = 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [terminal]
            id = "till-7"

            [sync]
            routing_mode = "offline_first"
            "#,
        )
        .unwrap();

        assert_eq!(config.terminal_id(), "till-7");
        assert_eq!(config.terminal.name, "POS Terminal");
        assert!(config.routing_mode().always_enqueues());
        assert_eq!(config.sync.call_timeout_ms, 10_000);
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.terminal.id = "till-3".to_string();
        config.sync.check_interval_secs = 0;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[terminal]"));
        assert!(contents.contains("[sync]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.terminal_id(), "till-3");
        assert!(loaded.check_interval().is_none());
    }
}
