//! Configuration types for the sideline engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for one engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidelineConfig {
    /// Remote authority synchronization settings.
    pub sync: SyncConfig,
    /// Period dictionary and scheduling settings.
    pub periods: PeriodConfig,
    /// Notification surface settings.
    pub notices: NoticeConfig,
    /// Durable slot settings.
    pub storage: StorageConfig,
}

/// Remote authority synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Authority endpoint base URL. Empty disables all remote calls.
    pub api_base: String,
    /// Whether pull polling and debounced pushes are active.
    pub enabled: bool,
    /// Poll interval in milliseconds. Values below the floor are clamped.
    pub poll_interval_ms: u64,
    /// Debounce window for outbound pushes in milliseconds.
    pub push_debounce_ms: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            enabled: false,
            poll_interval_ms: 1000,
            push_debounce_ms: 150,
            request_timeout_secs: 10,
        }
    }
}

/// Period scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    /// Reference timezone for all time-of-day math (IANA name).
    pub timezone: String,
    /// Dictionary refresh cadence in seconds.
    pub refresh_interval_secs: u64,
    /// Transition check cadence in seconds.
    pub transition_check_secs: u64,
    /// Margin past local midnight before rearming the day's timers.
    pub rearm_margin_secs: u64,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_owned(),
            refresh_interval_secs: 180,
            transition_check_secs: 30,
            rearm_margin_secs: 5,
        }
    }
}

impl PeriodConfig {
    /// Resolve the configured timezone, falling back to the Eastern default
    /// when the name is unknown.
    pub fn resolved_timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .parse()
            .unwrap_or(chrono_tz::America::New_York)
    }
}

/// Notification surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeConfig {
    /// How long a shown notice stays visible, in milliseconds.
    pub duration_ms: u64,
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
        }
    }
}

/// Durable slot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Slot file path. `None` uses the per-user default location.
    pub slot_path: Option<PathBuf>,
}

impl SidelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| crate::SidelineError::Config(format!("cannot read config: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| crate::SidelineError::Config(format!("cannot parse config: {e}")))
    }

    /// Save configuration as pretty TOML, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::SidelineError::Config(format!("cannot create dir: {e}")))?;
        }
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| crate::SidelineError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, toml_str)
            .map_err(|e| crate::SidelineError::Config(format!("cannot write config: {e}")))?;
        Ok(())
    }

    /// Default configuration file path: `<config dir>/sideline/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sideline")
            .join("config.toml")
    }
}
