//! Daemon configuration management
//!
//! A single TOML file carries the static daemon section plus the runtime
//! POS and USB power settings. The [`SettingsStore`] wraps the loaded
//! config behind a mutex and persists updates back to the same file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use common::PowerMethod;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub pos: PosSettings,
    #[serde(default)]
    pub usb_power: UsbPowerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// POS system connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Seconds between session polls.
    #[serde(default = "PosSettings::default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for PosSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            poll_interval: Self::default_poll_interval(),
        }
    }
}

impl PosSettings {
    fn default_poll_interval() -> u64 {
        2
    }
}

/// USB power control settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbPowerSettings {
    #[serde(default)]
    pub method: PowerMethod,
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/scangate/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(path: Option<PathBuf>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("scangate").join("daemon.toml")
        } else {
            PathBuf::from("/etc/scangate/daemon.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }
}

/// Thread-safe persistent settings store.
///
/// Snapshot getters hand out clones; updaters normalize, persist to disk,
/// and return the updated snapshot. Shared between the poller (reads) and
/// the CLI paths (writes).
pub struct SettingsStore {
    path: PathBuf,
    inner: Mutex<DaemonConfig>,
}

impl SettingsStore {
    pub fn new(config: DaemonConfig, path: PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(config),
        }
    }

    /// Load the store from a config file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let config = match DaemonConfig::load(Some(path.clone())) {
            Ok(config) => config,
            Err(err) => {
                if path.exists() {
                    warn!("Failed to load settings from {}: {}", path.display(), err);
                } else {
                    info!("No settings file at {}, using defaults", path.display());
                }
                DaemonConfig::default()
            }
        };
        Self::new(config, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current POS settings.
    pub fn pos(&self) -> PosSettings {
        self.lock().pos.clone()
    }

    /// Snapshot of the current USB power settings.
    pub fn usb_power(&self) -> UsbPowerSettings {
        self.lock().usb_power.clone()
    }

    /// Whether POS URL and token are both set.
    pub fn pos_configured(&self) -> bool {
        let config = self.lock();
        !config.pos.url.is_empty() && !config.pos.token.is_empty()
    }

    /// Update POS settings and persist to disk. Only provided values are
    /// updated; the URL is normalized and the poll interval clamped to at
    /// least one second.
    pub fn update_pos(
        &self,
        url: Option<&str>,
        token: Option<&str>,
        poll_interval: Option<u64>,
    ) -> PosSettings {
        let mut config = self.lock();
        if let Some(url) = url {
            config.pos.url = normalize_pos_url(url);
        }
        if let Some(token) = token {
            config.pos.token = token.to_string();
        }
        if let Some(interval) = poll_interval {
            config.pos.poll_interval = interval.max(1);
        }
        self.persist(&config);
        config.pos.clone()
    }

    /// Update USB power settings and persist to disk.
    pub fn update_usb_power(&self, method: Option<PowerMethod>) -> UsbPowerSettings {
        let mut config = self.lock();
        if let Some(method) = method {
            config.usb_power.method = method;
        }
        self.persist(&config);
        config.usb_power.clone()
    }

    fn persist(&self, config: &DaemonConfig) {
        if let Err(err) = config.save(&self.path) {
            error!("Failed to save settings to {}: {}", self.path.display(), err);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DaemonConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Trim the URL, strip trailing slashes, and default to https:// when no
/// scheme is given.
fn normalize_pos_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() || url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}
