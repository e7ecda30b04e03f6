//! Shared data model and observable status types

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single completed barcode read.
///
/// Created exactly once per scan; ownership transfers to whichever consumer
/// receives it. `timestamp` is local time at second precision
/// (`%Y-%m-%dT%H:%M:%S`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub barcode: String,
    pub timestamp: String,
    pub device: String,
}

/// How USB power to the scanner is switched.
///
/// Read from the settings store on every power call, so a settings change
/// takes effect on the next power transition without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMethod {
    /// Detach/re-attach the kernel driver via sysfs. Per-device; the device
    /// stays powered but becomes invisible to the OS.
    #[default]
    BindUnbind,
    /// Real power cut via `uhubctl` hub port switching. On Raspberry Pi 5
    /// this affects all USB ports simultaneously.
    Uhubctl,
    /// No power control at all; every call succeeds.
    None,
}

impl fmt::Display for PowerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerMethod::BindUnbind => "bind_unbind",
            PowerMethod::Uhubctl => "uhubctl",
            PowerMethod::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Last observed USB power state of the scanner port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Observable status of the POS polling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    NotConfigured,
    Polling,
    SessionActive,
    Error,
    Stopped,
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PollStatus::NotConfigured => "not_configured",
            PollStatus::Polling => "polling",
            PollStatus::SessionActive => "session_active",
            PollStatus::Error => "error",
            PollStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of the barcode scanner's state, for the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerStatus {
    pub connected: bool,
    /// Device file path, or "auto" before the first discovery.
    pub device_path: String,
    pub name: String,
    pub session_active: bool,
    pub session_id: Option<String>,
    pub power_state: PowerState,
    /// Learned USB topology id (e.g. "1-1.2"), if discovered.
    pub usb_port: Option<String>,
}

/// Snapshot of the POS polling service's state, for the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerStatus {
    pub status: PollStatus,
    pub detail: String,
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_method_display() {
        assert_eq!(PowerMethod::BindUnbind.to_string(), "bind_unbind");
        assert_eq!(PowerMethod::Uhubctl.to_string(), "uhubctl");
        assert_eq!(PowerMethod::None.to_string(), "none");
    }

    #[test]
    fn test_power_method_default() {
        assert_eq!(PowerMethod::default(), PowerMethod::BindUnbind);
    }

    #[test]
    fn test_poll_status_display() {
        assert_eq!(PollStatus::NotConfigured.to_string(), "not_configured");
        assert_eq!(PollStatus::SessionActive.to_string(), "session_active");
        assert_eq!(PollStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_power_state_display() {
        assert_eq!(PowerState::On.to_string(), "on");
        assert_eq!(PowerState::Off.to_string(), "off");
        assert_eq!(PowerState::Unknown.to_string(), "unknown");
    }
}
